//! PARLEY API Server Entry Point
//!
//! Wires configuration, stores, retrieval, the orchestrator, and the
//! Axum router, then serves until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use parley_api::{create_api_router, ApiError, ApiResult, AppConfig, AppState};
use parley_llm::{OpenAiChatProvider, OpenAiEmbeddingProvider};
use parley_retrieval::{QdrantVectorStore, RetrievalEngine};
use parley_runtime::{PersonaRuntime, SessionOrchestrator};
use parley_store::{DbConfig, KeyCipher, PgStore};

#[tokio::main]
async fn main() -> ApiResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,parley=debug".into()),
        )
        .init();

    let config = Arc::new(
        AppConfig::from_env().map_err(|e| ApiError::internal(format!("configuration: {}", e)))?,
    );

    let cipher = Arc::new(
        KeyCipher::from_secret(&config.encryption_key)
            .map_err(|e| ApiError::internal(format!("encryption key: {}", e)))?,
    );

    let db_config = DbConfig::from_env();
    let store = Arc::new(
        PgStore::from_config(&db_config, cipher)
            .map_err(|e| ApiError::internal(format!("database: {}", e)))?,
    );
    store
        .ensure_schema()
        .await
        .map_err(|e| ApiError::internal(format!("schema: {}", e)))?;

    let vector_store = Arc::new(
        QdrantVectorStore::connect(&config.vector_store_url)
            .map_err(|e| ApiError::internal(format!("vector store: {}", e)))?,
    );
    let retrieval = Arc::new(RetrievalEngine::new(
        vector_store,
        Arc::new(OpenAiEmbeddingProvider::new()),
    ));

    let runtime = Arc::new(PersonaRuntime::new(
        Arc::new(OpenAiChatProvider::new()),
        retrieval.clone(),
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        store.clone(),
        store.clone(),
        runtime,
        config.orchestrator_config(),
    ));

    let state = AppState::new(store.clone(), store, orchestrator, retrieval, config);
    let app = create_api_router(state);

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, "starting Parley API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal(format!("failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal(format!("server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("PARLEY_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("PARLEY_API_PORT").ok())
        .unwrap_or_else(|| "8000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::validation(format!("invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::validation(format!("invalid bind address {}: {}", addr, e)))
}
