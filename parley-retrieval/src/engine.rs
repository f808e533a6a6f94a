//! Retrieval engine
//!
//! Ingestion and search over per-persona collections. The caller
//! supplies the resolved embedding endpoint for the persona; ingest and
//! search for a given persona therefore always use the same model and
//! dimension. Re-ingesting a `(collection, source)` pair replaces that
//! source's chunks, making ingestion idempotent per source.

use crate::chunker::{chunk_text, CHUNK_OVERLAP_CHARS, TARGET_CHUNK_CHARS};
use crate::store::{ChunkRecord, ScoredChunk, VectorStore};
use parley_core::{chunk_id, EmbeddingConfig, RetrievalError};
use parley_llm::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of an ingestion call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IngestReport {
    pub chunks_added: usize,
    pub collection: String,
}

/// Shared retrieval engine: one vector-store client, one embedder
/// transport; per-request parameters arrive with each call.
pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    http: reqwest::Client,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent("parley/0.3")
            .build()
            .unwrap_or_default();
        Self {
            store,
            embedder,
            http,
        }
    }

    /// Chunk, embed, and upsert `text` under `source`, creating the
    /// collection at the embedder's dimension on first use. Existing
    /// chunks with the same source are replaced.
    pub async fn ingest_text(
        &self,
        collection: &str,
        embed: &EmbeddingConfig,
        text: &str,
        source: &str,
    ) -> Result<IngestReport, RetrievalError> {
        let chunks = chunk_text(text, TARGET_CHUNK_CHARS, CHUNK_OVERLAP_CHARS);
        if chunks.is_empty() {
            return Ok(IngestReport {
                chunks_added: 0,
                collection: collection.to_string(),
            });
        }

        let vectors = self
            .embedder
            .embed(embed, &chunks)
            .await
            .map_err(|e| RetrievalError::VectorStore {
                reason: format!("embedding during ingest: {}", e),
            })?;

        self.store.ensure_collection(collection, embed.dimension).await?;
        // Replace semantics: clear this source before upserting.
        self.store.delete_by_source(collection, source).await?;

        let records: Vec<ChunkRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| ChunkRecord {
                id: chunk_id(collection, source, &text),
                text,
                source: source.to_string(),
                vector,
            })
            .collect();

        let count = records.len();
        self.store.upsert(collection, records).await?;

        info!(collection, source, count, "ingested document");
        Ok(IngestReport {
            chunks_added: count,
            collection: collection.to_string(),
        })
    }

    /// Fetch `url`, extract its text content, and ingest it with the
    /// url itself as the source tag.
    pub async fn ingest_url(
        &self,
        collection: &str,
        embed: &EmbeddingConfig,
        url: &str,
    ) -> Result<IngestReport, RetrievalError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RetrievalError::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Fetch {
                url: url.to_string(),
                reason: format!("status {}", status),
            });
        }

        let body = response.text().await.map_err(|e| RetrievalError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let text = extract_text(&body);
        if text.is_empty() {
            return Err(RetrievalError::Fetch {
                url: url.to_string(),
                reason: "no textual content".to_string(),
            });
        }

        self.ingest_text(collection, embed, &text, url).await
    }

    /// Remove every chunk ingested under `source`.
    pub async fn delete_by_source(
        &self,
        collection: &str,
        source: &str,
    ) -> Result<(), RetrievalError> {
        if self.store.collection_exists(collection).await? {
            self.store.delete_by_source(collection, source).await?;
        }
        Ok(())
    }

    /// Drop the whole collection. Missing collections are a no-op.
    pub async fn delete_collection(&self, collection: &str) -> Result<(), RetrievalError> {
        if self.store.collection_exists(collection).await? {
            self.store.drop_collection(collection).await?;
        }
        Ok(())
    }

    /// Top-k passages for `query`, descending score. A persona that has
    /// never ingested anything has no collection; that is an empty
    /// result, not an error.
    pub async fn search(
        &self,
        collection: &str,
        embed: &EmbeddingConfig,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if !self.store.collection_exists(collection).await? {
            debug!(collection, "search against absent collection");
            return Ok(Vec::new());
        }

        let query_texts = [query.to_string()];
        let mut vectors = self
            .embedder
            .embed(embed, &query_texts)
            .await
            .map_err(|e| RetrievalError::VectorStore {
                reason: format!("embedding query: {}", e),
            })?;
        let vector = vectors.pop().ok_or_else(|| RetrievalError::VectorStore {
            reason: "embedder returned no vector".to_string(),
        })?;

        self.store.search(collection, vector, top_k).await
    }
}

/// Strip markup from an HTML document, falling back to the raw body for
/// non-HTML content.
fn extract_text(body: &str) -> String {
    let document = scraper::Html::parse_document(body);
    let body_selector = scraper::Selector::parse("body").expect("static selector");
    let text = match document.select(&body_selector).next() {
        Some(element) => element.text().collect::<String>(),
        None => body.to_string(),
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
