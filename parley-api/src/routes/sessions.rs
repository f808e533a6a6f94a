//! Session REST API Routes
//!
//! Session lifecycle, message enqueueing, and history. Every handler
//! validates the owner token embedded in the session id against the
//! authenticated caller before touching storage.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    auth::{require_session_owner, AuthContext},
    error::{ApiError, ApiResult},
    state::AppState,
};
use parley_core::{Message, Session};
use parley_store::{NewSession, SessionMetaPatch};

/// Default and maximum history page sizes.
const DEFAULT_MESSAGE_LIMIT: usize = 50;
const MAX_MESSAGE_LIMIT: usize = 500;

// ============================================================================
// DTOS
// ============================================================================

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub id: String,
    pub owner: String,
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.as_str().to_string(),
            owner: session.owner,
            title: session.title,
            user_display_name: session.user_display_name,
            user_handle: session.user_handle,
            user_persona: session.user_persona,
            created_at: session.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub user_display_name: Option<String>,
    pub user_handle: Option<String>,
    pub user_persona: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteSessionsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeleteSessionsResponse {
    pub deleted: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MessagePayload {
    pub content: String,
    pub target_personas: Option<Vec<String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueResponse {
    pub message_id: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            sender: message.sender,
            content: message.content,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListMessagesQuery {
    /// Most recent messages to return, oldest first.
    pub limit: Option<usize>,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /sessions - Create a session for the caller.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "Sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 401, description = "Missing caller identity"),
    )
)]
pub async fn create_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .conversations
        .create_session(NewSession {
            owner: auth.username,
            title: req.title,
            user_display_name: req.user_display_name,
            user_handle: req.user_handle,
            user_persona: req.user_persona,
        })
        .await?;

    tracing::info!(session_id = %session.id, "session created");
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id.as_str().to_string(),
        }),
    ))
}

/// GET /sessions - List the caller's sessions.
#[utoipa::path(
    get,
    path = "/sessions",
    tag = "Sessions",
    responses(
        (status = 200, description = "Sessions for the caller", body = [SessionResponse]),
    )
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
) -> ApiResult<Json<Vec<SessionResponse>>> {
    let sessions = state.conversations.list_sessions(&auth.username).await?;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

/// PATCH /sessions/{id} - Update session metadata.
#[utoipa::path(
    patch,
    path = "/sessions/{id}",
    tag = "Sessions",
    request_body = UpdateSessionRequest,
    responses(
        (status = 200, description = "Updated session", body = SessionResponse),
        (status = 403, description = "Not the session owner"),
        (status = 404, description = "Session not found"),
    )
)]
pub async fn update_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let session_id = require_session_owner(&auth, &id)?;
    let session = state
        .conversations
        .update_session_meta(
            &session_id,
            SessionMetaPatch {
                title: req.title,
                user_display_name: req.user_display_name,
                user_handle: req.user_handle,
                user_persona: req.user_persona,
            },
        )
        .await?;
    Ok(Json(session.into()))
}

/// DELETE /sessions/{id} - Delete a session and its messages.
///
/// Any in-flight turn is cancelled; its partial reply is discarded.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    tag = "Sessions",
    responses(
        (status = 204, description = "Session deleted"),
        (status = 403, description = "Not the session owner"),
        (status = 404, description = "Session not found"),
    )
)]
pub async fn delete_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_id = require_session_owner(&auth, &id)?;
    state.orchestrator.close_session(&session_id);
    state.conversations.delete_session(&session_id).await?;
    tracing::info!(session_id = %session_id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /sessions - Bulk delete sessions owned by the caller.
#[utoipa::path(
    delete,
    path = "/sessions",
    tag = "Sessions",
    request_body = DeleteSessionsRequest,
    responses(
        (status = 200, description = "Deletion count", body = DeleteSessionsResponse),
    )
)]
pub async fn delete_sessions(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<DeleteSessionsRequest>,
) -> ApiResult<Json<DeleteSessionsResponse>> {
    let mut session_ids = Vec::with_capacity(req.ids.len());
    for raw in &req.ids {
        // Foreign or malformed ids are skipped, not errors: bulk delete
        // is best-effort within the caller's own sessions.
        if let Ok(session_id) = require_session_owner(&auth, raw) {
            state.orchestrator.close_session(&session_id);
            session_ids.push(session_id);
        }
    }
    let deleted = state
        .conversations
        .delete_sessions(&session_ids, &auth.username)
        .await?;
    Ok(Json(DeleteSessionsResponse { deleted }))
}

/// POST /sessions/{id}/messages - Enqueue a user message.
///
/// Returns 202 as soon as the message is committed and the turn queued;
/// replies stream over the session WebSocket.
#[utoipa::path(
    post,
    path = "/sessions/{id}/messages",
    tag = "Sessions",
    request_body = MessagePayload,
    responses(
        (status = 202, description = "Message accepted", body = EnqueueResponse),
        (status = 400, description = "Empty content or malformed session id"),
        (status = 403, description = "Not the session owner"),
        (status = 404, description = "Session not found"),
    )
)]
pub async fn enqueue_message(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(req): Json<MessagePayload>,
) -> ApiResult<impl IntoResponse> {
    if req.content.trim().is_empty() {
        return Err(ApiError::validation("content must not be empty"));
    }
    let session_id = require_session_owner(&auth, &id)?;

    let message_id = state
        .orchestrator
        .enqueue(&session_id, &req.content, req.target_personas)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse { message_id }),
    ))
}

/// GET /sessions/{id}/messages - Session history, oldest to newest.
#[utoipa::path(
    get,
    path = "/sessions/{id}/messages",
    tag = "Sessions",
    params(ListMessagesQuery),
    responses(
        (status = 200, description = "Messages, oldest first", body = [MessageResponse]),
        (status = 403, description = "Not the session owner"),
        (status = 404, description = "Session not found"),
    )
)]
pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    let session_id = require_session_owner(&auth, &id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .clamp(1, MAX_MESSAGE_LIMIT);
    let messages = state.conversations.list_messages(&session_id, limit).await?;
    Ok(Json(messages.into_iter().map(Into::into).collect()))
}

// ============================================================================
// ROUTER SETUP
// ============================================================================

/// Create the session routes router.
pub fn create_router() -> axum::Router<AppState> {
    use axum::routing::{patch, post};
    axum::Router::new()
        .route(
            "/",
            post(create_session).get(list_sessions).delete(delete_sessions),
        )
        .route("/:id", patch(update_session).delete(delete_session))
        .route("/:id/messages", post(enqueue_message).get(list_messages))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_payload_rejects_empty_content() {
        let payload: MessagePayload = serde_json::from_str(r#"{"content": "  "}"#).unwrap();
        assert!(payload.content.trim().is_empty());
    }

    #[test]
    fn test_message_payload_targets_optional() {
        let payload: MessagePayload =
            serde_json::from_str(r#"{"content": "hi", "target_personas": ["bob"]}"#).unwrap();
        assert_eq!(payload.target_personas.unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_limit_clamping() {
        assert_eq!(9_999usize.clamp(1, MAX_MESSAGE_LIMIT), MAX_MESSAGE_LIMIT);
        assert_eq!(0usize.clamp(1, MAX_MESSAGE_LIMIT), 1);
    }

    #[test]
    fn test_session_response_exposes_wire_id() {
        let session = Session {
            id: parley_core::SessionId::generate("alice").unwrap(),
            owner: "alice".to_string(),
            title: Some("t".to_string()),
            user_display_name: None,
            user_handle: None,
            user_persona: None,
            created_at: chrono::Utc::now(),
        };
        let response = SessionResponse::from(session.clone());
        assert_eq!(response.id, session.id.as_str());
        assert_eq!(response.owner, "alice");
    }
}
