//! Caller identity
//!
//! This service runs behind an authenticating gateway that injects the
//! verified account name in the `x-parley-user` header; full credential
//! handling lives upstream. Every session-scoped route still validates
//! the owner token embedded in the session id against the caller, so a
//! stolen or guessed id never crosses tenants.

use crate::error::ApiError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use parley_core::SessionId;

/// Header carrying the authenticated account name.
pub const USER_HEADER: &str = "x-parley-user";

/// Authenticated caller context, available to any handler as an
/// extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub username: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let username = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Missing caller identity"))?;

        Ok(AuthContext {
            username: username.to_string(),
        })
    }
}

/// Parse a raw session id and verify the caller owns it.
///
/// Malformed ids are a 400; an owner mismatch is a uniform 403 that
/// does not reveal whether the session exists.
pub fn require_session_owner(auth: &AuthContext, raw_id: &str) -> Result<SessionId, ApiError> {
    let session_id = SessionId::parse(raw_id).map_err(ApiError::from)?;
    if session_id.owner() != auth.username {
        return Err(ApiError::forbidden());
    }
    Ok(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn auth(username: &str) -> AuthContext {
        AuthContext {
            username: username.to_string(),
        }
    }

    #[test]
    fn test_owner_match_passes() {
        let id = SessionId::generate("alice").unwrap();
        let parsed = require_session_owner(&auth("alice"), id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_owner_mismatch_is_forbidden() {
        let id = SessionId::generate("alice").unwrap();
        let err = require_session_owner(&auth("bob"), id.as_str()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Forbidden);
    }

    #[test]
    fn test_malformed_id_is_validation_error() {
        let err = require_session_owner(&auth("alice"), "sess_alice_XYZ").unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }
}
