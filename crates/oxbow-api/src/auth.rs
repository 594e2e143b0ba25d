//! API-key authentication with role-based access control.
//!
//! Requests carry `Authorization: Bearer <raw_key>`; the server computes
//! the salted SHA-256 of the presented key and looks it up in the store.
//! Raw keys are never stored or logged. `last_used_at` is updated on a
//! spawned task so the request path never blocks on it.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use chrono::Utc;

use oxbow_core::ApiKeyId;
use oxbow_flow::apikey::ApiKeyRole;
use oxbow_flow::store::Store;

use crate::error::ApiError;
use crate::server::AppState;

/// The authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    /// The key record ID; `None` for the synthesized debug identity.
    pub id: Option<ApiKeyId>,
    /// The key's human-readable name.
    pub name: String,
    /// The key's role.
    pub role: ApiKeyRole,
}

impl AuthenticatedKey {
    /// Rejects the request unless this identity satisfies `required`.
    ///
    /// # Errors
    ///
    /// Returns 403 when the role is insufficient.
    pub fn require(&self, required: ApiKeyRole) -> Result<(), ApiError> {
        if self.role.allows(required) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "this endpoint requires the {required} role"
            )))
        }
    }

    /// Identity used for header-less requests in debug mode only.
    fn debug_identity() -> Self {
        Self {
            id: None,
            name: "debug".to_string(),
            role: ApiKeyRole::Admin,
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let Some(header) = header else {
            if state.config.debug {
                return Ok(Self::debug_identity());
            }
            return Err(ApiError::missing_auth());
        };

        let raw_key = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Authorization must be a bearer token"))?;

        let key_hash = state.hasher.hash(raw_key);
        let key = state
            .store
            .find_api_key_by_hash(&key_hash)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| {
                tracing::warn!(hash_prefix = &key_hash[..8], "unknown API key presented");
                ApiError::unauthorized("invalid API key")
            })?;

        let now = Utc::now();
        if !key.is_valid_at(now) {
            return Err(ApiError::unauthorized("API key expired or revoked"));
        }

        // Opportunistic; losing this write is fine.
        let store = state.store.clone();
        let id = key.id;
        tokio::spawn(async move {
            if let Err(error) = store.touch_api_key(&id, now).await {
                tracing::debug!(%error, "failed to update key last_used_at");
            }
        });

        Ok(Self {
            id: Some(key.id),
            name: key.name,
            role: key.role,
        })
    }
}
