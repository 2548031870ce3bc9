//! Request authentication extractors.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::warn;

use mediarun_core::Principal;

use super::responses::ApiError;
use crate::auth::{bearer_token, secret_matches};
use crate::engine::Engine;

fn presented_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
}

/// The principal behind the request's API key.
pub struct Caller(pub Principal);

#[async_trait]
impl FromRequestParts<Arc<Engine>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        engine: &Arc<Engine>,
    ) -> Result<Self, Self::Rejection> {
        let key = presented_token(parts).ok_or(ApiError::Unauthorized)?;
        Ok(Caller(engine.authenticate(key).await?))
    }
}

/// Proof that the request carries the admin secret.
pub struct Admin;

#[async_trait]
impl FromRequestParts<Arc<Engine>> for Admin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        engine: &Arc<Engine>,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = engine.config().admin_secret.as_deref() else {
            return Err(ApiError::Forbidden("Admin API is disabled".to_string()));
        };
        match presented_token(parts) {
            Some(token) if secret_matches(token, secret) => Ok(Admin),
            _ => {
                warn!(path = %parts.uri.path(), "Rejected admin request");
                Err(ApiError::Unauthorized)
            }
        }
    }
}
