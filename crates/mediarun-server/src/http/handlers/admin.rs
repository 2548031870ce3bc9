//! Admin handlers: API keys and pool diagnostics.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use crate::engine::Engine;
use crate::http::extract::Admin;
use crate::http::responses::{ApiError, CreateKeyRequest, CreateKeyResponse, KeyResponse};
use crate::pool::PoolSnapshot;

/// `POST /v1/admin/keys`: create a principal and return its key once.
pub async fn create_key(
    State(engine): State<Arc<Engine>>,
    _admin: Admin,
    Json(req): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::Unprocessable("name must not be empty".to_string()));
    }

    let (key, principal) = engine.create_principal(name, req.credit_balance).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            id: principal.id,
            name: principal.name,
            key,
            credit_balance: principal.credit_balance,
        }),
    ))
}

/// `GET /v1/admin/keys`.
pub async fn list_keys(
    State(engine): State<Arc<Engine>>,
    _admin: Admin,
) -> Result<Json<Vec<KeyResponse>>, ApiError> {
    let principals = engine.principals().await?;
    Ok(Json(principals.into_iter().map(KeyResponse::from).collect()))
}

/// `GET /v1/admin/pool`: resident models in LRU order.
pub async fn pool_status(State(engine): State<Arc<Engine>>, _admin: Admin) -> Json<PoolSnapshot> {
    Json(engine.pool_snapshot())
}
