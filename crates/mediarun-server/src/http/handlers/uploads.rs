//! Input file uploads.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::debug;

use crate::engine::Engine;
use crate::http::extract::Caller;
use crate::http::responses::{ApiError, UploadRequest, UploadResponse, UploadedResponse};

/// `POST /v1/uploads`: issue a slot for one input file.
pub async fn create_upload(
    State(engine): State<Arc<Engine>>,
    Caller(principal): Caller,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    debug!(
        principal = %principal.id,
        filename = %req.filename,
        kind = req.kind.as_deref().unwrap_or("unspecified"),
        "Upload slot requested"
    );
    let slot = engine.upload_slot(&req.filename)?;
    Ok(Json(slot.into()))
}

/// `PUT /v1/uploads/{name}`: the bytes of an issued slot.
pub async fn receive_upload(
    State(engine): State<Arc<Engine>>,
    Caller(_): Caller,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadedResponse>), ApiError> {
    let runway_uri = engine.receive_upload(&name, body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(UploadedResponse { runway_uri })))
}
