//! Task submission, polling and cancellation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use tracing::debug;

use mediarun_core::{CoreError, Endpoint, Principal, Task, TaskId, TaskSnapshot};

use crate::admission::Submission;
use crate::engine::Engine;
use crate::http::extract::Caller;
use crate::http::responses::ApiError;

/// `POST /v1/{endpoint}`.
///
/// The body is passed to the backend as-is. `model` selects the model (the
/// endpoint's default when omitted) and `webhookUrl` the completion callback.
pub async fn submit_task(
    State(engine): State<Arc<Engine>>,
    Caller(principal): Caller,
    Path(endpoint): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let endpoint: Endpoint = endpoint
        .parse()
        .map_err(|e: CoreError| ApiError::Unprocessable(e.to_string()))?;

    let model = match body.get("model").and_then(Value::as_str) {
        Some(model) => model.to_string(),
        None => endpoint
            .default_model()
            .map(|m| m.to_string())
            .ok_or_else(|| ApiError::Unprocessable(format!("model is required for {endpoint}")))?,
    };
    let webhook = body
        .get("webhookUrl")
        .and_then(Value::as_str)
        .map(str::to_string);

    let id = engine
        .submit(Submission {
            principal: principal.id,
            model,
            endpoint,
            input: body,
            webhook,
        })
        .await?;

    Ok(Json(engine.get_status(&id).await?))
}

/// `GET /v1/tasks/{id}`.
pub async fn get_task(
    State(engine): State<Arc<Engine>>,
    Caller(principal): Caller,
    Path(id): Path<TaskId>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    let task = owned_task(&engine, &principal, &id).await?;
    Ok(Json(TaskSnapshot::from(&task)))
}

/// `DELETE /v1/tasks/{id}`.
pub async fn cancel_task(
    State(engine): State<Arc<Engine>>,
    Caller(principal): Caller,
    Path(id): Path<TaskId>,
) -> Result<StatusCode, ApiError> {
    owned_task(&engine, &principal, &id).await?;
    engine.cancel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Tasks of other principals are reported as missing.
async fn owned_task(engine: &Engine, principal: &Principal, id: &TaskId) -> Result<Task, ApiError> {
    let task = engine.task(id).await?;
    if task.owner != principal.id {
        debug!(task_id = %id, principal = %principal.id, "Task belongs to another principal");
        return Err(ApiError::NotFound(format!("Task not found: {id}")));
    }
    Ok(task)
}
