//! HTTP request and response types.

use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use mediarun_core::{ModelKind, Principal, PrincipalId};

use crate::admission::AdmissionError;
use crate::engine::EngineError;
use crate::storage::{StorageError, UploadSlot};

// ============================================================================
// Key management types
// ============================================================================

/// Request body for creating an API key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,

    /// Starting balance; the configured default when omitted.
    #[serde(default)]
    pub credit_balance: Option<u64>,
}

/// Response body for a created key. The only time the key is shown.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyResponse {
    pub id: PrincipalId,
    pub name: String,
    pub key: String,
    pub credit_balance: u64,
}

/// A key owner as listed by the admin API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub id: PrincipalId,
    pub name: String,
    pub credit_balance: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Principal> for KeyResponse {
    fn from(p: Principal) -> Self {
        Self {
            id: p.id,
            name: p.name,
            credit_balance: p.credit_balance,
            active: p.active,
            created_at: p.created_at,
        }
    }
}

// ============================================================================
// Organization types
// ============================================================================

/// Response for `GET /v1/organization`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationResponse {
    pub credit_balance: u64,
    pub usage: Vec<ModelUsage>,
}

/// Credits spent on one model.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub model: ModelKind,
    pub credits: u64,
    pub tasks: u64,
}

// ============================================================================
// Upload types
// ============================================================================

/// Request body for `POST /v1/uploads`.
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub filename: String,

    /// Declared media kind, e.g. `"image"`. Informational only.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// An issued upload slot. `runwayUri` is what task inputs reference.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub id: String,
    pub upload_url: String,
    pub fields: BTreeMap<String, String>,
    pub runway_uri: String,
}

impl From<UploadSlot> for UploadResponse {
    fn from(slot: UploadSlot) -> Self {
        Self {
            id: slot.id,
            upload_url: slot.upload_url,
            fields: slot.fields,
            runway_uri: slot.uri,
        }
    }
}

/// Response for a completed upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedResponse {
    pub runway_uri: String,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors returned by handlers, mapped to status codes.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    PaymentRequired,
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Overloaded,
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized => "Invalid or missing API key".to_string(),
            Self::PaymentRequired => "You do not have enough credits to run this task.".to_string(),
            Self::Overloaded => "Too many tasks are queued, try again later".to_string(),
            Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Unprocessable(m)
            | Self::Internal(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(message) = &self {
            error!(error = %message, "Request failed");
        }
        (
            self.status(),
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response()
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::UnknownPrincipal(_) => Self::Unauthorized,
            AdmissionError::InsufficientCredits { .. } => Self::PaymentRequired,
            AdmissionError::UnknownModel(_) | AdmissionError::UnknownEndpoint(_) => {
                Self::Unprocessable(e.to_string())
            }
            AdmissionError::Overloaded | AdmissionError::Unavailable(_) => Self::Overloaded,
            AdmissionError::Store(_) | AdmissionError::Aborted(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Unauthorized => Self::Unauthorized,
            EngineError::TaskNotFound(_) => Self::NotFound(e.to_string()),
            EngineError::AlreadyTerminal(_) => Self::Conflict(e.to_string()),
            EngineError::Admission(inner) => inner.into(),
            EngineError::Storage(StorageError::InvalidName(_) | StorageError::UnknownUpload(_)) => {
                Self::NotFound(e.to_string())
            }
            EngineError::Storage(StorageError::UploadsUnsupported) => {
                Self::Unprocessable(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediarun_core::{Endpoint, TaskId};

    #[test]
    fn test_admission_errors_map_to_statuses() {
        let cases = [
            (
                AdmissionError::InsufficientCredits {
                    cost: 5,
                    balance: 1,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                AdmissionError::UnknownModel("gen4".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AdmissionError::UnknownEndpoint(Endpoint::TextToImage),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (AdmissionError::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (
                AdmissionError::UnknownPrincipal(PrincipalId::new("p")),
                StatusCode::UNAUTHORIZED,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_engine_errors_map_to_statuses() {
        let id = TaskId::new("t1");
        assert_eq!(
            ApiError::from(EngineError::TaskNotFound(id.clone())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EngineError::AlreadyTerminal(id)).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_unknown_upload_is_not_found() {
        let err = EngineError::Storage(StorageError::UnknownUpload("x".into()));
        assert_eq!(ApiError::from(err).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_payment_required_message() {
        let response = ApiError::PaymentRequired.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            ApiError::PaymentRequired.message(),
            "You do not have enough credits to run this task."
        );
    }
}
