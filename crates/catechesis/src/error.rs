use crate::access::Capability;
use crate::config::ConfigError;
use crate::extraction::ExtractionError;
use crate::ids::{EnrollmentId, ProfileId};
use crate::stores::{ConsistencyError, StoreError};
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

/// Failure taxonomy shared by every workflow service.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("an enrollment for this child already exists this year ({existing})")]
    DuplicateEnrollment {
        existing: EnrollmentId,
        guardian: ProfileId,
    },
    #[error("{actor} is not permitted to {action}")]
    Permission { actor: String, action: Capability },
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("payment of {amount} exceeds the remaining balance of {remaining}")]
    PaymentMismatch { amount: i64, remaining: i64 },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("store failure: {0}")]
    Store(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Consistency(err) if err.is_retryable())
    }

    /// Stable machine-readable label, also used as the audit failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::DuplicateEnrollment { .. } => "duplicate_enrollment_error",
            PipelineError::Permission { .. } => "permission_error",
            PipelineError::Consistency(_) => "consistency_error",
            PipelineError::PaymentMismatch { .. } => "payment_mismatch_error",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::Store(_) => "store_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) | PipelineError::Extraction(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PipelineError::DuplicateEnrollment { .. } | PipelineError::PaymentMismatch { .. } => {
                StatusCode::CONFLICT
            }
            PipelineError::Permission { .. } => StatusCode::FORBIDDEN,
            PipelineError::Consistency(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(value: sqlx::Error) -> Self {
        if crate::stores::is_busy(&value) {
            return Self::Consistency(ConsistencyError::StoreBusy(value.to_string()));
        }
        Self::Store(value.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let PipelineError::DuplicateEnrollment { existing, guardian } = &self {
            body["existing_enrollment_id"] = json!(existing);
            body["guardian_id"] = json!(guardian);
            body["offer"] = json!("link_existing");
        }
        if self.is_retryable() {
            body["retryable"] = json!(true);
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Store(StoreError),
    Pipeline(PipelineError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Store(err) => write!(f, "store error: {}", err),
            AppError::Pipeline(err) => write!(f, "pipeline error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Store(err) => Some(err),
            AppError::Pipeline(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => err.into_response(),
            other => {
                let body = Json(json!({ "error": other.to_string() }));
                (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}
