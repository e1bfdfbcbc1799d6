use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::error::ErrorKind;
use crate::pipeline::runtime::PipelineError;

pub type ApiObject<T> = (StatusCode, Json<T>);

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
    error_kind: ErrorKind,
    error_code: String,
}

pub fn error_response(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiObject<Value> {
    (
        status,
        into_json(ErrorResponse {
            ok: false,
            error: message.into(),
            error_kind: kind,
            error_code: code.into(),
        }),
    )
}

pub fn map_pipeline_error(error: &PipelineError) -> ApiObject<Value> {
    let (status, kind) = match error {
        PipelineError::PermissionDenied => (StatusCode::FORBIDDEN, ErrorKind::Policy),
        PipelineError::QueueSaturated { .. } => (StatusCode::TOO_MANY_REQUESTS, ErrorKind::Capacity),
        PipelineError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, ErrorKind::Capacity),
        PipelineError::Backend(_) => (StatusCode::BAD_GATEWAY, ErrorKind::Provider),
        PipelineError::MalformedInput(_) => (StatusCode::BAD_REQUEST, ErrorKind::Validation),
        PipelineError::Geometry(_) | PipelineError::NoMaskAvailable { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Validation)
        }
        PipelineError::InvalidPlan(_) | PipelineError::Worker(_) => {
            return internal_error(error.to_string());
        }
    };
    error_response(status, kind, error.code(), error.user_message())
}

pub fn internal_error(message: impl Into<String>) -> ApiObject<Value> {
    let detail = message.into();
    error!(detail = %detail, "internal api error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Infra,
        "internal_error",
        "Internal server error",
    )
}

pub fn into_json(payload: impl Serialize) -> Json<Value> {
    Json(serde_json::to_value(payload).unwrap_or_else(|e| {
        error!(error = %e, "api payload failed to serialize");
        json!({"ok": false, "error": "Internal server error", "error_kind": ErrorKind::Infra})
    }))
}
