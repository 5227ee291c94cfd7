use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// A single rejected request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every outcome a request can fail with. Handlers match on this exhaustively;
/// nothing else is allowed to reach the HTTP layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {}", summarize(.0))]
    Validation(Vec<FieldError>),
    #[error("invalid or missing API key")]
    Forbidden,
    #[error("service overloaded: {0}")]
    ServiceOverloaded(String),
    #[error("no execution slot became available within {0:?}")]
    Timeout(Duration),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("batch of {size} prompts exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
}

impl ServiceError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Validation(vec![FieldError::new(field, message)])
    }

    /// Stable machine-readable identifier, part of the response contract.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Forbidden => "forbidden",
            ServiceError::ServiceOverloaded(_) => "service_overloaded",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Inference(_) => "inference_error",
            ServiceError::BatchTooLarge { .. } => "batch_too_large",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::ServiceOverloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::BatchTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

fn summarize(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::invalid("body", rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetails<'a>,
}

#[derive(Serialize)]
struct ErrorDetails<'a> {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a [FieldError]>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let fields = match &self {
            ServiceError::Validation(fields) => Some(fields.as_slice()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetails {
                kind: self.kind(),
                message: self.to_string(),
                fields,
            },
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = ServiceError::Validation(vec![
            FieldError::new("prompt", "must not be empty"),
            FieldError::new("temperature", "must be >= 0"),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid request: prompt: must not be empty; temperature: must be >= 0"
        );
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn response_body_carries_kind_and_message() {
        let response = ServiceError::BatchTooLarge { size: 20, max: 16 }.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["kind"], "batch_too_large");
        assert_eq!(
            body["error"]["message"],
            "batch of 20 prompts exceeds the limit of 16"
        );
        assert!(body["error"].get("fields").is_none());
    }
}
