use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use switchyard_core::error::{self, ApiError};
use switchyard_core::usage::LimitDecision;

use crate::audit::AuditError;
use crate::orchestrator::TurnError;
use crate::session::RegistryError;
use crate::voice::BridgeError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Unknown conversation or session (404)
    NotFound { message: String },
    /// Conversation belongs to another session (403)
    Forbidden {
        message: String,
        docs_hint: Option<String>,
    },
    /// Daily quota denial (429)
    QuotaExceeded(LimitDecision),
    /// Planner, specialist, evaluator or realtime provider failure (502)
    Upstream(String),
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.into()),
            received: None,
            docs_hint: None,
        }
    }
}

/// Whole seconds until the next UTC midnight, when day buckets reset.
pub fn seconds_until_utc_midnight() -> i64 {
    let now = Utc::now();
    now.date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .map(|midnight| (midnight - now.naive_utc()).num_seconds())
        .unwrap_or_else(|| Duration::hours(1).num_seconds())
        .max(1)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();
        let mut retry_after = None;

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id: request_id.clone(),
                    docs_hint,
                },
            ),
            AppError::NotFound { message } => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: error::codes::NOT_FOUND.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id: request_id.clone(),
                    docs_hint: None,
                },
            ),
            AppError::Forbidden { message, docs_hint } => (
                StatusCode::FORBIDDEN,
                ApiError {
                    error: error::codes::FORBIDDEN.to_string(),
                    message,
                    field: None,
                    received: None,
                    request_id: request_id.clone(),
                    docs_hint,
                },
            ),
            AppError::QuotaExceeded(decision) => {
                retry_after = Some(seconds_until_utc_midnight());
                let message = decision
                    .message
                    .clone()
                    .unwrap_or_else(|| "Daily usage limit reached. Try again tomorrow.".to_string());
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    ApiError {
                        error: error::codes::QUOTA_EXCEEDED.to_string(),
                        message,
                        field: decision.limit_type.map(|scope| scope.as_str().to_string()),
                        received: serde_json::to_value(&decision).ok(),
                        request_id: request_id.clone(),
                        docs_hint: Some(
                            "Quotas reset at midnight UTC. GET /usage shows today's counts."
                                .to_string(),
                        ),
                    },
                )
            }
            AppError::Upstream(msg) => {
                tracing::error!(error = %msg, "upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    ApiError {
                        error: error::codes::UPSTREAM_FAILURE.to_string(),
                        message: "An upstream service failed while handling this request".to_string(),
                        field: None,
                        received: None,
                        request_id: request_id.clone(),
                        docs_hint: Some(
                            "Messages appended before the failure are kept. Retry the request."
                                .to_string(),
                        ),
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: error::codes::INTERNAL_ERROR.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        received: None,
                        request_id: request_id.clone(),
                        docs_hint: None,
                    },
                )
            }
        };

        let mut response = (status, Json(api_error)).into_response();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::NotFound(id) => AppError::NotFound {
                message: format!("Conversation {id} not found"),
            },
            TurnError::Forbidden(id) => AppError::Forbidden {
                message: format!("Conversation {id} belongs to a different session"),
                docs_hint: Some(
                    "Send the x-session-id header that was returned when the conversation was created."
                        .to_string(),
                ),
            },
            TurnError::Upstream(err) => AppError::Upstream(err.to_string()),
            TurnError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Blocked(decision) => AppError::QuotaExceeded(decision),
            BridgeError::NotFound(id) => AppError::NotFound {
                message: format!("No voice session for conversation {id}"),
            },
            BridgeError::Turn(err) => err.into(),
            BridgeError::Upstream(err) => AppError::Upstream(err.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::usage::UsageScope;

    #[test]
    fn retry_after_is_within_a_day() {
        let seconds = seconds_until_utc_midnight();
        assert!((1..=86_400).contains(&seconds));
    }

    #[tokio::test]
    async fn quota_exceeded_renders_429_with_retry_after() {
        let response = AppError::QuotaExceeded(LimitDecision {
            allowed: false,
            limit_type: Some(UsageScope::Session),
            limit: Some(2),
            remaining: Some(0),
            message: Some("You've reached today's limit of 2 messages.".to_string()),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: ApiError = serde_json::from_slice(&bytes).expect("api error body");
        assert_eq!(body.error, error::codes::QUOTA_EXCEEDED);
        assert_eq!(body.field.as_deref(), Some("session"));
        assert!(body.message.contains("limit of 2"));
    }

    #[test]
    fn turn_errors_map_to_status_codes() {
        let id = uuid::Uuid::now_v7();
        let status = |err: TurnError| AppError::from(err).into_response().status();
        assert_eq!(status(TurnError::NotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(status(TurnError::Forbidden(id)), StatusCode::FORBIDDEN);
        assert_eq!(
            status(TurnError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
