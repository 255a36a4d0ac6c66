use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Structured error response returned by every failing endpoint.
/// Carries enough context for a client to tell a malformed request apart
/// from a quota denial or an upstream outage.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found", "quota_exceeded")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const FORBIDDEN: &str = "forbidden";
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const UPSTREAM_FAILURE: &str = "upstream_failure";
    pub const INTERNAL_ERROR: &str = "internal_error";
}
