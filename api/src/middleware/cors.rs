use axum::http::{HeaderName, HeaderValue, Method};
use switchyard_core::identity::{SESSION_HEADER, SESSION_STATUS_HEADER};
use tower_http::cors::CorsLayer;

/// Build a CORS layer for the configured browser origins.
///
/// - Methods: GET, POST, DELETE, OPTIONS
/// - Request headers: Content-Type, x-session-id
/// - Exposed headers: x-session-id, x-session-status, x-request-id, retry-after
///   (browser clients must read the session id back to persist it)
/// - Max age: 3600s
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static(SESSION_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(SESSION_STATUS_HEADER),
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("retry-after"),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}
