use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use switchyard_core::error::{ApiError, codes};
use tower_governor::{
    GovernorError, GovernorLayer, governor::GovernorConfigBuilder,
    key_extractor::SmartIpKeyExtractor,
};

type RateLimitLayer =
    GovernorLayer<SmartIpKeyExtractor, governor::middleware::NoOpMiddleware, axum::body::Body>;

/// Burst limit for conversation message routes: 20 requests, then one every
/// 2 seconds per IP. Daily quotas are enforced separately by the usage limiter.
pub fn turn_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for turns"),
    )
    .error_handler(json_error_handler)
}

/// Burst limit for voice routes: 10 requests, then one every 6 seconds per IP.
pub fn voice_layer() -> RateLimitLayer {
    GovernorLayer::new(
        GovernorConfigBuilder::default()
            .per_second(6)
            .burst_size(10)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("invalid governor config for voice"),
    )
    .error_handler(json_error_handler)
}

/// Render governor rejections in the `ApiError` format with `retry-after`.
fn json_error_handler(err: GovernorError) -> Response {
    let (status, retry_after, message) = match err {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Some(wait_time),
            format!("Too many requests. Retry after {wait_time} seconds."),
        ),
        GovernorError::UnableToExtractKey => (
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "Unable to determine client identity for rate limiting".to_string(),
        ),
        GovernorError::Other { code, msg, .. } => (code, None, msg.unwrap_or_default()),
    };

    let body = ApiError {
        error: codes::RATE_LIMITED.to_string(),
        message,
        field: None,
        received: None,
        request_id: uuid::Uuid::now_v7().to_string(),
        docs_hint: None,
    };
    let mut response = (status, Json(body)).into_response();
    if let Some(seconds) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn too_many_requests_renders_api_error() {
        let response = json_error_handler(GovernorError::TooManyRequests {
            wait_time: 4,
            headers: None,
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "4");

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let error: ApiError = serde_json::from_slice(&body).expect("ApiError body");
        assert_eq!(error.error, codes::RATE_LIMITED);
    }
}
