use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

/// Security-header baseline for every response. Conversation payloads are
/// marked uncacheable unless the handler chose a cache policy itself.
pub async fn apply(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    let baseline: [(HeaderName, &'static str); 4] = [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::REFERRER_POLICY, "no-referrer"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::CONTENT_SECURITY_POLICY, "frame-ancestors 'none'"),
    ];
    for (name, value) in baseline {
        headers.insert(name, HeaderValue::from_static(value));
    }
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use axum::routing::get;
    use axum::{Router, middleware};
    use tower::ServiceExt;

    async fn ok() -> StatusCode {
        StatusCode::OK
    }

    async fn cached() -> ([(header::HeaderName, &'static str); 1], StatusCode) {
        ([(header::CACHE_CONTROL, "max-age=60")], StatusCode::OK)
    }

    async fn get_headers(path: &str) -> axum::http::HeaderMap {
        let app = Router::new()
            .route("/health", get(ok))
            .route("/cached", get(cached))
            .layer(middleware::from_fn(super::apply));
        app.oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("request should succeed")
        .headers()
        .clone()
    }

    #[tokio::test]
    async fn baseline_and_no_store_are_applied() {
        let headers = get_headers("/health").await;
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn handler_cache_policy_is_kept() {
        let headers = get_headers("/cached").await;
        assert_eq!(headers[header::CACHE_CONTROL], "max-age=60");
    }
}
