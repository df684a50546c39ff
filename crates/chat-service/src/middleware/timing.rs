//! Execution-time logging for HTTP requests.
//!
//! Records every response, including framework-level 404/405/415 errors,
//! under the matched route template so raw ids never become metric labels.

use crate::observability::metrics::record_http_request;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{debug, warn};

/// Requests slower than this are logged at warn.
const SLOW_REQUEST_MS: u128 = 1000;

/// Log and record how long each request took.
pub async fn log_execution_time(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status_code = response.status().as_u16();
    record_http_request(&method, &endpoint, status_code, duration);

    if duration.as_millis() >= SLOW_REQUEST_MS {
        warn!(
            target: "chat.http",
            method = %method,
            endpoint = %endpoint,
            status = status_code,
            elapsed_ms = duration.as_millis(),
            "Slow request"
        );
    } else {
        debug!(
            target: "chat.http",
            method = %method,
            endpoint = %endpoint,
            status = status_code,
            elapsed_ms = duration.as_millis(),
            "Request completed"
        );
    }

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn test_app() -> Router {
        Router::new()
            .route("/users/:id", get(|| async { "OK" }))
            .route(
                "/error",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "Error") }),
            )
            .layer(middleware::from_fn(log_execution_time))
    }

    async fn status_of(uri: &str) -> StatusCode {
        let request = HttpRequest::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        test_app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_passes_responses_through() {
        assert_eq!(status_of("/users/42").await, StatusCode::OK);
        assert_eq!(status_of("/error").await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_of("/missing").await, StatusCode::NOT_FOUND);
    }
}
