use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use uuid::Uuid;

use crate::AppState;

const MAX_BODY_LOG_SIZE: usize = 1024; // 1KB limit for body logging
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_logger_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    // Honour an id set by a proxy in front of us.
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&request_id).ok();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    if let Some(value) = &header_value {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    if state.log_request_body {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_BODY_LOG_SIZE).await {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    method = %method,
                    uri = %uri,
                    "Request body too large or failed to read"
                );
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
            }
        };

        let sanitized_body = match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(json) => {
                let sanitized = crate::utils::sanitize::sanitize_json(&json);
                serde_json::to_string(&sanitized).unwrap_or_else(|_| "[invalid json]".to_string())
            }
            Err(_) => format!("[non-json, {} bytes]", bytes.len()),
        };

        tracing::info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            body_size = bytes.len(),
            body = %sanitized_body,
            "Incoming request"
        );

        req = Request::from_parts(parts, Body::from(bytes));
    } else {
        tracing::info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            "Incoming request"
        );
    }

    let mut response = next.run(req).await;

    let latency = start.elapsed();
    let status = response.status();
    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status.as_u16(),
        latency_ms = latency.as_millis(),
        "Outgoing response"
    );

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedger;
    use axum::http::Request;
    use axum::{routing::post, Router};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(log_body: bool) -> Router {
        let ledger = Arc::new(InMemoryLedger::new());
        let state = AppState::new(ledger.clone(), ledger, chrono::Duration::days(7), "admin-key-0123456789")
            .with_request_body_logging(log_body);
        Router::new()
            .route("/test", post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn_with_state(state.clone(), request_logger_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn test_request_logger_adds_request_id() {
        let response = app(false)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_request_logger_keeps_incoming_id_and_body() {
        let response = app(true)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::from(r#"{"claim_token":"abcdefghijkl"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "req-42");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], br#"{"claim_token":"abcdefghijkl"}"#);
    }
}
