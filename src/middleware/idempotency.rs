//! `Idempotency-Key` handling for mutating routes.
//!
//! The first request with a key reserves it and runs. A 2xx response is
//! stored and replayed verbatim for later requests with the same key and
//! payload; any other outcome releases the key so the client may retry.
//! A reservation that never gets a response is reclaimable after the lease.

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, RETRY_AFTER_SECS};
use crate::ports::{IdempotencyStatus, IdempotencyStore, StoredResponse};
use crate::AppState;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const LEGACY_IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
pub const REPLAYED_HEADER: &str = "idempotent-replayed";
const MAX_KEY_LEN: usize = 255;
const MAX_BODY_BYTES: usize = 1024 * 1024;
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

fn idempotency_key(headers: &HeaderMap) -> Option<Result<String, AppError>> {
    let value = headers
        .get(IDEMPOTENCY_HEADER)
        .or_else(|| headers.get(LEGACY_IDEMPOTENCY_HEADER))?;

    Some(match value.to_str() {
        Ok(key) if !key.trim().is_empty() && key.len() <= MAX_KEY_LEN => Ok(key.trim().to_string()),
        _ => Err(AppError::BadRequest("Invalid idempotency key format".to_string())),
    })
}

/// Keys are per caller: the same key from two tokens never collides.
pub fn scoped_key(headers: &HeaderMap, key: &str) -> String {
    let caller = headers
        .get(header::AUTHORIZATION)
        .map(|value| hex::encode(Sha256::digest(value.as_bytes())))
        .unwrap_or_else(|| "anonymous".to_string());
    format!("{}:{}", &caller[..caller.len().min(16)], key)
}

/// SHA-256 over method, path and the body. JSON bodies are re-serialized
/// with sorted keys first so formatting differences do not matter.
pub fn request_hash(method: &Method, path: &str, body: &[u8]) -> String {
    let canonical = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) => serde_json::to_vec(&json).unwrap_or_else(|_| body.to_vec()),
        Err(_) => body.to_vec(),
    };

    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, stored.body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

pub async fn idempotency_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }

    let key = match idempotency_key(request.headers()) {
        None => return next.run(request).await,
        Some(Err(e)) => return e.into_response(),
        Some(Ok(key)) => scoped_key(request.headers(), &key),
    };

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return AppError::BadRequest("Request body too large".to_string()).into_response();
        }
    };
    let hash = request_hash(&parts.method, parts.uri.path(), &bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    match state.idempotency.check_idempotency(&key, &hash).await {
        Ok(IdempotencyStatus::New) => {}
        Ok(IdempotencyStatus::Completed(stored)) => {
            tracing::info!(idempotency_key = %key, "Replaying stored response");
            return replay(stored);
        }
        Ok(IdempotencyStatus::Mismatch) => {
            return AppError::Conflict("Idempotency-Key was already used with a different request".to_string())
                .into_response();
        }
        Ok(IdempotencyStatus::Processing) => {
            let mut response =
                AppError::Conflict("A request with this Idempotency-Key is in progress".to_string()).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            return response;
        }
        Err(e) => {
            // Fails closed.
            tracing::error!(error = %e, "Idempotency check failed");
            return AppError::Busy("idempotency store unavailable".to_string()).into_response();
        }
    }

    // The handler and the bookkeeping after it run detached so a client that
    // hangs up mid-request cannot strand the reservation.
    let store = Arc::clone(&state.idempotency);
    let settle_key = key.clone();
    let handle = tokio::spawn(async move {
        let response = next.run(request).await;
        settle(store.as_ref(), &settle_key, response).await
    });

    match handle.await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(idempotency_key = %key, error = %e, "Idempotent request task failed");
            AppError::Internal("request interrupted".to_string()).into_response()
        }
    }
}

/// Stores a 2xx response against the key, or releases the key otherwise.
async fn settle(store: &dyn IdempotencyStore, key: &str, response: Response) -> Response {
    if !response.status().is_success() {
        release(store, key).await;
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes: Bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to buffer response body");
            release(store, key).await;
            return AppError::Internal("response body unavailable".to_string()).into_response();
        }
    };

    let stored = StoredResponse {
        status: parts.status.as_u16(),
        body: String::from_utf8_lossy(&bytes).into_owned(),
    };
    let mut attempt = 1;
    loop {
        match store.store_response(key, stored.clone()).await {
            Ok(()) => break,
            Err(e) if attempt < STORE_ATTEMPTS => {
                tracing::warn!(idempotency_key = %key, attempt, error = %e, "Retrying idempotent response store");
                tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                // The reservation lapses after the lease and the key becomes usable again.
                tracing::error!(idempotency_key = %key, error = %e, "Failed to store idempotent response");
                break;
            }
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn release(store: &dyn IdempotencyStore, key: &str) {
    if let Err(e) = store.release_lock(key).await {
        tracing::error!(idempotency_key = %key, error = %e, "Failed to release idempotency key");
    }
}
