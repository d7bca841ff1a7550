use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::domain::User;
use crate::error::AppError;
use crate::AppState;

/// The user behind the request's bearer token.
#[derive(Debug, Clone)]
pub struct Caller(pub User);

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// `?token=` fallback for clients that cannot set headers (EventSource).
fn query_token(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(&parts.headers) {
            Some(token) => token.to_string(),
            None => query_token(parts)
                .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?,
        };

        match state.accounts.authenticate(&token).await? {
            Some(user) => Ok(Caller(user)),
            None => Err(AppError::Unauthorized("invalid bearer token".to_string())),
        }
    }
}

/// Guards operator routes with `ADMIN_API_KEY`, sent as a bearer token.
pub async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, AppError> {
    let authorized = match bearer_token(req.headers()) {
        Some(key) => key == &*state.admin_api_key,
        None => false,
    };

    if !authorized {
        tracing::warn!(uri = %req.uri(), "Rejected admin request");
        return Err(AppError::Unauthorized("admin key required".to_string()));
    }

    Ok(next.run(req).await)
}
