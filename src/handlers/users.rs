use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::error::AppError;
use crate::middleware::auth::Caller;
use crate::services::accounts::RegisterRequest;
use crate::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registration = state.accounts.register(request).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

pub async fn list_accounts(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Result<impl IntoResponse, AppError> {
    let accounts = state.accounts.accounts(&user).await?;
    Ok(Json(accounts))
}
