use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::accounts::DepositRequest;
use crate::AppState;

/// Operator credit into any account. Mounted behind `admin_auth`.
pub async fn deposit(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<DepositRequest>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state.accounts.deposit(account_id, request).await?;
    Ok(Json(receipt))
}
