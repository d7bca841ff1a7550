use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::Caller;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub account_id: Uuid,
    pub limit: Option<i64>,
}

/// Ledger rows for one of the caller's accounts, newest first, each with
/// `balance_after`.
pub async fn list_transactions(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, AppError> {
    let entries = state
        .accounts
        .history(&user, params.account_id, params.limit)
        .await?;
    Ok(Json(entries))
}
