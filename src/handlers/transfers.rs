use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::error::AppError;
use crate::middleware::auth::Caller;
use crate::services::transfer::{ClaimRequest, TransferQuery, TransferRequest};
use crate::AppState;

pub async fn create_transfer(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(request): Json<TransferRequest>,
) -> Result<impl IntoResponse, AppError> {
    let receipt = state.transfers.create_transfer(&user, request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(query): Query<TransferQuery>,
) -> Result<impl IntoResponse, AppError> {
    let transfers = state.transfers.list_transfers(&user, query).await?;
    Ok(Json(transfers))
}

pub async fn claim_transfer(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(request): Json<ClaimRequest>,
) -> Result<impl IntoResponse, AppError> {
    let transfer = state.transfers.claim_transfer(&user, request).await?;
    Ok(Json(transfer))
}
