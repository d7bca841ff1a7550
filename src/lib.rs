pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod utils;
pub mod validation;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::ports::{IdempotencyStore, LedgerRepository};
use crate::services::{AccountService, ConnectionManager, TransferService};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerRepository>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub accounts: Arc<AccountService>,
    pub transfers: Arc<TransferService>,
    pub connections: ConnectionManager,
    pub admin_api_key: Arc<str>,
    pub log_request_body: bool,
    /// Present when backed by Postgres; used for pool stats in `/health`.
    pub pool: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        idempotency: Arc<dyn IdempotencyStore>,
        claim_ttl: chrono::Duration,
        admin_api_key: &str,
    ) -> Self {
        let connections = ConnectionManager::new();
        Self {
            accounts: Arc::new(AccountService::new(Arc::clone(&ledger))),
            transfers: Arc::new(TransferService::new(Arc::clone(&ledger), connections.clone(), claim_ttl)),
            ledger,
            idempotency,
            connections,
            admin_api_key: Arc::from(admin_api_key),
            log_request_body: false,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: sqlx::PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_request_body_logging(mut self, enabled: bool) -> Self {
        self.log_request_body = enabled;
        self
    }
}

pub fn create_app(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/accounts/:id/deposit", post(handlers::admin::deposit))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth::admin_auth));

    // Mutating routes that honour `Idempotency-Key`.
    let idempotent = Router::new()
        .route(
            "/transfers",
            post(handlers::transfers::create_transfer).get(handlers::transfers::list_transfers),
        )
        .route("/transfers/claim", post(handlers::transfers::claim_transfer))
        .merge(admin)
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::idempotency::idempotency_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/users", post(handlers::users::register))
        .route("/accounts", get(handlers::users::list_accounts))
        .route("/transactions", get(handlers::transactions::list_transactions))
        .route("/events", get(handlers::events::stream_events))
        .merge(idempotent)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::request_logger::request_logger_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
