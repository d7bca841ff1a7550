//! Postgres-backed idempotency keys.
//!
//! A key is reserved by inserting a row without a response. The row is
//! completed with the response once the handler succeeds, or deleted so the
//! client can retry. A row left without a response past the lease is taken
//! over by the next request carrying the same payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::queries;
use crate::ports::{IdempotencyStatus, IdempotencyStore, RepositoryResult, StoredResponse, IDEMPOTENCY_LEASE_SECS};

#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check_idempotency(&self, key: &str, request_hash: &str) -> RepositoryResult<IdempotencyStatus> {
        if queries::reserve_idempotency_key(&self.pool, key, request_hash, IDEMPOTENCY_LEASE_SECS).await? {
            return Ok(IdempotencyStatus::New);
        }

        let Some(row) = queries::get_idempotency_key(&self.pool, key).await? else {
            // Released between our insert attempt and the read; try once more.
            return if queries::reserve_idempotency_key(&self.pool, key, request_hash, IDEMPOTENCY_LEASE_SECS).await? {
                Ok(IdempotencyStatus::New)
            } else {
                Ok(IdempotencyStatus::Processing)
            };
        };

        if row.request_hash != request_hash {
            return Ok(IdempotencyStatus::Mismatch);
        }

        Ok(match (row.status_code, row.response_body) {
            (Some(status), Some(body)) => IdempotencyStatus::Completed(StoredResponse {
                status: status as u16,
                body,
            }),
            _ => IdempotencyStatus::Processing,
        })
    }

    async fn store_response(&self, key: &str, response: StoredResponse) -> RepositoryResult<()> {
        queries::complete_idempotency_key(&self.pool, key, i32::from(response.status), &response.body).await
    }

    async fn release_lock(&self, key: &str) -> RepositoryResult<()> {
        queries::delete_idempotency_key(&self.pool, key).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        queries::prune_idempotency_keys(&self.pool, cutoff).await
    }
}
