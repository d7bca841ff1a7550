use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::db::queries;
use crate::domain::OutboxEvent;
use crate::ports::{OutboxStore, RepositoryResult};

#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> RepositoryResult<Vec<OutboxEvent>> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        queries::lease_due_outbox(&self.pool, now, lease_until, limit).await
    }

    async fn mark_delivered(&self, id: Uuid) -> RepositoryResult<()> {
        queries::mark_outbox_delivered(&self.pool, id).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> RepositoryResult<()> {
        queries::mark_outbox_failed(&self.pool, id, error, retry_at).await
    }
}
