//! Storage ports. Services depend on these traits; adapters implement them.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Account, AccountType, InsufficientFunds, OutboxEvent, TransactionRecord, Transfer, TransferPlan,
    UnknownVariant, User,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds in account {0}")]
    InsufficientFunds(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("claim expired for transfer {0}")]
    ClaimExpired(Uuid),

    #[error("row lock not acquired in time")]
    Busy,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";
const SERIALIZATION_FAILURE: &str = "40001";
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        let (code, constraint) = match &err {
            sqlx::Error::RowNotFound => return RepositoryError::NotFound("row".to_string()),
            sqlx::Error::Database(db) => (
                db.code().map(|code| code.into_owned()),
                db.constraint().map(str::to_string),
            ),
            _ => (None, None),
        };

        match code.as_deref() {
            Some(LOCK_NOT_AVAILABLE) | Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE) => {
                RepositoryError::Busy
            }
            Some(UNIQUE_VIOLATION) => {
                RepositoryError::Conflict(constraint.unwrap_or_else(|| "unique constraint".to_string()))
            }
            _ => RepositoryError::Database(err),
        }
    }
}

impl From<UnknownVariant> for RepositoryError {
    fn from(err: UnknownVariant) -> Self {
        RepositoryError::Corrupt(err.to_string())
    }
}

impl From<InsufficientFunds> for RepositoryError {
    fn from(err: InsufficientFunds) -> Self {
        RepositoryError::InsufficientFunds(err.account_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: String,
    pub api_token_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    /// Transfers where any of these accounts is sender or recipient.
    pub account_ids: Vec<Uuid>,
    pub reference: Option<String>,
    pub limit: i64,
}

/// Accounts, users, the transaction log and transfers.
///
/// The `commit_*`, `claim_*`, `expire_*` and `deposit` operations are each a
/// single atomic unit: they lock the account rows they touch, re-check funds
/// under the lock and either apply every write or none.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn ping(&self) -> RepositoryResult<()>;

    /// Creates the user together with a zero-balance account of every type.
    async fn create_user(&self, user: NewUser) -> RepositoryResult<(User, Vec<Account>)>;

    async fn find_user_by_token_hash(&self, token_hash: &str) -> RepositoryResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> RepositoryResult<Option<User>>;

    async fn find_users_by_display_name(&self, display_name: &str) -> RepositoryResult<Vec<User>>;

    async fn get_account(&self, id: Uuid) -> RepositoryResult<Account>;

    async fn find_account(&self, owner_id: Uuid, account_type: AccountType) -> RepositoryResult<Option<Account>>;

    async fn accounts_for_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Account>>;

    /// Newest first.
    async fn list_transactions(&self, account_id: Uuid, limit: i64) -> RepositoryResult<Vec<TransactionRecord>>;

    /// Newest first.
    async fn list_transfers(&self, filter: &TransferFilter) -> RepositoryResult<Vec<Transfer>>;

    async fn find_transfer_by_claim(&self, claim_token_hash: &str) -> RepositoryResult<Option<Transfer>>;

    async fn commit_transfer(&self, plan: TransferPlan) -> RepositoryResult<Transfer>;

    async fn claim_transfer(
        &self,
        claim_token_hash: &str,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Transfer>;

    /// Fails pending transfers whose claim window closed and refunds the sender.
    async fn expire_pending_transfers(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<Transfer>>;

    async fn deposit(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        description: String,
    ) -> RepositoryResult<(Account, TransactionRecord)>;
}

/// A reservation with no stored response older than this is treated as
/// abandoned and may be taken over by the next request with the same payload.
pub const IDEMPOTENCY_LEASE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus {
    /// First sighting, or a takeover of an abandoned reservation. The key
    /// is now reserved for this request.
    New,
    /// Reserved by an earlier request that has not finished.
    Processing,
    Completed(StoredResponse),
    /// Key already used with a different request body.
    Mismatch,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check_idempotency(&self, key: &str, request_hash: &str) -> RepositoryResult<IdempotencyStatus>;

    async fn store_response(&self, key: &str, response: StoredResponse) -> RepositoryResult<()>;

    async fn release_lock(&self, key: &str) -> RepositoryResult<()>;

    /// Removes keys created before `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Leases up to `limit` due events so no other dispatcher picks them up
    /// for `lease`.
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> RepositoryResult<Vec<OutboxEvent>>;

    async fn mark_delivered(&self, id: Uuid) -> RepositoryResult<()>;

    /// Records a failed attempt. `retry_at = None` gives up on the event.
    async fn mark_failed(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> RepositoryResult<()>;
}
