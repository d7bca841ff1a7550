//! Row types for SQLx. Enum columns are stored as text and parsed on the way out.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{Account, OutboxEvent, TransactionRecord, Transfer, User};
use crate::ports::RepositoryError;

#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub api_token_hash: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            api_token_hash: row.api_token_hash,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub account_type: String,
    pub balance: BigDecimal,
    pub available: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = RepositoryError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            owner_id: row.owner_id,
            account_type: row.account_type.parse()?,
            balance: row.balance,
            available: row.available,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub amount: BigDecimal,
    pub description: String,
    pub transfer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = RepositoryError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(TransactionRecord {
            id: row.id,
            account_id: row.account_id,
            direction: row.direction.parse()?,
            amount: row.amount,
            description: row.description,
            transfer_id: row.transfer_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct TransferRow {
    pub id: Uuid,
    pub reference: String,
    pub sender_account_id: Uuid,
    pub recipient_account_id: Option<Uuid>,
    pub recipient_external_ref: Option<String>,
    pub amount: BigDecimal,
    pub method: String,
    pub description: Option<String>,
    pub status: String,
    pub claim_token_hash: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = RepositoryError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        Ok(Transfer {
            id: row.id,
            reference: row.reference,
            sender_account_id: row.sender_account_id,
            recipient_account_id: row.recipient_account_id,
            recipient_external_ref: row.recipient_external_ref,
            amount: row.amount,
            method: row.method,
            description: row.description,
            status: row.status.parse()?,
            claim_token_hash: row.claim_token_hash,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct OutboxRow {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = RepositoryError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct IdempotencyRow {
    pub key: String,
    pub request_hash: String,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn collect_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>, RepositoryError>
where
    T: TryFrom<R, Error = RepositoryError>,
{
    rows.into_iter().map(<T as TryFrom<R>>::try_from).collect()
}
