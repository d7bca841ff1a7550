//! Events emitted after a transfer commits: live updates and outbox rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::account::UnknownVariant;
use super::transfer::Transfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferEventKind {
    #[serde(rename = "transfer.created")]
    Created,
    #[serde(rename = "transfer.updated")]
    Updated,
}

impl TransferEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferEventKind::Created => "transfer.created",
            TransferEventKind::Updated => "transfer.updated",
        }
    }
}

impl fmt::Display for TransferEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live update pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct TransferEvent {
    pub kind: TransferEventKind,
    pub transfer: Transfer,
    pub timestamp: DateTime<Utc>,
}

impl TransferEvent {
    pub fn new(kind: TransferEventKind, transfer: Transfer) -> Self {
        Self {
            kind,
            transfer,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Dead => "dead",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "delivered" => Ok(OutboxStatus::Delivered),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Durable record of a side effect still owed to the outside world.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn for_transfer(kind: TransferEventKind, transfer: &Transfer) -> Self {
        let now = Utc::now();
        let payload = serde_json::to_value(transfer).unwrap_or(serde_json::Value::Null);
        Self {
            id: Uuid::new_v4(),
            event_type: kind.as_str().to_string(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            delivered_at: None,
        }
    }
}
