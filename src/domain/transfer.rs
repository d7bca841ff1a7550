//! Transfer entity and the routing decision made for it.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::account::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    pub id: Uuid,
    pub reference: String,
    pub sender_account_id: Uuid,
    pub recipient_account_id: Option<Uuid>,
    pub recipient_external_ref: Option<String>,
    pub amount: BigDecimal,
    pub method: String,
    pub description: Option<String>,
    pub status: TransferStatus,
    #[serde(skip_serializing)]
    pub claim_token_hash: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn is_internal(&self) -> bool {
        self.recipient_external_ref.is_none()
    }

    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires_at.map_or(false, |expires| expires <= now)
    }
}

/// Where the credit leg of a transfer goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedRecipient {
    /// Settles immediately against an account in this ledger.
    Internal { account_id: Uuid },
    /// Held as pending until redeemed with the claim token.
    External {
        external_ref: String,
        claim_token_hash: String,
        claim_expires_at: DateTime<Utc>,
    },
}

/// A fully validated transfer, ready for the atomic unit.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub id: Uuid,
    pub reference: String,
    pub sender_account_id: Uuid,
    pub recipient: PlannedRecipient,
    pub amount: BigDecimal,
    pub method: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferPlan {
    pub fn new(
        sender_account_id: Uuid,
        recipient: PlannedRecipient,
        amount: BigDecimal,
        method: String,
        description: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            reference: reference_for(id),
            sender_account_id,
            recipient,
            amount,
            method,
            description,
            created_at: Utc::now(),
        }
    }

    pub fn recipient_account_id(&self) -> Option<Uuid> {
        match &self.recipient {
            PlannedRecipient::Internal { account_id } => Some(*account_id),
            PlannedRecipient::External { .. } => None,
        }
    }

    /// Builds the row this plan produces once committed.
    pub fn into_transfer(self) -> Transfer {
        let (status, recipient_account_id, recipient_external_ref, claim_token_hash, claim_expires_at) =
            match self.recipient {
                PlannedRecipient::Internal { account_id } => {
                    (TransferStatus::Completed, Some(account_id), None, None, None)
                }
                PlannedRecipient::External {
                    external_ref,
                    claim_token_hash,
                    claim_expires_at,
                } => (
                    TransferStatus::Pending,
                    None,
                    Some(external_ref),
                    Some(claim_token_hash),
                    Some(claim_expires_at),
                ),
            };

        Transfer {
            id: self.id,
            reference: self.reference,
            sender_account_id: self.sender_account_id,
            recipient_account_id,
            recipient_external_ref,
            amount: self.amount,
            method: self.method,
            description: self.description,
            status,
            claim_token_hash,
            claim_expires_at,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }

    pub fn debit_description(&self) -> String {
        match &self.description {
            Some(text) => format!("Transfer {} sent: {}", self.reference, text),
            None => format!("Transfer {} sent", self.reference),
        }
    }

    pub fn credit_description(&self) -> String {
        match &self.description {
            Some(text) => format!("Transfer {} received: {}", self.reference, text),
            None => format!("Transfer {} received", self.reference),
        }
    }
}

/// Short human-facing reference derived from the transfer id.
pub fn reference_for(id: Uuid) -> String {
    let simple = id.simple().to_string().to_uppercase();
    format!("TRF-{}", &simple[..12])
}

pub fn refund_description(transfer: &Transfer) -> String {
    format!("Refund for unclaimed transfer {}", transfer.reference)
}
