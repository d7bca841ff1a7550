//! Transfer orchestration: validation, recipient routing, the atomic commit
//! and the live-update broadcast that follows it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Account, AccountType, PlannedRecipient, Transfer, TransferEvent, TransferEventKind, TransferPlan,
    TransferStatus, User,
};
use crate::ports::{LedgerRepository, RepositoryError, TransferFilter};
use crate::services::connections::ConnectionManager;
use crate::services::tokens::{generate_token, hash_token};
use crate::validation::{
    parse_money, sanitize_string, validate_bank_account_number, validate_btc_address, validate_description,
    validate_email, validate_enum, validate_required, validate_routing_number, ValidationError,
    ALLOWED_METHODS,
};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;
const EXPIRY_BATCH: i64 = 100;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("sender account not found")]
    SenderNotFound,

    #[error("account does not belong to the caller")]
    Forbidden,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("recipient could not be resolved to an account or external destination")]
    RecipientUnresolved,

    #[error("recipient name '{0}' matches more than one user")]
    RecipientAmbiguous(String),

    #[error("recipient account {0} not found")]
    RecipientNotFound(Uuid),

    #[error("sender and recipient are the same account")]
    SelfTransfer,

    #[error("claim token not found")]
    ClaimNotFound,

    #[error("transfer has already been claimed or closed")]
    ClaimAlreadyUsed,

    #[error("claim token has expired")]
    ClaimExpired,

    #[error("accounts are busy, retry shortly")]
    Busy,

    #[error("storage error: {0}")]
    Store(RepositoryError),

    #[error("transfer task failed: {0}")]
    Interrupted(String),
}

impl From<RepositoryError> for TransferError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Busy => TransferError::Busy,
            RepositoryError::InsufficientFunds(_) => TransferError::InsufficientFunds,
            RepositoryError::ClaimExpired(_) => TransferError::ClaimExpired,
            other => TransferError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalAccount {
    pub account_number: String,
    pub routing_number: String,
}

/// Body of `POST /transfers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferRequest {
    pub sender_account_id: Option<Uuid>,
    pub sender_email: Option<String>,
    pub sender_account_type: Option<AccountType>,
    pub recipient_account_id: Option<Uuid>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
    pub recipient_account_type: Option<AccountType>,
    pub external: Option<ExternalAccount>,
    pub btc_address: Option<String>,
    #[serde(default)]
    pub amount: serde_json::Value,
    pub method: Option<String>,
    pub description: Option<String>,
}

impl TransferRequest {
    fn has_external_descriptor(&self) -> bool {
        self.external.is_some() || self.btc_address.is_some() || self.recipient_email.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub claim_token: String,
    pub account_id: Uuid,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferQuery {
    pub account_id: Option<Uuid>,
    pub reference: Option<String>,
    pub limit: Option<i64>,
}

/// What the sender gets back. The raw claim token is returned here; when the
/// request carried an `Idempotency-Key` this body, token included, is also
/// kept as the stored response so a replay hands back the same token.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    #[serde(flatten)]
    pub transfer: Transfer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
}

enum Recipient {
    Internal(Account),
    External { external_ref: String, method: &'static str },
}

pub struct TransferService {
    ledger: Arc<dyn LedgerRepository>,
    connections: ConnectionManager,
    claim_ttl: Duration,
}

impl TransferService {
    pub fn new(ledger: Arc<dyn LedgerRepository>, connections: ConnectionManager, claim_ttl: Duration) -> Self {
        Self {
            ledger,
            connections,
            claim_ttl,
        }
    }

    pub async fn create_transfer(
        &self,
        caller: &User,
        request: TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let amount = parse_money(&request.amount).map_err(|e| TransferError::InvalidAmount(e.message))?;

        let sender = self.resolve_sender(caller, &request).await?;
        if !sender.can_cover(&amount) {
            return Err(TransferError::InsufficientFunds);
        }

        let description = clean_description(request.description.as_deref())?;
        if let Some(method) = &request.method {
            validate_enum("method", method, ALLOWED_METHODS)?;
        }

        let recipient = self.resolve_recipient(&request).await?;

        let (planned, recipient_owner, default_method, claim_token) = match recipient {
            Recipient::Internal(account) => {
                if account.id == sender.id {
                    return Err(TransferError::SelfTransfer);
                }
                (
                    PlannedRecipient::Internal { account_id: account.id },
                    Some(account.owner_id),
                    "internal",
                    None,
                )
            }
            Recipient::External { external_ref, method } => {
                let token = generate_token();
                (
                    PlannedRecipient::External {
                        external_ref,
                        claim_token_hash: hash_token(&token),
                        claim_expires_at: Utc::now() + self.claim_ttl,
                    },
                    None,
                    method,
                    Some(token),
                )
            }
        };

        let method = request.method.unwrap_or_else(|| default_method.to_string());
        let plan = TransferPlan::new(sender.id, planned, amount, method, description);

        // Runs detached so a dropped request cannot cancel it between the
        // balance updates and the commit.
        let ledger = Arc::clone(&self.ledger);
        let transfer = tokio::spawn(async move { ledger.commit_transfer(plan).await })
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))??;

        tracing::info!(
            transfer_id = %transfer.id,
            reference = %transfer.reference,
            sender_account_id = %transfer.sender_account_id,
            amount = %transfer.amount,
            status = %transfer.status,
            internal = transfer.is_internal(),
            "Transfer committed"
        );

        let mut audience = vec![caller.id];
        audience.extend(recipient_owner);
        self.publish(TransferEventKind::Created, &transfer, &audience);

        Ok(TransferReceipt {
            transfer,
            claim_token,
        })
    }

    /// Credits a pending external transfer to one of the caller's accounts.
    pub async fn claim_transfer(&self, caller: &User, request: ClaimRequest) -> Result<Transfer, TransferError> {
        validate_required("claim_token", &request.claim_token)?;

        let account = self
            .find_account(request.account_id)
            .await?
            .ok_or(TransferError::RecipientNotFound(request.account_id))?;
        if account.owner_id != caller.id {
            return Err(TransferError::Forbidden);
        }

        let token_hash = hash_token(&request.claim_token);
        let pending = self
            .ledger
            .find_transfer_by_claim(&token_hash)
            .await?
            .ok_or(TransferError::ClaimNotFound)?;
        if pending.status != TransferStatus::Pending {
            return Err(TransferError::ClaimAlreadyUsed);
        }
        let now = Utc::now();
        if pending.claim_expired(now) {
            return Err(TransferError::ClaimExpired);
        }
        if pending.sender_account_id == account.id {
            return Err(TransferError::SelfTransfer);
        }

        let ledger = Arc::clone(&self.ledger);
        let account_id = account.id;
        let claimed = tokio::spawn(async move { ledger.claim_transfer(&token_hash, account_id, now).await })
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))?
            .map_err(|e| match e {
                RepositoryError::NotFound(_) => TransferError::ClaimNotFound,
                RepositoryError::Conflict(_) => TransferError::ClaimAlreadyUsed,
                other => other.into(),
            })?;

        tracing::info!(
            transfer_id = %claimed.id,
            reference = %claimed.reference,
            account_id = %account_id,
            "Pending transfer claimed"
        );

        let mut audience = vec![caller.id];
        audience.extend(self.owner_of(claimed.sender_account_id).await);
        self.publish(TransferEventKind::Updated, &claimed, &audience);

        Ok(claimed)
    }

    /// Fails pending transfers whose claim window has closed, refunding senders.
    pub async fn expire_pending(&self, now: DateTime<Utc>) -> Result<Vec<Transfer>, TransferError> {
        let mut expired = Vec::new();
        loop {
            let batch = self.ledger.expire_pending_transfers(now, EXPIRY_BATCH).await?;
            let done = (batch.len() as i64) < EXPIRY_BATCH;
            for transfer in &batch {
                tracing::info!(
                    transfer_id = %transfer.id,
                    reference = %transfer.reference,
                    "Unclaimed transfer expired, sender refunded"
                );
                let audience: Vec<Uuid> = self.owner_of(transfer.sender_account_id).await.into_iter().collect();
                self.publish(TransferEventKind::Updated, transfer, &audience);
            }
            expired.extend(batch);
            if done {
                break;
            }
        }
        Ok(expired)
    }

    /// Transfers touching the caller's accounts, newest first.
    pub async fn list_transfers(&self, caller: &User, query: TransferQuery) -> Result<Vec<Transfer>, TransferError> {
        let own: Vec<Uuid> = self
            .ledger
            .accounts_for_owner(caller.id)
            .await?
            .into_iter()
            .map(|account| account.id)
            .collect();

        let account_ids = match query.account_id {
            Some(id) if own.contains(&id) => vec![id],
            Some(_) => return Err(TransferError::Forbidden),
            None => own,
        };

        let filter = TransferFilter {
            account_ids,
            reference: query.reference.map(|r| sanitize_string(&r)).filter(|r| !r.is_empty()),
            limit: clamp_limit(query.limit),
        };
        Ok(self.ledger.list_transfers(&filter).await?)
    }

    async fn resolve_sender(&self, caller: &User, request: &TransferRequest) -> Result<Account, TransferError> {
        if let Some(id) = request.sender_account_id {
            let account = self.find_account(id).await?.ok_or(TransferError::SenderNotFound)?;
            if account.owner_id != caller.id {
                return Err(TransferError::Forbidden);
            }
            return Ok(account);
        }

        if let Some(email) = &request.sender_email {
            if normalize_email(email) != caller.email {
                return Err(TransferError::Forbidden);
            }
        }

        let account_type = request.sender_account_type.unwrap_or(AccountType::Checking);
        self.ledger
            .find_account(caller.id, account_type)
            .await?
            .ok_or(TransferError::SenderNotFound)
    }

    /// Internal matches win; external descriptors are the fallback.
    async fn resolve_recipient(&self, request: &TransferRequest) -> Result<Recipient, TransferError> {
        let account_type = request.recipient_account_type.unwrap_or(AccountType::Checking);

        if let Some(id) = request.recipient_account_id {
            match self.find_account(id).await? {
                Some(account) => return Ok(Recipient::Internal(account)),
                None if !request.has_external_descriptor() => return Err(TransferError::RecipientNotFound(id)),
                None => {}
            }
        }

        if let Some(email) = &request.recipient_email {
            let email = normalize_email(email);
            validate_email("recipient_email", &email)?;
            if let Some(user) = self.ledger.find_user_by_email(&email).await? {
                if let Some(account) = self.ledger.find_account(user.id, account_type).await? {
                    return Ok(Recipient::Internal(account));
                }
            }
        }

        if let Some(name) = &request.recipient_name {
            let name = sanitize_string(name);
            validate_required("recipient_name", &name)?;
            let mut users = self.ledger.find_users_by_display_name(&name).await?;
            if users.len() > 1 {
                return Err(TransferError::RecipientAmbiguous(name));
            }
            if let Some(user) = users.pop() {
                if let Some(account) = self.ledger.find_account(user.id, account_type).await? {
                    return Ok(Recipient::Internal(account));
                }
            }
        }

        if let Some(bank) = &request.external {
            let routing = sanitize_string(&bank.routing_number);
            let account_number = sanitize_string(&bank.account_number);
            validate_routing_number(&routing)?;
            validate_bank_account_number(&account_number)?;
            return Ok(Recipient::External {
                external_ref: format!("ach:{}/{}", routing, account_number),
                method: "ach",
            });
        }

        if let Some(address) = &request.btc_address {
            let address = address.trim();
            validate_btc_address(address)?;
            return Ok(Recipient::External {
                external_ref: format!("btc:{}", address),
                method: "crypto",
            });
        }

        if let Some(email) = &request.recipient_email {
            return Ok(Recipient::External {
                external_ref: format!("email:{}", normalize_email(email)),
                method: "email",
            });
        }

        Err(TransferError::RecipientUnresolved)
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>, TransferError> {
        match self.ledger.get_account(id).await {
            Ok(account) => Ok(Some(account)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn owner_of(&self, account_id: Uuid) -> Option<Uuid> {
        match self.ledger.get_account(account_id).await {
            Ok(account) => Some(account.owner_id),
            Err(e) => {
                tracing::warn!(account_id = %account_id, error = %e, "Could not look up account owner for broadcast");
                None
            }
        }
    }

    fn publish(&self, kind: TransferEventKind, transfer: &Transfer, audience: &[Uuid]) {
        let event = TransferEvent::new(kind, transfer.clone());
        let delivered = self.connections.broadcast(&event, audience);
        tracing::debug!(transfer_id = %transfer.id, kind = %kind, delivered, "Live update broadcast");
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn clean_description(description: Option<&str>) -> Result<Option<String>, TransferError> {
    let Some(text) = description.map(sanitize_string).filter(|text| !text.is_empty()) else {
        return Ok(None);
    };
    validate_description(&text)?;
    Ok(Some(text))
}
