//! Registration, bearer-token lookup, balances and history.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{with_running_balances, Account, BalancedEntry, TransactionRecord, User};
use crate::ports::{LedgerRepository, NewUser, RepositoryError};
use crate::services::tokens::{generate_token, hash_token};
use crate::services::transfer::{clamp_limit, normalize_email};
use crate::validation::{
    parse_money, sanitize_string, validate_description, validate_display_name, validate_email, ValidationError,
};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("email is already registered")]
    EmailTaken,

    #[error("account {0} not found")]
    NotFound(Uuid),

    #[error("account does not belong to the caller")]
    Forbidden,

    #[error("accounts are busy, retry shortly")]
    Busy,

    #[error("storage error: {0}")]
    Store(RepositoryError),
}

impl From<RepositoryError> for AccountError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Busy => AccountError::Busy,
            other => AccountError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub user: User,
    pub accounts: Vec<Account>,
    /// Shown once; only its hash is kept.
    pub api_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    #[serde(default)]
    pub amount: serde_json::Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositReceipt {
    pub account: Account,
    pub transaction: TransactionRecord,
}

pub struct AccountService {
    ledger: Arc<dyn LedgerRepository>,
}

impl AccountService {
    pub fn new(ledger: Arc<dyn LedgerRepository>) -> Self {
        Self { ledger }
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<Registration, AccountError> {
        let email = normalize_email(&request.email);
        let display_name = sanitize_string(&request.display_name);
        validate_email("email", &email)?;
        validate_display_name(&display_name)?;

        let api_token = generate_token();
        let (user, accounts) = self
            .ledger
            .create_user(NewUser {
                email,
                display_name,
                api_token_hash: hash_token(&api_token),
            })
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => AccountError::EmailTaken,
                other => other.into(),
            })?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(Registration {
            user,
            accounts,
            api_token,
        })
    }

    pub async fn authenticate(&self, token: &str) -> Result<Option<User>, AccountError> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        Ok(self.ledger.find_user_by_token_hash(&hash_token(token)).await?)
    }

    pub async fn accounts(&self, caller: &User) -> Result<Vec<Account>, AccountError> {
        Ok(self.ledger.accounts_for_owner(caller.id).await?)
    }

    /// Newest entries first, each with the balance right after it posted.
    pub async fn history(
        &self,
        caller: &User,
        account_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<BalancedEntry>, AccountError> {
        let account = self.owned_account(caller, account_id).await?;
        let entries = self.ledger.list_transactions(account.id, clamp_limit(limit)).await?;
        Ok(with_running_balances(&account.balance, entries))
    }

    /// Operator credit. Bypasses ownership; guarded by the admin key upstream.
    pub async fn deposit(&self, account_id: Uuid, request: DepositRequest) -> Result<DepositReceipt, AccountError> {
        let amount = parse_money(&request.amount).map_err(|e| AccountError::InvalidAmount(e.message))?;
        let description = request
            .description
            .map(|d| sanitize_string(&d))
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "Deposit".to_string());
        validate_description(&description)?;

        let ledger = Arc::clone(&self.ledger);
        let (account, transaction) = tokio::spawn(async move { ledger.deposit(account_id, amount, description).await })
            .await
            .map_err(|e| AccountError::Store(RepositoryError::Corrupt(e.to_string())))?
            .map_err(|e| match e {
                RepositoryError::NotFound(_) => AccountError::NotFound(account_id),
                other => other.into(),
            })?;

        tracing::info!(
            account_id = %account.id,
            amount = %transaction.amount,
            at = %Utc::now(),
            "Deposit posted"
        );
        Ok(DepositReceipt { account, transaction })
    }

    async fn owned_account(&self, caller: &User, account_id: Uuid) -> Result<Account, AccountError> {
        let account = self.ledger.get_account(account_id).await.map_err(|e| match e {
            RepositoryError::NotFound(_) => AccountError::NotFound(account_id),
            other => other.into(),
        })?;
        if account.owner_id != caller.id {
            return Err(AccountError::Forbidden);
        }
        Ok(account)
    }
}
