//! Postgres implementation of LedgerRepository.
//!
//! Every mutating operation runs in one SQL transaction with a bounded
//! `lock_timeout`; account rows are locked with `SELECT ... FOR UPDATE`
//! before balances are checked.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::domain::{
    transfer::refund_description, Account, AccountType, Direction, OutboxEvent, TransactionRecord,
    Transfer, TransferEventKind, TransferPlan, TransferStatus, User,
};
use crate::ports::{LedgerRepository, NewUser, RepositoryError, RepositoryResult, TransferFilter};

#[derive(Clone)]
pub struct PostgresLedgerRepository {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PostgresLedgerRepository {
    pub fn new(pool: PgPool, lock_timeout_ms: u64) -> Self {
        Self {
            pool,
            lock_timeout_ms,
        }
    }
}

#[async_trait]
impl LedgerRepository for PostgresLedgerRepository {
    async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_user(&self, new_user: NewUser) -> RepositoryResult<(User, Vec<Account>)> {
        let mut tx = self.pool.begin().await?;

        let user = queries::insert_user(
            &mut tx,
            &User::new(new_user.email, new_user.display_name, new_user.api_token_hash),
        )
        .await?;

        let mut accounts = Vec::with_capacity(AccountType::ALL.len());
        for account_type in AccountType::ALL {
            let account = queries::insert_account(&mut tx, &Account::open(user.id, account_type)).await?;
            accounts.push(account);
        }

        tx.commit().await?;
        Ok((user, accounts))
    }

    async fn find_user_by_token_hash(&self, token_hash: &str) -> RepositoryResult<Option<User>> {
        queries::find_user_by_token_hash(&self.pool, token_hash).await
    }

    async fn find_user_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        queries::find_user_by_email(&self.pool, email).await
    }

    async fn find_users_by_display_name(&self, display_name: &str) -> RepositoryResult<Vec<User>> {
        queries::find_users_by_display_name(&self.pool, display_name).await
    }

    async fn get_account(&self, id: Uuid) -> RepositoryResult<Account> {
        queries::get_account(&self.pool, id).await
    }

    async fn find_account(&self, owner_id: Uuid, account_type: AccountType) -> RepositoryResult<Option<Account>> {
        queries::find_account(&self.pool, owner_id, account_type).await
    }

    async fn accounts_for_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Account>> {
        queries::accounts_for_owner(&self.pool, owner_id).await
    }

    async fn list_transactions(&self, account_id: Uuid, limit: i64) -> RepositoryResult<Vec<TransactionRecord>> {
        queries::list_transactions(&self.pool, account_id, limit).await
    }

    async fn list_transfers(&self, filter: &TransferFilter) -> RepositoryResult<Vec<Transfer>> {
        queries::list_transfers(&self.pool, filter).await
    }

    async fn find_transfer_by_claim(&self, claim_token_hash: &str) -> RepositoryResult<Option<Transfer>> {
        queries::find_transfer_by_claim(&self.pool, claim_token_hash).await
    }

    async fn commit_transfer(&self, plan: TransferPlan) -> RepositoryResult<Transfer> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut tx, self.lock_timeout_ms).await?;

        let mut ids = vec![plan.sender_account_id];
        ids.extend(plan.recipient_account_id());
        let locked = queries::lock_accounts(&mut tx, &ids).await?;
        for id in &ids {
            if !locked.iter().any(|account| account.id == *id) {
                return Err(RepositoryError::NotFound(format!("account {}", id)));
            }
        }

        let debit_description = plan.debit_description();
        let credit_description = plan.credit_description();
        let amount = plan.amount.clone();
        let transfer = queries::insert_transfer(&mut tx, &plan.into_transfer()).await?;

        queries::adjust_balance(&mut tx, transfer.sender_account_id, &-amount.clone()).await?;
        queries::append_transaction(
            &mut tx,
            &TransactionRecord::new(
                transfer.sender_account_id,
                Direction::Debit,
                amount.clone(),
                debit_description,
                Some(transfer.id),
            ),
        )
        .await?;

        if let Some(recipient_id) = transfer.recipient_account_id {
            queries::adjust_balance(&mut tx, recipient_id, &amount).await?;
            queries::append_transaction(
                &mut tx,
                &TransactionRecord::new(
                    recipient_id,
                    Direction::Credit,
                    amount,
                    credit_description,
                    Some(transfer.id),
                ),
            )
            .await?;
        }

        queries::enqueue_outbox(
            &mut tx,
            &OutboxEvent::for_transfer(TransferEventKind::Created, &transfer),
        )
        .await?;

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit().await?;
        Ok(transfer)
    }

    async fn claim_transfer(
        &self,
        claim_token_hash: &str,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Transfer> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut tx, self.lock_timeout_ms).await?;

        let transfer = queries::lock_transfer_by_claim(&mut tx, claim_token_hash)
            .await?
            .ok_or_else(|| RepositoryError::NotFound("claim token".to_string()))?;

        if transfer.status != TransferStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "transfer {} is {}",
                transfer.reference, transfer.status
            )));
        }
        if transfer.claim_expired(now) {
            return Err(RepositoryError::ClaimExpired(transfer.id));
        }

        queries::lock_accounts(&mut tx, &[account_id]).await?;
        queries::adjust_balance(&mut tx, account_id, &transfer.amount).await?;
        queries::append_transaction(
            &mut tx,
            &TransactionRecord::new(
                account_id,
                Direction::Credit,
                transfer.amount.clone(),
                format!("Transfer {} claimed", transfer.reference),
                Some(transfer.id),
            ),
        )
        .await?;

        let claimed =
            queries::update_transfer_status(&mut tx, transfer.id, TransferStatus::Completed, Some(account_id))
                .await?;
        queries::enqueue_outbox(
            &mut tx,
            &OutboxEvent::for_transfer(TransferEventKind::Updated, &claimed),
        )
        .await?;

        tx.commit().await?;
        Ok(claimed)
    }

    async fn expire_pending_transfers(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<Transfer>> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut tx, self.lock_timeout_ms).await?;

        let expired = queries::lock_expired_transfers(&mut tx, now, limit).await?;
        let mut failed = Vec::with_capacity(expired.len());

        for transfer in expired {
            queries::adjust_balance(&mut tx, transfer.sender_account_id, &transfer.amount).await?;
            queries::append_transaction(
                &mut tx,
                &TransactionRecord::new(
                    transfer.sender_account_id,
                    Direction::Credit,
                    transfer.amount.clone(),
                    refund_description(&transfer),
                    Some(transfer.id),
                ),
            )
            .await?;

            let updated =
                queries::update_transfer_status(&mut tx, transfer.id, TransferStatus::Failed, None).await?;
            queries::enqueue_outbox(
                &mut tx,
                &OutboxEvent::for_transfer(TransferEventKind::Updated, &updated),
            )
            .await?;
            failed.push(updated);
        }

        tx.commit().await?;
        Ok(failed)
    }

    async fn deposit(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        description: String,
    ) -> RepositoryResult<(Account, TransactionRecord)> {
        let mut tx = self.pool.begin().await?;
        queries::set_lock_timeout(&mut tx, self.lock_timeout_ms).await?;

        let account = queries::adjust_balance(&mut tx, account_id, &amount).await?;
        let entry = queries::append_transaction(
            &mut tx,
            &TransactionRecord::new(account_id, Direction::Credit, amount, description, None),
        )
        .await?;

        tx.commit().await?;
        Ok((account, entry))
    }
}
