//! In-process implementation of every storage port.
//!
//! One mutex guards the whole state, so each operation is trivially atomic and
//! isolated. Used by the test suites and for running the API without Postgres.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    transfer::refund_description, Account, AccountType, Direction, OutboxEvent, OutboxStatus,
    TransactionRecord, Transfer, TransferEventKind, TransferPlan, TransferStatus, User,
};
use crate::ports::{
    IdempotencyStatus, IdempotencyStore, LedgerRepository, NewUser, OutboxStore, RepositoryError,
    RepositoryResult, StoredResponse, TransferFilter, IDEMPOTENCY_LEASE_SECS,
};

#[derive(Debug, Clone)]
struct IdempotencyEntry {
    request_hash: String,
    response: Option<StoredResponse>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    users: Vec<User>,
    accounts: HashMap<Uuid, Account>,
    /// Append order doubles as the sequence number.
    transactions: Vec<TransactionRecord>,
    transfers: Vec<Transfer>,
    outbox: Vec<OutboxEvent>,
    idempotency: HashMap<String, IdempotencyEntry>,
    busy: bool,
    commit_delay: Option<Duration>,
}

impl State {
    fn account(&self, id: Uuid) -> RepositoryResult<&Account> {
        self.accounts
            .get(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("account {}", id)))
    }

    fn check_busy(&self) -> RepositoryResult<()> {
        if self.busy {
            Err(RepositoryError::Busy)
        } else {
            Ok(())
        }
    }
}

/// Writes staged by one operation, applied only after every check passed.
#[derive(Default)]
struct Staged {
    accounts: HashMap<Uuid, Account>,
    entries: Vec<TransactionRecord>,
}

impl Staged {
    fn adjust(&mut self, state: &State, id: Uuid, delta: &BigDecimal) -> RepositoryResult<()> {
        let current = match self.accounts.get(&id) {
            Some(account) => account.clone(),
            None => state.account(id)?.clone(),
        };
        let next = current.apply_delta(delta)?;
        self.accounts.insert(id, next);
        Ok(())
    }

    fn record(&mut self, entry: TransactionRecord) {
        self.entries.push(entry);
    }

    fn apply(self, state: &mut State) {
        state.accounts.extend(self.accounts);
        state.transactions.extend(self.entries);
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every atomic unit fails as if its row locks timed out.
    pub async fn set_busy(&self, busy: bool) {
        self.state.lock().await.busy = busy;
    }

    /// Stalls every transfer commit for `delay` before it takes the lock.
    pub async fn set_commit_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.commit_delay = delay;
    }

    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.lock().await.outbox.clone()
    }

    pub async fn transfers(&self) -> Vec<Transfer> {
        self.state.lock().await.transfers.clone()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
    async fn ping(&self) -> RepositoryResult<()> {
        Ok(())
    }

    async fn create_user(&self, new_user: NewUser) -> RepositoryResult<(User, Vec<Account>)> {
        let mut state = self.state.lock().await;
        if state.users.iter().any(|u| u.email == new_user.email) {
            return Err(RepositoryError::Conflict("users_email_key".to_string()));
        }
        if state.users.iter().any(|u| u.api_token_hash == new_user.api_token_hash) {
            return Err(RepositoryError::Conflict("users_api_token_hash_key".to_string()));
        }

        let user = User::new(new_user.email, new_user.display_name, new_user.api_token_hash);
        let accounts: Vec<Account> = AccountType::ALL
            .into_iter()
            .map(|account_type| Account::open(user.id, account_type))
            .collect();

        state.users.push(user.clone());
        for account in &accounts {
            state.accounts.insert(account.id, account.clone());
        }
        Ok((user, accounts))
    }

    async fn find_user_by_token_hash(&self, token_hash: &str) -> RepositoryResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.api_token_hash == token_hash).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> RepositoryResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_users_by_display_name(&self, display_name: &str) -> RepositoryResult<Vec<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .filter(|u| u.display_name == display_name)
            .take(2)
            .cloned()
            .collect())
    }

    async fn get_account(&self, id: Uuid) -> RepositoryResult<Account> {
        let state = self.state.lock().await;
        state.account(id).cloned()
    }

    async fn find_account(&self, owner_id: Uuid, account_type: AccountType) -> RepositoryResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.owner_id == owner_id && a.account_type == account_type)
            .cloned())
    }

    async fn accounts_for_owner(&self, owner_id: Uuid) -> RepositoryResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.account_type.as_str());
        Ok(accounts)
    }

    async fn list_transactions(&self, account_id: Uuid, limit: i64) -> RepositoryResult<Vec<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.account_id == account_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_transfers(&self, filter: &TransferFilter) -> RepositoryResult<Vec<Transfer>> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .iter()
            .rev()
            .filter(|t| {
                filter.account_ids.contains(&t.sender_account_id)
                    || t.recipient_account_id
                        .map_or(false, |id| filter.account_ids.contains(&id))
            })
            .filter(|t| filter.reference.as_ref().map_or(true, |r| &t.reference == r))
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_transfer_by_claim(&self, claim_token_hash: &str) -> RepositoryResult<Option<Transfer>> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .iter()
            .find(|t| t.claim_token_hash.as_deref() == Some(claim_token_hash))
            .cloned())
    }

    async fn commit_transfer(&self, plan: TransferPlan) -> RepositoryResult<Transfer> {
        let delay = self.state.lock().await.commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.check_busy()?;

        state.account(plan.sender_account_id)?;
        if let Some(recipient) = plan.recipient_account_id() {
            state.account(recipient)?;
        }
        if state.transfers.iter().any(|t| t.reference == plan.reference) {
            return Err(RepositoryError::Conflict("transfers_reference_key".to_string()));
        }

        let debit_description = plan.debit_description();
        let credit_description = plan.credit_description();
        let amount = plan.amount.clone();
        let transfer = plan.into_transfer();

        let mut staged = Staged::default();
        staged.adjust(&state, transfer.sender_account_id, &-amount.clone())?;
        staged.record(TransactionRecord::new(
            transfer.sender_account_id,
            Direction::Debit,
            amount.clone(),
            debit_description,
            Some(transfer.id),
        ));
        if let Some(recipient) = transfer.recipient_account_id {
            staged.adjust(&state, recipient, &amount)?;
            staged.record(TransactionRecord::new(
                recipient,
                Direction::Credit,
                amount,
                credit_description,
                Some(transfer.id),
            ));
        }

        staged.apply(&mut state);
        state.transfers.push(transfer.clone());
        state
            .outbox
            .push(OutboxEvent::for_transfer(TransferEventKind::Created, &transfer));
        Ok(transfer)
    }

    async fn claim_transfer(
        &self,
        claim_token_hash: &str,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> RepositoryResult<Transfer> {
        let mut state = self.state.lock().await;
        state.check_busy()?;

        let index = state
            .transfers
            .iter()
            .position(|t| t.claim_token_hash.as_deref() == Some(claim_token_hash))
            .ok_or_else(|| RepositoryError::NotFound("claim token".to_string()))?;
        let transfer = state.transfers[index].clone();

        if transfer.status != TransferStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "transfer {} is {}",
                transfer.reference, transfer.status
            )));
        }
        if transfer.claim_expired(now) {
            return Err(RepositoryError::ClaimExpired(transfer.id));
        }

        let mut staged = Staged::default();
        staged.adjust(&state, account_id, &transfer.amount)?;
        staged.record(TransactionRecord::new(
            account_id,
            Direction::Credit,
            transfer.amount.clone(),
            format!("Transfer {} claimed", transfer.reference),
            Some(transfer.id),
        ));
        staged.apply(&mut state);

        let claimed = Transfer {
            status: TransferStatus::Completed,
            recipient_account_id: Some(account_id),
            updated_at: Utc::now(),
            ..transfer
        };
        state.transfers[index] = claimed.clone();
        state
            .outbox
            .push(OutboxEvent::for_transfer(TransferEventKind::Updated, &claimed));
        Ok(claimed)
    }

    async fn expire_pending_transfers(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<Transfer>> {
        let mut state = self.state.lock().await;
        state.check_busy()?;

        let due: Vec<usize> = state
            .transfers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TransferStatus::Pending && t.claim_expired(now))
            .map(|(index, _)| index)
            .take(limit.max(0) as usize)
            .collect();

        let mut staged = Staged::default();
        let mut failed = Vec::with_capacity(due.len());
        for index in due {
            let transfer = state.transfers[index].clone();
            staged.adjust(&state, transfer.sender_account_id, &transfer.amount)?;
            staged.record(TransactionRecord::new(
                transfer.sender_account_id,
                Direction::Credit,
                transfer.amount.clone(),
                refund_description(&transfer),
                Some(transfer.id),
            ));
            failed.push((
                index,
                Transfer {
                    status: TransferStatus::Failed,
                    updated_at: Utc::now(),
                    ..transfer
                },
            ));
        }

        staged.apply(&mut state);
        let mut updated = Vec::with_capacity(failed.len());
        for (index, transfer) in failed {
            state.transfers[index] = transfer.clone();
            state
                .outbox
                .push(OutboxEvent::for_transfer(TransferEventKind::Updated, &transfer));
            updated.push(transfer);
        }
        Ok(updated)
    }

    async fn deposit(
        &self,
        account_id: Uuid,
        amount: BigDecimal,
        description: String,
    ) -> RepositoryResult<(Account, TransactionRecord)> {
        let mut state = self.state.lock().await;
        state.check_busy()?;

        let mut staged = Staged::default();
        staged.adjust(&state, account_id, &amount)?;
        let entry = TransactionRecord::new(account_id, Direction::Credit, amount, description, None);
        staged.record(entry.clone());
        staged.apply(&mut state);

        Ok((state.account(account_id)?.clone(), entry))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryLedger {
    async fn check_idempotency(&self, key: &str, request_hash: &str) -> RepositoryResult<IdempotencyStatus> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.idempotency.get(key) else {
            state.idempotency.insert(
                key.to_string(),
                IdempotencyEntry {
                    request_hash: request_hash.to_string(),
                    response: None,
                    created_at: Utc::now(),
                },
            );
            return Ok(IdempotencyStatus::New);
        };

        if entry.request_hash != request_hash {
            return Ok(IdempotencyStatus::Mismatch);
        }
        if let Some(response) = &entry.response {
            return Ok(IdempotencyStatus::Completed(response.clone()));
        }

        let now = Utc::now();
        if entry.created_at < now - chrono::Duration::seconds(IDEMPOTENCY_LEASE_SECS) {
            if let Some(entry) = state.idempotency.get_mut(key) {
                entry.created_at = now;
            }
            return Ok(IdempotencyStatus::New);
        }
        Ok(IdempotencyStatus::Processing)
    }

    async fn store_response(&self, key: &str, response: StoredResponse) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.idempotency.get_mut(key) {
            entry.response = Some(response);
        }
        Ok(())
    }

    async fn release_lock(&self, key: &str) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if matches!(state.idempotency.get(key), Some(entry) if entry.response.is_none()) {
            state.idempotency.remove(key);
        }
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, entry| entry.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[async_trait]
impl OutboxStore for InMemoryLedger {
    async fn claim_due(&self, now: DateTime<Utc>, lease: Duration, limit: i64) -> RepositoryResult<Vec<OutboxEvent>> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        for event in state
            .outbox
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .take(limit.max(0) as usize)
        {
            event.next_attempt_at = lease_until;
            claimed.push(event.clone());
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: Uuid) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id) {
            event.status = OutboxStatus::Delivered;
            event.attempts += 1;
            event.delivered_at = Some(Utc::now());
            event.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> RepositoryResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id) {
            event.attempts += 1;
            event.last_error = Some(error.to_string());
            match retry_at {
                Some(at) => event.next_attempt_at = at,
                None => event.status = OutboxStatus::Dead,
            }
        }
        Ok(())
    }
}
