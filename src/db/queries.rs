use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::db::models::{
    collect_rows, AccountRow, IdempotencyRow, OutboxRow, TransactionRow, TransferRow, UserRow,
};
use crate::domain::{
    Account, AccountType, OutboxEvent, TransactionRecord, Transfer, TransferStatus, User,
};
use crate::ports::{RepositoryError, RepositoryResult, TransferFilter};

type PgTx<'c> = SqlxTransaction<'c, Postgres>;

/// Bounds how long any statement in this transaction waits for a row lock.
pub async fn set_lock_timeout(executor: &mut PgTx<'_>, timeout_ms: u64) -> RepositoryResult<()> {
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", timeout_ms))
        .execute(&mut **executor)
        .await?;
    Ok(())
}

// --- Users ---

pub async fn insert_user(executor: &mut PgTx<'_>, user: &User) -> RepositoryResult<User> {
    let row = sqlx::query_as::<_, UserRow>(
        r#"
        INSERT INTO users (id, email, display_name, api_token_hash, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.display_name)
    .bind(&user.api_token_hash)
    .bind(user.created_at)
    .fetch_one(&mut **executor)
    .await?;

    Ok(row.into())
}

pub async fn find_user_by_token_hash(pool: &PgPool, token_hash: &str) -> RepositoryResult<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE api_token_hash = $1")
        .bind(token_hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(User::from))
}

pub async fn find_user_by_email(pool: &PgPool, email: &str) -> RepositoryResult<Option<User>> {
    let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(User::from))
}

pub async fn find_users_by_display_name(pool: &PgPool, display_name: &str) -> RepositoryResult<Vec<User>> {
    let rows = sqlx::query_as::<_, UserRow>(
        "SELECT * FROM users WHERE display_name = $1 ORDER BY created_at LIMIT 2",
    )
    .bind(display_name)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(User::from).collect())
}

// --- Accounts ---

pub async fn insert_account(executor: &mut PgTx<'_>, account: &Account) -> RepositoryResult<Account> {
    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        INSERT INTO accounts (id, owner_id, account_type, balance, available, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(account.id)
    .bind(account.owner_id)
    .bind(account.account_type.as_str())
    .bind(&account.balance)
    .bind(&account.available)
    .bind(account.created_at)
    .bind(account.updated_at)
    .fetch_one(&mut **executor)
    .await?;

    row.try_into()
}

pub async fn get_account(pool: &PgPool, id: Uuid) -> RepositoryResult<Account> {
    let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.ok_or_else(|| RepositoryError::NotFound(format!("account {}", id)))?
        .try_into()
}

pub async fn find_account(
    pool: &PgPool,
    owner_id: Uuid,
    account_type: AccountType,
) -> RepositoryResult<Option<Account>> {
    let row = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts WHERE owner_id = $1 AND account_type = $2",
    )
    .bind(owner_id)
    .bind(account_type.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(Account::try_from).transpose()
}

pub async fn accounts_for_owner(pool: &PgPool, owner_id: Uuid) -> RepositoryResult<Vec<Account>> {
    let rows = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts WHERE owner_id = $1 ORDER BY account_type",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    collect_rows(rows)
}

/// Takes row locks on the given accounts in ascending id order, so two
/// transfers touching the same pair of accounts cannot deadlock.
pub async fn lock_accounts(executor: &mut PgTx<'_>, ids: &[Uuid]) -> RepositoryResult<Vec<Account>> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();

    let rows = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(&ids)
    .fetch_all(&mut **executor)
    .await?;

    collect_rows(rows)
}

/// Applies `delta` to balance and available funds of a locked account.
/// Fails with `InsufficientFunds` instead of driving either below zero.
pub async fn adjust_balance(
    executor: &mut PgTx<'_>,
    id: Uuid,
    delta: &BigDecimal,
) -> RepositoryResult<Account> {
    let current: Account = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **executor)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("account {}", id)))?
        .try_into()?;

    let next = current.apply_delta(delta)?;

    let row = sqlx::query_as::<_, AccountRow>(
        r#"
        UPDATE accounts SET balance = $2, available = $3, updated_at = $4
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&next.balance)
    .bind(&next.available)
    .bind(next.updated_at)
    .fetch_one(&mut **executor)
    .await?;

    row.try_into()
}

// --- Transaction log ---

pub async fn append_transaction(
    executor: &mut PgTx<'_>,
    entry: &TransactionRecord,
) -> RepositoryResult<TransactionRecord> {
    let row = sqlx::query_as::<_, TransactionRow>(
        r#"
        INSERT INTO transactions (id, account_id, direction, amount, description, transfer_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, account_id, direction, amount, description, transfer_id, created_at
        "#,
    )
    .bind(entry.id)
    .bind(entry.account_id)
    .bind(entry.direction.as_str())
    .bind(&entry.amount)
    .bind(&entry.description)
    .bind(entry.transfer_id)
    .bind(entry.created_at)
    .fetch_one(&mut **executor)
    .await?;

    row.try_into()
}

pub async fn list_transactions(
    pool: &PgPool,
    account_id: Uuid,
    limit: i64,
) -> RepositoryResult<Vec<TransactionRecord>> {
    let rows = sqlx::query_as::<_, TransactionRow>(
        r#"
        SELECT id, account_id, direction, amount, description, transfer_id, created_at
        FROM transactions
        WHERE account_id = $1
        ORDER BY seq DESC
        LIMIT $2
        "#,
    )
    .bind(account_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    collect_rows(rows)
}

// --- Transfers ---

pub async fn insert_transfer(executor: &mut PgTx<'_>, transfer: &Transfer) -> RepositoryResult<Transfer> {
    let row = sqlx::query_as::<_, TransferRow>(
        r#"
        INSERT INTO transfers (
            id, reference, sender_account_id, recipient_account_id, recipient_external_ref,
            amount, method, description, status, claim_token_hash, claim_expires_at,
            created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(transfer.id)
    .bind(&transfer.reference)
    .bind(transfer.sender_account_id)
    .bind(transfer.recipient_account_id)
    .bind(&transfer.recipient_external_ref)
    .bind(&transfer.amount)
    .bind(&transfer.method)
    .bind(&transfer.description)
    .bind(transfer.status.as_str())
    .bind(&transfer.claim_token_hash)
    .bind(transfer.claim_expires_at)
    .bind(transfer.created_at)
    .bind(transfer.updated_at)
    .fetch_one(&mut **executor)
    .await?;

    row.try_into()
}

pub async fn find_transfer_by_claim(pool: &PgPool, claim_token_hash: &str) -> RepositoryResult<Option<Transfer>> {
    let row = sqlx::query_as::<_, TransferRow>("SELECT * FROM transfers WHERE claim_token_hash = $1")
        .bind(claim_token_hash)
        .fetch_optional(pool)
        .await?;

    row.map(Transfer::try_from).transpose()
}

pub async fn lock_transfer_by_claim(
    executor: &mut PgTx<'_>,
    claim_token_hash: &str,
) -> RepositoryResult<Option<Transfer>> {
    let row = sqlx::query_as::<_, TransferRow>(
        "SELECT * FROM transfers WHERE claim_token_hash = $1 FOR UPDATE",
    )
    .bind(claim_token_hash)
    .fetch_optional(&mut **executor)
    .await?;

    row.map(Transfer::try_from).transpose()
}

/// Pending transfers past their claim window. Rows another worker holds are skipped.
pub async fn lock_expired_transfers(
    executor: &mut PgTx<'_>,
    now: DateTime<Utc>,
    limit: i64,
) -> RepositoryResult<Vec<Transfer>> {
    let rows = sqlx::query_as::<_, TransferRow>(
        r#"
        SELECT * FROM transfers
        WHERE status = 'pending' AND claim_expires_at <= $1
        ORDER BY claim_expires_at
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut **executor)
    .await?;

    collect_rows(rows)
}

pub async fn update_transfer_status(
    executor: &mut PgTx<'_>,
    id: Uuid,
    status: TransferStatus,
    recipient_account_id: Option<Uuid>,
) -> RepositoryResult<Transfer> {
    let row = sqlx::query_as::<_, TransferRow>(
        r#"
        UPDATE transfers
        SET status = $2,
            recipient_account_id = COALESCE($3, recipient_account_id),
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(recipient_account_id)
    .fetch_one(&mut **executor)
    .await?;

    row.try_into()
}

pub async fn list_transfers(pool: &PgPool, filter: &TransferFilter) -> RepositoryResult<Vec<Transfer>> {
    let rows = sqlx::query_as::<_, TransferRow>(
        r#"
        SELECT * FROM transfers
        WHERE (sender_account_id = ANY($1) OR recipient_account_id = ANY($1))
        AND ($2::TEXT IS NULL OR reference = $2)
        ORDER BY created_at DESC
        LIMIT $3
        "#,
    )
    .bind(&filter.account_ids)
    .bind(&filter.reference)
    .bind(filter.limit)
    .fetch_all(pool)
    .await?;

    collect_rows(rows)
}

// --- Outbox ---

pub async fn enqueue_outbox(executor: &mut PgTx<'_>, event: &OutboxEvent) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, event_type, payload, status, attempts, next_attempt_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(event.attempts)
    .bind(event.next_attempt_at)
    .bind(event.created_at)
    .execute(&mut **executor)
    .await?;

    Ok(())
}

/// Pushes `next_attempt_at` of due events forward by the lease and returns
/// them. Concurrent dispatchers skip each other's rows.
pub async fn lease_due_outbox(
    pool: &PgPool,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: i64,
) -> RepositoryResult<Vec<OutboxEvent>> {
    let rows = sqlx::query_as::<_, OutboxRow>(
        r#"
        UPDATE outbox_events SET next_attempt_at = $2
        WHERE id IN (
            SELECT id FROM outbox_events
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(lease_until)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    collect_rows(rows)
}

pub async fn mark_outbox_delivered(pool: &PgPool, id: Uuid) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'delivered', attempts = attempts + 1, delivered_at = NOW(), last_error = NULL
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_outbox_failed(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    retry_at: Option<DateTime<Utc>>,
) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET attempts = attempts + 1,
            last_error = $2,
            status = CASE WHEN $3::TIMESTAMPTZ IS NULL THEN 'dead' ELSE 'pending' END,
            next_attempt_at = COALESCE($3, next_attempt_at)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(retry_at)
    .execute(pool)
    .await?;
    Ok(())
}

// --- Idempotency keys ---

/// Returns true when this call created the reservation, or took over one
/// for the same payload that has sat without a response past `lease_secs`.
pub async fn reserve_idempotency_key(
    pool: &PgPool,
    key: &str,
    request_hash: &str,
    lease_secs: i64,
) -> RepositoryResult<bool> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, request_hash)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET created_at = NOW()
        WHERE idempotency_keys.status_code IS NULL
          AND idempotency_keys.request_hash = EXCLUDED.request_hash
          AND idempotency_keys.created_at < NOW() - make_interval(secs => $3)
        "#,
    )
    .bind(key)
    .bind(request_hash)
    .bind(lease_secs as f64)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() == 1)
}

pub async fn get_idempotency_key(pool: &PgPool, key: &str) -> RepositoryResult<Option<IdempotencyRow>> {
    let row = sqlx::query_as::<_, IdempotencyRow>(
        "SELECT key, request_hash, status_code, response_body, created_at FROM idempotency_keys WHERE key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn complete_idempotency_key(
    pool: &PgPool,
    key: &str,
    status_code: i32,
    response_body: &str,
) -> RepositoryResult<()> {
    sqlx::query(
        r#"
        UPDATE idempotency_keys
        SET status_code = $2, response_body = $3, completed_at = NOW()
        WHERE key = $1
        "#,
    )
    .bind(key)
    .bind(status_code)
    .bind(response_body)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_idempotency_key(pool: &PgPool, key: &str) -> RepositoryResult<()> {
    sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND status_code IS NULL")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn prune_idempotency_keys(pool: &PgPool, cutoff: DateTime<Utc>) -> RepositoryResult<u64> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
