use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::adapters::{PostgresIdempotencyStore, PostgresLedgerRepository};
use crate::config::{mask_password, Config};
use crate::ports::IdempotencyStore;
use crate::services::{ConnectionManager, TransferService};

#[derive(Parser)]
#[command(name = "transfer-core")]
#[command(about = "Transfer Core - money transfer ledger service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// One-shot maintenance jobs
    #[command(subcommand)]
    Jobs(JobCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Fail unclaimed transfers past their expiry and refund the senders
    #[command(name = "expire")]
    ExpireClaims,

    /// Delete idempotency keys older than the retention window
    PruneIdempotency {
        /// Overrides IDEMPOTENCY_RETENTION_HOURS
        #[arg(long)]
        older_than_hours: Option<i64>,
    },
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Max DB Connections: {}", config.db_max_connections);
    println!("  Lock Timeout: {}ms", config.lock_timeout_ms);
    println!("  Claim Token TTL: {}h", config.claim_token_ttl_hours);
    match config.idempotency_retention_hours {
        Some(hours) => println!("  Idempotency Retention: {}h", hours),
        None => println!("  Idempotency Retention: unbounded"),
    }
    match &config.webhook {
        Some(webhook) => println!("  Webhook: {}", webhook.url),
        None => println!("  Webhook: disabled"),
    }
    println!("  Webhook Max Attempts: {}", config.webhook_max_attempts);

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

pub async fn handle_expire_claims(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let ledger = Arc::new(PostgresLedgerRepository::new(pool, config.lock_timeout_ms));
    let service = TransferService::new(
        ledger,
        ConnectionManager::new(),
        chrono::Duration::hours(config.claim_token_ttl_hours),
    );

    let expired = service.expire_pending(Utc::now()).await?;
    println!("✓ Expired {} unclaimed transfer(s)", expired.len());
    for transfer in expired {
        println!("  {} {} {}", transfer.reference, transfer.amount, transfer.sender_account_id);
    }
    Ok(())
}

pub async fn handle_prune_idempotency(config: &Config, older_than_hours: Option<i64>) -> anyhow::Result<()> {
    let Some(hours) = older_than_hours.or(config.idempotency_retention_hours) else {
        anyhow::bail!("No retention window: pass --older-than-hours or set IDEMPOTENCY_RETENTION_HOURS");
    };
    if hours <= 0 {
        anyhow::bail!("Retention window must be positive");
    }

    let pool = crate::db::create_pool(config).await?;
    let store = PostgresIdempotencyStore::new(pool);
    let removed = store.prune_before(Utc::now() - chrono::Duration::hours(hours)).await?;

    println!("✓ Removed {} idempotency key(s) older than {}h", removed, hours);
    Ok(())
}
