use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use transfer_core::adapters::{PostgresIdempotencyStore, PostgresLedgerRepository, PostgresOutboxStore};
use transfer_core::cli::{self, Cli, Commands, DbCommands, JobCommands};
use transfer_core::config::Config;
use transfer_core::ports::{IdempotencyStore, OutboxStore};
use transfer_core::services::{LogNotifier, Notifier, OutboxDispatcher, TransferService, WebhookClient};
use transfer_core::{create_app, db, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    match Cli::parse().command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Jobs(JobCommands::ExpireClaims) => cli::handle_expire_claims(&config).await,
        Commands::Jobs(JobCommands::PruneIdempotency { older_than_hours }) => {
            cli::handle_prune_idempotency(&config, older_than_hours).await
        }
        Commands::Config => cli::handle_config_validate(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let ledger = Arc::new(PostgresLedgerRepository::new(pool.clone(), config.lock_timeout_ms));
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(PostgresIdempotencyStore::new(pool.clone()));
    let outbox: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone()));
    let claim_ttl = chrono::Duration::hours(config.claim_token_ttl_hours);

    let state = AppState::new(ledger, Arc::clone(&idempotency), claim_ttl, &config.admin_api_key)
        .with_pool(pool)
        .with_request_body_logging(config.log_request_body);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(webhook) = &config.webhook {
        tracing::info!(url = %webhook.url, "Webhook delivery enabled");
        notifiers.push(Arc::new(WebhookClient::new(webhook.url.clone(), webhook.secret.clone())));
    }
    let dispatcher = OutboxDispatcher::new(
        outbox,
        notifiers,
        config.webhook_max_attempts,
        config.webhook_rate_per_sec,
        Duration::from_millis(config.outbox_poll_interval_ms),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    tokio::spawn(expiry_loop(
        Arc::clone(&state.transfers),
        Duration::from_secs(config.claim_expiry_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    if let Some(hours) = config.idempotency_retention_hours {
        tokio::spawn(prune_loop(idempotency, chrono::Duration::hours(hours), shutdown_rx.clone()));
    }

    let app = create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = dispatcher_handle.await {
        tracing::error!(error = %e, "Outbox dispatcher panicked");
    }
    Ok(())
}

async fn expiry_loop(transfers: Arc<TransferService>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match transfers.expire_pending(chrono::Utc::now()).await {
                    Ok(expired) if !expired.is_empty() => {
                        tracing::info!(count = expired.len(), "Expired unclaimed transfers");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Claim expiry sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn prune_loop(store: Arc<dyn IdempotencyStore>, retention: chrono::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.prune_before(chrono::Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "Pruned idempotency keys"),
                    Err(e) => tracing::error!(error = %e, "Idempotency prune failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
