//! Background delivery of outbox events.
//!
//! Events are written in the same database transaction as the transfer that
//! produced them. This worker leases due events, hands each to every
//! configured notifier and records the outcome. Failures are retried with
//! exponential backoff until `max_attempts`, after which the event is dead.

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::domain::OutboxEvent;
use crate::ports::{OutboxStore, RepositoryResult};
use crate::services::notifier::Notifier;

const BATCH_SIZE: i64 = 20;
const LEASE: Duration = Duration::from_secs(60);
const BASE_BACKOFF_SECS: i64 = 2;
const MAX_BACKOFF_SECS: i64 = 3600;

/// Delay before attempt number `attempts + 1`, doubling from two seconds up
/// to an hour.
pub fn backoff_for(attempts: i32) -> chrono::Duration {
    let exponent = attempts.clamp(0, 20) as u32;
    let secs = BASE_BACKOFF_SECS.saturating_mul(2_i64.saturating_pow(exponent));
    chrono::Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: usize,
    pub retried: usize,
    pub dead: usize,
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    limiter: DefaultDirectRateLimiter,
    max_attempts: u32,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        notifiers: Vec<Arc<dyn Notifier>>,
        max_attempts: u32,
        rate_per_sec: u32,
        poll_interval: Duration,
    ) -> Self {
        let rate = NonZeroU32::new(rate_per_sec).unwrap_or(NonZeroU32::MIN);
        Self {
            store,
            notifiers,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            max_attempts: max_attempts.max(1),
            poll_interval,
        }
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(notifiers = self.notifiers.len(), "Outbox dispatcher started");

        loop {
            match self.process_batch(Utc::now()).await {
                Ok(outcome) if outcome != BatchOutcome::default() => {
                    tracing::debug!(?outcome, "Outbox batch processed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Outbox batch failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    pub async fn process_batch(&self, now: DateTime<Utc>) -> RepositoryResult<BatchOutcome> {
        let events = self.store.claim_due(now, LEASE, BATCH_SIZE).await?;
        let mut outcome = BatchOutcome::default();

        for event in events {
            self.limiter.until_ready().await;

            match self.deliver(&event).await {
                Ok(()) => {
                    self.store.mark_delivered(event.id).await?;
                    outcome.delivered += 1;
                }
                Err(error) => {
                    let attempts = event.attempts + 1;
                    let retry_at = if attempts >= self.max_attempts as i32 {
                        None
                    } else {
                        Some(Utc::now() + backoff_for(event.attempts))
                    };

                    match retry_at {
                        Some(at) => {
                            tracing::warn!(event_id = %event.id, attempts, retry_at = %at, error = %error, "Outbox delivery failed, will retry");
                            outcome.retried += 1;
                        }
                        None => {
                            tracing::error!(event_id = %event.id, attempts, error = %error, "Outbox delivery gave up");
                            outcome.dead += 1;
                        }
                    }
                    self.store.mark_failed(event.id, &error, retry_at).await?;
                }
            }
        }

        Ok(outcome)
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<(), String> {
        let mut failures = Vec::new();
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                failures.push(format!("{}: {}", notifier.name(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}
