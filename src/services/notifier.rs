use async_trait::async_trait;
use thiserror::Error;

use crate::domain::OutboxEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint answered {0}")]
    Rejected(u16),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A destination for committed transfer events. Called only by the outbox
/// dispatcher, never inside a ledger transaction.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &OutboxEvent) -> Result<(), NotifyError>;
}

/// Stands in for email delivery: records what would have been sent.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &OutboxEvent) -> Result<(), NotifyError> {
        let reference = event.payload.get("reference").and_then(|r| r.as_str()).unwrap_or("-");
        let status = event.payload.get("status").and_then(|s| s.as_str()).unwrap_or("-");
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            reference,
            status,
            "Transfer notification"
        );
        Ok(())
    }
}
