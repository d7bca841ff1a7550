//! Outbound webhook delivery, signed with HMAC-SHA256 and guarded by a
//! circuit breaker so a dead endpoint is not hammered.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;

use crate::domain::OutboxEvent;
use crate::services::notifier::{Notifier, NotifyError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Transfer-Signature";
pub const EVENT_HEADER: &str = "X-Transfer-Event";

#[derive(Clone)]
pub struct WebhookClient {
    client: Client,
    url: String,
    secret: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl WebhookClient {
    pub fn new(url: String, secret: String) -> Self {
        Self::with_circuit_breaker(url, secret, 5, 30)
    }

    pub fn with_circuit_breaker(url: String, secret: String, failure_threshold: u32, reset_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Self {
            client,
            url,
            secret,
            circuit_breaker,
        }
    }

    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Notifier for WebhookClient {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &OutboxEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&json!({
            "id": event.id,
            "type": event.event_type,
            "created_at": event.created_at,
            "data": event.payload,
        }))?;
        let signature = sign(&self.secret, &body);

        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event.event_type.clone())
            .body(body);

        let result = self
            .circuit_breaker
            .call(async move {
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(NotifyError::Rejected(response.status().as_u16()));
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(FailsafeError::Rejected) => Err(NotifyError::CircuitOpen),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        let mut mac = HmacSha256::new_from_slice(b"my-secret").unwrap();
        mac.update(b"payload");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sign("my-secret", b"payload"), expected);
        assert_ne!(sign("other-secret", b"payload"), expected);
    }

    #[test]
    fn breaker_starts_closed() {
        let client = WebhookClient::new("http://localhost:9".to_string(), "s".to_string());
        assert_eq!(client.circuit_state(), "closed");
    }
}
