use anyhow::Context;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub lock_timeout_ms: u64,
    pub claim_token_ttl_hours: i64,
    pub claim_expiry_interval_secs: u64,
    /// Unset keeps idempotency keys forever.
    pub idempotency_retention_hours: Option<i64>,
    pub webhook: Option<WebhookConfig>,
    pub webhook_max_attempts: u32,
    pub webhook_rate_per_sec: u32,
    pub outbox_poll_interval_ms: u64,
    pub admin_api_key: String,
    pub log_request_body: bool,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        let webhook = match env::var("WEBHOOK_URL").ok().filter(|url| !url.trim().is_empty()) {
            Some(url) => Some(WebhookConfig {
                url,
                secret: env::var("WEBHOOK_SECRET")
                    .context("WEBHOOK_SECRET is required when WEBHOOK_URL is set")?,
            }),
            None => None,
        };

        let config = Config {
            server_port: env_or("SERVER_PORT", 3000)?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10)?,
            lock_timeout_ms: env_or("LOCK_TIMEOUT_MS", 3000)?,
            claim_token_ttl_hours: env_or("CLAIM_TOKEN_TTL_HOURS", 24 * 7)?,
            claim_expiry_interval_secs: env_or("CLAIM_EXPIRY_INTERVAL_SECS", 60)?,
            idempotency_retention_hours: env_opt("IDEMPOTENCY_RETENTION_HOURS")?,
            webhook,
            webhook_max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", 8)?,
            webhook_rate_per_sec: env_or("WEBHOOK_RATE_PER_SEC", 10)?,
            outbox_poll_interval_ms: env_or("OUTBOX_POLL_INTERVAL_MS", 1000)?,
            admin_api_key: env::var("ADMIN_API_KEY").context("ADMIN_API_KEY must be set")?,
            log_request_body: env_or("LOG_REQUEST_BODY", false)?,
            log_json: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.server_port == 0 {
            anyhow::bail!("SERVER_PORT must be greater than 0");
        }
        if self.admin_api_key.len() < 16 {
            anyhow::bail!("ADMIN_API_KEY must be at least 16 characters");
        }
        if self.claim_token_ttl_hours <= 0 {
            anyhow::bail!("CLAIM_TOKEN_TTL_HOURS must be positive");
        }
        if self.webhook_rate_per_sec == 0 {
            anyhow::bail!("WEBHOOK_RATE_PER_SEC must be greater than 0");
        }
        if matches!(self.idempotency_retention_hours, Some(hours) if hours <= 0) {
            anyhow::bail!("IDEMPOTENCY_RETENTION_HOURS must be positive when set");
        }

        url::Url::parse(&self.database_url).context("DATABASE_URL is not a valid URL")?;
        if let Some(webhook) = &self.webhook {
            url::Url::parse(&webhook.url).context("WEBHOOK_URL is not a valid URL")?;
        }

        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} has an invalid value", key)),
        _ => Ok(None),
    }
}

/// Hides the password part of a connection URL for display.
pub fn mask_password(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("****"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}
