//! Environment-driven configuration, loaded once at process start.
//!
//! Mirrors the teacher crate's `create_mailer_from_env`/`is_configured` pattern:
//! required values are read eagerly and missing ones become a
//! [`RelayError::Fatal`] rather than surfacing later as a panic.

use std::env;
use std::time::Duration;

use crate::error::RelayError;

/// Topic names bound by the consumer orchestrator (see §6 of the spec).
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub send: String,
    pub webhook_sendgrid: String,
    pub webhook_postmark: String,
    pub webhook_socketlabs: String,
    pub webhook_sparkpost: String,
    pub batch: String,
}

/// Process-wide configuration, assembled once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: String,
    pub kafka_offset_reset: String,
    pub topics: TopicConfig,
    pub postgres_host: String,
    pub postgres_port: String,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    pub health_port: u16,
    pub http_timeout: Duration,
}

impl Config {
    /// Load `.env` (if present, ignoring its absence) and read required
    /// variables from the environment. Fails fast with `RelayError::Fatal`.
    pub fn from_env() -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();

        let required = |name: &'static str| -> Result<String, RelayError> {
            env::var(name).map_err(|_| RelayError::Fatal(format!("{name} not set")))
        };
        let optional = |name: &'static str, default: &str| -> String {
            env::var(name).unwrap_or_else(|_| default.to_string())
        };

        let health_port: u16 = optional("HEALTH_PORT", "8080")
            .parse()
            .map_err(|_| RelayError::Fatal("HEALTH_PORT must be a valid port number".into()))?;

        Ok(Self {
            kafka_brokers: required("KAFKA_BROKERS")?,
            kafka_offset_reset: optional("KAFKA_OFFSET_RESET", "earliest"),
            topics: TopicConfig {
                send: optional("SEND_TOPIC", "send-requests"),
                webhook_sendgrid: optional("WEBHOOK_SENDGRID_TOPIC", "webhook-sendgrid"),
                webhook_postmark: optional("WEBHOOK_POSTMARK_TOPIC", "webhook-postmark"),
                webhook_socketlabs: optional("WEBHOOK_SOCKETLABS_TOPIC", "webhook-socketlabs"),
                webhook_sparkpost: optional("WEBHOOK_SPARKPOST_TOPIC", "webhook-sparkpost"),
                batch: optional("BATCH_TOPIC", "batch-emails"),
            },
            postgres_host: required("POSTGRES_HOST")?,
            postgres_port: optional("POSTGRES_PORT", "5432"),
            postgres_user: required("POSTGRES_USER")?,
            postgres_password: required("POSTGRES_PASSWORD")?,
            postgres_db: required("POSTGRES_DB")?,
            health_port,
            http_timeout: Duration::from_secs(30),
        })
    }

    /// Assemble a `postgres://` connection string for `sqlx::PgPool`.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres_user, self.postgres_password, self.postgres_host, self.postgres_port, self.postgres_db
        )
    }
}
