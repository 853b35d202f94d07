//! Error taxonomy for the relay.

use thiserror::Error;

/// Errors that can occur while routing and dispatching messages.
///
/// Each variant carries its own recovery policy, applied by the consumer
/// orchestrator (see [`crate::consumer`]): `TransientBus` and `TransientStore`
/// block the offset commit and are retried; `ProviderRejection`,
/// `InvalidCredential` and `MalformedPayload` are poison-pill tolerant (logged
/// and committed); `Fatal` aborts the process.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Message bus connection or session loss.
    #[error("bus unavailable: {0}")]
    TransientBus(String),

    /// Database connection loss or deadlock.
    #[error("store unavailable: {0}")]
    TransientStore(String),

    /// ESP returned a non-success status for a send.
    #[error("provider rejected send ({provider}): {message}")]
    ProviderRejection {
        provider: &'static str,
        message: String,
        status: Option<u16>,
    },

    /// No credential with a valid shape exists for any ESP on this tenant.
    #[error("no valid provider credential for tenant {tenant}")]
    InvalidCredential { tenant: i64 },

    /// Record failed to decode or is missing required fields.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Configuration missing or invalid at startup.
    #[error("fatal configuration error: {0}")]
    Fatal(String),
}

impl RelayError {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::ProviderRejection {
            provider,
            message: message.into(),
            status: None,
        }
    }

    pub fn provider_with_status(provider: &'static str, message: impl Into<String>, status: u16) -> Self {
        Self::ProviderRejection {
            provider,
            message: message.into(),
            status: Some(status),
        }
    }

    /// Whether this error should block the inbound offset commit.
    pub fn blocks_commit(&self) -> bool {
        matches!(self, Self::TransientBus(_) | Self::TransientStore(_))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(err.to_string())
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        Self::TransientStore(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for RelayError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::TransientBus(err.to_string())
    }
}
