//! ESP adapter implementations.
//!
//! Each adapter implements [`EspAdapter`]: one outbound HTTP call per
//! personalization, and a `normalize` function translating that provider's
//! webhook vocabulary into a [`StandardizedEvent`](crate::event::StandardizedEvent).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::event::StandardizedEvent;

#[cfg(feature = "sendgrid")]
pub mod sendgrid;
#[cfg(feature = "sendgrid")]
pub use sendgrid::SendGridAdapter;

#[cfg(feature = "postmark")]
pub mod postmark;
#[cfg(feature = "postmark")]
pub use postmark::PostmarkAdapter;

#[cfg(feature = "socketlabs")]
pub mod socketlabs;
#[cfg(feature = "socketlabs")]
pub use socketlabs::SocketLabsAdapter;

#[cfg(feature = "sparkpost")]
pub mod sparkpost;
#[cfg(feature = "sparkpost")]
pub use sparkpost::SparkPostAdapter;

/// The outcome of one successful send call.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub message_id: String,
    pub status: u16,
}

/// One webhook delivery: headers plus the provider's raw JSON body for a
/// single event (the per-provider consumer fans an array payload out into
/// one `RawWebhookEvent` per element before calling `normalize`).
#[derive(Debug, Clone)]
pub struct RawWebhookEvent {
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Capability set every ESP adapter implements (§4.C).
#[async_trait]
pub trait EspAdapter: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Send one personalization of `message`. Implementations apply
    /// substitution/section expansion (`crate::substitution::expand`)
    /// before building the provider payload.
    async fn send(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<DispatchResult, RelayError>;

    /// Translate one raw webhook event into the standardized schema.
    fn normalize(&self, raw: &RawWebhookEvent) -> Result<StandardizedEvent, RelayError>;
}

/// Fallback timestamp resolution order shared by every adapter's
/// `normalize`: an explicit event-level timestamp, else a webhook-header
/// timestamp, else the wall clock at ingest (§4.C).
pub(crate) fn resolve_timestamp(event_ts: Option<i64>, header_ts: Option<i64>) -> i64 {
    event_ts
        .or(header_ts)
        .unwrap_or_else(|| chrono::Utc::now().timestamp())
}

pub(crate) fn header_timestamp(headers: &HashMap<String, String>, name: &str) -> Option<i64> {
    headers.get(name).and_then(|v| v.parse::<i64>().ok())
}
