//! SocketLabs send + webhook normalization.
//!
//! SocketLabs's Injection API takes a server id alongside the api key
//! (unlike the other three providers, which are bearer-key-only), so this
//! adapter carries both credentials through to the request.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::credentials::EspCredential;
use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::event::StandardizedEvent;
use crate::providers::{resolve_timestamp, DispatchResult, EspAdapter, RawWebhookEvent};
use crate::substitution;

const SOCKETLABS_API_URL: &str = "https://inject.socketlabs.com/api/v1";

pub struct SocketLabsAdapter {
    server_id: String,
    api_key: String,
    client: Client,
    base_url: String,
}

impl SocketLabsAdapter {
    pub fn new(credential: &EspCredential) -> Self {
        Self {
            server_id: credential.server_id.clone().unwrap_or_default(),
            api_key: credential.api_key.clone().unwrap_or_default(),
            client: Client::new(),
            base_url: SOCKETLABS_API_URL.to_string(),
        }
    }

    pub fn with_client(credential: &EspCredential, client: Client) -> Self {
        Self { client, ..Self::new(credential) }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_request(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<SocketLabsRequest, RelayError> {
        let from = message
            .from
            .as_ref()
            .ok_or_else(|| RelayError::provider("socketlabs", "missing from address"))?;

        let subject = substitution::expand(
            personalization.subject.as_deref().unwrap_or(&message.subject),
            &personalization.substitutions,
            &message.sections,
        );
        let html_body = message
            .html_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));
        let plain_text_body = message
            .text_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));

        Ok(SocketLabsRequest {
            server_id: self.server_id.parse().unwrap_or(0),
            messages: vec![SocketLabsMessage {
                from: SocketLabsAddress { email_address: from.email.clone(), friendly_name: from.name.clone() },
                to: vec![SocketLabsAddress { email_address: personalization.to.email.clone(), friendly_name: personalization.to.name.clone() }],
                subject,
                html_body,
                plain_text_body,
                customheaders: message
                    .headers
                    .iter()
                    .map(|(n, v)| SocketLabsHeader { name: n.clone(), value: v.clone() })
                    .collect(),
                attachments: message
                    .attachments
                    .iter()
                    .map(|a| SocketLabsAttachment {
                        name: a.filename.clone(),
                        content: a.base64_data(),
                        mime_type: a.content_type.clone(),
                        content_id: a.content_id.clone(),
                    })
                    .collect(),
            }],
        })
    }
}

#[async_trait]
impl EspAdapter for SocketLabsAdapter {
    fn provider_name(&self) -> &'static str {
        "socketlabs"
    }

    async fn send(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<DispatchResult, RelayError> {
        let request = self.build_request(message, personalization)?;
        let url = format!("{}/email", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::provider("socketlabs", format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let result: SocketLabsResponse = response
                .json()
                .await
                .map_err(|e| RelayError::provider("socketlabs", format!("bad response body: {e}")))?;
            let message_id = result
                .message_id
                .or_else(|| result.transaction_receipt.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Ok(DispatchResult { message_id, status: status.as_u16() })
        } else {
            let error: SocketLabsResponse = response.json().await.unwrap_or_default();
            Err(RelayError::provider_with_status(
                "socketlabs",
                error.error_code.unwrap_or_else(|| "unknown error".into()),
                status.as_u16(),
            ))
        }
    }

    fn normalize(&self, raw: &RawWebhookEvent) -> Result<StandardizedEvent, RelayError> {
        let event_type = raw
            .body
            .get("Type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("socketlabs webhook missing Type".into()))?;

        let event_ts = raw
            .body
            .get("DateTime")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());
        let ts = resolve_timestamp(event_ts, crate::providers::header_timestamp(&raw.headers, "x-webhook-timestamp"));

        let message_id = raw
            .body
            .get("MessageId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.synthesize_message_id(ts));

        let mut event = StandardizedEvent::new(message_id);
        event.provider = Some(crate::credentials::Provider::SocketLabs);

        match event_type {
            "Delivered" => {
                event.delivered = true;
                event.delivered_time = Some(ts);
            }
            "Failed" => {
                event.bounce = true;
                event.bounce_time = Some(ts);
                let is_hard = raw.body.get("FailureCode").and_then(|v| v.as_str()).unwrap_or("") == "Hard";
                event.bounce_type = Some(if is_hard { "hard".into() } else { "soft".into() });
                if is_hard {
                    event.dropped = true;
                    event.dropped_time = Some(ts);
                    event.dropped_reason = raw.body.get("Reason").and_then(|v| v.as_str()).map(|s| s.to_string());
                }
            }
            "Delay" => {
                event.deferred = true;
                event.deferred_count = 1;
                event.last_deferral_time = Some(ts);
            }
            "Opened" => {
                event.open = true;
                event.open_count = 1;
                event.last_open_time = Some(ts);
                event.unique_open = true;
                event.unique_open_time = Some(ts);
            }
            "Complaint" => {
                event.dropped = true;
                event.dropped_time = Some(ts);
                event.dropped_reason = Some("spam complaint".into());
            }
            _ => {}
        }

        Ok(event)
    }
}

impl SocketLabsAdapter {
    /// Deterministically derive a message id from (secret-key, server-id,
    /// nanosecond timestamp) when a webhook omits one. This reduces
    /// collision probability across events arriving in the same instant but
    /// is not cryptographically tied to the original send -- it cannot be
    /// used to correlate the event back to a specific dispatched message
    /// beyond "some send from this server, around this time" (§9).
    fn synthesize_message_id(&self, timestamp_secs: i64) -> String {
        let nanos = (timestamp_secs as i128) * 1_000_000_000;
        let seed = format!("{}:{}:{}", self.api_key, self.server_id, nanos);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(seed.as_bytes())
    }
}

#[derive(Debug, Serialize)]
struct SocketLabsRequest {
    #[serde(rename = "ServerId")]
    server_id: i64,
    messages: Vec<SocketLabsMessage>,
}

#[derive(Debug, Serialize)]
struct SocketLabsMessage {
    from: SocketLabsAddress,
    to: Vec<SocketLabsAddress>,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_text_body: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    customheaders: Vec<SocketLabsHeader>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<SocketLabsAttachment>,
}

#[derive(Debug, Serialize)]
struct SocketLabsAddress {
    email_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SocketLabsHeader {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct SocketLabsAttachment {
    name: String,
    content: String,
    mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SocketLabsResponse {
    #[serde(rename = "MessageId")]
    message_id: Option<String>,
    #[serde(rename = "TransactionReceipt")]
    transaction_receipt: Option<String>,
    #[serde(rename = "ErrorCode")]
    error_code: Option<String>,
}
