//! SendGrid send + webhook normalization, grounded on the teacher's
//! `SendGridMailer` (request shape, gzip compression) generalized to the
//! relay's single-personalization-per-call send contract.

use std::collections::HashMap;
use std::io::Write;

use async_trait::async_trait;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::credentials::EspCredential;
use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::event::StandardizedEvent;
use crate::providers::{resolve_timestamp, DispatchResult, EspAdapter, RawWebhookEvent};
use crate::substitution;

const SENDGRID_API_URL: &str = "https://api.sendgrid.com/v3";

pub struct SendGridAdapter {
    api_key: String,
    client: Client,
    base_url: String,
    compress: bool,
}

impl SendGridAdapter {
    pub fn new(credential: &EspCredential) -> Self {
        Self {
            api_key: credential.api_key.clone().unwrap_or_default(),
            client: Client::new(),
            base_url: SENDGRID_API_URL.to_string(),
            compress: true,
        }
    }

    pub fn with_client(credential: &EspCredential, client: Client) -> Self {
        Self {
            client,
            ..Self::new(credential)
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    fn build_request(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<SendGridRequest, RelayError> {
        let from = message
            .from
            .as_ref()
            .ok_or_else(|| RelayError::provider("sendgrid", "missing from address"))?;

        let subject = substitution::expand(
            personalization.subject.as_deref().unwrap_or(&message.subject),
            &personalization.substitutions,
            &message.sections,
        );

        let mut content = Vec::new();
        if let Some(text) = &message.text_body {
            content.push(SendGridContent {
                content_type: "text/plain".into(),
                value: substitution::expand(text, &personalization.substitutions, &message.sections),
            });
        }
        if let Some(html) = &message.html_body {
            content.push(SendGridContent {
                content_type: "text/html".into(),
                value: substitution::expand(html, &personalization.substitutions, &message.sections),
            });
        }

        let sg_personalization = SendGridPersonalization {
            to: vec![SendGridAddress {
                email: personalization.to.email.clone(),
                name: personalization.to.name.clone(),
            }],
            cc: addr_list(&personalization.cc),
            bcc: addr_list(&personalization.bcc),
        };

        let attachments = if message.attachments.is_empty() {
            None
        } else {
            Some(
                message
                    .attachments
                    .iter()
                    .map(|a| SendGridAttachment {
                        content: a.base64_data(),
                        filename: a.filename.clone(),
                        content_type: Some(a.content_type.clone()),
                        disposition: Some(if a.is_inline() { "inline".into() } else { "attachment".into() }),
                        content_id: a.content_id.clone(),
                    })
                    .collect(),
            )
        };

        Ok(SendGridRequest {
            personalizations: vec![sg_personalization],
            from: SendGridAddress { email: from.email.clone(), name: from.name.clone() },
            subject,
            content: if content.is_empty() { None } else { Some(content) },
            attachments,
            headers: if message.headers.is_empty() { None } else { Some(message.headers.clone()) },
            categories: if message.categories.is_empty() { None } else { Some(message.categories.clone()) },
        })
    }

    fn compress_body(&self, body: &[u8]) -> Result<Vec<u8>, RelayError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body)
            .map_err(|e| RelayError::provider("sendgrid", format!("gzip compress failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| RelayError::provider("sendgrid", format!("gzip finish failed: {e}")))
    }
}

fn addr_list(addrs: &[crate::address::Address]) -> Option<Vec<SendGridAddress>> {
    if addrs.is_empty() {
        None
    } else {
        Some(addrs.iter().map(|a| SendGridAddress { email: a.email.clone(), name: a.name.clone() }).collect())
    }
}

#[async_trait]
impl EspAdapter for SendGridAdapter {
    fn provider_name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<DispatchResult, RelayError> {
        let request = self.build_request(message, personalization)?;
        let url = format!("{}/mail/send", self.base_url);
        let json_body = serde_json::to_vec(&request)?;

        let mut req = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        let body = if self.compress {
            req = req.header("Content-Encoding", "gzip");
            self.compress_body(&json_body)?
        } else {
            json_body
        };

        let response = req
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::provider("sendgrid", format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .headers()
                .get("X-Message-Id")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            Ok(DispatchResult { message_id, status: status.as_u16() })
        } else {
            let error: SendGridError = response
                .json()
                .await
                .unwrap_or(SendGridError { errors: vec![SendGridErrorDetail { message: "unknown error".into() }] });
            let error_msg = error.errors.iter().map(|e| e.message.clone()).collect::<Vec<_>>().join("; ");
            Err(RelayError::provider_with_status("sendgrid", error_msg, status.as_u16()))
        }
    }

    fn normalize(&self, raw: &RawWebhookEvent) -> Result<StandardizedEvent, RelayError> {
        let event_type = raw
            .body
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("sendgrid webhook missing 'event'".into()))?;

        let message_id = raw
            .body
            .get("sg_message_id")
            .and_then(|v| v.as_str())
            .or_else(|| raw.body.get("smtp-id").and_then(|v| v.as_str()))
            .ok_or_else(|| RelayError::MalformedPayload("sendgrid webhook missing message id".into()))?;

        let event_ts = raw.body.get("timestamp").and_then(|v| v.as_i64());
        let ts = resolve_timestamp(event_ts, crate::providers::header_timestamp(&raw.headers, "x-webhook-timestamp"));

        let mut event = StandardizedEvent::new(message_id);
        event.provider = Some(crate::credentials::Provider::SendGrid);

        match event_type {
            "processed" => {
                event.processed = true;
                event.processed_time = Some(ts);
            }
            "delivered" => {
                event.delivered = true;
                event.delivered_time = Some(ts);
            }
            "bounce" => {
                event.bounce = true;
                event.bounce_time = Some(ts);
                let bounce_type = raw.body.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                let is_hard = bounce_type == "bounce" || raw.body.get("status").and_then(|v| v.as_str()).is_some_and(|s| s.starts_with('5'));
                event.bounce_type = Some(bounce_type);
                if is_hard {
                    event.dropped = true;
                    event.dropped_time = Some(ts);
                    event.dropped_reason = Some("hard bounce".into());
                }
            }
            "deferred" => {
                event.deferred = true;
                event.deferred_count = 1;
                event.last_deferral_time = Some(ts);
            }
            "open" => {
                event.open = true;
                event.open_count = 1;
                event.last_open_time = Some(ts);
                event.unique_open = true;
                event.unique_open_time = Some(ts);
            }
            "dropped" | "spamreport" => {
                event.dropped = true;
                event.dropped_time = Some(ts);
                event.dropped_reason = raw
                    .body
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| (event_type == "spamreport").then(|| "spam complaint".to_string()));
            }
            // click/unsubscribe/group_unsubscribe/group_resubscribe and any
            // other vocabulary SendGrid sends are not part of the
            // standardized schema; merge as a no-op rather than erroring so
            // a single unmodeled webhook type doesn't spam the error log.
            _ => {}
        }

        Ok(event)
    }
}

#[derive(Debug, Serialize)]
struct SendGridRequest {
    personalizations: Vec<SendGridPersonalization>,
    from: SendGridAddress,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Vec<SendGridContent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachments: Option<Vec<SendGridAttachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    categories: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct SendGridPersonalization {
    to: Vec<SendGridAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cc: Option<Vec<SendGridAddress>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bcc: Option<Vec<SendGridAddress>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SendGridAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendGridContent {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct SendGridAttachment {
    content: String,
    filename: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendGridError {
    errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SendGridErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credential() -> EspCredential {
        EspCredential { api_key: Some("SG.test".into()), ..Default::default() }
    }

    #[test]
    fn build_request_applies_substitutions() {
        let adapter = SendGridAdapter::new(&credential());
        let message = EmailMessage::new()
            .from("sender@example.com")
            .subject("Hi {{first_name}}")
            .text_body("Hello -first_name-!");
        let personalization = Personalization::new("to@example.com").substitute("first_name", "Alice");

        let request = adapter.build_request(&message, &personalization).unwrap();
        assert_eq!(request.subject, "Hi Alice");
        assert_eq!(request.content.unwrap()[0].value, "Hello Alice!");
    }

    #[test]
    fn normalize_delivered_event() {
        let adapter = SendGridAdapter::new(&credential());
        let raw = RawWebhookEvent {
            headers: HashMap::new(),
            body: json!({ "event": "delivered", "sg_message_id": "abc123", "timestamp": 1700000000i64 }),
        };
        let event = adapter.normalize(&raw).unwrap();
        assert!(event.delivered);
        assert_eq!(event.delivered_time, Some(1700000000));
        assert_eq!(event.message_id, "abc123");
    }

    #[test]
    fn normalize_hard_bounce_also_drops() {
        let adapter = SendGridAdapter::new(&credential());
        let raw = RawWebhookEvent {
            headers: HashMap::new(),
            body: json!({ "event": "bounce", "sg_message_id": "abc123", "timestamp": 1700000000i64, "type": "bounce", "status": "550" }),
        };
        let event = adapter.normalize(&raw).unwrap();
        assert!(event.bounce && event.dropped);
    }

    #[test]
    fn normalize_unrecognized_event_is_a_harmless_no_op() {
        let adapter = SendGridAdapter::new(&credential());
        let raw = RawWebhookEvent {
            headers: HashMap::new(),
            body: json!({ "event": "click", "sg_message_id": "abc123" }),
        };
        let event = adapter.normalize(&raw).unwrap();
        assert!(!event.delivered && !event.bounce && !event.open);
    }
}
