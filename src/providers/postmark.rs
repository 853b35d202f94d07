//! Postmark send + webhook normalization, grounded on the teacher's
//! `PostmarkMailer` request shape (`PascalCase` wire fields, server-token
//! auth header).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::credentials::EspCredential;
use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::event::StandardizedEvent;
use crate::providers::{resolve_timestamp, DispatchResult, EspAdapter, RawWebhookEvent};
use crate::substitution;

const POSTMARK_API_URL: &str = "https://api.postmarkapp.com";

pub struct PostmarkAdapter {
    api_token: String,
    client: Client,
    base_url: String,
}

impl PostmarkAdapter {
    pub fn new(credential: &EspCredential) -> Self {
        Self {
            api_token: credential.api_key.clone().unwrap_or_default(),
            client: Client::new(),
            base_url: POSTMARK_API_URL.to_string(),
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
    ) -> Result<PostmarkRequest, RelayError> {
        let from = message
            .from
            .as_ref()
            .ok_or_else(|| RelayError::provider("postmark", "missing from address"))?;

        let subject = substitution::expand(
            personalization.subject.as_deref().unwrap_or(&message.subject),
            &personalization.substitutions,
            &message.sections,
        );
        let html_body = message
            .html_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));
        let text_body = message
            .text_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));

        Ok(PostmarkRequest {
            from: from.formatted(),
            to: personalization.to.formatted(),
            subject: if subject.is_empty() { None } else { Some(subject) },
            html_body,
            text_body,
            cc: fmt_list(&personalization.cc),
            bcc: fmt_list(&personalization.bcc),
            reply_to: message.reply_to.first().map(|a| a.formatted()),
            tag: message.categories.first().cloned(),
            headers: if message.headers.is_empty() {
                None
            } else {
                Some(message.headers.iter().map(|(n, v)| PostmarkHeader { name: n.clone(), value: v.clone() }).collect())
            },
            attachments: if message.attachments.is_empty() {
                None
            } else {
                Some(
                    message
                        .attachments
                        .iter()
                        .map(|a| PostmarkAttachment {
                            name: a.filename.clone(),
                            content: a.base64_data(),
                            content_type: a.content_type.clone(),
                            content_id: a.is_inline().then(|| format!("cid:{}", a.content_id.clone().unwrap_or_else(|| a.filename.clone()))),
                        })
                        .collect(),
                )
            },
        })
    }
}

fn fmt_list(addrs: &[crate::address::Address]) -> Option<String> {
    if addrs.is_empty() {
        None
    } else {
        Some(addrs.iter().map(|a| a.formatted()).collect::<Vec<_>>().join(", "))
    }
}

#[async_trait]
impl EspAdapter for PostmarkAdapter {
    fn provider_name(&self) -> &'static str {
        "postmark"
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
            .header("X-Postmark-Server-Token", &self.api_token)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::provider("postmark", format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let result: PostmarkResponse = response
                .json()
                .await
                .map_err(|e| RelayError::provider("postmark", format!("bad response body: {e}")))?;
            Ok(DispatchResult { message_id: result.message_id, status: status.as_u16() })
        } else {
            let error: PostmarkError = response
                .json()
                .await
                .unwrap_or(PostmarkError { error_code: 0, message: "unknown error".into() });
            Err(RelayError::provider_with_status(
                "postmark",
                format!("[{}] {}", error.error_code, error.message),
                status.as_u16(),
            ))
        }
    }

    fn normalize(&self, raw: &RawWebhookEvent) -> Result<StandardizedEvent, RelayError> {
        let record_type = raw
            .body
            .get("RecordType")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("postmark webhook missing RecordType".into()))?;

        let message_id = raw
            .body
            .get("MessageID")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("postmark webhook missing MessageID".into()))?;

        let event_ts = raw
            .body
            .get("ReceivedAt")
            .or_else(|| raw.body.get("DeliveredAt"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp());
        let ts = resolve_timestamp(event_ts, crate::providers::header_timestamp(&raw.headers, "x-webhook-timestamp"));

        let mut event = StandardizedEvent::new(message_id);
        event.provider = Some(crate::credentials::Provider::Postmark);

        match record_type {
            "Delivery" => {
                event.delivered = true;
                event.delivered_time = Some(ts);
            }
            "Bounce" => {
                event.bounce = true;
                event.bounce_time = Some(ts);
                let bounce_type = raw.body.get("Type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                let is_hard = raw.body.get("TypeCode").and_then(|v| v.as_i64()).is_some_and(|c| c == 1 || c == 6);
                event.bounce_type = Some(bounce_type);
                if is_hard {
                    event.dropped = true;
                    event.dropped_time = Some(ts);
                    event.dropped_reason = raw.body.get("Description").and_then(|v| v.as_str()).map(|s| s.to_string());
                }
            }
            "Open" => {
                event.open = true;
                event.open_count = 1;
                event.last_open_time = Some(ts);
                let first_open = raw.body.get("FirstOpen").and_then(|v| v.as_bool()).unwrap_or(true);
                if first_open {
                    event.unique_open = true;
                    event.unique_open_time = Some(ts);
                }
            }
            "SpamComplaint" => {
                event.dropped = true;
                event.dropped_time = Some(ts);
                event.dropped_reason = Some("spam complaint".into());
            }
            _ => {}
        }

        Ok(event)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkRequest {
    from: String,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bcc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<Vec<PostmarkHeader>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachments: Option<Vec<PostmarkAttachment>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkHeader {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkAttachment {
    name: String,
    content: String,
    content_type: String,
    #[serde(rename = "ContentID", skip_serializing_if = "Option::is_none")]
    content_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkResponse {
    #[serde(rename = "MessageID")]
    message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkError {
    error_code: i32,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn credential() -> EspCredential {
        EspCredential { api_key: Some("server-token".into()), ..Default::default() }
    }

    #[test]
    fn build_request_formats_addresses() {
        let adapter = PostmarkAdapter::new(&credential());
        let message = EmailMessage::new().from(("Sender", "sender@example.com")).subject("Hi").text_body("hello");
        let personalization = Personalization::new(("Recipient", "to@example.com"));
        let request = adapter.build_request(&message, &personalization).unwrap();
        assert_eq!(request.from, "Sender <sender@example.com>");
        assert_eq!(request.to, "Recipient <to@example.com>");
    }

    #[test]
    fn normalize_delivery_record() {
        let adapter = PostmarkAdapter::new(&credential());
        let raw = RawWebhookEvent {
            headers: HashMap::new(),
            body: json!({ "RecordType": "Delivery", "MessageID": "m1", "DeliveredAt": "2024-01-01T00:00:00Z" }),
        };
        let event = adapter.normalize(&raw).unwrap();
        assert!(event.delivered);
        assert_eq!(event.message_id, "m1");
    }

    #[test]
    fn normalize_hard_bounce_drops() {
        let adapter = PostmarkAdapter::new(&credential());
        let raw = RawWebhookEvent {
            headers: HashMap::new(),
            body: json!({ "RecordType": "Bounce", "MessageID": "m1", "Type": "HardBounce", "TypeCode": 1 }),
        };
        let event = adapter.normalize(&raw).unwrap();
        assert!(event.bounce && event.dropped);
    }
}
