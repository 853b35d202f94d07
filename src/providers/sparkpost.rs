//! SparkPost send + webhook normalization.
//!
//! SparkPost's transmission API takes substitution data per recipient and
//! wraps each webhook event in a `msys` envelope keyed by event class
//! (`message_event`, `relay_event`, ...); this adapter only deals with
//! `message_event` payloads since those carry delivery/bounce/open data.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::EspCredential;
use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::event::StandardizedEvent;
use crate::providers::{resolve_timestamp, DispatchResult, EspAdapter, RawWebhookEvent};
use crate::substitution;

const SPARKPOST_API_URL: &str = "https://api.sparkpost.com/api/v1";

pub struct SparkPostAdapter {
    api_key: String,
    client: Client,
    base_url: String,
}

impl SparkPostAdapter {
    pub fn new(credential: &EspCredential) -> Self {
        Self {
            api_key: credential.api_key.clone().unwrap_or_default(),
            client: Client::new(),
            base_url: SPARKPOST_API_URL.to_string(),
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
    ) -> Result<SparkPostRequest, RelayError> {
        let from = message
            .from
            .as_ref()
            .ok_or_else(|| RelayError::provider("sparkpost", "missing from address"))?;

        let subject = substitution::expand(
            personalization.subject.as_deref().unwrap_or(&message.subject),
            &personalization.substitutions,
            &message.sections,
        );
        let html = message
            .html_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));
        let text = message
            .text_body
            .as_ref()
            .map(|b| substitution::expand(b, &personalization.substitutions, &message.sections));

        let mut recipients = vec![SparkPostRecipient {
            address: SparkPostAddress { email: personalization.to.email.clone(), name: personalization.to.name.clone() },
        }];
        for cc in &personalization.cc {
            recipients.push(SparkPostRecipient { address: SparkPostAddress { email: cc.email.clone(), name: cc.name.clone() } });
        }
        for bcc in &personalization.bcc {
            recipients.push(SparkPostRecipient { address: SparkPostAddress { email: bcc.email.clone(), name: bcc.name.clone() } });
        }

        Ok(SparkPostRequest {
            content: SparkPostContent {
                from: SparkPostAddress { email: from.email.clone(), name: from.name.clone() },
                subject,
                html,
                text,
                headers: if message.headers.is_empty() { None } else { Some(message.headers.clone()) },
                attachments: if message.attachments.is_empty() {
                    None
                } else {
                    Some(
                        message
                            .attachments
                            .iter()
                            .map(|a| SparkPostAttachment {
                                name: a.filename.clone(),
                                data: a.base64_data(),
                                mime_type: a.content_type.clone(),
                            })
                            .collect(),
                    )
                },
            },
            recipients,
            tags: message.categories.clone(),
        })
    }
}

#[async_trait]
impl EspAdapter for SparkPostAdapter {
    fn provider_name(&self) -> &'static str {
        "sparkpost"
    }

    async fn send(
        &self,
        message: &EmailMessage,
        personalization: &Personalization,
    ) -> Result<DispatchResult, RelayError> {
        let request = self.build_request(message, personalization)?;
        let url = format!("{}/transmissions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::provider("sparkpost", format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let result: SparkPostResponse = response
                .json()
                .await
                .map_err(|e| RelayError::provider("sparkpost", format!("bad response body: {e}")))?;
            let message_id = result
                .results
                .and_then(|r| r.id)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            Ok(DispatchResult { message_id, status: status.as_u16() })
        } else {
            let error: SparkPostErrorResponse = response.json().await.unwrap_or_default();
            let message = error
                .errors
                .into_iter()
                .next()
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".into());
            Err(RelayError::provider_with_status("sparkpost", message, status.as_u16()))
        }
    }

    fn normalize(&self, raw: &RawWebhookEvent) -> Result<StandardizedEvent, RelayError> {
        let wrapper: Value = raw
            .body
            .get("msys")
            .cloned()
            .ok_or_else(|| RelayError::MalformedPayload("sparkpost webhook missing msys envelope".into()))?;
        let event = wrapper
            .get("message_event")
            .or_else(|| wrapper.get("track_event"))
            .ok_or_else(|| RelayError::MalformedPayload("sparkpost webhook missing message_event".into()))?;

        let event_type = event
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("sparkpost event missing type".into()))?;

        let message_id = event
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::MalformedPayload("sparkpost event missing message_id".into()))?;

        let event_ts = event
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok());
        let ts = resolve_timestamp(event_ts, crate::providers::header_timestamp(&raw.headers, "x-webhook-timestamp"));

        let mut standardized = StandardizedEvent::new(message_id);
        standardized.provider = Some(crate::credentials::Provider::SparkPost);

        match event_type {
            "delivery" => {
                standardized.delivered = true;
                standardized.delivered_time = Some(ts);
            }
            "bounce" | "out_of_band" => {
                standardized.bounce = true;
                standardized.bounce_time = Some(ts);
                let bounce_class = event.get("bounce_class").and_then(|v| v.as_str()).unwrap_or("");
                let is_hard = bounce_class == "10" || bounce_class == "30" || bounce_class == "90";
                standardized.bounce_type = Some(if is_hard { "hard".into() } else { "soft".into() });
                if is_hard {
                    standardized.dropped = true;
                    standardized.dropped_time = Some(ts);
                    standardized.dropped_reason = event.get("reason").and_then(|v| v.as_str()).map(|s| s.to_string());
                }
            }
            "delay" => {
                standardized.deferred = true;
                standardized.deferred_count = 1;
                standardized.last_deferral_time = Some(ts);
            }
            "open" => {
                standardized.open = true;
                standardized.open_count = 1;
                standardized.last_open_time = Some(ts);
            }
            "initial_open" => {
                standardized.open = true;
                standardized.open_count = 1;
                standardized.last_open_time = Some(ts);
                standardized.unique_open = true;
                standardized.unique_open_time = Some(ts);
            }
            "spam_complaint" => {
                standardized.dropped = true;
                standardized.dropped_time = Some(ts);
                standardized.dropped_reason = Some("spam complaint".into());
            }
            _ => {}
        }

        Ok(standardized)
    }
}

#[derive(Debug, Serialize)]
struct SparkPostRequest {
    content: SparkPostContent,
    recipients: Vec<SparkPostRecipient>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SparkPostContent {
    from: SparkPostAddress,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<std::collections::HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachments: Option<Vec<SparkPostAttachment>>,
}

#[derive(Debug, Serialize)]
struct SparkPostAttachment {
    name: String,
    data: String,
    #[serde(rename = "type")]
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct SparkPostRecipient {
    address: SparkPostAddress,
}

#[derive(Debug, Serialize)]
struct SparkPostAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SparkPostResponse {
    results: Option<SparkPostResults>,
}

#[derive(Debug, Deserialize)]
struct SparkPostResults {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SparkPostErrorResponse {
    #[serde(default)]
    errors: Vec<SparkPostErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SparkPostErrorDetail {
    message: String,
}
