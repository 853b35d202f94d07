//! SparkPost adapter tests: `send()` against a mocked `/transmissions`, plus
//! `msys` webhook envelope normalization.

use relay_router::credentials::EspCredential;
use relay_router::email::{EmailMessage, Personalization};
use relay_router::providers::{EspAdapter, RawWebhookEvent, SparkPostAdapter};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> EspCredential {
    EspCredential {
        api_key: Some("sp-api-key".into()),
        ..Default::default()
    }
}

fn valid_message() -> EmailMessage {
    EmailMessage::new()
        .from("wanda.maximoff@example.com")
        .subject("Welcome")
        .html_body("<p>Welcome</p>")
}

#[tokio::test]
async fn successful_send_returns_transmission_id() {
    let server = MockServer::start().await;
    let adapter = SparkPostAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/transmissions"))
        .and(header("Authorization", "sp-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": { "id": "sp-transmission-1", "total_accepted_recipients": 1, "total_rejected_recipients": 0 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("peter.parker@example.com");
    let result = adapter.send(&message, &personalization).await.unwrap();

    assert_eq!(result.message_id, "sp-transmission-1");
}

#[tokio::test]
async fn rejected_send_surfaces_first_error_message() {
    let server = MockServer::start().await;
    let adapter = SparkPostAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/transmissions"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "errors": [{"message": "From address is not a verified sending domain"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("peter.parker@example.com");
    let err = adapter.send(&message, &personalization).await.unwrap_err();

    match err {
        relay_router::error::RelayError::ProviderRejection { provider, status, message } => {
            assert_eq!(provider, "sparkpost");
            assert_eq!(status, Some(422));
            assert!(message.contains("verified sending domain"));
        }
        other => panic!("expected ProviderRejection, got {other:?}"),
    }
}

#[tokio::test]
async fn webhook_message_event_delivery_normalizes() {
    let adapter = SparkPostAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "msys": { "message_event": { "type": "delivery", "message_id": "m1", "timestamp": "1700000000" } }
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.delivered);
    assert_eq!(event.message_id, "m1");
}

#[tokio::test]
async fn webhook_initial_open_sets_unique_open() {
    let adapter = SparkPostAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "msys": { "message_event": { "type": "initial_open", "message_id": "m1", "timestamp": "1700000000" } }
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.open);
    assert!(event.unique_open);
}

#[tokio::test]
async fn webhook_spam_complaint_drops_message() {
    let adapter = SparkPostAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "msys": { "message_event": { "type": "spam_complaint", "message_id": "m1", "timestamp": "1700000000" } }
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.dropped);
    assert_eq!(event.dropped_reason.as_deref(), Some("spam complaint"));
}
