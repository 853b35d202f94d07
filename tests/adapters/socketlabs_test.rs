//! SocketLabs adapter tests: `send()` against a mocked `/email`, plus
//! webhook normalization and message-id synthesis.

use relay_router::credentials::EspCredential;
use relay_router::email::{EmailMessage, Personalization};
use relay_router::providers::{EspAdapter, RawWebhookEvent, SocketLabsAdapter};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> EspCredential {
    EspCredential {
        api_key: Some("sl-api-key".into()),
        server_id: Some("4242".into()),
        ..Default::default()
    }
}

fn valid_message() -> EmailMessage {
    EmailMessage::new()
        .from("nick.fury@example.com")
        .subject("Assemble")
        .text_body("Assemble now")
}

#[tokio::test]
async fn successful_send_carries_server_id_and_bearer_auth() {
    let server = MockServer::start().await;
    let adapter = SocketLabsAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/email"))
        .and(header("Authorization", "Bearer sl-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ErrorCode": "Success",
            "TransactionReceipt": "abc-transaction-id",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("maria.hill@example.com");
    let result = adapter.send(&message, &personalization).await.unwrap();

    assert_eq!(result.message_id, "abc-transaction-id");
}

#[tokio::test]
async fn rejected_send_surfaces_error_code() {
    let server = MockServer::start().await;
    let adapter = SocketLabsAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "ErrorCode": "InvalidAuthentication",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("maria.hill@example.com");
    let err = adapter.send(&message, &personalization).await.unwrap_err();

    match err {
        relay_router::error::RelayError::ProviderRejection { provider, status, message } => {
            assert_eq!(provider, "socketlabs");
            assert_eq!(status, Some(401));
            assert_eq!(message, "InvalidAuthentication");
        }
        other => panic!("expected ProviderRejection, got {other:?}"),
    }
}

#[tokio::test]
async fn webhook_delivered_event_normalizes() {
    let adapter = SocketLabsAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "Type": "Delivered",
            "MessageId": "m1",
            "DateTime": "2024-01-01T00:00:00Z",
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.delivered);
    assert_eq!(event.message_id, "m1");
}

#[tokio::test]
async fn webhook_hard_failure_drops_with_reason() {
    let adapter = SocketLabsAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "Type": "Failed",
            "MessageId": "m1",
            "FailureCode": "Hard",
            "Reason": "Mailbox does not exist",
            "DateTime": "2024-01-01T00:00:00Z",
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.bounce);
    assert!(event.dropped);
    assert_eq!(event.dropped_reason.as_deref(), Some("Mailbox does not exist"));
}

#[tokio::test]
async fn missing_message_id_synthesizes_a_stable_stand_in() {
    let adapter = SocketLabsAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({ "Type": "Opened", "DateTime": "2024-01-01T00:00:00Z" }),
    };

    let first = adapter.normalize(&raw).unwrap();
    let second = adapter.normalize(&raw).unwrap();
    assert_eq!(first.message_id, second.message_id);
    assert!(!first.message_id.is_empty());
}
