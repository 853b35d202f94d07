//! SendGrid adapter tests: `send()` against a mocked `/mail/send`, plus
//! webhook normalization.

use relay_router::credentials::EspCredential;
use relay_router::email::{EmailMessage, Personalization};
use relay_router::providers::{EspAdapter, RawWebhookEvent, SendGridAdapter};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> EspCredential {
    EspCredential {
        api_key: Some("SG.test-api-key".into()),
        ..Default::default()
    }
}

fn valid_message() -> EmailMessage {
    EmailMessage::new()
        .from("tony.stark@example.com")
        .subject("Hello, Avengers!")
        .html_body("<h1>Hello</h1>")
        .text_body("Hello")
}

fn success_response() -> ResponseTemplate {
    ResponseTemplate::new(202).insert_header("X-Message-Id", "123-xyz")
}

#[tokio::test]
async fn successful_send_returns_message_id_from_header() {
    let server = MockServer::start().await;
    let adapter = SendGridAdapter::new(&credential()).base_url(server.uri()).compress(false);

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .and(header("Authorization", "Bearer SG.test-api-key"))
        .and(header("Content-Type", "application/json"))
        .respond_with(success_response())
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("steve.rogers@example.com");
    let result = adapter.send(&message, &personalization).await.unwrap();

    assert_eq!(result.message_id, "123-xyz");
    assert_eq!(result.status, 202);
}

#[tokio::test]
async fn gzip_compression_sets_content_encoding_header() {
    let server = MockServer::start().await;
    let adapter = SendGridAdapter::new(&credential()).base_url(server.uri()).compress(true);

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .and(header("Content-Encoding", "gzip"))
        .respond_with(success_response())
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("steve.rogers@example.com");
    adapter.send(&message, &personalization).await.unwrap();
}

#[tokio::test]
async fn rejected_send_surfaces_provider_rejection() {
    let server = MockServer::start().await;
    let adapter = SendGridAdapter::new(&credential()).base_url(server.uri()).compress(false);

    Mock::given(method("POST"))
        .and(path("/mail/send"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{"message": "The from address does not match a verified Sender Identity"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("steve.rogers@example.com");
    let err = adapter.send(&message, &personalization).await.unwrap_err();

    match err {
        relay_router::error::RelayError::ProviderRejection { provider, status, message } => {
            assert_eq!(provider, "sendgrid");
            assert_eq!(status, Some(400));
            assert!(message.contains("verified Sender Identity"));
        }
        other => panic!("expected ProviderRejection, got {other:?}"),
    }
}

#[tokio::test]
async fn webhook_delivered_event_normalizes_to_standardized_schema() {
    let adapter = SendGridAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "event": "delivered",
            "sg_message_id": "abc123.filterdrecv-xyz",
            "timestamp": 1_700_000_000i64,
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.delivered);
    assert_eq!(event.delivered_time, Some(1_700_000_000));
    assert_eq!(event.message_id, "abc123.filterdrecv-xyz");
}

#[tokio::test]
async fn webhook_spam_report_is_dropped_with_reason() {
    let adapter = SendGridAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({ "event": "spamreport", "sg_message_id": "m1", "timestamp": 1i64 }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.dropped);
    assert_eq!(event.dropped_reason.as_deref(), Some("spam complaint"));
}
