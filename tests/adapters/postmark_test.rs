//! Postmark adapter tests: `send()` against a mocked `/email`, plus webhook
//! normalization.

use relay_router::credentials::EspCredential;
use relay_router::email::{EmailMessage, Personalization};
use relay_router::providers::{EspAdapter, PostmarkAdapter, RawWebhookEvent};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> EspCredential {
    EspCredential {
        api_key: Some("jarvis".into()),
        ..Default::default()
    }
}

fn valid_message() -> EmailMessage {
    EmailMessage::new()
        .from("steve.rogers@example.com")
        .subject("Hello, Avengers!")
        .html_body("<h1>Hello</h1>")
}

fn success_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "ErrorCode": 0,
        "Message": "OK",
        "MessageID": "b7bc2f4a-e38e-4336-af7d-e6c392c2f817",
        "SubmittedAt": "2010-11-26T12:01:05.1794748-05:00",
        "To": "tony.stark@example.com"
    }))
}

#[tokio::test]
async fn successful_send_uses_server_token_header_and_pascal_case_body() {
    let server = MockServer::start().await;
    let adapter = PostmarkAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/email"))
        .and(header("X-Postmark-Server-Token", "jarvis"))
        .and(header("Content-Type", "application/json"))
        .and(body_string_contains("\"Subject\":\"Hello, Avengers!\""))
        .and(body_string_contains("\"To\":\"tony.stark@example.com\""))
        .and(body_string_contains("\"From\":\"steve.rogers@example.com\""))
        .and(body_string_contains("\"HtmlBody\":\"<h1>Hello</h1>\""))
        .respond_with(success_response())
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("tony.stark@example.com");
    let result = adapter.send(&message, &personalization).await.unwrap();

    assert_eq!(result.message_id, "b7bc2f4a-e38e-4336-af7d-e6c392c2f817");
}

#[tokio::test]
async fn rejected_send_surfaces_error_code_and_message() {
    let server = MockServer::start().await;
    let adapter = PostmarkAdapter::new(&credential()).base_url(server.uri());

    Mock::given(method("POST"))
        .and(path("/email"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "ErrorCode": 300,
            "Message": "Invalid email request"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = valid_message();
    let personalization = Personalization::new("tony.stark@example.com");
    let err = adapter.send(&message, &personalization).await.unwrap_err();

    match err {
        relay_router::error::RelayError::ProviderRejection { provider, status, message } => {
            assert_eq!(provider, "postmark");
            assert_eq!(status, Some(422));
            assert!(message.contains("300"));
            assert!(message.contains("Invalid email request"));
        }
        other => panic!("expected ProviderRejection, got {other:?}"),
    }
}

#[tokio::test]
async fn webhook_delivery_record_normalizes_to_standardized_schema() {
    let adapter = PostmarkAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "RecordType": "Delivery",
            "MessageID": "b7bc2f4a-e38e-4336-af7d-e6c392c2f817",
            "DeliveredAt": "2024-01-01T00:00:00Z",
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.delivered);
    assert_eq!(event.message_id, "b7bc2f4a-e38e-4336-af7d-e6c392c2f817");
}

#[tokio::test]
async fn webhook_soft_bounce_does_not_drop() {
    let adapter = PostmarkAdapter::new(&credential());
    let raw = RawWebhookEvent {
        headers: Default::default(),
        body: json!({
            "RecordType": "Bounce",
            "MessageID": "m1",
            "Type": "SoftBounce",
            "TypeCode": 4,
        }),
    };

    let event = adapter.normalize(&raw).unwrap();
    assert!(event.bounce);
    assert!(!event.dropped);
}
