use std::collections::HashMap;
use std::io::Read;

use delivery_engine::{
    verify_signature, DeliveryHandler, DeliveryPayload, DestinationConfig, PayloadType, Transport,
    WebhookConfig, WebhookHandler, DEFAULT_TOLERANCE,
};
use serde_json::json;
use time::OffsetDateTime;

const SECRET: &str = "whsec-test-0123456789abcdef0123456789abcdef";

/// One-shot receiver capturing headers and body, replying as told.
fn spawn_receiver(
    status: u16,
    response_body: &'static str,
) -> (
    String,
    std::thread::JoinHandle<(HashMap<String, String>, String)>,
) {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let port = server.server_addr().to_ip().unwrap().port();
    let url = format!("http://127.0.0.1:{port}/hook");

    let handle = std::thread::spawn(move || {
        let mut request = server.recv().unwrap();
        let headers: HashMap<String, String> = request
            .headers()
            .iter()
            .map(|h| {
                (
                    h.field.as_str().as_str().to_ascii_lowercase(),
                    h.value.as_str().to_string(),
                )
            })
            .collect();
        let mut body = String::new();
        request.as_reader().read_to_string(&mut body).unwrap();
        let response = tiny_http::Response::from_string(response_body).with_status_code(status);
        request.respond(response).unwrap();
        (headers, body)
    });

    (url, handle)
}

fn webhook_destination(url: &str) -> DestinationConfig {
    DestinationConfig::Webhook(WebhookConfig {
        url: url.to_string(),
        method: "POST".to_string(),
        headers: HashMap::from([("X-Env".to_string(), "test".to_string())]),
        secret: Some(SECRET.to_string()),
        timeout_secs: 5,
    })
}

fn payload() -> DeliveryPayload {
    DeliveryPayload::new(
        "dlv_1",
        "org_1",
        PayloadType::Data,
        json!({ "value": 12, "nested": { "b": 2, "a": 1 } }),
    )
}

#[tokio::test]
async fn delivered_requests_are_signed_and_verifiable() {
    let (url, receiver) = spawn_receiver(200, r#"{"request_id":"req_555"}"#);
    let handler = WebhookHandler::new();

    assert_eq!(handler.transport(), Transport::Webhook);
    let result = handler.deliver(&payload(), &webhook_destination(&url)).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.cross_system_reference.as_deref(), Some("req_555"));
    assert!(result.delivered_at.is_some());

    let (headers, body) = receiver.join().unwrap();
    assert_eq!(headers.get("x-env").map(String::as_str), Some("test"));
    assert_eq!(
        headers.get("x-delivery-id").map(String::as_str),
        Some("dlv_1")
    );

    let timestamp = headers.get("x-webhook-timestamp").unwrap();
    let signature = headers.get("x-webhook-signature").unwrap();
    let idem = headers.get("x-idempotency-key").unwrap();
    assert_eq!(idem.len(), 32);

    // The receiver verifies the signature over the parsed body, exactly as
    // a customer integration would.
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["delivery_id"], "dlv_1");
    assert_eq!(parsed["organization_id"], "org_1");
    assert_eq!(parsed["type"], "data");
    assert_eq!(parsed["idempotency_key"], idem.as_str());
    assert_eq!(parsed["timestamp"], timestamp.as_str());

    let check = verify_signature(
        SECRET.as_bytes(),
        &parsed,
        timestamp,
        signature,
        DEFAULT_TOLERANCE,
        OffsetDateTime::now_utc(),
    );
    assert!(check.is_valid, "reason: {:?}", check.reason);
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let (url, receiver) = spawn_receiver(503, "upstream down");
    let handler = WebhookHandler::new();

    let result = handler.deliver(&payload(), &webhook_destination(&url)).await;
    assert!(!result.success);
    assert!(result.retryable);
    assert!(result.error.as_deref().unwrap().contains("HTTP 503"));
    receiver.join().unwrap();
}

#[tokio::test]
async fn client_errors_are_terminal() {
    let (url, receiver) = spawn_receiver(422, "bad shape");
    let handler = WebhookHandler::new();

    let result = handler.deliver(&payload(), &webhook_destination(&url)).await;
    assert!(!result.success);
    assert!(!result.retryable);
    receiver.join().unwrap();
}

#[tokio::test]
async fn connection_failures_are_retryable() {
    // Nothing listens on this port.
    let handler = WebhookHandler::new();
    let result = handler
        .deliver(&payload(), &webhook_destination("http://127.0.0.1:9/hook"))
        .await;
    assert!(!result.success);
    assert!(result.retryable);
}

#[tokio::test]
async fn invalid_configuration_fails_fast() {
    let handler = WebhookHandler::new();

    let config = DestinationConfig::Webhook(WebhookConfig {
        url: "ftp://example.com/hook".to_string(),
        method: "DELETE".to_string(),
        headers: HashMap::new(),
        secret: Some("short".to_string()),
        timeout_secs: 0,
    });
    let report = handler.validate_config(&config);
    assert!(!report.is_valid);
    assert!(report.errors.len() >= 4);

    let result = handler.deliver(&payload(), &config).await;
    assert!(!result.success);
    assert!(!result.retryable);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .starts_with("Configuration validation failed:"));
}

#[tokio::test]
async fn explicit_idempotency_keys_pass_through() {
    let (url, receiver) = spawn_receiver(200, "{}");
    let handler = WebhookHandler::new();

    let payload = payload().with_idempotency_key("caller-chosen-key");
    let result = handler.deliver(&payload, &webhook_destination(&url)).await;
    assert!(result.success);

    let (headers, _) = receiver.join().unwrap();
    assert_eq!(
        headers.get("x-idempotency-key").map(String::as_str),
        Some("caller-chosen-key")
    );
}

#[test]
fn http_urls_warn_but_validate() {
    let handler = WebhookHandler::new();
    let config = DestinationConfig::Webhook(WebhookConfig {
        url: "http://internal.example.com/hook".to_string(),
        method: "POST".to_string(),
        headers: HashMap::new(),
        secret: None,
        timeout_secs: 30,
    });
    let report = handler.validate_config(&config);
    assert!(report.is_valid);
    assert!(!report.warnings.is_empty());
}
