use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use delivery_engine::{
    DeliveryHandler, DeliveryPayload, DestinationConfig, EmailConfig, EmailHandler, EmailMessage,
    EmailProviderConfig, EmailProviderKind, EmailRateLimiter, EmailTransport, PayloadType,
    RateLimits, Transport, TransportError,
};
use serde_json::json;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
    fail_with: Option<TransportError>,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(
        &self,
        _config: &EmailProviderConfig,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(Some("msg_001".to_string()))
    }

    async fn probe(&self, _config: &EmailProviderConfig) -> Result<(), TransportError> {
        Ok(())
    }
}

fn email_destination() -> DestinationConfig {
    DestinationConfig::Email(EmailConfig {
        provider: EmailProviderConfig::SendGrid {
            api_key: "SG.test-key".to_string(),
            endpoint: None,
        },
        from: "noreply@deliveries.example.com".to_string(),
        recipients: vec!["ops@customer.example.com".to_string()],
        cc: vec![],
        bcc: vec![],
        subject_template: "{type} delivery {deliveryId}".to_string(),
        attach_payload: true,
    })
}

fn payload() -> DeliveryPayload {
    DeliveryPayload::new("dlv_42", "org_1", PayloadType::Export, json!({ "n": 7 }))
        .with_correlation_id("corr_1")
}

fn handler_with(transport: Arc<RecordingTransport>, limits: RateLimits) -> EmailHandler {
    EmailHandler::new(transport, EmailRateLimiter::new(limits))
}

#[tokio::test]
async fn renders_subject_body_and_attachment() {
    let transport = Arc::new(RecordingTransport::default());
    let handler = handler_with(transport.clone(), RateLimits::default());

    assert_eq!(handler.transport(), Transport::Email);
    let result = handler.deliver(&payload(), &email_destination()).await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.cross_system_reference.as_deref(), Some("msg_001"));

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert_eq!(message.subject, "export delivery dlv_42");
    assert_eq!(message.to, vec!["ops@customer.example.com".to_string()]);
    assert!(message.body_text.contains("corr_1"));

    let (filename, bytes) = message.attachment.as_ref().unwrap();
    assert_eq!(filename, "delivery_dlv_42.json");
    let parsed: serde_json::Value = serde_json::from_slice(bytes).unwrap();
    assert_eq!(parsed["n"], 7);
}

#[tokio::test]
async fn inline_body_when_attachment_disabled() {
    let transport = Arc::new(RecordingTransport::default());
    let handler = handler_with(transport.clone(), RateLimits::default());

    let mut config = email_destination();
    if let DestinationConfig::Email(cfg) = &mut config {
        cfg.attach_payload = false;
    }
    let result = handler.deliver(&payload(), &config).await;
    assert!(result.success);

    let sent = transport.sent.lock().unwrap();
    assert!(sent[0].attachment.is_none());
    assert!(sent[0].body_text.contains("\"n\": 7"));
}

#[tokio::test]
async fn missing_recipients_fail_validation() {
    let handler = handler_with(Arc::new(RecordingTransport::default()), RateLimits::default());

    let mut config = email_destination();
    if let DestinationConfig::Email(cfg) = &mut config {
        cfg.recipients.clear();
    }
    let report = handler.validate_config(&config);
    assert!(!report.is_valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("recipient list")));

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
async fn malformed_addresses_fail_validation() {
    let handler = handler_with(Arc::new(RecordingTransport::default()), RateLimits::default());
    let mut config = email_destination();
    if let DestinationConfig::Email(cfg) = &mut config {
        cfg.recipients.push("not-an-address".to_string());
    }
    assert!(!handler.validate_config(&config).is_valid);
}

#[tokio::test]
async fn exhausted_rate_limit_is_a_retryable_failure() {
    let transport = Arc::new(RecordingTransport::default());
    let limits = RateLimits {
        per_second: 2,
        per_minute: 2,
        per_hour: 2,
    };
    let handler = handler_with(transport.clone(), limits);

    for _ in 0..2 {
        let result = handler.deliver(&payload(), &email_destination()).await;
        assert!(result.success);
    }

    let result = handler.deliver(&payload(), &email_destination()).await;
    assert!(!result.success);
    assert!(result.retryable);
    assert!(result.error.as_deref().unwrap().contains("rate limit"));

    // The rejected send was not forwarded to the provider.
    assert_eq!(transport.sent.lock().unwrap().len(), 2);
}

#[test]
fn limiter_windows_are_per_provider() {
    let limiter = EmailRateLimiter::new(RateLimits {
        per_second: 1,
        per_minute: 10,
        per_hour: 10,
    });

    assert!(limiter.check_and_record(EmailProviderKind::SendGrid).is_ok());
    assert!(limiter.check_and_record(EmailProviderKind::SendGrid).is_err());
    // A different provider has its own budget.
    assert!(limiter.check_and_record(EmailProviderKind::Resend).is_ok());

    let stats = limiter.stats(EmailProviderKind::SendGrid);
    assert_eq!(stats.in_last_second, 1);
    assert_eq!(stats.in_last_hour, 1);
}

#[test]
fn provider_capabilities_differ() {
    assert!(EmailProviderKind::Smtp.supports("attachments"));
    assert!(!EmailProviderKind::Smtp.supports("templates"));
    assert!(EmailProviderKind::SendGrid.supports("templates"));
    assert!(EmailProviderKind::Resend.supports("templates"));
    assert!(!EmailProviderKind::Ses.supports("templates"));
}

#[tokio::test]
async fn transport_failures_carry_their_verdict() {
    let transport = Arc::new(RecordingTransport {
        sent: Mutex::new(Vec::new()),
        fail_with: Some(TransportError::terminal("mailbox does not exist")),
    });
    let handler = handler_with(transport, RateLimits::default());

    let result = handler.deliver(&payload(), &email_destination()).await;
    assert!(!result.success);
    assert!(!result.retryable);
    assert_eq!(result.error.as_deref(), Some("mailbox does not exist"));
}
