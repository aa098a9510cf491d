use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use delivery_engine::{
    DeliveryEngine, DeliveryPayload, DestinationConfig, DownloadConfig, EmailConfig, EmailMessage,
    EmailProviderConfig, EmailTransport, EngineConfig, InMemoryLinkStore, PayloadType,
    ProviderRegistry, SftpAuth, SftpConfig, SftpSession, SftpSessionFactory, Transport,
    TransportError, WebhookConfig,
};
use serde_json::json;

struct NoopSession {
    last_len: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl SftpSession for NoopSession {
    async fn ensure_dir(&mut self, _path: &str, _mode: i32) -> Result<(), TransportError> {
        Ok(())
    }

    async fn upload(&mut self, _path: &str, data: &[u8], _mode: i32) -> Result<(), TransportError> {
        self.last_len.store(data.len(), std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn remote_size(&mut self, _path: &str) -> Result<u64, TransportError> {
        Ok(self.last_len.load(std::sync::atomic::Ordering::SeqCst) as u64)
    }

    async fn close(&mut self) {}
}

struct NoopFactory;

#[async_trait]
impl SftpSessionFactory for NoopFactory {
    async fn connect(
        &self,
        _config: &SftpConfig,
        _timeout: Duration,
    ) -> Result<Box<dyn SftpSession>, TransportError> {
        Ok(Box::new(NoopSession {
            last_len: std::sync::atomic::AtomicUsize::new(0),
        }))
    }
}

#[derive(Default)]
struct CountingEmailTransport {
    sent: Mutex<usize>,
}

#[async_trait]
impl EmailTransport for CountingEmailTransport {
    async fn send(
        &self,
        _config: &EmailProviderConfig,
        _message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        *self.sent.lock().unwrap() += 1;
        Ok(None)
    }

    async fn probe(&self, _config: &EmailProviderConfig) -> Result<(), TransportError> {
        Ok(())
    }
}

fn engine_with_mocks(email: Arc<CountingEmailTransport>) -> DeliveryEngine {
    DeliveryEngine::with_parts(
        EngineConfig::default(),
        Arc::new(ProviderRegistry::with_builtins()),
        Arc::new(NoopFactory),
        email,
        Arc::new(InMemoryLinkStore::new()),
    )
}

fn payload() -> DeliveryPayload {
    DeliveryPayload::new("dlv_1", "org_1", PayloadType::Report, json!({ "ok": 1 }))
}

fn download_destination() -> DestinationConfig {
    DestinationConfig::Download(DownloadConfig {
        base_url: "https://files.example.com".to_string(),
        expiry_hours: 24,
        max_access: None,
        object_type: None,
    })
}

fn email_destination() -> DestinationConfig {
    DestinationConfig::Email(EmailConfig {
        provider: EmailProviderConfig::Resend {
            api_key: "re_test".to_string(),
            endpoint: None,
        },
        from: "noreply@deliveries.example.com".to_string(),
        recipients: vec!["ops@customer.example.com".to_string()],
        cc: vec![],
        bcc: vec![],
        subject_template: "{type} delivery {deliveryId}".to_string(),
        attach_payload: false,
    })
}

fn sftp_destination() -> DestinationConfig {
    DestinationConfig::Sftp(SftpConfig {
        host: "files.example.com".to_string(),
        port: 22,
        username: "deliveries".to_string(),
        auth: SftpAuth::Password {
            password: "hunter2".to_string(),
        },
        remote_path: "/inbound".to_string(),
        filename_template: "{deliveryId}.json".to_string(),
        connect_timeout_secs: 5,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn routes_by_destination_transport() {
    let email = Arc::new(CountingEmailTransport::default());
    let engine = engine_with_mocks(email.clone());

    assert_eq!(
        engine.handler(Transport::Webhook).transport(),
        Transport::Webhook
    );
    assert_eq!(
        engine.handler(Transport::Storage).transport(),
        Transport::Storage
    );

    let result = engine.deliver(&payload(), &download_destination()).await;
    assert!(result.success);
    assert!(result
        .cross_system_reference
        .as_deref()
        .unwrap()
        .contains("/download/"));

    let result = engine.deliver(&payload(), &email_destination()).await;
    assert!(result.success);
    assert_eq!(*email.sent.lock().unwrap(), 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn batches_run_to_completion_despite_failures() {
    let email = Arc::new(CountingEmailTransport::default());
    let engine = engine_with_mocks(email.clone());

    let bad_webhook = DestinationConfig::Webhook(WebhookConfig {
        url: "not a url".to_string(),
        method: "POST".to_string(),
        headers: Default::default(),
        secret: None,
        timeout_secs: 30,
    });

    let destinations = vec![
        download_destination(),
        bad_webhook,
        sftp_destination(),
        email_destination(),
    ];
    let results = engine.deliver_all(&payload(), &destinations).await;
    assert_eq!(results.len(), 4);

    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(!results[1].retryable);
    assert!(results[2].success, "sftp error: {:?}", results[2].error);
    assert!(results[3].success);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn issued_links_remain_queryable_through_the_engine() {
    let email = Arc::new(CountingEmailTransport::default());
    let engine = engine_with_mocks(email);

    let result = engine.deliver(&payload(), &download_destination()).await;
    assert!(result.success);

    let org = delivery_engine::OrganizationId("org_1".to_string());
    let analytics = engine
        .link_manager()
        .analytics(&org, time::OffsetDateTime::now_utc(), 10)
        .await
        .unwrap();
    assert_eq!(analytics.total_links, 1);
    assert_eq!(analytics.active, 1);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_routes_to_the_right_handler() {
    let email = Arc::new(CountingEmailTransport::default());
    let engine = engine_with_mocks(email);

    assert!(engine.validate_config(&download_destination()).is_valid);
    assert!(engine.validate_config(&sftp_destination()).is_valid);

    let bad = DestinationConfig::Download(DownloadConfig {
        base_url: "https://files.example.com".to_string(),
        expiry_hours: -1,
        max_access: None,
        object_type: None,
    });
    assert!(!engine.validate_config(&bad).is_valid);

    engine.shutdown().await;
}
