use std::sync::Arc;

use crate::download::{DownloadLinkHandler, DownloadLinkManager, InMemoryLinkStore, LinkRepository};
use crate::email::{DefaultEmailTransport, EmailHandler, EmailRateLimiter, EmailTransport, RateLimits};
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::sftp::{SftpHandler, SftpPoolConfig, SftpSessionFactory};
use crate::signing::generate_secret;
use crate::storage::{ProviderRegistry, StorageHandler};
use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};
use crate::webhook::WebhookHandler;

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Engine-wide settings injected at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HMAC key for download link URLs. Defaults to a random per-process
    /// key; supply a stable one when links must survive restarts.
    pub link_signing_key: Vec<u8>,
    pub sftp_pool: SftpPoolConfig,
    pub email_rate_limits: RateLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            link_signing_key: generate_secret(32).into_bytes(),
            sftp_pool: SftpPoolConfig::default(),
            email_rate_limits: RateLimits::default(),
        }
    }
}

/// Facade owning one handler per transport and routing deliveries by
/// destination configuration.
///
/// Handlers never panic and never return errors across the boundary;
/// every attempt yields a [`DeliveryResult`], so a batch over mixed
/// destinations always runs to completion.
pub struct DeliveryEngine {
    config: EngineConfig,
    webhook: WebhookHandler,
    storage: StorageHandler,
    sftp: SftpHandler,
    email: EmailHandler,
    download: DownloadLinkHandler,
    link_manager: Arc<DownloadLinkManager>,
}

impl DeliveryEngine {
    /// Engine with built-in transports, an in-memory link store and, when
    /// compiled in, real SSH sessions.
    pub fn new(config: EngineConfig) -> Self {
        let registry = Arc::new(ProviderRegistry::with_builtins());
        let link_repository: Arc<dyn LinkRepository> = Arc::new(InMemoryLinkStore::new());
        let email_transport: Arc<dyn EmailTransport> = Arc::new(DefaultEmailTransport::new());
        Self::assemble(
            config,
            registry,
            default_sftp_factory(),
            email_transport,
            link_repository,
        )
    }

    /// Engine with every seam injected, for tests and embedders with
    /// their own persistence or transports.
    pub fn with_parts(
        config: EngineConfig,
        registry: Arc<ProviderRegistry>,
        sftp_factory: Arc<dyn SftpSessionFactory>,
        email_transport: Arc<dyn EmailTransport>,
        link_repository: Arc<dyn LinkRepository>,
    ) -> Self {
        Self::assemble(config, registry, sftp_factory, email_transport, link_repository)
    }

    fn assemble(
        config: EngineConfig,
        registry: Arc<ProviderRegistry>,
        sftp_factory: Arc<dyn SftpSessionFactory>,
        email_transport: Arc<dyn EmailTransport>,
        link_repository: Arc<dyn LinkRepository>,
    ) -> Self {
        let link_manager = Arc::new(DownloadLinkManager::new(
            config.link_signing_key.clone(),
            link_repository,
        ));
        Self {
            webhook: WebhookHandler::new(),
            storage: StorageHandler::new(registry),
            sftp: SftpHandler::new(sftp_factory, config.sftp_pool.clone()),
            email: EmailHandler::new(
                email_transport,
                EmailRateLimiter::new(config.email_rate_limits),
            ),
            download: DownloadLinkHandler::new(link_manager.clone()),
            link_manager,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Link manager behind the download transport, for access validation
    /// and analytics.
    pub fn link_manager(&self) -> &Arc<DownloadLinkManager> {
        &self.link_manager
    }

    /// The handler serving a transport.
    pub fn handler(&self, transport: Transport) -> &dyn DeliveryHandler {
        match transport {
            Transport::Webhook => &self.webhook,
            Transport::Storage => &self.storage,
            Transport::Sftp => &self.sftp,
            Transport::Email => &self.email,
            Transport::Download => &self.download,
        }
    }

    pub fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        self.handler(config.transport()).validate_config(config)
    }

    pub async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        self.handler(config.transport()).test_connection(config).await
    }

    /// Deliver one payload to one destination.
    pub async fn deliver(
        &self,
        payload: &DeliveryPayload,
        config: &DestinationConfig,
    ) -> DeliveryResult {
        self.handler(config.transport()).deliver(payload, config).await
    }

    /// Deliver one payload to every destination in order. Failures never
    /// abort the batch; results align with the input slice.
    pub async fn deliver_all(
        &self,
        payload: &DeliveryPayload,
        configs: &[DestinationConfig],
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            results.push(self.deliver(payload, config).await);
        }
        results
    }

    /// Release pooled resources. Call once when the engine is retired.
    pub async fn shutdown(&self) {
        trace_event("delivery engine shutting down");
        self.sftp.cleanup().await;
    }
}

#[cfg(feature = "sftp")]
fn default_sftp_factory() -> Arc<dyn SftpSessionFactory> {
    Arc::new(crate::sftp::Ssh2SessionFactory)
}

#[cfg(not(feature = "sftp"))]
fn default_sftp_factory() -> Arc<dyn SftpSessionFactory> {
    Arc::new(UnavailableSessionFactory)
}

/// Stand-in factory when no SSH implementation is compiled in.
#[cfg(not(feature = "sftp"))]
struct UnavailableSessionFactory;

#[cfg(not(feature = "sftp"))]
#[async_trait::async_trait]
impl SftpSessionFactory for UnavailableSessionFactory {
    async fn connect(
        &self,
        _config: &crate::sftp::SftpConfig,
        _timeout: std::time::Duration,
    ) -> Result<Box<dyn crate::sftp::SftpSession>, crate::error::TransportError> {
        Err(crate::error::TransportError::terminal(
            "sftp support is not compiled in",
        ))
    }
}
