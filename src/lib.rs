//! A multi-destination delivery engine.
//!
//! This crate pushes **one payload to many kinds of destinations**
//! behind a single handler contract: webhooks, object storage, SFTP
//! servers, email providers, and signed download links.
//!
//! ## Guarantees
//! - One result object per attempt; handlers never panic or throw
//! - Fail-fast validation before any network I/O
//! - Explicit retryability verdict on every failure
//! - HMAC-signed webhook requests and download links
//! - Webhook secrets encrypted at rest
//!
//! ## Non-Guarantees
//! - Retry scheduling (the caller owns backoff and re-invocation)
//! - Durability of in-memory repositories across restarts
//! - Exactly-once delivery
//!
//! This crate is intentionally **not a hosted service**. It is the
//! delivery layer you embed under your own queue and scheduler.

mod download;
mod email;
mod engine;
mod error;
mod handler;
mod secrets;
mod sftp;
mod signing;
mod storage;
mod storage_azure;
mod storage_gcs;
mod storage_local;
mod types;
mod webhook;

#[cfg(feature = "s3")]
mod storage_s3;

pub use download::{
    AccessAttempt, AccessDecision, AccessDenial, DailyDownloads, DownloadConfig, DownloadLink,
    DownloadLinkHandler, DownloadLinkManager, InMemoryLinkStore, LinkAccess, LinkAnalytics,
    LinkCleanup, LinkRepository, LinkStatus,
};
pub use email::{
    DefaultEmailTransport, EmailConfig, EmailHandler, EmailMessage, EmailProviderConfig,
    EmailProviderKind, EmailRateLimiter, EmailTransport, RateLimiterStats, RateLimits,
};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{
    retryable_http_status, retryable_transport_message, LinkError, SecretError, StorageError,
    StorageErrorKind, TransportError,
};
pub use handler::{ConnectionTest, DeliveryHandler, ValidationReport};
pub use secrets::{
    ActiveSecret, ByosConfig, CleanupSummary, CreateSecretOptions, CreatedSecret, EncryptedSecret,
    InMemorySecretStore, SecretCipher, SecretManager, SecretRepository, SignatureAlgorithm,
    WebhookSecret,
};
pub use sftp::{
    PoolKey, PoolStats, SftpAuth, SftpConfig, SftpHandler, SftpPool, SftpPoolConfig, SftpSession,
    SftpSessionFactory,
};
pub use signing::{
    canonical_json, canonicalize, classify_secret_strength, generate_secret, idempotency_key,
    now_rfc3339, sign_payload, validate_secret_format, verify_signature, SecretStrength,
    SignatureCheck, SignatureRejection, DEFAULT_TOLERANCE, SECRET_MAX_LEN, SECRET_MIN_LEN,
};
pub use storage::{
    resolve_storage_key, validate_azure_config, validate_gcs_config, validate_local_config,
    validate_s3_config, AzureProviderConfig, GcsProviderConfig, LocalProviderConfig, ProviderConfig,
    ProviderFactory, ProviderKind, ProviderRegistry, S3ProviderConfig, StorageConfig,
    StorageHandler, StorageObject, StorageProvider,
};
pub use storage_azure::AzureBlobProvider;
pub use storage_gcs::GcsProvider;
pub use storage_local::LocalProvider;
pub use types::{
    DeliveryId, DeliveryPayload, DeliveryResult, DestinationConfig, DestinationId, LinkId,
    OrganizationId, PayloadType, Transport,
};
pub use webhook::{
    WebhookConfig, WebhookHandler, DELIVERY_ID_HEADER, IDEMPOTENCY_HEADER, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};

#[cfg(feature = "sftp")]
pub use sftp::Ssh2SessionFactory;

#[cfg(feature = "s3")]
pub use storage_s3::S3Provider;
