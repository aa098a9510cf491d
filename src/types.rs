use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::download::DownloadConfig;
use crate::email::EmailConfig;
use crate::sftp::SftpConfig;
use crate::storage::StorageConfig;
use crate::webhook::WebhookConfig;

/// Unique identifier for a delivery attempt series.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of delivery IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

/// Unique identifier for an organization (tenant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

/// Unique identifier for a configured destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId(pub String);

/// Unique identifier for an issued download link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub String);

/// What kind of content a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    Report,
    Export,
    Data,
    Custom,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Report => "report",
            PayloadType::Export => "export",
            PayloadType::Data => "data",
            PayloadType::Custom => "custom",
        }
    }
}

/// Unit of work to deliver.
///
/// The engine treats `data` as opaque JSON. Schema management is the
/// caller's responsibility. Payloads are constructed per attempt and are
/// never persisted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPayload {
    /// Logical identifier for the delivery attempt series.
    pub delivery_id: DeliveryId,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Content classification.
    pub payload_type: PayloadType,

    /// Opaque payload body.
    pub data: serde_json::Value,

    /// Caller-supplied metadata forwarded to the destination.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Optional cross-system correlation identifier.
    pub correlation_id: Option<String>,

    /// Optional caller-supplied idempotency key. When absent the webhook
    /// path derives one deterministically from the delivery id.
    pub idempotency_key: Option<String>,
}

impl DeliveryPayload {
    /// Create a new payload with empty metadata.
    pub fn new(
        delivery_id: impl Into<String>,
        organization_id: impl Into<String>,
        payload_type: PayloadType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            delivery_id: DeliveryId(delivery_id.into()),
            organization_id: OrganizationId(organization_id.into()),
            payload_type,
            data,
            metadata: HashMap::new(),
            correlation_id: None,
            idempotency_key: None,
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Canonical wire body shared by the push transports. Key order is
    /// irrelevant here; signing canonicalizes separately.
    pub fn wire_body(&self, timestamp: &str, idempotency_key: &str) -> serde_json::Value {
        serde_json::json!({
            "delivery_id": self.delivery_id.0,
            "organization_id": self.organization_id.0,
            "type": self.payload_type.as_str(),
            "data": self.data,
            "metadata": self.metadata,
            "correlation_id": self.correlation_id,
            "idempotency_key": idempotency_key,
            "timestamp": timestamp,
        })
    }
}

/// Transport discriminant for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Webhook,
    Storage,
    Sftp,
    Email,
    Download,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Webhook => "webhook",
            Transport::Storage => "storage",
            Transport::Sftp => "sftp",
            Transport::Email => "email",
            Transport::Download => "download",
        }
    }
}

/// Transport-specific destination settings.
///
/// Exactly one transport sub-config is populated per delivery; the tagged
/// representation makes an ambiguous or empty configuration unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum DestinationConfig {
    Webhook(WebhookConfig),
    Storage(StorageConfig),
    Sftp(SftpConfig),
    Email(EmailConfig),
    Download(DownloadConfig),
}

impl DestinationConfig {
    pub fn transport(&self) -> Transport {
        match self {
            DestinationConfig::Webhook(_) => Transport::Webhook,
            DestinationConfig::Storage(_) => Transport::Storage,
            DestinationConfig::Sftp(_) => Transport::Sftp,
            DestinationConfig::Email(_) => Transport::Email,
            DestinationConfig::Download(_) => Transport::Download,
        }
    }
}

/// Outcome of one delivery attempt.
///
/// Handlers always return a result object; errors never cross the handler
/// boundary, so a batch dispatcher can inspect every outcome uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Whether the transport accepted the payload.
    pub success: bool,

    /// When the destination acknowledged the delivery.
    pub delivered_at: Option<OffsetDateTime>,

    /// Wall-clock duration of the attempt in milliseconds.
    pub response_time_ms: u64,

    /// Human-readable failure description.
    pub error: Option<String>,

    /// Whether an external scheduler should re-invoke `deliver`.
    /// Meaningful only when `success` is false.
    pub retryable: bool,

    /// Transport-specific reference: request id, ETag, remote path,
    /// message id, or signed URL.
    pub cross_system_reference: Option<String>,
}

impl DeliveryResult {
    /// A successful delivery.
    pub fn delivered(response_time_ms: u64, reference: Option<String>) -> Self {
        Self {
            success: true,
            delivered_at: Some(OffsetDateTime::now_utc()),
            response_time_ms,
            error: None,
            retryable: false,
            cross_system_reference: reference,
        }
    }

    /// A failed delivery with an explicit retryability verdict.
    pub fn failed(error: impl Into<String>, retryable: bool, response_time_ms: u64) -> Self {
        Self {
            success: false,
            delivered_at: None,
            response_time_ms,
            error: Some(error.into()),
            retryable,
            cross_system_reference: None,
        }
    }

    /// A fail-fast result for invalid configuration. Always terminal.
    pub fn config_failure(errors: &[String]) -> Self {
        Self::failed(
            format!("Configuration validation failed: {}", errors.join("; ")),
            false,
            0,
        )
    }
}
