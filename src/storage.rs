use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::error::{StorageError, StorageErrorKind};
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::signing::now_rfc3339;
use crate::storage_azure::AzureBlobProvider;
use crate::storage_gcs::GcsProvider;
use crate::storage_local::LocalProvider;
use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};

/// Built-in storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    S3,
    Azure,
    Gcp,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Local => "local",
        }
    }
}

/// S3 provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3ProviderConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint URL for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Server-side encryption mode (`AES256` or `aws:kms`).
    #[serde(default)]
    pub server_side_encryption: Option<String>,
}

/// Azure Blob Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureProviderConfig {
    pub account: String,
    pub container: String,
    /// Base64-encoded shared account key.
    pub account_key: String,
    #[serde(default)]
    pub access_tier: Option<String>,
    /// Endpoint override for Azurite or sovereign clouds.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Google Cloud Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsProviderConfig {
    pub bucket: String,
    #[serde(default)]
    pub project: Option<String>,
    /// OAuth2 bearer token for the JSON API.
    pub access_token: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Local-filesystem provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    pub root: String,
}

/// Provider selection plus provider-specific settings, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    S3(S3ProviderConfig),
    Azure(AzureProviderConfig),
    Gcp(GcsProviderConfig),
    Local(LocalProviderConfig),
    /// A runtime-registered backend.
    Custom {
        name: String,
        #[serde(default)]
        settings: serde_json::Value,
    },
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::S3(_) => "s3",
            ProviderConfig::Azure(_) => "azure",
            ProviderConfig::Gcp(_) => "gcp",
            ProviderConfig::Local(_) => "local",
            ProviderConfig::Custom { name, .. } => name,
        }
    }
}

/// Storage destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub provider: ProviderConfig,

    /// Object key template. Placeholders: `{organizationId}`,
    /// `{deliveryId}`, `{type}`, `{year}`, `{month}`, `{day}`,
    /// `{timestamp}`.
    #[serde(default = "default_path_template")]
    pub path_template: String,

    /// Advisory retention in days, attached as object metadata.
    #[serde(default)]
    pub retention_days: Option<u32>,

    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_path_template() -> String {
    "{organizationId}/{type}/{year}/{month}/{deliveryId}".to_string()
}

/// A blob in a backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub last_modified: Option<OffsetDateTime>,
}

/// Common interface implemented per backend.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Provider name, for diagnostics.
    fn name(&self) -> &str;

    /// Validates the provider's own configuration shape.
    fn validate_config(&self) -> ValidationReport;

    /// Minimal reachability probe.
    async fn test_connection(&self) -> Result<(), StorageError>;

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError>;
}

/// Constructor for a provider instance from its configuration.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn StorageProvider>, StorageError> + Send + Sync>;

/// Open provider registry: built-in backends keyed by [`ProviderKind`],
/// custom backends registered by name at runtime.
pub struct ProviderRegistry {
    builtin: HashMap<ProviderKind, ProviderFactory>,
    custom: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Registry with all compiled-in backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            builtin: HashMap::new(),
            custom: HashMap::new(),
        };

        registry.register(
            ProviderKind::Local,
            Arc::new(|config| match config {
                ProviderConfig::Local(cfg) => {
                    Ok(Arc::new(LocalProvider::new(cfg.clone())) as Arc<dyn StorageProvider>)
                }
                _ => Err(StorageError::other("expected local provider config")),
            }),
        );

        registry.register(
            ProviderKind::Azure,
            Arc::new(|config| match config {
                ProviderConfig::Azure(cfg) => {
                    Ok(Arc::new(AzureBlobProvider::new(cfg.clone())?) as Arc<dyn StorageProvider>)
                }
                _ => Err(StorageError::other("expected azure provider config")),
            }),
        );

        registry.register(
            ProviderKind::Gcp,
            Arc::new(|config| match config {
                ProviderConfig::Gcp(cfg) => {
                    Ok(Arc::new(GcsProvider::new(cfg.clone())) as Arc<dyn StorageProvider>)
                }
                _ => Err(StorageError::other("expected gcp provider config")),
            }),
        );

        #[cfg(feature = "s3")]
        registry.register(
            ProviderKind::S3,
            Arc::new(|config| match config {
                ProviderConfig::S3(cfg) => Ok(Arc::new(crate::storage_s3::S3Provider::new(
                    cfg.clone(),
                )) as Arc<dyn StorageProvider>),
                _ => Err(StorageError::other("expected s3 provider config")),
            }),
        );

        registry
    }

    pub fn register(&mut self, kind: ProviderKind, factory: ProviderFactory) {
        self.builtin.insert(kind, factory);
    }

    /// Register a backend under a caller-chosen name.
    pub fn register_custom(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        self.custom.insert(name.into(), factory);
    }

    /// Build a provider instance for the given configuration.
    pub fn resolve(&self, config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>, StorageError> {
        let factory = match config {
            ProviderConfig::S3(_) => self.builtin.get(&ProviderKind::S3),
            ProviderConfig::Azure(_) => self.builtin.get(&ProviderKind::Azure),
            ProviderConfig::Gcp(_) => self.builtin.get(&ProviderKind::Gcp),
            ProviderConfig::Local(_) => self.builtin.get(&ProviderKind::Local),
            ProviderConfig::Custom { name, .. } => self.custom.get(name),
        };

        match factory {
            Some(factory) => factory(config),
            None => Err(StorageError::new(
                StorageErrorKind::Other,
                format!("no storage provider registered for {:?}", config.name()),
            )),
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Resolve an object key from a path template and payload fields.
///
/// Rejects traversal segments and unresolved placeholders; a leading
/// slash is stripped so keys are always bucket-relative.
pub fn resolve_storage_key(
    template: &str,
    payload: &DeliveryPayload,
    now: OffsetDateTime,
) -> Result<String, String> {
    let resolved = template
        .replace("{organizationId}", &payload.organization_id.0)
        .replace("{deliveryId}", &payload.delivery_id.0)
        .replace("{type}", payload.payload_type.as_str())
        .replace("{year}", &now.year().to_string())
        .replace("{month}", &format!("{:02}", u8::from(now.month())))
        .replace("{day}", &format!("{:02}", now.day()))
        .replace("{timestamp}", &now.unix_timestamp().to_string());

    if resolved.contains('{') || resolved.contains('}') {
        return Err(format!("unresolved placeholder in path template {template:?}"));
    }
    if resolved.split('/').any(|segment| segment == "..") {
        return Err("path template must not contain '..' segments".to_string());
    }

    let key = resolved.trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err("resolved storage key is empty".to_string());
    }
    Ok(key)
}

/// Field validation for S3 settings. Pure; usable without the `s3`
/// feature compiled in.
pub fn validate_s3_config(cfg: &S3ProviderConfig) -> ValidationReport {
    let mut report = ValidationReport::ok();

    let bucket = cfg.bucket.as_str();
    if bucket.len() < 3 || bucket.len() > 63 {
        report.error("s3 bucket name must be 3-63 characters");
    } else {
        let valid_chars = bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        let valid_edges = bucket.starts_with(|c: char| c.is_ascii_alphanumeric())
            && bucket.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid_chars || !valid_edges {
            report.error(format!("invalid s3 bucket name {bucket:?}"));
        }
    }

    if cfg.region.trim().is_empty() {
        report.error("s3 region is required");
    }

    if let Some(class) = &cfg.storage_class {
        const CLASSES: &[&str] = &[
            "STANDARD",
            "REDUCED_REDUNDANCY",
            "STANDARD_IA",
            "ONEZONE_IA",
            "INTELLIGENT_TIERING",
            "GLACIER",
            "GLACIER_IR",
            "DEEP_ARCHIVE",
        ];
        if !CLASSES.contains(&class.as_str()) {
            report.error(format!("unknown s3 storage class {class:?}"));
        }
    }

    if let Some(sse) = &cfg.server_side_encryption {
        if sse != "AES256" && sse != "aws:kms" {
            report.error(format!("unknown s3 server-side encryption mode {sse:?}"));
        }
    }

    #[cfg(not(feature = "s3"))]
    report.warning("s3 support is not compiled in; delivery will fail");

    report
}

/// Field validation for Azure Blob settings.
pub fn validate_azure_config(cfg: &AzureProviderConfig) -> ValidationReport {
    let mut report = ValidationReport::ok();

    let account = cfg.account.as_str();
    if account.len() < 3
        || account.len() > 24
        || !account
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        report.error(format!("invalid azure storage account name {account:?}"));
    }

    let container = cfg.container.as_str();
    if container.len() < 3
        || container.len() > 63
        || !container
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || container.starts_with('-')
        || container.ends_with('-')
    {
        report.error(format!("invalid azure container name {container:?}"));
    }

    if cfg.account_key.trim().is_empty() {
        report.error("azure account key is required");
    } else {
        use base64::Engine;
        if base64::engine::general_purpose::STANDARD
            .decode(cfg.account_key.trim())
            .is_err()
        {
            report.error("azure account key must be valid base64");
        }
    }

    if let Some(tier) = &cfg.access_tier {
        if !matches!(tier.to_ascii_lowercase().as_str(), "hot" | "cool" | "archive") {
            report.error(format!("unknown azure access tier {tier:?}"));
        }
    }

    report
}

/// Field validation for GCS settings.
pub fn validate_gcs_config(cfg: &GcsProviderConfig) -> ValidationReport {
    let mut report = ValidationReport::ok();

    let bucket = cfg.bucket.as_str();
    if bucket.len() < 3
        || bucket.len() > 222
        || !bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    {
        report.error(format!("invalid gcs bucket name {bucket:?}"));
    }

    if cfg.access_token.trim().is_empty() {
        report.error("gcs access token is required");
    }

    if let Some(project) = &cfg.project {
        if project.trim().is_empty() {
            report.error("gcs project must not be empty when set");
        }
    }

    report
}

/// Field validation for local-filesystem settings.
pub fn validate_local_config(cfg: &LocalProviderConfig) -> ValidationReport {
    let mut report = ValidationReport::ok();
    if cfg.root.trim().is_empty() {
        report.error("local storage root is required");
    }
    if cfg.root.split('/').any(|segment| segment == "..") {
        report.error("local storage root must not contain '..' segments");
    }
    report
}

/// Transport-agnostic storage handler: resolves a key from the path
/// template, converts the payload to bytes, attaches delivery metadata,
/// and delegates to the registered provider.
pub struct StorageHandler {
    registry: Arc<ProviderRegistry>,
}

impl StorageHandler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    fn storage_config<'a>(&self, config: &'a DestinationConfig) -> Option<&'a StorageConfig> {
        match config {
            DestinationConfig::Storage(cfg) => Some(cfg),
            _ => None,
        }
    }

    fn validate_storage(&self, cfg: &StorageConfig) -> ValidationReport {
        let mut report = ValidationReport::ok();

        if cfg.path_template.trim().is_empty() {
            report.error("path template is required");
        }
        if cfg.path_template.split('/').any(|segment| segment == "..") {
            report.error("path template must not contain '..' segments");
        }
        if let Some(days) = cfg.retention_days {
            if days == 0 {
                report.warning("retention of 0 days means objects are immediately eligible for cleanup");
            }
            if days > 3650 {
                report.error("retention_days must be at most 3650");
            }
        }

        match &cfg.provider {
            ProviderConfig::S3(s3) => report.merge(validate_s3_config(s3)),
            ProviderConfig::Azure(azure) => report.merge(validate_azure_config(azure)),
            ProviderConfig::Gcp(gcs) => report.merge(validate_gcs_config(gcs)),
            ProviderConfig::Local(local) => report.merge(validate_local_config(local)),
            ProviderConfig::Custom { .. } => match self.registry.resolve(&cfg.provider) {
                Ok(provider) => report.merge(provider.validate_config()),
                Err(err) => report.error(err.message),
            },
        }

        report
    }

    fn payload_bytes(payload: &DeliveryPayload) -> Result<Vec<u8>, String> {
        match &payload.data {
            serde_json::Value::String(raw) => Ok(raw.clone().into_bytes()),
            other => serde_json::to_vec(other).map_err(|err| err.to_string()),
        }
    }

    fn delivery_metadata(payload: &DeliveryPayload, cfg: &StorageConfig) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("delivery_id".to_string(), payload.delivery_id.0.clone());
        metadata.insert(
            "organization_id".to_string(),
            payload.organization_id.0.clone(),
        );
        metadata.insert("type".to_string(), payload.payload_type.as_str().to_string());
        metadata.insert("uploaded_at".to_string(), now_rfc3339());
        if let Some(correlation_id) = &payload.correlation_id {
            metadata.insert("correlation_id".to_string(), correlation_id.clone());
        }
        if let Some(key) = &payload.idempotency_key {
            metadata.insert("idempotency_key".to_string(), key.clone());
        }
        if let Some(days) = cfg.retention_days {
            metadata.insert("retention_days".to_string(), days.to_string());
        }
        for (key, value) in &payload.metadata {
            metadata.insert(format!("user_{key}"), value.clone());
        }
        metadata
    }
}

#[async_trait]
impl DeliveryHandler for StorageHandler {
    fn transport(&self) -> Transport {
        Transport::Storage
    }

    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        match self.storage_config(config) {
            Some(cfg) => self.validate_storage(cfg),
            None => ValidationReport::wrong_transport(Transport::Storage),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        let started = Instant::now();
        let report = self.validate_config(config);
        if !report.is_valid {
            return ConnectionTest::failed(report.errors.join("; "), 0);
        }
        // Unwrap is safe: validation rejected non-storage configs above.
        let cfg = match self.storage_config(config) {
            Some(cfg) => cfg,
            None => return ConnectionTest::failed("expected storage configuration", 0),
        };

        let provider = match self.registry.resolve(&cfg.provider) {
            Ok(provider) => provider,
            Err(err) => {
                return ConnectionTest::failed(err.message, elapsed_ms(started));
            }
        };

        match provider.test_connection().await {
            Ok(()) => ConnectionTest::ok(elapsed_ms(started))
                .with_details(json!({ "provider": provider.name() })),
            Err(err) => {
                let mut test = ConnectionTest::failed(err.message.clone(), elapsed_ms(started));
                if let Some(status) = err.status_code {
                    test = test.with_status(status);
                }
                test
            }
        }
    }

    async fn deliver(
        &self,
        payload: &DeliveryPayload,
        config: &DestinationConfig,
    ) -> DeliveryResult {
        let report = self.validate_config(config);
        if !report.is_valid {
            return DeliveryResult::config_failure(&report.errors);
        }
        let cfg = match self.storage_config(config) {
            Some(cfg) => cfg,
            None => return DeliveryResult::config_failure(&["expected storage configuration".into()]),
        };

        let started = Instant::now();

        let key = match resolve_storage_key(&cfg.path_template, payload, OffsetDateTime::now_utc())
        {
            Ok(key) => key,
            Err(err) => return DeliveryResult::failed(err, false, elapsed_ms(started)),
        };

        let bytes = match Self::payload_bytes(payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                return DeliveryResult::failed(
                    format!("payload serialization failed: {err}"),
                    false,
                    elapsed_ms(started),
                )
            }
        };

        let provider = match self.registry.resolve(&cfg.provider) {
            Ok(provider) => provider,
            Err(err) => {
                return DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started))
            }
        };

        let metadata = Self::delivery_metadata(payload, cfg);

        match provider.upload(&key, &bytes, &metadata).await {
            Ok(object) => {
                let reference = object.etag.unwrap_or(object.key);
                DeliveryResult::delivered(elapsed_ms(started), Some(reference))
            }
            Err(err) => DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started)),
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(feature, "metadata" | "retention" | "custom_providers" | "key_templating")
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "title": "Storage delivery configuration",
            "required": ["provider"],
            "properties": {
                "provider": {
                    "type": "string",
                    "enum": ["s3", "azure", "gcp", "local"],
                    "description": "Storage backend; custom providers may be registered at runtime"
                },
                "path_template": {
                    "type": "string",
                    "default": default_path_template(),
                    "description": "Object key template; {organizationId}, {deliveryId}, {type}, {year}, {month}, {day}, {timestamp}"
                },
                "retention_days": { "type": "integer", "minimum": 0, "maximum": 3650 },
                "content_type": { "type": "string" },
                "bucket": { "type": "string" },
                "region": { "type": "string" },
                "account": { "type": "string" },
                "container": { "type": "string" },
                "root": { "type": "string" }
            }
        })
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
