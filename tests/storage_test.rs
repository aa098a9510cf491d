use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use delivery_engine::{
    resolve_storage_key, validate_azure_config, validate_s3_config, AzureProviderConfig,
    DeliveryHandler, DeliveryPayload, DestinationConfig, LocalProvider, LocalProviderConfig,
    PayloadType, ProviderConfig, ProviderKind, ProviderRegistry, S3ProviderConfig, StorageConfig,
    StorageError, StorageHandler, StorageObject, StorageProvider, Transport, ValidationReport,
};
use serde_json::json;
use time::macros::datetime;

fn payload() -> DeliveryPayload {
    DeliveryPayload::new(
        "dlv_1",
        "org_1",
        PayloadType::Report,
        json!({ "rows": [1, 2, 3] }),
    )
    .with_metadata("source", "unit")
    .with_correlation_id("corr_9")
}

fn local_config(root: &std::path::Path) -> DestinationConfig {
    DestinationConfig::Storage(StorageConfig {
        provider: ProviderConfig::Local(LocalProviderConfig {
            root: root.display().to_string(),
        }),
        path_template: "{organizationId}/{type}/{deliveryId}.json".to_string(),
        retention_days: Some(30),
        content_type: None,
    })
}

#[test]
fn key_template_resolution() {
    let now = datetime!(2026-03-05 10:00 UTC);
    let key = resolve_storage_key(
        "{organizationId}/{type}/{year}/{month}/{day}/{deliveryId}",
        &payload(),
        now,
    )
    .unwrap();
    assert_eq!(key, "org_1/report/2026/03/05/dlv_1");

    // Leading slash is stripped; keys are always relative.
    let key = resolve_storage_key("/{organizationId}/{deliveryId}", &payload(), now).unwrap();
    assert_eq!(key, "org_1/dlv_1");

    assert!(resolve_storage_key("{unknown}/{deliveryId}", &payload(), now).is_err());
    assert!(resolve_storage_key("../{deliveryId}", &payload(), now).is_err());
}

#[test]
fn s3_config_validation() {
    let mut cfg = S3ProviderConfig {
        bucket: "my-delivery-bucket".to_string(),
        region: "eu-west-1".to_string(),
        endpoint: None,
        force_path_style: false,
        storage_class: Some("STANDARD_IA".to_string()),
        server_side_encryption: Some("AES256".to_string()),
    };
    assert!(validate_s3_config(&cfg).is_valid);

    cfg.bucket = "UPPERCASE".to_string();
    assert!(!validate_s3_config(&cfg).is_valid);

    cfg.bucket = "ok-bucket".to_string();
    cfg.storage_class = Some("FROZEN".to_string());
    assert!(!validate_s3_config(&cfg).is_valid);
}

#[test]
fn azure_config_validation() {
    let mut cfg = AzureProviderConfig {
        account: "deliveries".to_string(),
        container: "reports".to_string(),
        account_key: base64_key(),
        access_tier: Some("cool".to_string()),
        endpoint: None,
    };
    assert!(validate_azure_config(&cfg).is_valid);

    cfg.access_tier = Some("lukewarm".to_string());
    assert!(!validate_azure_config(&cfg).is_valid);

    cfg.access_tier = None;
    cfg.account = "Not-Valid".to_string();
    assert!(!validate_azure_config(&cfg).is_valid);
}

fn base64_key() -> String {
    // 32 zero bytes.
    "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()
}

#[tokio::test]
async fn local_provider_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let provider = LocalProvider::new(LocalProviderConfig {
        root: dir.path().display().to_string(),
    });

    provider.test_connection().await.unwrap();

    let mut metadata = HashMap::new();
    metadata.insert("delivery_id".to_string(), "dlv_1".to_string());
    let object = provider
        .upload("org_1/report/dlv_1.json", b"{\"ok\":true}", &metadata)
        .await
        .unwrap();
    assert_eq!(object.size, 11);
    assert!(object.etag.is_some());

    assert!(provider.exists("org_1/report/dlv_1.json").await.unwrap());
    let bytes = provider.download("org_1/report/dlv_1.json").await.unwrap();
    assert_eq!(bytes, b"{\"ok\":true}");

    // Listings exclude metadata sidecars.
    let listed = provider.list("org_1/").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "org_1/report/dlv_1.json");

    provider.delete("org_1/report/dlv_1.json").await.unwrap();
    assert!(!provider.exists("org_1/report/dlv_1.json").await.unwrap());
}

#[tokio::test]
async fn local_provider_rejects_traversal_keys() {
    let dir = tempfile::tempdir().unwrap();
    let provider = LocalProvider::new(LocalProviderConfig {
        root: dir.path().display().to_string(),
    });
    assert!(provider
        .upload("../escape.json", b"x", &HashMap::new())
        .await
        .is_err());
}

#[tokio::test]
async fn handler_delivers_through_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let handler = StorageHandler::new(Arc::new(ProviderRegistry::with_builtins()));
    let config = local_config(dir.path());

    assert_eq!(handler.transport(), Transport::Storage);
    assert!(handler.validate_config(&config).is_valid);

    let result = handler.deliver(&payload(), &config).await;
    assert!(result.success, "error: {:?}", result.error);
    assert!(result.cross_system_reference.is_some());

    // The object landed under the resolved key.
    let written = dir.path().join("org_1/report/dlv_1.json");
    assert!(written.is_file());

    // Delivery metadata went into the sidecar, caller metadata prefixed.
    let sidecar = std::fs::read_to_string(dir.path().join("org_1/report/dlv_1.json.meta.json"))
        .unwrap();
    let meta: HashMap<String, String> = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(meta.get("delivery_id").unwrap(), "dlv_1");
    assert_eq!(meta.get("retention_days").unwrap(), "30");
    assert_eq!(meta.get("user_source").unwrap(), "unit");
    assert_eq!(meta.get("correlation_id").unwrap(), "corr_9");
}

#[tokio::test]
async fn handler_fails_fast_on_invalid_config() {
    let handler = StorageHandler::new(Arc::new(ProviderRegistry::with_builtins()));
    let config = DestinationConfig::Storage(StorageConfig {
        provider: ProviderConfig::Local(LocalProviderConfig {
            root: "/tmp/whatever".to_string(),
        }),
        path_template: "../{deliveryId}".to_string(),
        retention_days: None,
        content_type: None,
    });

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
async fn handler_rejects_configs_for_other_transports() {
    let handler = StorageHandler::new(Arc::new(ProviderRegistry::with_builtins()));
    let config = DestinationConfig::Download(delivery_engine::DownloadConfig {
        base_url: "https://example.com".to_string(),
        expiry_hours: 24,
        max_access: None,
        object_type: None,
    });
    assert!(!handler.validate_config(&config).is_valid);
}

struct NullProvider;

#[async_trait]
impl StorageProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    fn validate_config(&self) -> ValidationReport {
        ValidationReport::ok()
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        _metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError> {
        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            etag: Some("null-etag".to_string()),
            metadata: HashMap::new(),
            last_modified: None,
        })
    }

    async fn download(&self, _key: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::not_found("null provider holds nothing"))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn custom_providers_resolve_by_name() {
    let mut registry = ProviderRegistry::with_builtins();
    registry.register_custom(
        "null",
        Arc::new(|_config: &ProviderConfig| -> Result<Arc<dyn StorageProvider>, StorageError> {
            Ok(Arc::new(NullProvider))
        }),
    );
    let handler = StorageHandler::new(Arc::new(registry));

    let config = DestinationConfig::Storage(StorageConfig {
        provider: ProviderConfig::Custom {
            name: "null".to_string(),
            settings: json!({}),
        },
        path_template: "{deliveryId}".to_string(),
        retention_days: None,
        content_type: None,
    });

    let result = handler.deliver(&payload(), &config).await;
    assert!(result.success);
    assert_eq!(result.cross_system_reference.as_deref(), Some("null-etag"));

    // An unregistered name fails at resolution, not with a panic.
    let unknown = DestinationConfig::Storage(StorageConfig {
        provider: ProviderConfig::Custom {
            name: "missing".to_string(),
            settings: json!({}),
        },
        path_template: "{deliveryId}".to_string(),
        retention_days: None,
        content_type: None,
    });
    let result = handler.deliver(&payload(), &unknown).await;
    assert!(!result.success);
}

#[test]
fn builtin_registry_covers_compiled_backends() {
    let registry = ProviderRegistry::with_builtins();
    let local = ProviderConfig::Local(LocalProviderConfig {
        root: "/tmp/x".to_string(),
    });
    assert!(registry.resolve(&local).is_ok());
    assert_eq!(ProviderKind::Local.as_str(), "local");
}
