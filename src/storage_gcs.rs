use std::collections::HashMap;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::handler::ValidationReport;
use crate::storage::{validate_gcs_config, GcsProviderConfig, StorageObject, StorageProvider};

/// Google Cloud Storage provider speaking the JSON API with bearer-token
/// auth. Token acquisition (service-account exchange, metadata server) is
/// the caller's concern.
pub struct GcsProvider {
    config: GcsProviderConfig,
    client: reqwest::Client,
}

impl GcsProvider {
    pub fn new(config: GcsProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => "https://storage.googleapis.com".to_string(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint(),
            self.config.bucket,
            utf8_percent_encode(key, NON_ALPHANUMERIC),
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(self.config.access_token.trim())
    }

    async fn check_status(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(response)
        } else {
            Err(StorageError::from_http_status(status, context))
        }
    }

    fn object_from_json(value: &serde_json::Value) -> StorageObject {
        let key = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let size = value
            .get("size")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let etag = value
            .get("etag")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string());
        let last_modified = value
            .get("updated")
            .and_then(|v| v.as_str())
            .and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok());
        let metadata = value
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        StorageObject {
            key,
            size,
            etag,
            metadata,
            last_modified,
        }
    }
}

#[async_trait]
impl StorageProvider for GcsProvider {
    fn name(&self) -> &str {
        "gcp"
    }

    fn validate_config(&self) -> ValidationReport {
        validate_gcs_config(&self.config)
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        let url = format!(
            "{}/storage/v1/b/{}",
            self.endpoint(),
            self.config.bucket
        );
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs test connection"))?;
        Self::check_status(response, "gcs test connection").await?;
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint(),
            self.config.bucket,
            utf8_percent_encode(key, NON_ALPHANUMERIC),
        );

        let response = self
            .authorized(self.client.post(&url))
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs upload"))?;
        let response = Self::check_status(response, "gcs upload").await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs upload"))?;

        // Media uploads cannot carry custom metadata; patch it on after.
        if !metadata.is_empty() {
            let patch = serde_json::json!({ "metadata": metadata });
            let response = self
                .authorized(self.client.patch(self.object_url(key)))
                .json(&patch)
                .send()
                .await
                .map_err(|err| StorageError::from_reqwest(&err, "gcs metadata patch"))?;
            Self::check_status(response, "gcs metadata patch").await?;
        }

        let mut object = Self::object_from_json(&body);
        if object.key.is_empty() {
            object.key = key.to_string();
        }
        object.size = data.len() as u64;
        object.metadata = metadata.clone();
        Ok(object)
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}?alt=media", self.object_url(key));
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs download"))?;
        let response = Self::check_status(response, "gcs download").await?;
        let body = response
            .bytes()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs download"))?;
        Ok(body.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .authorized(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs delete"))?;
        Self::check_status(response, "gcs delete").await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let response = self
            .authorized(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs exists"))?;
        match response.status().as_u16() {
            status if (200..300).contains(&status) => Ok(true),
            404 => Ok(false),
            status => Err(StorageError::from_http_status(status, "gcs exists")),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let url = format!(
            "{}/storage/v1/b/{}/o?prefix={}",
            self.endpoint(),
            self.config.bucket,
            utf8_percent_encode(prefix, NON_ALPHANUMERIC),
        );
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs list"))?;
        let response = Self::check_status(response, "gcs list").await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "gcs list"))?;

        let items = body
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().map(Self::object_from_json).collect())
    }
}
