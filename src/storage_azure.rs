use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::handler::ValidationReport;
use crate::storage::{validate_azure_config, AzureProviderConfig, StorageObject, StorageProvider};

/// REST API version pinned for SharedKey signing.
const API_VERSION: &str = "2021-08-06";

/// Percent-encoding set for blob paths: segment separators stay literal.
const BLOB_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Azure Blob Storage provider speaking the REST API with SharedKey
/// request signing.
pub struct AzureBlobProvider {
    config: AzureProviderConfig,
    key: Vec<u8>,
    client: reqwest::Client,
}

impl AzureBlobProvider {
    pub fn new(config: AzureProviderConfig) -> Result<Self, StorageError> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(config.account_key.trim())
            .map_err(|_| StorageError::authentication("azure account key is not valid base64"))?;
        Ok(Self {
            config,
            key,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.config.account),
        }
    }

    fn blob_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint(),
            self.config.container,
            utf8_percent_encode(key, BLOB_PATH)
        )
    }

    fn rfc1123_now() -> String {
        let format = format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        );
        OffsetDateTime::now_utc()
            .format(&format)
            .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"))
    }

    /// SharedKey signature over the canonical request form.
    fn authorization(
        &self,
        verb: &str,
        content_length: Option<u64>,
        content_type: Option<&str>,
        ms_headers: &BTreeMap<String, String>,
        resource_path: &str,
        query: &[(&str, &str)],
    ) -> Result<String, StorageError> {
        let canonical_headers: String = ms_headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let mut canonical_resource = format!("/{}{resource_path}", self.config.account);
        let mut sorted_query: Vec<(&str, &str)> = query.to_vec();
        sorted_query.sort();
        for (name, value) in sorted_query {
            canonical_resource.push_str(&format!("\n{name}:{value}"));
        }

        let length = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        let string_to_sign = format!(
            "{verb}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n{canonical_headers}{canonical_resource}",
            content_type = content_type.unwrap_or(""),
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|_| StorageError::authentication("invalid azure account key length"))?;
        mac.update(string_to_sign.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{signature}", self.config.account))
    }

    fn base_ms_headers() -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("x-ms-date".to_string(), Self::rfc1123_now());
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        headers
    }

    fn apply_headers(
        mut request: reqwest::RequestBuilder,
        headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
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
}

#[async_trait]
impl StorageProvider for AzureBlobProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn validate_config(&self) -> ValidationReport {
        validate_azure_config(&self.config)
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        // Container properties: reversible, no payload.
        let resource = format!("/{}", self.config.container);
        let ms_headers = Self::base_ms_headers();
        let auth = self.authorization(
            "GET",
            None,
            None,
            &ms_headers,
            &resource,
            &[("restype", "container")],
        )?;

        let url = format!("{}/{}?restype=container", self.endpoint(), self.config.container);
        let request = Self::apply_headers(self.client.get(&url), &ms_headers)
            .header("Authorization", auth);
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure test connection"))?;
        Self::check_status(response, "azure test connection").await?;
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError> {
        let mut ms_headers = Self::base_ms_headers();
        ms_headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());
        if let Some(tier) = &self.config.access_tier {
            ms_headers.insert("x-ms-access-tier".to_string(), tier.clone());
        }
        for (name, value) in metadata {
            ms_headers.insert(
                format!("x-ms-meta-{}", name.replace('-', "_")),
                value.clone(),
            );
        }

        let resource = format!("/{}/{key}", self.config.container);
        let auth = self.authorization(
            "PUT",
            Some(data.len() as u64),
            Some("application/octet-stream"),
            &ms_headers,
            &resource,
            &[],
        )?;

        let request = Self::apply_headers(self.client.put(self.blob_url(key)), &ms_headers)
            .header("Authorization", auth)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec());

        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure upload"))?;
        let response = Self::check_status(response, "azure upload").await?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string());

        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            etag,
            metadata: metadata.clone(),
            last_modified: Some(OffsetDateTime::now_utc()),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let ms_headers = Self::base_ms_headers();
        let resource = format!("/{}/{key}", self.config.container);
        let auth = self.authorization("GET", None, None, &ms_headers, &resource, &[])?;

        let request = Self::apply_headers(self.client.get(self.blob_url(key)), &ms_headers)
            .header("Authorization", auth);
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure download"))?;
        let response = Self::check_status(response, "azure download").await?;
        let body = response
            .bytes()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure download"))?;
        Ok(body.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let ms_headers = Self::base_ms_headers();
        let resource = format!("/{}/{key}", self.config.container);
        let auth = self.authorization("DELETE", None, None, &ms_headers, &resource, &[])?;

        let request = Self::apply_headers(self.client.delete(self.blob_url(key)), &ms_headers)
            .header("Authorization", auth);
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure delete"))?;
        Self::check_status(response, "azure delete").await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let ms_headers = Self::base_ms_headers();
        let resource = format!("/{}/{key}", self.config.container);
        let auth = self.authorization("HEAD", None, None, &ms_headers, &resource, &[])?;

        let request = Self::apply_headers(self.client.head(self.blob_url(key)), &ms_headers)
            .header("Authorization", auth);
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure exists"))?;

        match response.status().as_u16() {
            status if (200..300).contains(&status) => Ok(true),
            404 => Ok(false),
            status => Err(StorageError::from_http_status(status, "azure exists")),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let ms_headers = Self::base_ms_headers();
        let resource = format!("/{}", self.config.container);
        let auth = self.authorization(
            "GET",
            None,
            None,
            &ms_headers,
            &resource,
            &[
                ("comp", "list"),
                ("prefix", prefix),
                ("restype", "container"),
            ],
        )?;

        let url = format!(
            "{}/{}?restype=container&comp=list&prefix={}",
            self.endpoint(),
            self.config.container,
            utf8_percent_encode(prefix, NON_ALPHANUMERIC),
        );
        let request = Self::apply_headers(self.client.get(&url), &ms_headers)
            .header("Authorization", auth);
        let response = request
            .send()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure list"))?;
        let response = Self::check_status(response, "azure list").await?;
        let body = response
            .text()
            .await
            .map_err(|err| StorageError::from_reqwest(&err, "azure list"))?;

        Ok(parse_blob_listing(&body))
    }
}

/// Extracts blob names and sizes from a container listing.
///
/// The listing schema is stable and flat enough that tag scanning beats
/// pulling in an XML parser for two fields.
fn parse_blob_listing(xml: &str) -> Vec<StorageObject> {
    let mut objects = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Name>") {
        let after = &rest[start + "<Name>".len()..];
        let Some(end) = after.find("</Name>") else {
            break;
        };
        let name = &after[..end];

        let tail = &after[end..];
        let size = tail
            .find("<Content-Length>")
            .and_then(|pos| {
                let value = &tail[pos + "<Content-Length>".len()..];
                value
                    .find("</Content-Length>")
                    .and_then(|vend| value[..vend].parse::<u64>().ok())
            })
            .unwrap_or(0);

        objects.push(StorageObject {
            key: name.to_string(),
            size,
            etag: None,
            metadata: HashMap::new(),
            last_modified: None,
        });
        rest = tail;
    }
    objects
}
