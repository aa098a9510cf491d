use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ServerSideEncryption, StorageClass};
use aws_sdk_s3::Client;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

use crate::error::{StorageError, StorageErrorKind};
use crate::handler::ValidationReport;
use crate::storage::{validate_s3_config, S3ProviderConfig, StorageObject, StorageProvider};

/// S3 provider backed by the AWS SDK. Credentials come from the default
/// provider chain (environment, profile, IMDS).
pub struct S3Provider {
    config: S3ProviderConfig,
    client: OnceCell<Client>,
}

impl S3Provider {
    pub fn new(config: S3ProviderConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(self.config.region.clone()));
                if let Some(endpoint) = &self.config.endpoint {
                    loader = loader.endpoint_url(endpoint);
                }
                let shared = loader.load().await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if self.config.force_path_style {
                    builder = builder.force_path_style(true);
                }
                Client::from_conf(builder.build())
            })
            .await
    }

    fn map_sdk_error<E, R>(err: SdkError<E, R>, context: &str) -> StorageError
    where
        E: std::fmt::Debug,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                StorageError::network(format!("{context}: {err:?}"))
            }
            SdkError::ServiceError(_) => {
                let message = format!("{context}: {err:?}");
                let lowered = message.to_ascii_lowercase();
                if lowered.contains("nosuchkey") || lowered.contains("notfound") {
                    StorageError::not_found(message)
                } else if lowered.contains("accessdenied")
                    || lowered.contains("invalidaccesskey")
                    || lowered.contains("signaturedoesnotmatch")
                {
                    StorageError::authentication(message)
                } else if lowered.contains("slowdown") || lowered.contains("throttl") {
                    StorageError::network(message)
                } else if lowered.contains("quotaexceeded") {
                    StorageError::quota(message)
                } else {
                    StorageError::new(StorageErrorKind::Other, message)
                }
            }
            _ => StorageError::other(format!("{context}: {err:?}")),
        }
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        "s3"
    }

    fn validate_config(&self) -> ValidationReport {
        validate_s3_config(&self.config)
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        self.client()
            .await
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, "s3 test connection"))?;
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError> {
        let mut request = self
            .client()
            .await
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .content_type("application/octet-stream");

        for (name, value) in metadata {
            request = request.metadata(name, value);
        }
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(sse) = &self.config.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::from(sse.as_str()));
        }

        let output = request
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, "s3 upload"))?;

        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            etag: output.e_tag().map(|tag| tag.trim_matches('"').to_string()),
            metadata: metadata.clone(),
            last_modified: Some(OffsetDateTime::now_utc()),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client()
            .await
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, "s3 download"))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::network(format!("s3 download: {err}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client()
            .await
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(err, "s3 delete"))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let result = self
            .client()
            .await
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let mapped = Self::map_sdk_error(err, "s3 exists");
                if mapped.kind == StorageErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client()
                .await
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|err| Self::map_sdk_error(err, "s3 list"))?;

            for item in output.contents() {
                objects.push(StorageObject {
                    key: item.key().unwrap_or_default().to_string(),
                    size: item.size().unwrap_or(0).max(0) as u64,
                    etag: item.e_tag().map(|tag| tag.trim_matches('"').to_string()),
                    metadata: HashMap::new(),
                    last_modified: None,
                });
            }

            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }
}
