use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::{StorageError, StorageErrorKind};
use crate::handler::ValidationReport;
use crate::storage::{validate_local_config, LocalProviderConfig, StorageObject, StorageProvider};

/// Metadata sidecar suffix. Sidecars are excluded from listings.
const META_SUFFIX: &str = ".meta.json";

/// Local-filesystem provider rooted at a configured directory.
pub struct LocalProvider {
    config: LocalProviderConfig,
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        let root = PathBuf::from(&config.root);
        Self { config, root }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.split('/').any(|segment| segment == "..") {
            return Err(StorageError::other(format!(
                "storage key {key:?} contains traversal segments"
            )));
        }
        Ok(self.root.join(key))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    fn map_io(err: std::io::Error, context: &str) -> StorageError {
        use std::io::ErrorKind;
        let message = format!("{context}: {err}");
        match err.kind() {
            ErrorKind::NotFound => StorageError::not_found(message),
            ErrorKind::PermissionDenied => {
                StorageError::authentication(message).with_retryable(false)
            }
            ErrorKind::StorageFull => StorageError::quota(message),
            ErrorKind::TimedOut | ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => {
                StorageError::network(message)
            }
            _ => StorageError::new(StorageErrorKind::Other, message),
        }
    }

    async fn walk(&self, dir: PathBuf, out: &mut Vec<PathBuf>) -> Result<(), StorageError> {
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::map_io(err, "list")),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| Self::map_io(err, "list"))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| Self::map_io(err, "list"))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if !path.to_string_lossy().ends_with(META_SUFFIX) {
                    out.push(path);
                }
            }
        }
        Ok(())
    }

    fn relative_key(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn validate_config(&self) -> ValidationReport {
        validate_local_config(&self.config)
    }

    async fn test_connection(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| Self::map_io(err, "create storage root"))?;
        let probe = self.root.join(".probe");
        tokio::fs::write(&probe, b"probe")
            .await
            .map_err(|err| Self::map_io(err, "write probe"))?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|err| Self::map_io(err, "remove probe"))?;
        Ok(())
    }

    async fn upload(
        &self,
        key: &str,
        data: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<StorageObject, StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Self::map_io(err, "create parent directories"))?;
        }

        tokio::fs::write(&path, data)
            .await
            .map_err(|err| Self::map_io(err, "write object"))?;

        let sidecar = serde_json::to_vec_pretty(metadata)
            .map_err(|err| StorageError::other(format!("encode metadata: {err}")))?;
        tokio::fs::write(Self::meta_path(&path), sidecar)
            .await
            .map_err(|err| Self::map_io(err, "write metadata"))?;

        let etag = hex::encode(Sha256::digest(data));
        Ok(StorageObject {
            key: key.to_string(),
            size: data.len() as u64,
            etag: Some(etag),
            metadata: metadata.clone(),
            last_modified: Some(OffsetDateTime::now_utc()),
        })
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|err| Self::map_io(err, "read object"))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| Self::map_io(err, "delete object"))?;
        // Sidecar may be absent for objects written by other tools.
        let _ = tokio::fs::remove_file(Self::meta_path(&path)).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Self::map_io(err, "stat object")),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let mut paths = Vec::new();
        self.walk(self.root.clone(), &mut paths).await?;

        let mut objects = Vec::new();
        for path in paths {
            let key = self.relative_key(&path);
            if !key.starts_with(prefix) {
                continue;
            }
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|err| Self::map_io(err, "stat object"))?;
            let last_modified = meta
                .modified()
                .ok()
                .map(OffsetDateTime::from);
            objects.push(StorageObject {
                key,
                size: meta.len(),
                etag: None,
                metadata: HashMap::new(),
                last_modified,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
