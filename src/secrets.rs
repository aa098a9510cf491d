use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::SecretError;
use crate::signing::{classify_secret_strength, generate_secret, validate_secret_format, SecretStrength};
use crate::types::DestinationId;

/// Ciphertext plus nonce for a secret encrypted at rest.
///
/// An explicit value type rather than an opaque string, so the
/// serialization format is testable independent of the cipher choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 24],
}

impl EncryptedSecret {
    /// Compact hex form: nonce followed by ciphertext.
    pub fn to_hex(&self) -> String {
        let mut combined = Vec::with_capacity(24 + self.ciphertext.len());
        combined.extend_from_slice(&self.nonce);
        combined.extend_from_slice(&self.ciphertext);
        hex::encode(combined)
    }

    pub fn from_hex(input: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(input)
            .map_err(|_| SecretError::InvalidSecret("invalid hex encoding".into()))?;
        if bytes.len() <= 24 {
            return Err(SecretError::InvalidSecret("ciphertext too short".into()));
        }
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&bytes[..24]);
        Ok(Self {
            ciphertext: bytes[24..].to_vec(),
            nonce,
        })
    }
}

/// AEAD cipher wrapping the process-level encryption key.
///
/// Encryption and decryption are pure, CPU-bound, and safe to call
/// concurrently.
pub struct SecretCipher {
    key: chacha20poly1305::Key,
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: chacha20poly1305::Key::from(key),
        }
    }

    /// AEAD encrypt with a fresh random nonce. The destination id is bound
    /// in as associated data so ciphertexts cannot be replayed across
    /// destinations.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedSecret, SecretError> {
        let cipher = XChaCha20Poly1305::new(&self.key);

        let mut nonce_bytes = [0u8; 24];
        rand_core::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| SecretError::Encrypt)?;

        Ok(EncryptedSecret {
            ciphertext,
            nonce: nonce_bytes,
        })
    }

    pub fn decrypt(
        &self,
        encrypted: &EncryptedSecret,
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let cipher = XChaCha20Poly1305::new(&self.key);
        let nonce = XNonce::from(encrypted.nonce);
        let plaintext = cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: &encrypted.ciphertext,
                    aad,
                },
            )
            .map_err(|_| SecretError::Decrypt)?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Supported signing algorithms. Only HMAC-SHA256 today; the enum keeps
/// the wire format explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    Sha256,
}

/// A signing key bound to a destination, encrypted at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSecret {
    pub id: String,
    pub destination_id: DestinationId,
    pub secret: EncryptedSecret,
    pub algorithm: SignatureAlgorithm,
    pub is_primary: bool,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub created_by: String,
    pub created_at: OffsetDateTime,
}

/// A secret decrypted on read for signing use.
#[derive(Debug, Clone)]
pub struct ActiveSecret {
    pub id: String,
    pub secret: String,
    pub algorithm: SignatureAlgorithm,
    pub is_primary: bool,
    pub expires_at: Option<OffsetDateTime>,
}

/// Persistence seam for webhook secrets. Implemented by collaborators;
/// the in-memory implementation below serves tests and lightweight
/// deployments.
#[async_trait]
pub trait SecretRepository: Send + Sync {
    async fn create(&self, secret: WebhookSecret) -> Result<(), SecretError>;
    async fn find_by_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Vec<WebhookSecret>, SecretError>;
    async fn find_active_by_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Vec<WebhookSecret>, SecretError>;
    async fn mark_inactive(&self, secret_id: &str) -> Result<(), SecretError>;
    async fn cleanup_expired(&self, now: OffsetDateTime) -> Result<u64, SecretError>;
}

/// In-memory secret store for lightweight deployments.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, WebhookSecret>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretRepository for InMemorySecretStore {
    async fn create(&self, secret: WebhookSecret) -> Result<(), SecretError> {
        self.secrets.lock().await.insert(secret.id.clone(), secret);
        Ok(())
    }

    async fn find_by_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Vec<WebhookSecret>, SecretError> {
        let guard = self.secrets.lock().await;
        let mut found: Vec<WebhookSecret> = guard
            .values()
            .filter(|s| &s.destination_id == destination_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn find_active_by_destination(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Vec<WebhookSecret>, SecretError> {
        let all = self.find_by_destination(destination_id).await?;
        Ok(all.into_iter().filter(|s| s.is_active).collect())
    }

    async fn mark_inactive(&self, secret_id: &str) -> Result<(), SecretError> {
        let mut guard = self.secrets.lock().await;
        match guard.get_mut(secret_id) {
            Some(secret) => {
                secret.is_active = false;
                secret.is_primary = false;
                Ok(())
            }
            None => Err(SecretError::Repository(format!(
                "unknown secret id {secret_id}"
            ))),
        }
    }

    async fn cleanup_expired(&self, now: OffsetDateTime) -> Result<u64, SecretError> {
        let mut guard = self.secrets.lock().await;
        let before = guard.len();
        guard.retain(|_, s| s.expires_at.map(|at| at > now).unwrap_or(true));
        Ok((before - guard.len()) as u64)
    }
}

/// Options for creating a secret.
#[derive(Debug, Clone, Default)]
pub struct CreateSecretOptions {
    /// Caller-supplied key material; generated when absent.
    pub secret: Option<String>,
    /// Whether the new secret becomes the signing primary.
    pub is_primary: bool,
    /// Validity window in days; no forced expiry when absent.
    pub expires_in_days: Option<i64>,
    pub created_by: String,
}

/// Customer-supplied key onboarding ("bring your own secret").
#[derive(Debug, Clone)]
pub struct ByosConfig {
    pub secret: String,
    /// When true the customer manages rotation and no expiry is forced.
    pub customer_managed_rotation: bool,
}

/// A freshly created secret: the persisted record plus the plaintext,
/// which is only available at creation time.
#[derive(Debug, Clone)]
pub struct CreatedSecret {
    pub record: WebhookSecret,
    pub plaintext: String,
    pub strength: SecretStrength,
}

/// Summary of a cleanup sweep. Partial failure is reported, not thrown.
#[derive(Debug, Clone, Default)]
pub struct CleanupSummary {
    pub removed: u64,
    pub errors: Vec<String>,
}

/// Default validity window for BYOS secrets when the customer does not
/// manage rotation.
const BYOS_DEFAULT_VALIDITY_DAYS: i64 = 90;

/// Lifecycle manager layering rotation, BYOS onboarding and
/// encryption-at-rest over the signing primitives.
pub struct SecretManager {
    cipher: SecretCipher,
    repository: Arc<dyn SecretRepository>,
}

impl SecretManager {
    /// `encryption_key` is a process-level configuration value injected at
    /// construction.
    pub fn new(encryption_key: [u8; 32], repository: Arc<dyn SecretRepository>) -> Self {
        Self {
            cipher: SecretCipher::new(encryption_key),
            repository,
        }
    }

    /// Create a secret for a destination.
    ///
    /// When `is_primary` is requested, any existing active primary is
    /// first marked inactive. It is never deleted, so in-flight requests
    /// signed with the old key remain verifiable until it is purged.
    pub async fn create_secret(
        &self,
        destination_id: &DestinationId,
        opts: CreateSecretOptions,
    ) -> Result<CreatedSecret, SecretError> {
        let plaintext = match opts.secret {
            Some(provided) => {
                validate_secret_format(&provided).map_err(SecretError::InvalidSecret)?;
                provided
            }
            None => generate_secret(32),
        };
        let strength = classify_secret_strength(&plaintext);

        if opts.is_primary {
            self.demote_primary(destination_id).await?;
        }

        let encrypted = self
            .cipher
            .encrypt(plaintext.as_bytes(), destination_id.0.as_bytes())?;

        let now = OffsetDateTime::now_utc();
        let record = WebhookSecret {
            id: new_secret_id(),
            destination_id: destination_id.clone(),
            secret: encrypted,
            algorithm: SignatureAlgorithm::Sha256,
            is_primary: opts.is_primary,
            is_active: true,
            expires_at: opts.expires_in_days.map(|days| now + time::Duration::days(days)),
            created_by: opts.created_by,
            created_at: now,
        };

        self.repository.create(record.clone()).await?;

        Ok(CreatedSecret {
            record,
            plaintext,
            strength,
        })
    }

    /// Rotate the primary secret: demote the current one, install a new
    /// generated primary. Fails when no primary exists.
    pub async fn rotate_secret(
        &self,
        destination_id: &DestinationId,
        created_by: impl Into<String>,
    ) -> Result<CreatedSecret, SecretError> {
        let active = self
            .repository
            .find_active_by_destination(destination_id)
            .await?;
        let primary = active
            .iter()
            .find(|s| s.is_primary)
            .ok_or(SecretError::NoPrimarySecret)?;

        self.repository.mark_inactive(&primary.id).await?;

        self.create_secret(
            destination_id,
            CreateSecretOptions {
                secret: None,
                is_primary: true,
                expires_in_days: None,
                created_by: created_by.into(),
            },
        )
        .await
    }

    /// Install a customer-supplied key, deactivating all existing secrets
    /// for the destination first, not just the primary.
    pub async fn configure_byos(
        &self,
        destination_id: &DestinationId,
        config: ByosConfig,
        actor: impl Into<String>,
    ) -> Result<CreatedSecret, SecretError> {
        validate_secret_format(&config.secret).map_err(SecretError::InvalidSecret)?;

        let existing = self.repository.find_by_destination(destination_id).await?;
        for secret in existing.iter().filter(|s| s.is_active) {
            self.repository.mark_inactive(&secret.id).await?;
        }

        let expires_in_days = if config.customer_managed_rotation {
            None
        } else {
            Some(BYOS_DEFAULT_VALIDITY_DAYS)
        };

        self.create_secret(
            destination_id,
            CreateSecretOptions {
                secret: Some(config.secret),
                is_primary: true,
                expires_in_days,
                created_by: actor.into(),
            },
        )
        .await
    }

    /// All active secrets for a destination, decrypted on read. Empty
    /// when none exist.
    pub async fn get_active_secrets(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Vec<ActiveSecret>, SecretError> {
        let records = self
            .repository
            .find_active_by_destination(destination_id)
            .await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(self.decrypt_record(&record)?);
        }
        Ok(out)
    }

    /// The current signing primary, decrypted. `None` when no primary
    /// exists.
    pub async fn get_primary_secret(
        &self,
        destination_id: &DestinationId,
    ) -> Result<Option<ActiveSecret>, SecretError> {
        let active = self.get_active_secrets(destination_id).await?;
        Ok(active.into_iter().find(|s| s.is_primary))
    }

    /// Best-effort sweep of expired secrets. Repository failure degrades
    /// to an error entry in the summary.
    pub async fn cleanup_expired_secrets(&self) -> CleanupSummary {
        match self
            .repository
            .cleanup_expired(OffsetDateTime::now_utc())
            .await
        {
            Ok(removed) => CleanupSummary {
                removed,
                errors: Vec::new(),
            },
            Err(err) => CleanupSummary {
                removed: 0,
                errors: vec![err.to_string()],
            },
        }
    }

    async fn demote_primary(&self, destination_id: &DestinationId) -> Result<(), SecretError> {
        let active = self
            .repository
            .find_active_by_destination(destination_id)
            .await?;
        for secret in active.iter().filter(|s| s.is_primary) {
            self.repository.mark_inactive(&secret.id).await?;
        }
        Ok(())
    }

    fn decrypt_record(&self, record: &WebhookSecret) -> Result<ActiveSecret, SecretError> {
        let plaintext = self
            .cipher
            .decrypt(&record.secret, record.destination_id.0.as_bytes())?;
        let secret = String::from_utf8(plaintext.to_vec())
            .map_err(|_| SecretError::InvalidSecret("secret is not valid UTF-8".into()))?;
        Ok(ActiveSecret {
            id: record.id.clone(),
            secret,
            algorithm: record.algorithm,
            is_primary: record.is_primary,
            expires_at: record.expires_at,
        })
    }
}

fn new_secret_id() -> String {
    let mut buf = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut buf);
    format!("whsec_{}", hex::encode(buf))
}
