use std::time::Duration;

use hmac::{Hmac, Mac};
use rand_core::RngCore;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::types::DeliveryId;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix on the wire: `sha256=<hex digest>`.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Internal salt for idempotency key derivation. Not a secret; it only
/// namespaces the keyspace so derived keys cannot collide with signatures.
const IDEMPOTENCY_SALT: &[u8] = b"delivery-engine/idempotency/v1";

/// Default replay tolerance window for signature verification.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// Secret format bounds, in characters.
pub const SECRET_MIN_LEN: usize = 32;
pub const SECRET_MAX_LEN: usize = 256;

/// Rebuild a JSON value with lexicographically sorted object keys at every
/// nesting level. Arrays preserve order. Logically identical payloads
/// therefore serialize identically regardless of field insertion order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (key, inner) in entries {
                out.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical string form of a JSON value, suitable for signing.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Compute the webhook signature over `"{timestamp}.{canonical json}"`.
///
/// Returns the wire format `sha256=<hex>`.
pub fn sign_payload(secret: &[u8], payload: &Value, timestamp: &str) -> String {
    let message = format!("{timestamp}.{}", canonical_json(payload));
    format!("{SIGNATURE_PREFIX}{}", hmac_hex(secret, message.as_bytes()))
}

/// Why a signature was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    MalformedTimestamp,
    /// Timestamp older than the tolerance window.
    TooOld,
    /// Timestamp further in the future than the tolerance window.
    TooFarInFuture,
    MalformedSignature,
    Mismatch,
}

impl std::fmt::Display for SignatureRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureRejection::MalformedTimestamp => write!(f, "malformed timestamp"),
            SignatureRejection::TooOld => write!(f, "timestamp too old"),
            SignatureRejection::TooFarInFuture => write!(f, "timestamp too far in future"),
            SignatureRejection::MalformedSignature => write!(f, "malformed signature"),
            SignatureRejection::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureCheck {
    pub is_valid: bool,
    pub reason: Option<SignatureRejection>,
}

impl SignatureCheck {
    fn valid() -> Self {
        Self {
            is_valid: true,
            reason: None,
        }
    }

    fn rejected(reason: SignatureRejection) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
        }
    }
}

/// Verify a received signature against the same canonicalization used for
/// signing.
///
/// The timestamp must fall within `tolerance` of `now` in *either*
/// direction; this bounds replay exposure without a nonce store. Digest
/// comparison is constant-time.
pub fn verify_signature(
    secret: &[u8],
    payload: &Value,
    timestamp: &str,
    signature: &str,
    tolerance: Duration,
    now: OffsetDateTime,
) -> SignatureCheck {
    let Ok(ts) = OffsetDateTime::parse(timestamp, &Rfc3339) else {
        return SignatureCheck::rejected(SignatureRejection::MalformedTimestamp);
    };

    let tolerance = time::Duration::try_from(tolerance).unwrap_or(time::Duration::MAX);
    if now - ts > tolerance {
        return SignatureCheck::rejected(SignatureRejection::TooOld);
    }
    if ts - now > tolerance {
        return SignatureCheck::rejected(SignatureRejection::TooFarInFuture);
    }

    let Some(provided_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return SignatureCheck::rejected(SignatureRejection::MalformedSignature);
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return SignatureCheck::rejected(SignatureRejection::MalformedSignature);
    };

    let message = format!("{timestamp}.{}", canonical_json(payload));
    let expected = hmac_bytes(secret, message.as_bytes());

    if expected.ct_eq(provided.as_slice()).into() {
        SignatureCheck::valid()
    } else {
        SignatureCheck::rejected(SignatureRejection::Mismatch)
    }
}

/// Deterministic idempotency key: HMAC over `"{delivery_id}:{timestamp}"`
/// with a fixed internal salt, truncated to 32 hex characters. Identical
/// inputs always yield the identical key, so a receiver can de-duplicate
/// retried deliveries.
pub fn idempotency_key(delivery_id: &DeliveryId, timestamp: &str) -> String {
    let message = format!("{}:{timestamp}", delivery_id.0);
    let mut digest = hmac_hex(IDEMPOTENCY_SALT, message.as_bytes());
    digest.truncate(32);
    digest
}

/// Generate a cryptographically random secret of `bytes` bytes, hex
/// encoded. The 32-byte default yields 64 hex characters.
pub fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes.max(1)];
    rand_core::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Structural validation of raw secret material: a length band and an
/// allowed character class. Low entropy is a warning, not a rejection;
/// see [`classify_secret_strength`].
pub fn validate_secret_format(secret: &str) -> Result<(), String> {
    if secret.len() < SECRET_MIN_LEN {
        return Err(format!(
            "secret must be at least {SECRET_MIN_LEN} characters"
        ));
    }
    if secret.len() > SECRET_MAX_LEN {
        return Err(format!("secret must be at most {SECRET_MAX_LEN} characters"));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '_' | '-');
    if let Some(bad) = secret.chars().find(|c| !allowed(*c)) {
        return Err(format!("secret contains disallowed character {bad:?}"));
    }
    Ok(())
}

/// Entropy classification for caller-supplied secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretStrength {
    Weak,
    Medium,
    Strong,
}

/// Flags low-entropy patterns without rejecting them.
///
/// A single character class or heavy repetition is weak; mixed classes at
/// 64+ characters is strong; everything else is medium.
pub fn classify_secret_strength(secret: &str) -> SecretStrength {
    let has_lower = secret.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = secret.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = secret.chars().any(|c| c.is_ascii_digit());
    let has_symbol = secret.chars().any(|c| !c.is_ascii_alphanumeric());
    let classes = [has_lower, has_upper, has_digit, has_symbol]
        .iter()
        .filter(|present| **present)
        .count();

    let mut counts = std::collections::HashMap::new();
    for c in secret.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    let max_repeat = counts.values().copied().max().unwrap_or(0);
    let repetitive = !secret.is_empty() && max_repeat * 2 > secret.len();

    if classes <= 1 || repetitive {
        SecretStrength::Weak
    } else if classes >= 3 && secret.len() >= 64 {
        SecretStrength::Strong
    } else {
        SecretStrength::Medium
    }
}

pub(crate) fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HmacSha256 accepts keys of any length; new_from_slice only fails for
    // variable-output MACs, so the fallback is unreachable in practice.
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"default").expect("hmac"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn hmac_hex(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_bytes(key, data))
}

/// Current RFC 3339 timestamp used for signing and wire headers.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
