use thiserror::Error;

/// Classifies an HTTP status code as retryable or terminal.
///
/// 408 (request timeout), 429 (rate limited) and all 5xx responses are
/// transient; every other 4xx is a caller problem that a retry cannot fix.
pub fn retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Classifies a raw transport error message as retryable or terminal.
///
/// This is the fallback path for error sources that only expose a message
/// string. Providers that can report structured errors should construct a
/// [`StorageError`] or [`TransportError`] with `retryable` set explicitly
/// instead of routing through here.
pub fn retryable_transport_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();

    // Terminal conditions win: retrying a full disk or a bad credential
    // repeats the same failure.
    let terminal = [
        "disk full",
        "no space",
        "quota",
        "permission denied",
        "access denied",
        "authentication",
        "auth failed",
        "invalid credentials",
        "unauthorized",
    ];
    if terminal.iter().any(|needle| lower.contains(needle)) {
        return false;
    }

    let transient = [
        "econnreset",
        "econnrefused",
        "etimedout",
        "enotfound",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "connection lost",
        "connection closed",
        "broken pipe",
        "temporarily unavailable",
    ];
    transient.iter().any(|needle| lower.contains(needle))
}

/// Discriminant for storage-layer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Credential or signature rejection.
    Authentication,
    /// Object or container does not exist.
    NotFound,
    /// Capacity or quota exhausted on the backing store.
    QuotaExceeded,
    /// Network-layer failure reaching the store.
    Network,
    /// Anything else.
    Other,
}

/// A single storage error type carrying a `kind` discriminant plus
/// structured fields, replacing a subclass-per-condition hierarchy while
/// preserving discriminated handling in callers.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub code: Option<String>,
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, StorageErrorKind::Network);
        Self {
            kind,
            code: None,
            status_code: None,
            retryable,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Authentication, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::NotFound, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::QuotaExceeded, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = retryable_transport_message(&message);
        Self::new(StorageErrorKind::Other, message).with_retryable(retryable)
    }

    /// Maps an HTTP response status from a storage backend.
    pub fn from_http_status(status: u16, context: &str) -> Self {
        let message = format!("{context}: HTTP {status}");
        let kind = match status {
            401 | 403 => StorageErrorKind::Authentication,
            404 => StorageErrorKind::NotFound,
            413 | 507 => StorageErrorKind::QuotaExceeded,
            _ => {
                if retryable_http_status(status) {
                    StorageErrorKind::Network
                } else {
                    StorageErrorKind::Other
                }
            }
        };
        Self::new(kind, message)
            .with_status(status)
            .with_retryable(retryable_http_status(status))
    }

    /// Maps a client-side HTTP failure (no response received).
    pub fn from_reqwest(err: &reqwest::Error, context: &str) -> Self {
        if let Some(status) = err.status() {
            return Self::from_http_status(status.as_u16(), context);
        }
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        Self::new(StorageErrorKind::Network, format!("{context}: {err}")).with_retryable(retryable)
    }
}

/// Transport-level failure shared by the non-storage handlers.
///
/// Carries the retryability verdict alongside the message so that the
/// decision is made where the most context exists, not at the handler
/// boundary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
    pub status_code: Option<u16>,
}

impl TransportError {
    /// A transient failure worth re-invoking `deliver` for.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            status_code: None,
        }
    }

    /// A terminal failure that a retry would only repeat.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            status_code: None,
        }
    }

    /// Classifies from the message text alone.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let retryable = retryable_transport_message(&message);
        Self {
            message,
            retryable,
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl From<StorageError> for TransportError {
    fn from(err: StorageError) -> Self {
        Self {
            retryable: err.retryable,
            status_code: err.status_code,
            message: err.message,
        }
    }
}

/// Errors from the secret lifecycle manager.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("no primary secret configured for destination")]
    NoPrimarySecret,

    #[error("secret repository error: {0}")]
    Repository(String),
}

/// Errors from the download link repository.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("download link not found")]
    NotFound,

    #[error("link repository error: {0}")]
    Repository(String),
}
