use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};

/// Outcome of structural and semantic configuration validation.
///
/// Errors make the configuration unusable; warnings are advisory and do
/// not block delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.is_valid = self.is_valid && other.is_valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// A report rejecting a config handed to the wrong transport handler.
    pub fn wrong_transport(expected: Transport) -> Self {
        let mut report = Self::ok();
        report.error(format!("expected {} configuration", expected.as_str()));
        report
    }
}

/// Outcome of a minimal, side-effect-free destination probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl ConnectionTest {
    pub fn ok(response_time_ms: u64) -> Self {
        Self {
            success: true,
            response_time_ms,
            status_code: None,
            error: None,
            details: None,
        }
    }

    pub fn failed(error: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            success: false,
            response_time_ms,
            status_code: None,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Shared contract implemented by every transport handler.
///
/// `deliver` re-validates the configuration first and fails fast
/// (non-retryable) without attempting I/O when it is invalid, and wraps
/// every unexpected failure into a [`DeliveryResult`] so a batch
/// dispatcher can always inspect a result object.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// The transport this handler serves.
    fn transport(&self) -> Transport;

    /// Pure, synchronous, exhaustive config validation. Runs before any
    /// network I/O.
    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport;

    /// Minimal probe of the destination.
    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest;

    /// Perform the transport operation.
    async fn deliver(&self, payload: &DeliveryPayload, config: &DestinationConfig)
        -> DeliveryResult;

    /// Static capability check, keyed by feature name.
    fn supports_feature(&self, feature: &str) -> bool;

    /// JSON-Schema-shaped self-description for UI-driven configuration.
    fn config_schema(&self) -> serde_json::Value;
}
