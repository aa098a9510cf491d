use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::error::retryable_http_status;
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::signing::{
    classify_secret_strength, idempotency_key, now_rfc3339, sign_payload, validate_secret_format,
    SecretStrength,
};
use crate::storage::elapsed_ms;
use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Signature header carried on every signed request.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Webhook destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    /// POST, PUT or PATCH.
    #[serde(default = "default_method")]
    pub method: String,

    /// Extra request headers. Reserved header names are overwritten by
    /// the handler.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Signing secret. Requests are unsigned when absent.
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Webhook delivery handler.
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn webhook_config<'a>(&self, config: &'a DestinationConfig) -> Option<&'a WebhookConfig> {
        match config {
            DestinationConfig::Webhook(cfg) => Some(cfg),
            _ => None,
        }
    }

    fn validate_webhook(cfg: &WebhookConfig) -> ValidationReport {
        let mut report = ValidationReport::ok();

        match Url::parse(&cfg.url) {
            Ok(url) => match url.scheme() {
                "https" => {}
                "http" => report.warning("webhook url is not https"),
                scheme => report.error(format!("unsupported webhook url scheme {scheme:?}")),
            },
            Err(err) => report.error(format!("invalid webhook url: {err}")),
        }

        if !matches!(cfg.method.as_str(), "POST" | "PUT" | "PATCH") {
            report.error(format!(
                "unsupported webhook method {:?}; expected POST, PUT or PATCH",
                cfg.method
            ));
        }

        if cfg.timeout_secs == 0 || cfg.timeout_secs > 300 {
            report.error("webhook timeout must be between 1 and 300 seconds");
        }

        if let Some(secret) = &cfg.secret {
            if let Err(reason) = validate_secret_format(secret) {
                report.error(format!("invalid webhook secret: {reason}"));
            } else if classify_secret_strength(secret) == SecretStrength::Weak {
                report.warning("webhook secret is low-entropy");
            }
        }

        for name in cfg.headers.keys() {
            if name.eq_ignore_ascii_case(SIGNATURE_HEADER)
                || name.eq_ignore_ascii_case(TIMESTAMP_HEADER)
                || name.eq_ignore_ascii_case(IDEMPOTENCY_HEADER)
                || name.eq_ignore_ascii_case(DELIVERY_ID_HEADER)
            {
                report.warning(format!("header {name:?} is reserved and will be overwritten"));
            }
        }

        report
    }

    fn method(name: &str) -> reqwest::Method {
        match name {
            "PUT" => reqwest::Method::PUT,
            "PATCH" => reqwest::Method::PATCH,
            _ => reqwest::Method::POST,
        }
    }

    /// Receiver-supplied reference: body `request_id`/`id`, then the
    /// `x-request-id` header.
    fn extract_reference(headers: &reqwest::header::HeaderMap, body: &[u8]) -> Option<String> {
        if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(body) {
            for field in ["request_id", "id"] {
                if let Some(value) = parsed.get(field).and_then(|v| v.as_str()) {
                    return Some(value.to_string());
                }
            }
        }
        headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    }
}

impl Default for WebhookHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryHandler for WebhookHandler {
    fn transport(&self) -> Transport {
        Transport::Webhook
    }

    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        match self.webhook_config(config) {
            Some(cfg) => Self::validate_webhook(cfg),
            None => ValidationReport::wrong_transport(Transport::Webhook),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        let report = self.validate_config(config);
        if !report.is_valid {
            return ConnectionTest::failed(report.errors.join("; "), 0);
        }
        let cfg = match self.webhook_config(config) {
            Some(cfg) => cfg,
            None => return ConnectionTest::failed("expected webhook configuration", 0),
        };

        let started = Instant::now();
        let result = self
            .client
            .head(&cfg.url)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .send()
            .await;

        match result {
            // Any response proves the endpoint is reachable; HEAD is often
            // unimplemented, so 4xx still counts.
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 500 {
                    ConnectionTest::ok(elapsed_ms(started)).with_status(status)
                } else {
                    ConnectionTest::failed(format!("endpoint returned HTTP {status}"), elapsed_ms(started))
                        .with_status(status)
                }
            }
            Err(err) => ConnectionTest::failed(
                format!("webhook probe failed: {err}"),
                elapsed_ms(started),
            ),
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
        let cfg = match self.webhook_config(config) {
            Some(cfg) => cfg,
            None => {
                return DeliveryResult::config_failure(&["expected webhook configuration".into()])
            }
        };

        metric_inc("delivery_webhook_attempts");
        let started = Instant::now();

        let timestamp = now_rfc3339();
        let idem = payload
            .idempotency_key
            .clone()
            .unwrap_or_else(|| idempotency_key(&payload.delivery_id, &timestamp));
        let body = payload.wire_body(&timestamp, &idem);

        let mut request = self
            .client
            .request(Self::method(&cfg.method), &cfg.url)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .json(&body);

        for (name, value) in &cfg.headers {
            request = request.header(name, value);
        }
        request = request
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(IDEMPOTENCY_HEADER, &idem)
            .header(DELIVERY_ID_HEADER, &payload.delivery_id.0);
        if let Some(secret) = &cfg.secret {
            let signature = sign_payload(secret.as_bytes(), &body, &timestamp);
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                metric_inc("delivery_webhook_failures");
                let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                return DeliveryResult::failed(
                    format!("webhook request failed: {err}"),
                    retryable,
                    elapsed_ms(started),
                );
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let bytes = response.bytes().await.unwrap_or_default();

        if (200..300).contains(&status) {
            metric_inc("delivery_webhook_success");
            trace_event("webhook delivered");
            DeliveryResult::delivered(elapsed_ms(started), Self::extract_reference(&headers, &bytes))
        } else {
            metric_inc("delivery_webhook_failures");
            let snippet: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
            DeliveryResult::failed(
                format!("webhook returned HTTP {status}: {snippet}"),
                retryable_http_status(status),
                elapsed_ms(started),
            )
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            "signing" | "idempotency" | "custom_headers" | "custom_method"
        )
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "title": "Webhook delivery configuration",
            "required": ["url"],
            "properties": {
                "url": { "type": "string", "format": "uri" },
                "method": { "type": "string", "enum": ["POST", "PUT", "PATCH"], "default": "POST" },
                "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                "secret": { "type": "string", "minLength": 32, "maxLength": 256 },
                "timeout_secs": { "type": "integer", "minimum": 1, "maximum": 300, "default": 30 }
            }
        })
    }
}
