use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{retryable_http_status, TransportError};
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::storage::elapsed_ms;
use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com";
const RESEND_ENDPOINT: &str = "https://api.resend.com";

fn default_subject_template() -> String {
    "{type} delivery {deliveryId}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

/// Provider-specific sending settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum EmailProviderConfig {
    /// Plain SMTP relay.
    Smtp {
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        username: String,
        password: String,
        #[serde(default = "default_true")]
        starttls: bool,
    },
    SendGrid {
        api_key: String,
        /// Override for tests; production uses the public API host.
        #[serde(default)]
        endpoint: Option<String>,
    },
    Resend {
        api_key: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Amazon SES via its SMTP interface.
    Ses {
        host: String,
        #[serde(default = "default_smtp_port")]
        port: u16,
        username: String,
        password: String,
    },
}

impl EmailProviderConfig {
    pub fn kind(&self) -> EmailProviderKind {
        match self {
            EmailProviderConfig::Smtp { .. } => EmailProviderKind::Smtp,
            EmailProviderConfig::SendGrid { .. } => EmailProviderKind::SendGrid,
            EmailProviderConfig::Resend { .. } => EmailProviderKind::Resend,
            EmailProviderConfig::Ses { .. } => EmailProviderKind::Ses,
        }
    }
}

/// Rate limiter key; one sliding window set per provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailProviderKind {
    Smtp,
    SendGrid,
    Resend,
    Ses,
}

impl EmailProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailProviderKind::Smtp => "smtp",
            EmailProviderKind::SendGrid => "sendgrid",
            EmailProviderKind::Resend => "resend",
            EmailProviderKind::Ses => "ses",
        }
    }

    /// Provider-level capabilities; server-side templates only exist on
    /// the REST providers.
    pub fn supports(&self, feature: &str) -> bool {
        match feature {
            "attachments" => true,
            "templates" => matches!(self, EmailProviderKind::SendGrid | EmailProviderKind::Resend),
            _ => false,
        }
    }
}

/// Email destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(flatten)]
    pub provider: EmailProviderConfig,

    pub from: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,

    /// Subject template; `{deliveryId}`, `{organizationId}` and `{type}`
    /// are substituted.
    #[serde(default = "default_subject_template")]
    pub subject_template: String,

    /// Attach the payload body as a JSON file.
    #[serde(default = "default_true")]
    pub attach_payload: bool,
}

/// Fully rendered message handed to a transport.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    /// Filename and bytes of the optional JSON attachment.
    pub attachment: Option<(String, Vec<u8>)>,
}

/// Sends rendered messages through a concrete provider. Tests inject a
/// recording implementation.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Send the message, returning the provider's message id when it
    /// reports one.
    async fn send(
        &self,
        config: &EmailProviderConfig,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError>;

    /// Cheap credential and reachability probe. No mail is sent.
    async fn probe(&self, config: &EmailProviderConfig) -> Result<(), TransportError>;
}

/// Per-window send budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 300,
            per_hour: 5_000,
        }
    }
}

/// Snapshot of recent send counts for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub in_last_second: usize,
    pub in_last_minute: usize,
    pub in_last_hour: usize,
}

/// Non-blocking sliding-window limiter, keyed by provider kind.
///
/// `check_and_record` never sleeps; an exhausted window surfaces as a
/// retryable delivery failure so the external scheduler provides the
/// backoff.
pub struct EmailRateLimiter {
    limits: HashMap<EmailProviderKind, RateLimits>,
    default_limits: RateLimits,
    windows: Mutex<HashMap<EmailProviderKind, VecDeque<Instant>>>,
}

impl EmailRateLimiter {
    pub fn new(default_limits: RateLimits) -> Self {
        Self {
            limits: HashMap::new(),
            default_limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the budget for one provider.
    pub fn with_limits(mut self, kind: EmailProviderKind, limits: RateLimits) -> Self {
        self.limits.insert(kind, limits);
        self
    }

    fn limits_for(&self, kind: EmailProviderKind) -> RateLimits {
        self.limits.get(&kind).copied().unwrap_or(self.default_limits)
    }

    /// Admit or reject one send. Admission records the send instant.
    pub fn check_and_record(&self, kind: EmailProviderKind) -> Result<(), TransportError> {
        let limits = self.limits_for(kind);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(kind).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= Duration::from_secs(3600) {
                window.pop_front();
            } else {
                break;
            }
        }

        let in_hour = window.len();
        let in_minute = count_within(window, now, Duration::from_secs(60));
        let in_second = count_within(window, now, Duration::from_secs(1));

        let exceeded = if in_second >= limits.per_second as usize {
            Some("per-second")
        } else if in_minute >= limits.per_minute as usize {
            Some("per-minute")
        } else if in_hour >= limits.per_hour as usize {
            Some("per-hour")
        } else {
            None
        };

        if let Some(window_name) = exceeded {
            return Err(TransportError::transient(format!(
                "email rate limit exceeded for {} ({window_name} window)",
                kind.as_str()
            )));
        }

        window.push_back(now);
        Ok(())
    }

    pub fn stats(&self, kind: EmailProviderKind) -> RateLimiterStats {
        let now = Instant::now();
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(window) = windows.get(&kind) else {
            return RateLimiterStats::default();
        };
        RateLimiterStats {
            in_last_second: count_within(window, now, Duration::from_secs(1)),
            in_last_minute: count_within(window, now, Duration::from_secs(60)),
            in_last_hour: count_within(window, now, Duration::from_secs(3600)),
        }
    }
}

fn count_within(window: &VecDeque<Instant>, now: Instant, span: Duration) -> usize {
    window
        .iter()
        .rev()
        .take_while(|instant| now.duration_since(**instant) < span)
        .count()
}

/// Email delivery handler.
pub struct EmailHandler {
    transport: std::sync::Arc<dyn EmailTransport>,
    limiter: EmailRateLimiter,
}

impl EmailHandler {
    pub fn new(transport: std::sync::Arc<dyn EmailTransport>, limiter: EmailRateLimiter) -> Self {
        Self { transport, limiter }
    }

    /// Handler wired to the built-in provider implementations with
    /// default rate limits.
    pub fn with_defaults() -> Self {
        Self::new(
            std::sync::Arc::new(DefaultEmailTransport::new()),
            EmailRateLimiter::new(RateLimits::default()),
        )
    }

    pub fn limiter(&self) -> &EmailRateLimiter {
        &self.limiter
    }

    fn email_config<'a>(&self, config: &'a DestinationConfig) -> Option<&'a EmailConfig> {
        match config {
            DestinationConfig::Email(cfg) => Some(cfg),
            _ => None,
        }
    }

    fn validate_email(cfg: &EmailConfig) -> ValidationReport {
        let mut report = ValidationReport::ok();

        if !looks_like_address(&cfg.from) {
            report.error(format!("invalid sender address {:?}", cfg.from));
        }
        if cfg.recipients.is_empty() {
            report.error("email delivery requires a recipient list");
        }
        for address in cfg.recipients.iter().chain(&cfg.cc).chain(&cfg.bcc) {
            if !looks_like_address(address) {
                report.error(format!("invalid recipient address {address:?}"));
            }
        }
        if cfg.subject_template.trim().is_empty() {
            report.error("email subject template must not be empty");
        }

        match &cfg.provider {
            EmailProviderConfig::Smtp {
                host,
                port,
                username,
                password,
                ..
            }
            | EmailProviderConfig::Ses {
                host,
                port,
                username,
                password,
            } => {
                if host.trim().is_empty() {
                    report.error("smtp host is required");
                }
                if *port == 0 {
                    report.error("smtp port must be non-zero");
                }
                if username.is_empty() || password.is_empty() {
                    report.error("smtp credentials are required");
                }
                #[cfg(not(feature = "smtp"))]
                report.warning("smtp support is not compiled in; sends will fail");
            }
            EmailProviderConfig::SendGrid { api_key, .. } => {
                if api_key.trim().is_empty() {
                    report.error("sendgrid api key is required");
                }
            }
            EmailProviderConfig::Resend { api_key, .. } => {
                if api_key.trim().is_empty() {
                    report.error("resend api key is required");
                }
            }
        }

        report
    }

    fn render(cfg: &EmailConfig, payload: &DeliveryPayload) -> EmailMessage {
        let subject = cfg
            .subject_template
            .replace("{deliveryId}", &payload.delivery_id.0)
            .replace("{organizationId}", &payload.organization_id.0)
            .replace("{type}", payload.payload_type.as_str());

        let mut body_text = format!(
            "Delivery {} ({}) for organization {}.\n",
            payload.delivery_id.0,
            payload.payload_type.as_str(),
            payload.organization_id.0,
        );
        if let Some(correlation_id) = &payload.correlation_id {
            body_text.push_str(&format!("Correlation id: {correlation_id}\n"));
        }
        if cfg.attach_payload {
            body_text.push_str("The payload is attached as JSON.\n");
        } else {
            let rendered = serde_json::to_string_pretty(&payload.data)
                .unwrap_or_else(|_| payload.data.to_string());
            body_text.push_str("\n");
            body_text.push_str(&rendered);
            body_text.push('\n');
        }

        let attachment = if cfg.attach_payload {
            let bytes = serde_json::to_vec_pretty(&payload.data)
                .unwrap_or_else(|_| payload.data.to_string().into_bytes());
            Some((format!("delivery_{}.json", payload.delivery_id.0), bytes))
        } else {
            None
        };

        EmailMessage {
            from: cfg.from.clone(),
            to: cfg.recipients.clone(),
            cc: cfg.cc.clone(),
            bcc: cfg.bcc.clone(),
            subject,
            body_text,
            attachment,
        }
    }
}

/// Rejects only what no provider would accept.
fn looks_like_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

#[async_trait]
impl DeliveryHandler for EmailHandler {
    fn transport(&self) -> Transport {
        Transport::Email
    }

    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        match self.email_config(config) {
            Some(cfg) => Self::validate_email(cfg),
            None => ValidationReport::wrong_transport(Transport::Email),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        let report = self.validate_config(config);
        if !report.is_valid {
            return ConnectionTest::failed(report.errors.join("; "), 0);
        }
        let cfg = match self.email_config(config) {
            Some(cfg) => cfg,
            None => return ConnectionTest::failed("expected email configuration", 0),
        };

        let started = Instant::now();
        match self.transport.probe(&cfg.provider).await {
            Ok(()) => ConnectionTest::ok(elapsed_ms(started)).with_details(json!({
                "provider": cfg.provider.kind().as_str(),
            })),
            Err(err) => {
                let mut test = ConnectionTest::failed(err.message, elapsed_ms(started));
                if let Some(status) = err.status_code {
                    test = test.with_status(status);
                }
                test
            }
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
        let cfg = match self.email_config(config) {
            Some(cfg) => cfg,
            None => {
                return DeliveryResult::config_failure(&["expected email configuration".into()])
            }
        };

        let started = Instant::now();

        if let Err(err) = self.limiter.check_and_record(cfg.provider.kind()) {
            return DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started));
        }

        let message = Self::render(cfg, payload);
        match self.transport.send(&cfg.provider, &message).await {
            Ok(message_id) => DeliveryResult::delivered(elapsed_ms(started), message_id),
            Err(err) => DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started)),
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            "attachments" | "rate_limiting" | "cc_bcc" | "subject_templating"
        )
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "title": "Email delivery configuration",
            "required": ["provider", "from", "recipients"],
            "properties": {
                "provider": {
                    "type": "string",
                    "enum": ["smtp", "send_grid", "resend", "ses"]
                },
                "from": { "type": "string", "format": "email" },
                "recipients": {
                    "type": "array",
                    "items": { "type": "string", "format": "email" },
                    "minItems": 1
                },
                "cc": { "type": "array", "items": { "type": "string", "format": "email" } },
                "bcc": { "type": "array", "items": { "type": "string", "format": "email" } },
                "subject_template": { "type": "string", "default": default_subject_template() },
                "attach_payload": { "type": "boolean", "default": true }
            }
        })
    }
}

/// Built-in transport: SMTP-family providers go through the mail relay,
/// REST providers through their HTTP APIs.
pub struct DefaultEmailTransport {
    client: reqwest::Client,
}

impl DefaultEmailTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn send_sendgrid(
        &self,
        api_key: &str,
        endpoint: Option<&str>,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        let base = endpoint.unwrap_or(SENDGRID_ENDPOINT).trim_end_matches('/');
        let url = format!("{base}/v3/mail/send");

        let to_list = |addresses: &[String]| -> Vec<serde_json::Value> {
            addresses.iter().map(|a| json!({ "email": a })).collect()
        };
        let mut personalization = json!({ "to": to_list(&message.to) });
        if !message.cc.is_empty() {
            personalization["cc"] = serde_json::Value::Array(to_list(&message.cc));
        }
        if !message.bcc.is_empty() {
            personalization["bcc"] = serde_json::Value::Array(to_list(&message.bcc));
        }

        let mut body = json!({
            "personalizations": [personalization],
            "from": { "email": message.from },
            "subject": message.subject,
            "content": [{ "type": "text/plain", "value": message.body_text }],
        });
        if let Some((filename, bytes)) = &message.attachment {
            body["attachments"] = json!([{
                "content": base64::engine::general_purpose::STANDARD.encode(bytes),
                "filename": filename,
                "type": "application/json",
            }]);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_reqwest(&err, "sendgrid send"))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(http_failure(response, status, "sendgrid send").await);
        }
        Ok(response
            .headers()
            .get("x-message-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string()))
    }

    async fn send_resend(
        &self,
        api_key: &str,
        endpoint: Option<&str>,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        let base = endpoint.unwrap_or(RESEND_ENDPOINT).trim_end_matches('/');
        let url = format!("{base}/emails");

        let mut body = json!({
            "from": message.from,
            "to": message.to,
            "subject": message.subject,
            "text": message.body_text,
        });
        if !message.cc.is_empty() {
            body["cc"] = json!(message.cc);
        }
        if !message.bcc.is_empty() {
            body["bcc"] = json!(message.bcc);
        }
        if let Some((filename, bytes)) = &message.attachment {
            body["attachments"] = json!([{
                "filename": filename,
                "content": base64::engine::general_purpose::STANDARD.encode(bytes),
            }]);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| map_reqwest(&err, "resend send"))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(http_failure(response, status, "resend send").await);
        }
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|err| map_reqwest(&err, "resend send"))?;
        Ok(parsed
            .get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string()))
    }

    async fn probe_rest(
        &self,
        url: &str,
        api_key: &str,
        context: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|err| map_reqwest(&err, context))?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(http_failure(response, status, context).await)
        }
    }
}

impl Default for DefaultEmailTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_reqwest(err: &reqwest::Error, context: &str) -> TransportError {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    TransportError {
        message: format!("{context}: {err}"),
        retryable,
        status_code: err.status().map(|s| s.as_u16()),
    }
}

async fn http_failure(response: reqwest::Response, status: u16, context: &str) -> TransportError {
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    TransportError {
        message: format!("{context}: HTTP {status} {snippet}"),
        retryable: retryable_http_status(status),
        status_code: Some(status),
    }
}

#[async_trait]
impl EmailTransport for DefaultEmailTransport {
    async fn send(
        &self,
        config: &EmailProviderConfig,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        match config {
            EmailProviderConfig::SendGrid { api_key, endpoint } => {
                self.send_sendgrid(api_key, endpoint.as_deref(), message)
                    .await
            }
            EmailProviderConfig::Resend { api_key, endpoint } => {
                self.send_resend(api_key, endpoint.as_deref(), message).await
            }
            EmailProviderConfig::Smtp {
                host,
                port,
                username,
                password,
                starttls,
            } => smtp::send(host, *port, username, password, *starttls, message).await,
            EmailProviderConfig::Ses {
                host,
                port,
                username,
                password,
            } => smtp::send(host, *port, username, password, true, message).await,
        }
    }

    async fn probe(&self, config: &EmailProviderConfig) -> Result<(), TransportError> {
        match config {
            EmailProviderConfig::SendGrid { api_key, endpoint } => {
                let base = endpoint
                    .as_deref()
                    .unwrap_or(SENDGRID_ENDPOINT)
                    .trim_end_matches('/');
                self.probe_rest(&format!("{base}/v3/scopes"), api_key, "sendgrid probe")
                    .await
            }
            EmailProviderConfig::Resend { api_key, endpoint } => {
                let base = endpoint
                    .as_deref()
                    .unwrap_or(RESEND_ENDPOINT)
                    .trim_end_matches('/');
                self.probe_rest(&format!("{base}/domains"), api_key, "resend probe")
                    .await
            }
            EmailProviderConfig::Smtp {
                host,
                port,
                username,
                password,
                starttls,
            } => smtp::probe(host, *port, username, password, *starttls).await,
            EmailProviderConfig::Ses {
                host,
                port,
                username,
                password,
            } => smtp::probe(host, *port, username, password, true).await,
        }
    }
}

#[cfg(feature = "smtp")]
mod smtp {
    use lettre::message::header::ContentType;
    use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

    use super::EmailMessage;
    use crate::error::TransportError;

    fn relay(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        starttls: bool,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        let builder = if starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|err| TransportError::classify(format!("smtp relay setup: {err}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        Ok(builder
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build())
    }

    fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
        address
            .parse()
            .map_err(|err| TransportError::terminal(format!("invalid address {address:?}: {err}")))
    }

    fn build(message: &EmailMessage) -> Result<Message, TransportError> {
        let mut builder = Message::builder()
            .from(mailbox(&message.from)?)
            .subject(&message.subject);
        for to in &message.to {
            builder = builder.to(mailbox(to)?);
        }
        for cc in &message.cc {
            builder = builder.cc(mailbox(cc)?);
        }
        for bcc in &message.bcc {
            builder = builder.bcc(mailbox(bcc)?);
        }

        let built = match &message.attachment {
            Some((filename, bytes)) => {
                let content_type = ContentType::parse("application/json")
                    .map_err(|_| TransportError::terminal("invalid attachment content type"))?;
                builder.multipart(
                    MultiPart::mixed()
                        .singlepart(SinglePart::plain(message.body_text.clone()))
                        .singlepart(
                            Attachment::new(filename.clone()).body(bytes.clone(), content_type),
                        ),
                )
            }
            None => builder.body(message.body_text.clone()),
        };
        built.map_err(|err| TransportError::terminal(format!("message build failed: {err}")))
    }

    pub async fn send(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        starttls: bool,
        message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        let transport = relay(host, port, username, password, starttls)?;
        let email = build(message)?;
        let response = transport
            .send(email)
            .await
            .map_err(|err| TransportError::classify(format!("smtp send: {err}")))?;
        Ok(response.message().next().map(|line| line.to_string()))
    }

    pub async fn probe(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        starttls: bool,
    ) -> Result<(), TransportError> {
        let transport = relay(host, port, username, password, starttls)?;
        let alive = transport
            .test_connection()
            .await
            .map_err(|err| TransportError::classify(format!("smtp probe: {err}")))?;
        if alive {
            Ok(())
        } else {
            Err(TransportError::transient("smtp connection test failed"))
        }
    }
}

#[cfg(not(feature = "smtp"))]
mod smtp {
    use super::EmailMessage;
    use crate::error::TransportError;

    pub async fn send(
        _host: &str,
        _port: u16,
        _username: &str,
        _password: &str,
        _starttls: bool,
        _message: &EmailMessage,
    ) -> Result<Option<String>, TransportError> {
        Err(TransportError::terminal("smtp support is not compiled in"))
    }

    pub async fn probe(
        _host: &str,
        _port: u16,
        _username: &str,
        _password: &str,
        _starttls: bool,
    ) -> Result<(), TransportError> {
        Err(TransportError::terminal("smtp support is not compiled in"))
    }
}
