use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use url::Url;

use crate::error::LinkError;
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::signing::hmac_hex;
use crate::storage::elapsed_ms;
use crate::types::{
    DeliveryPayload, DeliveryResult, DestinationConfig, LinkId, OrganizationId, Transport,
};

/// Ceiling on configured link lifetime: one year.
const MAX_EXPIRY_HOURS: i64 = 8_760;

/// Percent-encoding set for query parameter values; unreserved
/// characters stay literal.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn default_expiry_hours() -> i64 {
    24
}

/// Download link destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Public base URL links are issued under.
    pub base_url: String,

    /// Link lifetime in hours. Must be positive.
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,

    /// Optional cap on successful accesses.
    #[serde(default)]
    pub max_access: Option<u32>,

    /// Object classification recorded for analytics; falls back to the
    /// payload type.
    #[serde(default)]
    pub object_type: Option<String>,
}

/// Lifecycle state of a link, derived rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Revoked,
    Expired,
    Exhausted,
}

/// An issued download link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLink {
    pub id: LinkId,
    pub delivery_id: String,
    pub organization_id: OrganizationId,
    pub object_type: String,
    /// Fully signed URL as handed to the recipient.
    pub url: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub max_access: Option<u32>,
    /// Successful accesses so far.
    pub access_count: u32,
    /// Set when the link was revoked, with the operator-supplied reason.
    #[serde(default)]
    pub revoked_reason: Option<String>,
}

impl DownloadLink {
    /// Status at `now`. Revocation wins over expiry, expiry over
    /// exhaustion.
    pub fn status(&self, now: OffsetDateTime) -> LinkStatus {
        if self.revoked_reason.is_some() {
            LinkStatus::Revoked
        } else if now > self.expires_at {
            LinkStatus::Expired
        } else if self
            .max_access
            .is_some_and(|max| self.access_count >= max)
        {
            LinkStatus::Exhausted
        } else {
            LinkStatus::Active
        }
    }
}

/// One access attempt against a link, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAccess {
    pub link_id: LinkId,
    pub organization_id: OrganizationId,
    pub accessed_at: OffsetDateTime,
    pub user: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub success: bool,
    /// Denial reason or transfer error, when the attempt failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Caller-observed details of one access attempt, recorded verbatim in
/// the audit log.
#[derive(Debug, Clone, Default)]
pub struct AccessAttempt {
    pub user: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Persistence seam for links and their access log.
#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn create_link(&self, link: DownloadLink) -> Result<(), LinkError>;

    async fn find_link(&self, id: &LinkId) -> Result<DownloadLink, LinkError>;

    /// Append an access record; a successful access also bumps the link's
    /// counter.
    async fn record_access(&self, access: LinkAccess) -> Result<(), LinkError>;

    /// Mark a link revoked, keeping the reason.
    async fn revoke(&self, id: &LinkId, reason: String) -> Result<(), LinkError>;

    async fn list_links(&self, organization: &OrganizationId)
        -> Result<Vec<DownloadLink>, LinkError>;

    async fn list_accesses(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<LinkAccess>, LinkError>;

    /// Remove links expired before `cutoff`, returning their ids.
    async fn delete_expired(&self, cutoff: OffsetDateTime) -> Result<Vec<LinkId>, LinkError>;
}

/// In-memory repository for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLinkStore {
    inner: Mutex<LinkStoreState>,
}

#[derive(Default)]
struct LinkStoreState {
    links: HashMap<LinkId, DownloadLink>,
    accesses: Vec<LinkAccess>,
}

impl InMemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkRepository for InMemoryLinkStore {
    async fn create_link(&self, link: DownloadLink) -> Result<(), LinkError> {
        let mut state = self.inner.lock().await;
        state.links.insert(link.id.clone(), link);
        Ok(())
    }

    async fn find_link(&self, id: &LinkId) -> Result<DownloadLink, LinkError> {
        let state = self.inner.lock().await;
        state.links.get(id).cloned().ok_or(LinkError::NotFound)
    }

    async fn record_access(&self, access: LinkAccess) -> Result<(), LinkError> {
        let mut state = self.inner.lock().await;
        if access.success {
            if let Some(link) = state.links.get_mut(&access.link_id) {
                link.access_count += 1;
            }
        }
        state.accesses.push(access);
        Ok(())
    }

    async fn revoke(&self, id: &LinkId, reason: String) -> Result<(), LinkError> {
        let mut state = self.inner.lock().await;
        match state.links.get_mut(id) {
            Some(link) => {
                link.revoked_reason = Some(reason);
                Ok(())
            }
            None => Err(LinkError::NotFound),
        }
    }

    async fn list_links(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<DownloadLink>, LinkError> {
        let state = self.inner.lock().await;
        Ok(state
            .links
            .values()
            .filter(|link| &link.organization_id == organization)
            .cloned()
            .collect())
    }

    async fn list_accesses(
        &self,
        organization: &OrganizationId,
    ) -> Result<Vec<LinkAccess>, LinkError> {
        let state = self.inner.lock().await;
        Ok(state
            .accesses
            .iter()
            .filter(|access| &access.organization_id == organization)
            .cloned()
            .collect())
    }

    async fn delete_expired(&self, cutoff: OffsetDateTime) -> Result<Vec<LinkId>, LinkError> {
        let mut state = self.inner.lock().await;
        let expired: Vec<LinkId> = state
            .links
            .values()
            .filter(|link| link.expires_at < cutoff)
            .map(|link| link.id.clone())
            .collect();
        for id in &expired {
            state.links.remove(id);
        }
        Ok(expired)
    }
}

/// Verdict on one access attempt. Pure data; recording the attempt is a
/// separate call so denied attempts still appear in analytics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<AccessDenial>,
    /// Accesses left under the cap, when one is configured.
    pub remaining_access: Option<u32>,
    /// Whole seconds until expiry, when the link is still live.
    pub time_until_expiry_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenial {
    NotFound,
    /// Carries the reason recorded when the link was revoked.
    Revoked(String),
    Expired,
    Exhausted,
    BadSignature,
}

impl std::fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessDenial::NotFound => write!(f, "link not found"),
            AccessDenial::Revoked(reason) => write!(f, "link revoked: {reason}"),
            AccessDenial::Expired => write!(f, "link expired"),
            AccessDenial::Exhausted => write!(f, "access limit reached"),
            AccessDenial::BadSignature => write!(f, "invalid signature"),
        }
    }
}

/// Aggregated link analytics, recomputed from raw links and the access
/// log on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAnalytics {
    pub total_links: usize,
    pub active: usize,
    pub revoked: usize,
    pub expired: usize,
    pub exhausted: usize,
    pub total_downloads: usize,
    pub unique_users: usize,
    /// Object types by link count, descending.
    pub top_object_types: Vec<(String, usize)>,
    /// Successful downloads per day over the trailing 30 days, oldest
    /// first.
    pub daily_downloads: Vec<DailyDownloads>,
    /// Most recent accesses, newest first.
    pub recent_accesses: Vec<LinkAccess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyDownloads {
    /// Calendar date in `YYYY-MM-DD` form.
    pub date: String,
    pub downloads: usize,
}

/// Outcome of an expired-link sweep. Failures degrade to counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkCleanup {
    pub removed: usize,
    pub errors: usize,
}

/// Issues, validates and accounts for signed download links.
pub struct DownloadLinkManager {
    signing_key: Vec<u8>,
    repository: Arc<dyn LinkRepository>,
}

impl DownloadLinkManager {
    pub fn new(signing_key: impl Into<Vec<u8>>, repository: Arc<dyn LinkRepository>) -> Self {
        Self {
            signing_key: signing_key.into(),
            repository,
        }
    }

    pub fn repository(&self) -> &Arc<dyn LinkRepository> {
        &self.repository
    }

    fn signature(&self, id: &LinkId, expires_unix: i64, org: &str, max_access: Option<u32>) -> String {
        let max = max_access.map(|m| m.to_string()).unwrap_or_default();
        let message = format!("{}.{expires_unix}.{org}.{max}", id.0);
        hmac_hex(&self.signing_key, message.as_bytes())
    }

    /// Issue and persist a link for a delivery.
    pub async fn issue_link(
        &self,
        payload: &DeliveryPayload,
        config: &DownloadConfig,
        now: OffsetDateTime,
    ) -> Result<DownloadLink, LinkError> {
        let id = new_link_id();
        let expires_at = now + Duration::hours(config.expiry_hours);
        let expires_unix = expires_at.unix_timestamp();
        let org = &payload.organization_id.0;

        let signature = self.signature(&id, expires_unix, org, config.max_access);
        let base = config.base_url.trim_end_matches('/');
        let org_encoded = utf8_percent_encode(org, QUERY_VALUE);
        let mut url = format!(
            "{base}/download/{}?expires={expires_unix}&org={org_encoded}",
            id.0
        );
        if let Some(max) = config.max_access {
            url.push_str(&format!("&max_access={max}"));
        }
        url.push_str(&format!("&signature={signature}"));

        let link = DownloadLink {
            id,
            delivery_id: payload.delivery_id.0.clone(),
            organization_id: payload.organization_id.clone(),
            object_type: config
                .object_type
                .clone()
                .unwrap_or_else(|| payload.payload_type.as_str().to_string()),
            url,
            created_at: now,
            expires_at,
            max_access: config.max_access,
            access_count: 0,
            revoked_reason: None,
        };
        self.repository.create_link(link.clone()).await?;
        Ok(link)
    }

    /// Verify the URL signature parameters in constant time.
    pub fn verify_url_signature(
        &self,
        id: &LinkId,
        expires_unix: i64,
        org: &str,
        max_access: Option<u32>,
        signature: &str,
    ) -> bool {
        let expected = self.signature(id, expires_unix, org, max_access);
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let Ok(expected) = hex::decode(expected) else {
            return false;
        };
        expected.ct_eq(provided.as_slice()).into()
    }

    /// Decide whether an access attempt is allowed. Pure with respect to
    /// stored state; call [`DownloadLinkManager::record_access`] to log
    /// the attempt regardless of the verdict.
    pub async fn validate_access(&self, id: &LinkId, now: OffsetDateTime) -> AccessDecision {
        let link = match self.repository.find_link(id).await {
            Ok(link) => link,
            Err(_) => {
                return AccessDecision {
                    allowed: false,
                    reason: Some(AccessDenial::NotFound),
                    remaining_access: None,
                    time_until_expiry_secs: None,
                }
            }
        };

        match link.status(now) {
            LinkStatus::Revoked => AccessDecision {
                allowed: false,
                reason: Some(AccessDenial::Revoked(
                    link.revoked_reason.clone().unwrap_or_default(),
                )),
                remaining_access: None,
                time_until_expiry_secs: None,
            },
            LinkStatus::Expired => AccessDecision {
                allowed: false,
                reason: Some(AccessDenial::Expired),
                remaining_access: link
                    .max_access
                    .map(|max| max.saturating_sub(link.access_count)),
                time_until_expiry_secs: None,
            },
            LinkStatus::Exhausted => AccessDecision {
                allowed: false,
                reason: Some(AccessDenial::Exhausted),
                remaining_access: Some(0),
                time_until_expiry_secs: Some((link.expires_at - now).whole_seconds()),
            },
            LinkStatus::Active => AccessDecision {
                allowed: true,
                reason: None,
                remaining_access: link
                    .max_access
                    .map(|max| max.saturating_sub(link.access_count)),
                time_until_expiry_secs: Some((link.expires_at - now).whole_seconds()),
            },
        }
    }

    /// Revoke a link so further access is denied with the given reason.
    pub async fn revoke_link(&self, id: &LinkId, reason: impl Into<String>) -> Result<(), LinkError> {
        self.repository.revoke(id, reason.into()).await
    }

    /// Log one access attempt. Successful attempts consume an access.
    pub async fn record_access(
        &self,
        id: &LinkId,
        organization: &OrganizationId,
        attempt: AccessAttempt,
        now: OffsetDateTime,
    ) -> Result<(), LinkError> {
        self.repository
            .record_access(LinkAccess {
                link_id: id.clone(),
                organization_id: organization.clone(),
                accessed_at: now,
                user: attempt.user,
                ip: attempt.ip,
                user_agent: attempt.user_agent,
                success: attempt.success,
                error: attempt.error,
            })
            .await
    }

    /// Recompute analytics for one organization from raw data.
    pub async fn analytics(
        &self,
        organization: &OrganizationId,
        now: OffsetDateTime,
        recent_limit: usize,
    ) -> Result<LinkAnalytics, LinkError> {
        let links = self.repository.list_links(organization).await?;
        let mut accesses = self.repository.list_accesses(organization).await?;

        let mut active = 0;
        let mut revoked = 0;
        let mut expired = 0;
        let mut exhausted = 0;
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        for link in &links {
            match link.status(now) {
                LinkStatus::Active => active += 1,
                LinkStatus::Revoked => revoked += 1,
                LinkStatus::Expired => expired += 1,
                LinkStatus::Exhausted => exhausted += 1,
            }
            *type_counts.entry(link.object_type.clone()).or_insert(0) += 1;
        }
        let mut top_object_types: Vec<(String, usize)> = type_counts.into_iter().collect();
        top_object_types.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let successful: Vec<&LinkAccess> =
            accesses.iter().filter(|access| access.success).collect();
        let total_downloads = successful.len();
        let unique_users = {
            let mut users: Vec<&str> = successful
                .iter()
                .filter_map(|access| access.user.as_deref())
                .collect();
            users.sort_unstable();
            users.dedup();
            users.len()
        };

        let mut daily_downloads = Vec::with_capacity(30);
        for offset in (0..30).rev() {
            let day = (now - Duration::days(offset)).date();
            let downloads = successful
                .iter()
                .filter(|access| access.accessed_at.date() == day)
                .count();
            daily_downloads.push(DailyDownloads {
                date: format!(
                    "{:04}-{:02}-{:02}",
                    day.year(),
                    day.month() as u8,
                    day.day()
                ),
                downloads,
            });
        }

        accesses.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
        accesses.truncate(recent_limit);

        Ok(LinkAnalytics {
            total_links: links.len(),
            active,
            revoked,
            expired,
            exhausted,
            total_downloads,
            unique_users,
            top_object_types,
            daily_downloads,
            recent_accesses: accesses,
        })
    }

    /// Remove links expired at `now`. Repository failures degrade to the
    /// error counter; the sweep itself never fails.
    pub async fn cleanup_expired_links(&self, now: OffsetDateTime) -> LinkCleanup {
        match self.repository.delete_expired(now).await {
            Ok(removed) => LinkCleanup {
                removed: removed.len(),
                errors: 0,
            },
            Err(_) => LinkCleanup {
                removed: 0,
                errors: 1,
            },
        }
    }
}

fn new_link_id() -> LinkId {
    let mut suffix = String::with_capacity(24);
    for _ in 0..24 {
        let n = fastrand::u8(0..16);
        suffix.push(char::from_digit(n as u32, 16).unwrap_or('0'));
    }
    LinkId(format!("dl_{suffix}"))
}

/// Delivery handler that issues a signed link instead of pushing bytes.
pub struct DownloadLinkHandler {
    manager: Arc<DownloadLinkManager>,
}

impl DownloadLinkHandler {
    pub fn new(manager: Arc<DownloadLinkManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<DownloadLinkManager> {
        &self.manager
    }

    fn download_config<'a>(&self, config: &'a DestinationConfig) -> Option<&'a DownloadConfig> {
        match config {
            DestinationConfig::Download(cfg) => Some(cfg),
            _ => None,
        }
    }

    fn validate_download(cfg: &DownloadConfig) -> ValidationReport {
        let mut report = ValidationReport::ok();
        match Url::parse(&cfg.base_url) {
            Ok(url) => {
                if url.scheme() != "https" && url.scheme() != "http" {
                    report.error(format!("unsupported base url scheme {:?}", url.scheme()));
                } else if url.scheme() == "http" {
                    report.warning("base url is not https; links will be sent in cleartext");
                }
            }
            Err(err) => report.error(format!("invalid base url: {err}")),
        }
        if cfg.expiry_hours <= 0 {
            report.error("link expiry must be a positive number of hours");
        } else if cfg.expiry_hours > MAX_EXPIRY_HOURS {
            report.error(format!(
                "link expiry must be at most {MAX_EXPIRY_HOURS} hours"
            ));
        }
        if cfg.max_access == Some(0) {
            report.error("max access must be at least 1 when set");
        }
        report
    }
}

#[async_trait]
impl DeliveryHandler for DownloadLinkHandler {
    fn transport(&self) -> Transport {
        Transport::Download
    }

    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        match self.download_config(config) {
            Some(cfg) => Self::validate_download(cfg),
            None => ValidationReport::wrong_transport(Transport::Download),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        let report = self.validate_config(config);
        if !report.is_valid {
            return ConnectionTest::failed(report.errors.join("; "), 0);
        }

        // A miss on a fresh id proves the repository answers queries.
        let started = Instant::now();
        let probe = LinkId(format!("probe_{}", fastrand::u64(..)));
        match self.manager.repository.find_link(&probe).await {
            Err(LinkError::NotFound) | Ok(_) => ConnectionTest::ok(elapsed_ms(started)),
            Err(err) => ConnectionTest::failed(err.to_string(), elapsed_ms(started)),
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
        let cfg = match self.download_config(config) {
            Some(cfg) => cfg,
            None => {
                return DeliveryResult::config_failure(&["expected download configuration".into()])
            }
        };

        let started = Instant::now();
        match self
            .manager
            .issue_link(payload, cfg, OffsetDateTime::now_utc())
            .await
        {
            Ok(link) => DeliveryResult::delivered(elapsed_ms(started), Some(link.url)),
            Err(err) => {
                // Link issuance only touches the repository; a failure
                // there is transient.
                DeliveryResult::failed(err.to_string(), true, elapsed_ms(started))
            }
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            "signed_urls" | "access_limits" | "expiry" | "revocation" | "analytics"
        )
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "title": "Download link configuration",
            "required": ["base_url"],
            "properties": {
                "base_url": { "type": "string", "format": "uri" },
                "expiry_hours": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_EXPIRY_HOURS,
                    "default": default_expiry_hours()
                },
                "max_access": { "type": "integer", "minimum": 1 },
                "object_type": { "type": "string" }
            }
        })
    }
}
