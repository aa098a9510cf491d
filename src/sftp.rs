use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::handler::{ConnectionTest, DeliveryHandler, ValidationReport};
use crate::storage::{elapsed_ms, resolve_storage_key};
use crate::types::{DeliveryPayload, DeliveryResult, DestinationConfig, Transport};

#[cfg(feature = "sftp")]
pub use ssh2_factory::Ssh2SessionFactory;

/// Remote directory permissions applied to directories this handler
/// creates.
const DIR_MODE: i32 = 0o755;

/// Remote file permissions applied after upload.
const FILE_MODE: i32 = 0o644;

/// SFTP authentication material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SftpAuth {
    Password {
        password: String,
    },
    PrivateKey {
        private_key: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl SftpAuth {
    pub fn method_name(&self) -> &'static str {
        match self {
            SftpAuth::Password { .. } => "password",
            SftpAuth::PrivateKey { .. } => "private_key",
        }
    }
}

/// SFTP destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: SftpAuth,
    /// Remote directory receiving uploads.
    pub remote_path: String,
    /// Filename template; same placeholders as storage key templates.
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_filename_template() -> String {
    "{deliveryId}_{timestamp}.json".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

/// Pool identity: deliveries to the same host and credentials share
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: &'static str,
}

impl PoolKey {
    fn from_config(config: &SftpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth_method: config.auth.method_name(),
        }
    }
}

/// Pool sizing and lifecycle settings, injected at construction.
#[derive(Debug, Clone)]
pub struct SftpPoolConfig {
    /// Maximum live connections per pool key.
    pub max_per_key: usize,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
    /// Bound on establishing a connection or waiting for a slot.
    pub connect_timeout: Duration,
    /// Reaper sweep interval.
    pub reap_interval: Duration,
}

impl Default for SftpPoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 4,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// One authenticated SFTP session.
#[async_trait]
pub trait SftpSession: Send {
    /// Stat a single directory, creating it with `mode` when absent.
    async fn ensure_dir(&mut self, path: &str, mode: i32) -> Result<(), TransportError>;

    /// Write `data` to `path` and set `mode` on the result.
    async fn upload(&mut self, path: &str, data: &[u8], mode: i32) -> Result<(), TransportError>;

    /// Size of the remote file, for post-upload verification.
    async fn remote_size(&mut self, path: &str) -> Result<u64, TransportError>;

    async fn close(&mut self);
}

/// Establishes authenticated sessions. The `ssh2`-backed factory lives
/// behind the `sftp` feature; tests inject their own.
#[async_trait]
pub trait SftpSessionFactory: Send + Sync {
    async fn connect(
        &self,
        config: &SftpConfig,
        timeout: Duration,
    ) -> Result<Box<dyn SftpSession>, TransportError>;
}

struct IdleSession {
    session: Box<dyn SftpSession>,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<PoolKey, Vec<IdleSession>>,
    total: HashMap<PoolKey, usize>,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle_connections: usize,
    pub total_connections: usize,
}

/// Keyed, size-bounded, idle-reaping pool of authenticated sessions.
///
/// An explicit struct owned by the handler, so multiple independently
/// configured handlers can coexist in one process and shut down cleanly
/// via [`SftpPool::cleanup`].
pub struct SftpPool {
    factory: Arc<dyn SftpSessionFactory>,
    config: SftpPoolConfig,
    state: Arc<Mutex<PoolState>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SftpPool {
    pub fn new(factory: Arc<dyn SftpSessionFactory>, config: SftpPoolConfig) -> Self {
        Self {
            factory,
            config,
            state: Arc::new(Mutex::new(PoolState::default())),
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            reaper: Mutex::new(None),
        }
    }

    /// Acquire a session for the destination, reusing an idle one when
    /// available. Blocks only when the pool is at capacity, bounded by
    /// the connect timeout.
    pub async fn acquire(
        &self,
        config: &SftpConfig,
    ) -> Result<Box<dyn SftpSession>, TransportError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(TransportError::terminal("sftp pool is shut down"));
        }
        self.ensure_reaper().await;

        let key = PoolKey::from_config(config);
        let deadline = Instant::now() + self.config.connect_timeout;

        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.idle.get_mut(&key).and_then(|idle| idle.pop()) {
                    return Ok(entry.session);
                }
                let total = state.total.entry(key.clone()).or_insert(0);
                if *total < self.config.max_per_key {
                    *total += 1;
                    drop(state);
                    match self.factory.connect(config, self.config.connect_timeout).await {
                        Ok(session) => return Ok(session),
                        Err(err) => {
                            self.decrement(&key).await;
                            return Err(err);
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::transient(
                    "timed out waiting for an sftp connection slot",
                ));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    /// Return a healthy session to the idle set, or retire a broken one.
    pub async fn release(
        &self,
        config: &SftpConfig,
        mut session: Box<dyn SftpSession>,
        healthy: bool,
    ) {
        let key = PoolKey::from_config(config);
        if !healthy || self.shutdown.load(Ordering::SeqCst) {
            session.close().await;
            self.decrement(&key).await;
            return;
        }

        let mut state = self.state.lock().await;
        state.idle.entry(key).or_default().push(IdleSession {
            session,
            idle_since: Instant::now(),
        });
        drop(state);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            idle_connections: state.idle.values().map(Vec::len).sum(),
            total_connections: state.total.values().sum(),
        }
    }

    /// Close every idle session and stop the reaper. In-flight sessions
    /// are retired as they are released.
    pub async fn cleanup(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }

        let drained: Vec<(PoolKey, Vec<IdleSession>)> = {
            let mut state = self.state.lock().await;
            state.idle.drain().collect()
        };
        for (key, sessions) in drained {
            for mut entry in sessions {
                entry.session.close().await;
                self.decrement(&key).await;
            }
        }
        self.notify.notify_waiters();
    }

    /// Evict idle sessions past the idle timeout. The background reaper
    /// calls this periodically; exposed for deterministic tests.
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let expired: Vec<(PoolKey, Vec<IdleSession>)> = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            for (key, sessions) in state.idle.iter_mut() {
                let (old, fresh): (Vec<IdleSession>, Vec<IdleSession>) = sessions
                    .drain(..)
                    .partition(|entry| entry.idle_since.elapsed() >= idle_timeout);
                *sessions = fresh;
                if !old.is_empty() {
                    expired.push((key.clone(), old));
                }
            }
            expired
        };

        let mut reaped = 0;
        for (key, sessions) in expired {
            for mut entry in sessions {
                entry.session.close().await;
                self.decrement(&key).await;
                reaped += 1;
            }
        }
        reaped
    }

    async fn decrement(&self, key: &PoolKey) {
        let mut state = self.state.lock().await;
        if let Some(total) = state.total.get_mut(key) {
            *total = total.saturating_sub(1);
        }
        drop(state);
        self.notify.notify_one();
    }

    async fn ensure_reaper(&self) {
        let mut guard = self.reaper.lock().await;
        if guard.is_some() {
            return;
        }
        let state = self.state.clone();
        let notify = self.notify.clone();
        let shutdown = self.shutdown.clone();
        let idle_timeout = self.config.idle_timeout;
        let interval = self.config.reap_interval;

        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let expired: Vec<IdleSession> = {
                    let mut state = state.lock().await;
                    let state = &mut *state;
                    let mut expired = Vec::new();
                    let keys: Vec<PoolKey> = state.idle.keys().cloned().collect();
                    for key in keys {
                        if let Some(sessions) = state.idle.get_mut(&key) {
                            let (old, fresh): (Vec<IdleSession>, Vec<IdleSession>) = sessions
                                .drain(..)
                                .partition(|entry| entry.idle_since.elapsed() >= idle_timeout);
                            *sessions = fresh;
                            let count = old.len();
                            expired.extend(old);
                            if let Some(total) = state.total.get_mut(&key) {
                                *total = total.saturating_sub(count);
                            }
                        }
                    }
                    expired
                };
                for mut entry in expired {
                    entry.session.close().await;
                }
                notify.notify_waiters();
            }
        }));
    }
}

/// SFTP delivery handler.
pub struct SftpHandler {
    pool: SftpPool,
}

impl SftpHandler {
    pub fn new(factory: Arc<dyn SftpSessionFactory>, pool_config: SftpPoolConfig) -> Self {
        Self {
            pool: SftpPool::new(factory, pool_config),
        }
    }

    /// Handler backed by real ssh2 sessions.
    #[cfg(feature = "sftp")]
    pub fn with_ssh2(pool_config: SftpPoolConfig) -> Self {
        Self::new(Arc::new(ssh2_factory::Ssh2SessionFactory), pool_config)
    }

    pub fn pool(&self) -> &SftpPool {
        &self.pool
    }

    /// Drain the pool. Call before dropping the handler on shutdown.
    pub async fn cleanup(&self) {
        self.pool.cleanup().await;
    }

    fn sftp_config<'a>(&self, config: &'a DestinationConfig) -> Option<&'a SftpConfig> {
        match config {
            DestinationConfig::Sftp(cfg) => Some(cfg),
            _ => None,
        }
    }

    fn validate_sftp(cfg: &SftpConfig) -> ValidationReport {
        let mut report = ValidationReport::ok();
        if cfg.host.trim().is_empty() {
            report.error("sftp host is required");
        }
        if cfg.port == 0 {
            report.error("sftp port must be non-zero");
        }
        if cfg.username.trim().is_empty() {
            report.error("sftp username is required");
        }
        match &cfg.auth {
            SftpAuth::Password { password } if password.is_empty() => {
                report.error("sftp password must not be empty");
            }
            SftpAuth::PrivateKey { private_key, .. } if private_key.trim().is_empty() => {
                report.error("sftp private key must not be empty");
            }
            _ => {}
        }
        if cfg.remote_path.trim().is_empty() {
            report.error("sftp remote path is required");
        }
        if cfg.remote_path.split('/').any(|segment| segment == "..") {
            report.error("sftp remote path must not contain '..' segments");
        }
        if !cfg.remote_path.starts_with('/') {
            report.warning("sftp remote path is relative to the login directory");
        }
        if cfg.filename_template.trim().is_empty() {
            report.error("sftp filename template is required");
        }
        if cfg.filename_template.contains('/') || cfg.filename_template.contains("..") {
            report.error("sftp filename template must be a bare filename");
        }
        if cfg.connect_timeout_secs == 0 || cfg.connect_timeout_secs > 300 {
            report.error("sftp connect timeout must be between 1 and 300 seconds");
        }
        report
    }

    /// Create every missing directory on the way to `path`.
    async fn ensure_dir_all(
        session: &mut Box<dyn SftpSession>,
        path: &str,
    ) -> Result<(), TransportError> {
        let absolute = path.starts_with('/');
        let mut current = if absolute { String::from("/") } else { String::new() };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(segment);
            session.ensure_dir(&current, DIR_MODE).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for SftpHandler {
    fn transport(&self) -> Transport {
        Transport::Sftp
    }

    fn validate_config(&self, config: &DestinationConfig) -> ValidationReport {
        match self.sftp_config(config) {
            Some(cfg) => Self::validate_sftp(cfg),
            None => ValidationReport::wrong_transport(Transport::Sftp),
        }
    }

    async fn test_connection(&self, config: &DestinationConfig) -> ConnectionTest {
        let report = self.validate_config(config);
        if !report.is_valid {
            return ConnectionTest::failed(report.errors.join("; "), 0);
        }
        let cfg = match self.sftp_config(config) {
            Some(cfg) => cfg,
            None => return ConnectionTest::failed("expected sftp configuration", 0),
        };

        let started = Instant::now();
        let timeout = Duration::from_secs(cfg.connect_timeout_secs);
        match self.pool.factory.connect(cfg, timeout).await {
            Ok(mut session) => {
                let probe = session.ensure_dir(cfg.remote_path.trim_end_matches('/'), DIR_MODE).await;
                session.close().await;
                match probe {
                    Ok(()) => ConnectionTest::ok(elapsed_ms(started)).with_details(json!({
                        "host": cfg.host,
                        "remote_path": cfg.remote_path,
                    })),
                    Err(err) => ConnectionTest::failed(err.message, elapsed_ms(started)),
                }
            }
            Err(err) => ConnectionTest::failed(err.message, elapsed_ms(started)),
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
        let cfg = match self.sftp_config(config) {
            Some(cfg) => cfg,
            None => return DeliveryResult::config_failure(&["expected sftp configuration".into()]),
        };

        let started = Instant::now();

        let filename = match resolve_storage_key(
            &cfg.filename_template,
            payload,
            OffsetDateTime::now_utc(),
        ) {
            Ok(filename) => filename,
            Err(err) => return DeliveryResult::failed(err, false, elapsed_ms(started)),
        };
        let remote_dir = cfg.remote_path.trim_end_matches('/');
        let remote_file = format!("{remote_dir}/{filename}");

        let timestamp = crate::signing::now_rfc3339();
        let idempotency_key = payload
            .idempotency_key
            .clone()
            .unwrap_or_else(|| crate::signing::idempotency_key(&payload.delivery_id, &timestamp));
        let bytes = match serde_json::to_vec(&payload.wire_body(&timestamp, &idempotency_key)) {
            Ok(bytes) => bytes,
            Err(err) => {
                return DeliveryResult::failed(
                    format!("payload serialization failed: {err}"),
                    false,
                    elapsed_ms(started),
                )
            }
        };

        let mut session = match self.pool.acquire(cfg).await {
            Ok(session) => session,
            Err(err) => {
                return DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started))
            }
        };

        let outcome = async {
            Self::ensure_dir_all(&mut session, remote_dir).await?;
            session.upload(&remote_file, &bytes, FILE_MODE).await?;
            let remote = session.remote_size(&remote_file).await?;
            Ok::<u64, TransportError>(remote)
        }
        .await;

        match outcome {
            Ok(remote) if remote == bytes.len() as u64 => {
                self.pool.release(cfg, session, true).await;
                DeliveryResult::delivered(elapsed_ms(started), Some(remote_file))
            }
            Ok(remote) => {
                // Silent corruption, not a transient fault. A blind retry
                // would repeat it.
                self.pool.release(cfg, session, false).await;
                DeliveryResult::failed(
                    format!(
                        "integrity check failed: remote size {remote} != local size {}",
                        bytes.len()
                    ),
                    false,
                    elapsed_ms(started),
                )
            }
            Err(err) => {
                self.pool.release(cfg, session, false).await;
                DeliveryResult::failed(err.message, err.retryable, elapsed_ms(started))
            }
        }
    }

    fn supports_feature(&self, feature: &str) -> bool {
        matches!(
            feature,
            "integrity_check" | "connection_pooling" | "permissions" | "directory_creation"
        )
    }

    fn config_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "title": "SFTP delivery configuration",
            "required": ["host", "username", "auth", "remote_path"],
            "properties": {
                "host": { "type": "string" },
                "port": { "type": "integer", "minimum": 1, "maximum": 65535, "default": 22 },
                "username": { "type": "string" },
                "auth": {
                    "type": "object",
                    "properties": {
                        "method": { "type": "string", "enum": ["password", "private_key"] },
                        "password": { "type": "string" },
                        "private_key": { "type": "string" },
                        "passphrase": { "type": "string" }
                    }
                },
                "remote_path": { "type": "string" },
                "filename_template": { "type": "string", "default": default_filename_template() },
                "connect_timeout_secs": { "type": "integer", "minimum": 1, "maximum": 300, "default": 10 }
            }
        })
    }
}

#[cfg(feature = "sftp")]
mod ssh2_factory {
    use std::io::Write;
    use std::net::{TcpStream, ToSocketAddrs};
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{SftpAuth, SftpConfig, SftpSession, SftpSessionFactory};
    use crate::error::TransportError;

    /// Session factory backed by libssh2.
    ///
    /// Session operations run under `block_in_place`, so this factory
    /// requires the multi-thread runtime.
    pub struct Ssh2SessionFactory;

    #[async_trait]
    impl SftpSessionFactory for Ssh2SessionFactory {
        async fn connect(
            &self,
            config: &SftpConfig,
            timeout: Duration,
        ) -> Result<Box<dyn SftpSession>, TransportError> {
            let config = config.clone();
            let session = tokio::task::spawn_blocking(move || open_session(&config, timeout))
                .await
                .map_err(|err| TransportError::transient(format!("sftp connect task: {err}")))??;
            Ok(Box::new(session))
        }
    }

    fn open_session(config: &SftpConfig, timeout: Duration) -> Result<Ssh2Session, TransportError> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|err| TransportError::classify(format!("sftp resolve {addr}: {err}")))?
            .next()
            .ok_or_else(|| TransportError::terminal(format!("sftp host {addr} did not resolve")))?;

        let tcp = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|err| TransportError::classify(format!("sftp connect {addr}: {err}")))?;
        tcp.set_read_timeout(Some(timeout))
            .map_err(|err| TransportError::transient(format!("sftp socket setup: {err}")))?;
        tcp.set_write_timeout(Some(timeout))
            .map_err(|err| TransportError::transient(format!("sftp socket setup: {err}")))?;

        let mut session = ssh2::Session::new()
            .map_err(|err| TransportError::transient(format!("sftp session init: {err}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| TransportError::classify(format!("sftp handshake: {err}")))?;

        match &config.auth {
            SftpAuth::Password { password } => session
                .userauth_password(&config.username, password)
                .map_err(|err| {
                    TransportError::terminal(format!("sftp authentication failed: {err}"))
                })?,
            SftpAuth::PrivateKey {
                private_key,
                passphrase,
            } => session
                .userauth_pubkey_memory(
                    &config.username,
                    None,
                    private_key,
                    passphrase.as_deref(),
                )
                .map_err(|err| {
                    TransportError::terminal(format!("sftp authentication failed: {err}"))
                })?,
        }
        if !session.authenticated() {
            return Err(TransportError::terminal("sftp authentication failed"));
        }

        let sftp = session
            .sftp()
            .map_err(|err| TransportError::classify(format!("sftp subsystem: {err}")))?;

        Ok(Ssh2Session {
            _session: session,
            sftp,
        })
    }

    struct Ssh2Session {
        // Held so the transport outlives the sftp channel.
        _session: ssh2::Session,
        sftp: ssh2::Sftp,
    }

    fn map_ssh2(err: ssh2::Error, context: &str) -> TransportError {
        TransportError::classify(format!("{context}: {err}"))
    }

    #[async_trait]
    impl SftpSession for Ssh2Session {
        async fn ensure_dir(&mut self, path: &str, mode: i32) -> Result<(), TransportError> {
            tokio::task::block_in_place(|| {
                if self.sftp.stat(Path::new(path)).is_ok() {
                    return Ok(());
                }
                self.sftp
                    .mkdir(Path::new(path), mode)
                    .map_err(|err| map_ssh2(err, "sftp mkdir"))
            })
        }

        async fn upload(
            &mut self,
            path: &str,
            data: &[u8],
            mode: i32,
        ) -> Result<(), TransportError> {
            tokio::task::block_in_place(|| {
                let mut file = self
                    .sftp
                    .open_mode(
                        Path::new(path),
                        ssh2::OpenFlags::WRITE
                            | ssh2::OpenFlags::CREATE
                            | ssh2::OpenFlags::TRUNCATE,
                        mode,
                        ssh2::OpenType::File,
                    )
                    .map_err(|err| map_ssh2(err, "sftp open"))?;
                file.write_all(data)
                    .map_err(|err| TransportError::classify(format!("sftp write: {err}")))?;
                drop(file);

                let stat = ssh2::FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(mode as u32),
                    atime: None,
                    mtime: None,
                };
                self.sftp
                    .setstat(Path::new(path), stat)
                    .map_err(|err| map_ssh2(err, "sftp chmod"))
            })
        }

        async fn remote_size(&mut self, path: &str) -> Result<u64, TransportError> {
            tokio::task::block_in_place(|| {
                let stat = self
                    .sftp
                    .stat(Path::new(path))
                    .map_err(|err| map_ssh2(err, "sftp stat"))?;
                stat.size
                    .ok_or_else(|| TransportError::terminal("sftp stat returned no size"))
            })
        }

        async fn close(&mut self) {
            // Dropping the session tears down the transport.
        }
    }
}
