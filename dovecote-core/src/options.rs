//! Server configuration options.
//!
//! The broker does not parse flags or configuration files; the embedding
//! harness resolves those and hands the broker a `ServerOptions` at
//! construction.

use std::path::PathBuf;
use std::time::Duration;

/// Default listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listen port
pub const DEFAULT_PORT: u16 = 4222;
/// Size of the per-session buffered writer and read buffer
pub const BUF_SIZE: usize = 32 * 1024;
/// How long a session may sit unauthenticated before eviction
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);
/// Interval between server-initiated pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
/// Unanswered pings tolerated before a connection is considered stale
pub const DEFAULT_PING_MAX_OUT: i32 = 2;
/// Bound on any single flush of a session writer
pub const DEFAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(2);
/// Largest accepted message payload
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Broker configuration.
///
/// # Examples
///
/// ```
/// use dovecote_core::options::ServerOptions;
/// use std::time::Duration;
///
/// let opts = ServerOptions::default()
///     .with_port(0)
///     .with_auth_token("s3cret")
///     .with_flush_deadline(Duration::from_millis(500));
/// assert!(opts.auth_required());
/// ```
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Network host to listen on
    pub host: String,

    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Username required from clients, paired with `password`
    pub username: Option<String>,

    /// Password paired with `username`
    pub password: Option<String>,

    /// Token-based authorization; ignored when `username` is set
    pub auth_token: Option<String>,

    /// Time allowed between accept and a valid `CONNECT`
    pub auth_timeout: Duration,

    /// Interval between server pings on an active session
    pub ping_interval: Duration,

    /// Unanswered pings tolerated before "Stale Connection"
    pub max_pings_out: i32,

    /// Write deadline applied when flushing a session writer
    pub flush_deadline: Duration,

    /// Largest accepted message payload in bytes
    pub max_payload: usize,

    /// Log destination for the embedding harness; the broker itself only
    /// emits `tracing` events
    pub log_file: Option<PathBuf>,

    /// Where the binary writes its PID, when set
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            auth_token: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_PING_MAX_OUT,
            flush_deadline: DEFAULT_FLUSH_DEADLINE,
            max_payload: MAX_PAYLOAD_SIZE,
            log_file: None,
            pid_file: None,
        }
    }
}

impl ServerOptions {
    /// Create options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Require username/password credentials.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Require a token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the authentication deadline.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Set the ping interval.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set how many unanswered pings are tolerated.
    pub fn with_max_pings_out(mut self, max: i32) -> Self {
        self.max_pings_out = max;
        self
    }

    /// Set the writer flush deadline.
    pub fn with_flush_deadline(mut self, deadline: Duration) -> Self {
        self.flush_deadline = deadline;
        self
    }

    /// Set the maximum accepted payload size.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Set the log destination passed through to the harness.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Set the PID file path.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Whether clients must authenticate.
    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.username.is_some() || self.auth_token.is_some()
    }
}
