use crate::router::AuthMode;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, thread pool and shutdown settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Credential validation and cookie settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// How per-user backend sessions are launched and supervised
    #[serde(default)]
    pub session: SessionConfig,

    /// Proxied URI prefixes. Empty means the built-in set from [`default_routes`].
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Runtime worker threads servicing connections
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Upper bound on threads used by blocking handlers
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,

    /// Largest request body accepted by a blocking handler
    #[serde(default = "default_max_blocking_body_bytes")]
    pub max_blocking_body_bytes: usize,

    /// Interval of the dead-session sweep in milliseconds
    #[serde(default = "default_scheduled_command_interval")]
    pub scheduled_command_interval_ms: u64,

    /// Time given to in-flight requests after a shutdown signal
    #[serde(default = "default_server_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Directory served by the default static handler (optional)
    pub www_root: Option<String>,

    /// Answer every request with the offline page; no sessions are launched
    #[serde(default)]
    pub offline: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn scheduled_command_interval(&self) -> Duration {
        Duration::from_millis(self.scheduled_command_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            worker_threads: default_worker_threads(),
            max_blocking_threads: default_max_blocking_threads(),
            max_blocking_body_bytes: default_max_blocking_body_bytes(),
            scheduled_command_interval_ms: default_scheduled_command_interval(),
            shutdown_grace_period_secs: default_server_grace_period(),
            www_root: None,
            offline: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC secret for session cookies. A random one is generated when unset,
    /// which invalidates every cookie on restart.
    pub secret: Option<String>,

    /// Name of the session cookie
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Lifetime of issued tokens in hours
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,

    /// Mark cookies `Secure`
    #[serde(default)]
    pub cookie_secure: bool,

    /// Where `redirect` routes send unauthenticated browsers
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Static bearer tokens mapped to the identity they authenticate
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            cookie_name: default_cookie_name(),
            token_expiry_hours: default_token_expiry_hours(),
            cookie_secure: false,
            login_url: default_login_url(),
            tokens: HashMap::new(),
        }
    }
}

/// Transport a session backend listens on
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// Loopback TCP port from `port_range_start..=port_range_end` (default)
    #[default]
    Tcp,
    /// Unix-domain socket under `socket_dir`
    Unix,
}

/// Configuration for launching session backends
///
/// # Security Warning
///
/// `command` and `args` are executed directly for every user that signs in.
/// Configuration files must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Program started for each session
    #[serde(default)]
    pub command: String,

    /// Arguments; `{user}`, `{port}` and `{endpoint}` are substituted
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the backend
    pub working_dir: Option<String>,

    /// Endpoint transport
    #[serde(default)]
    pub endpoint: EndpointType,

    /// First loopback port handed to sessions
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last loopback port handed to sessions
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Directory for unix-domain session sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Time a backend gets to start accepting connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Interval between readiness probes
    #[serde(default = "default_ready_check_interval")]
    pub ready_check_interval_ms: u64,

    /// When set, readiness also requires `GET <health_path>` to answer 2xx
    pub health_path: Option<String>,

    /// Ceiling on launches in progress at the same time
    #[serde(default = "default_max_concurrent_launches")]
    pub max_concurrent_launches: usize,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Wait for in-flight requests before terminating a session
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Sessions without traffic for this long are terminated (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Maximum wait for a backend's response head (0 disables)
    #[serde(default)]
    pub request_timeout_secs: u64,
}

impl SessionConfig {
    /// Create a session config running `command` with defaults everywhere else
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn ready_check_interval(&self) -> Duration {
        Duration::from_millis(self.ready_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn socket_dir(&self) -> PathBuf {
        PathBuf::from(&self.socket_dir)
    }

    /// Validate the session configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("session: 'command' is required".to_string());
        }
        if self.endpoint == EndpointType::Tcp {
            if self.port_range_start == 0 {
                errors.push("session: 'port_range_start' must be greater than 0".to_string());
            }
            if self.port_range_end < self.port_range_start {
                errors.push(format!(
                    "session: port range {}..={} is empty",
                    self.port_range_start, self.port_range_end
                ));
            }
        }
        if self.max_concurrent_launches == 0 {
            errors.push("session: 'max_concurrent_launches' must be at least 1".to_string());
        }
        if self.startup_timeout_ms == 0 {
            errors.push("session: 'startup_timeout_ms' must be greater than 0".to_string());
        }
        if self.ready_check_interval_ms == 0 {
            errors.push("session: 'ready_check_interval_ms' must be greater than 0".to_string());
        }
        if let Some(path) = &self.health_path {
            if !path.starts_with('/') {
                errors.push(format!("session: health_path '{}' must start with '/'", path));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            endpoint: EndpointType::default(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            socket_dir: default_socket_dir(),
            startup_timeout_ms: default_startup_timeout(),
            ready_check_interval_ms: default_ready_check_interval(),
            health_path: None,
            max_concurrent_launches: default_max_concurrent_launches(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            drain_timeout_secs: default_drain_timeout(),
            idle_timeout_secs: 0,
            request_timeout_secs: 0,
        }
    }
}

/// A URI prefix proxied to the caller's session
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    pub prefix: String,
    /// What happens to unauthenticated requests (default: reject with 401)
    #[serde(default = "default_route_auth")]
    pub auth: AuthMode,
}

impl RouteConfig {
    pub fn new(prefix: &str, auth: AuthMode) -> Self {
        Self {
            prefix: prefix.to_string(),
            auth,
        }
    }
}

/// Prefixes proxied when the configuration names none. RPC-style endpoints
/// answer 401; pages a browser may open directly redirect to sign-in.
pub fn default_routes() -> Vec<RouteConfig> {
    let reject = ["/rpc", "/events", "/graphics", "/upload", "/export", "/content"];
    let redirect = ["/files", "/help", "/session", "/custom", "/p/"];

    reject
        .iter()
        .map(|p| RouteConfig::new(p, AuthMode::Reject))
        .chain(redirect.iter().map(|p| RouteConfig::new(p, AuthMode::Redirect)))
        .collect()
}

// Default value functions
fn default_listen_port() -> u16 {
    8787
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_max_blocking_threads() -> usize {
    16
}

fn default_max_blocking_body_bytes() -> usize {
    1024 * 1024
}

fn default_scheduled_command_interval() -> u64 {
    500
}

fn default_server_grace_period() -> u64 {
    10
}

fn default_cookie_name() -> String {
    "sessiongate_session".to_string()
}

fn default_token_expiry_hours() -> i64 {
    24
}

fn default_login_url() -> String {
    "/auth-sign-in".to_string()
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    29999
}

fn default_socket_dir() -> String {
    "/tmp/sessiongate".to_string()
}

fn default_startup_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_ready_check_interval() -> u64 {
    100
}

fn default_max_concurrent_launches() -> usize {
    8
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_route_auth() -> AuthMode {
    AuthMode::Reject
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Routes from the file, or the built-in set when none are configured
    pub fn effective_routes(&self) -> Vec<RouteConfig> {
        if self.routes.is_empty() {
            default_routes()
        } else {
            self.routes.clone()
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(session_errors) = self.session.validate() {
            errors.extend(session_errors);
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.server.worker_threads == 0 {
            errors.push("server: 'worker_threads' must be at least 1".to_string());
        }
        if self.server.max_blocking_threads == 0 {
            errors.push("server: 'max_blocking_threads' must be at least 1".to_string());
        }
        if self.server.scheduled_command_interval_ms == 0 {
            errors.push("server: 'scheduled_command_interval_ms' must be greater than 0".to_string());
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                errors.push(format!("routes: prefix '{}' must start with '/'", route.prefix));
            }
            if route.auth == AuthMode::Public {
                errors.push(format!(
                    "routes: proxied prefix '{}' cannot be public",
                    route.prefix
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
