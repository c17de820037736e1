//! Server configuration.
//!
//! Configuration is layered:
//! - TOML file (`beacon.toml`, `/etc/beacon/beacon.toml`,
//!   `~/.config/beacon/beacon.toml`, or an explicit path)
//! - Environment variables (`BEACON_*`, nested keys separated by `__`,
//!   e.g. `BEACON_PRESENCE__TTL_SECS=30`)
//! - `JWT_SECRET` when no secret is configured

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default config file locations, in search order.
const CONFIG_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Environment variable consulted when `auth.jwt_secret` is unset.
pub const JWT_SECRET_ENV: &str = "JWT_SECRET";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence tracking.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Token authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enable the HTTP polling fallback.
    #[serde(default = "default_true")]
    pub polling: bool,

    /// Base path for the polling endpoints.
    #[serde(default = "default_polling_path")]
    pub polling_path: String,

    /// How long a poll request waits for frames.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Close a polling session after this long without requests.
    #[serde(default = "default_polling_idle_timeout")]
    pub polling_idle_timeout_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Buffered messages per topic channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Buffered deliveries per session before new ones are dropped.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval the server offers in the `heart-beat` header, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close a connection after this long without inbound frames.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Session lease length in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,

    /// How often expired leases are swept, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Topic ONLINE/OFFLINE transitions are published to. An empty string
    /// disables publishing.
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: Option<String>,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens.
    #[serde(default, skip_serializing)]
    pub jwt_secret: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_polling_path() -> String {
    "/ws-sockjs".to_string()
}

fn default_poll_timeout() -> u64 {
    25_000
}

fn default_polling_idle_timeout() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_channels() -> usize {
    10_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_session_queue_capacity() -> usize {
    256
}

fn default_heartbeat_interval() -> u64 {
    10_000 // 10 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_broadcast_topic() -> Option<String> {
    Some("/topic/presence".to_string())
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            polling: true,
            polling_path: default_polling_path(),
            poll_timeout_ms: default_poll_timeout(),
            polling_idle_timeout_ms: default_polling_idle_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels: default_max_channels(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            channel_capacity: default_channel_capacity(),
            session_queue_capacity: default_session_queue_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            broadcast_topic: default_broadcast_topic(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl PresenceConfig {
    /// Session lease length.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval, never shorter than one second.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Presence topic, if publishing is enabled.
    #[must_use]
    pub fn broadcast_topic(&self) -> Option<&str> {
        self.broadcast_topic.as_deref().filter(|t| !t.is_empty())
    }
}

impl AuthConfig {
    /// The configured secret, falling back to `JWT_SECRET`.
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        self.jwt_secret
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var(JWT_SECRET_ENV).ok())
            .filter(|s| !s.trim().is_empty())
    }
}

impl Config {
    /// Load configuration from the first default path that exists,
    /// layered with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = Path::new(expanded.as_ref());
            if path.exists() {
                return Self::build(Some(path));
            }
        }

        // Fall back to defaults with environment overrides
        Self::build(None)
    }

    /// Load configuration from a specific file, layered with environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).into_owned();
        Self::build(Some(Path::new(&expanded)))
    }

    fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BEACON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let source = match file {
            Some(path) => path.display().to_string(),
            None => "environment".to_string(),
        };
        let config: Config = builder
            .build()
            .with_context(|| format!("Failed to read config from {source}"))?
            .try_deserialize()
            .with_context(|| format!("Failed to parse config from {source}"))?;

        Ok(config)
    }

    /// Render the effective configuration as TOML. Secrets are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
