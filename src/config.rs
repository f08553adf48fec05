use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Everything a `solo` process reads from its YAML file.
///
/// Every section is optional; an empty file yields the same values as
/// [`SoloConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoloConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub lease: LeaseSettings,
    /// Socket address for the `/metrics` + `/healthz` listener.  Disabled
    /// when absent.
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable TLS for the Redis connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the Redis password.
    #[serde(default = "default_auth_env")]
    pub auth_token_env: String,
    /// Upper bound (milliseconds) on a single lease command round-trip.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            auth_token_env: default_auth_env(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    crate::coordination::redis::DEFAULT_REDIS_PORT
}

fn default_auth_env() -> String {
    "SOLO_REDIS_AUTH".to_string()
}

fn default_command_timeout_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Whether the controller loops forever or stops after one episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Continuous,
    OneShot,
}

/// Lease section as written in YAML.  The aliases accept the short option
/// names (`ttl`, `ping`, `interval`, `prefix`) older deployments use.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSettings {
    #[serde(default = "default_key_prefix", alias = "prefix")]
    pub key_prefix: String,
    #[serde(default = "default_ttl_ms", alias = "ttl")]
    pub ttl_ms: u64,
    #[serde(default = "default_ping_interval_ms", alias = "ping")]
    pub ping_interval_ms: u64,
    #[serde(default, alias = "interval")]
    pub restart_interval_ms: u64,
    #[serde(default)]
    pub mode: RunMode,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            ttl_ms: default_ttl_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            restart_interval_ms: 0,
            mode: RunMode::default(),
        }
    }
}

impl LeaseSettings {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_millis(self.ttl_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            restart_interval: Duration::from_millis(self.restart_interval_ms),
        }
    }
}

pub const DEFAULT_KEY_PREFIX: &str = "solo";

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl_ms() -> u64 {
    1000
}

fn default_ping_interval_ms() -> u64 {
    1000
}

/// Timing parameters of one controller.  Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a lease stays valid without being extended.
    pub ttl: Duration,
    /// Delay between acquisition attempts while the lease is held elsewhere.
    pub ping_interval: Duration,
    /// Cool-down after an episode before the lease is released and the
    /// next acquisition attempt starts.
    pub restart_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(1000),
            ping_interval: Duration::from_millis(1000),
            restart_interval: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// The name under which mutual exclusion is enforced.  Maps to exactly one
/// coordination-store key, `prefix:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    prefix: String,
    id: String,
}

impl WorkerIdentity {
    pub fn new(prefix: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            id: id.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The coordination-store key for this identity.
    pub fn key(&self) -> String {
        format!("{}:{}", self.prefix, self.id)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.id)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`SoloConfig`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SoloConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`SoloConfig`] from YAML text.
pub fn parse_config(contents: &str) -> Result<SoloConfig> {
    // serde_yaml rejects an empty document; treat it as "all defaults".
    let config: SoloConfig = if contents.trim().is_empty() {
        SoloConfig::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &SoloConfig) -> Result<()> {
    anyhow::ensure!(config.lease.ttl_ms > 0, "lease.ttl_ms must be greater than 0");
    anyhow::ensure!(
        config.lease.ping_interval_ms > 0,
        "lease.ping_interval_ms must be greater than 0"
    );
    anyhow::ensure!(
        !config.lease.key_prefix.is_empty(),
        "lease.key_prefix must not be empty"
    );
    anyhow::ensure!(
        config.redis.command_timeout_ms > 0,
        "redis.command_timeout_ms must be greater than 0"
    );
    Ok(())
}
