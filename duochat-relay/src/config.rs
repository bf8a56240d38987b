//! Configuration system for the `DuoChat` relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/duochat-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use duochat_proto::api::UserProfile;
use duochat_proto::message::{MAX_MESSAGE_SIZE, UserId};

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    users: Vec<UserFileEntry>,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
    max_history: Option<usize>,
    grace_period_ms: Option<u64>,
    roster_interval_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

/// One `[[users]]` entry.
#[derive(Debug, serde::Deserialize)]
struct UserFileEntry {
    id: String,
    name: Option<String>,
    profile_pic: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "DuoChat presence and relay server")]
pub struct RelayCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "DUOCHAT_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/duochat-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum request body and socket frame size in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Maximum number of messages kept per conversation.
    #[arg(long)]
    pub max_history: Option<usize>,

    /// Milliseconds a disconnected user stays online awaiting a reconnect (0 disables).
    #[arg(long, env = "DUOCHAT_GRACE_MS")]
    pub grace_period_ms: Option<u64>,

    /// Seconds between roster re-announcements (0 disables).
    #[arg(long)]
    pub roster_interval_secs: Option<u64>,

    /// Seconds between WebSocket pings (0 disables).
    #[arg(long)]
    pub ping_interval_secs: Option<u64>,

    /// Seconds without inbound frames before a socket is dropped (0 disables).
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DUOCHAT_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:5000`).
    pub bind_addr: String,
    /// Maximum request body and socket frame size in bytes.
    pub max_payload_size: usize,
    /// Maximum number of messages kept per conversation.
    pub max_history: usize,
    /// Reconnection grace period.
    pub grace_period: Duration,
    /// Interval between roster re-announcements, if enabled.
    pub roster_interval: Option<Duration>,
    /// Interval between server pings, if enabled.
    pub ping_interval: Option<Duration>,
    /// Inbound silence after which a socket is dropped, if enabled.
    pub idle_timeout: Option<Duration>,
    /// Users known before anyone connects.
    pub users: Vec<UserProfile>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            max_payload_size: MAX_MESSAGE_SIZE,
            max_history: 10_000,
            grace_period: Duration::from_secs(5),
            roster_interval: Some(Duration::from_secs(30)),
            ping_interval: Some(Duration::from_secs(25)),
            idle_timeout: Some(Duration::from_secs(60)),
            users: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();
        let server = &file.server;

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_payload_size: cli
                .max_payload_size
                .or(server.max_payload_size)
                .unwrap_or(defaults.max_payload_size),
            max_history: cli
                .max_history
                .or(server.max_history)
                .unwrap_or(defaults.max_history),
            grace_period: cli
                .grace_period_ms
                .or(server.grace_period_ms)
                .map_or(defaults.grace_period, Duration::from_millis),
            roster_interval: optional_secs(
                cli.roster_interval_secs.or(server.roster_interval_secs),
                defaults.roster_interval,
            ),
            ping_interval: optional_secs(
                cli.ping_interval_secs.or(server.ping_interval_secs),
                defaults.ping_interval,
            ),
            idle_timeout: optional_secs(
                cli.idle_timeout_secs.or(server.idle_timeout_secs),
                defaults.idle_timeout,
            ),
            users: file
                .users
                .iter()
                .filter(|u| !u.id.is_empty())
                .map(|u| UserProfile {
                    id: UserId::new(&u.id),
                    full_name: u.name.clone().unwrap_or_else(|| u.id.clone()),
                    profile_pic: u.profile_pic.clone(),
                })
                .collect(),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Maps a seconds setting to an optional interval where `0` means disabled.
fn optional_secs(value: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match value {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => default,
    }
}

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("duochat-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
