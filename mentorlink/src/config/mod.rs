//! Configuration system for the `MentorLink` engine.
//!
//! Supports layered configuration with the following priority (highest
//! first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/mentorlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use mentorlink_proto::envelope::UserId;

use crate::connection::ConnectionConfig;
use crate::connection::backoff::ReconnectPolicy;
use crate::history::HistorySettings;
use crate::sync::SyncSettings;
use crate::transport::SessionIdentity;

/// Errors that can occur when loading configuration.
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

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    session: SessionFileConfig,
    connection: ConnectionFileConfig,
    sync: SyncFileConfig,
    history: HistoryFileConfig,
    storage: StorageFileConfig,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<String>,
    auth_token: Option<String>,
    device_name: Option<String>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    server_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    heartbeat_secs: Option<u64>,
    reconnect_base_ms: Option<u64>,
    reconnect_max_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    reconnect_jitter: Option<f64>,
    queue_capacity: Option<usize>,
    queue_enabled: Option<bool>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    interval_secs: Option<u64>,
    batch_delay_ms: Option<u64>,
    max_retries: Option<u32>,
    pull_limit: Option<u32>,
}

/// `[history]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HistoryFileConfig {
    page_size: Option<u32>,
    max_cached: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    path: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Realtime server WebSocket URL, when live mode is wanted.
    pub server_url: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Bearer token for the session handshake.
    pub auth_token: Option<String>,
    /// Device label presented during the handshake.
    pub device_name: String,
    /// Durable store location; `None` means the per-user data directory.
    pub storage_path: Option<PathBuf>,
    /// Connection manager settings.
    pub connection: ConnectionConfig,
    /// Sync coordinator settings.
    pub sync: SyncSettings,
    /// History cache settings.
    pub history: HistorySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            user_id: None,
            auth_token: None,
            device_name: "mentorlink-device".to_string(),
            storage_path: None,
            connection: ConnectionConfig::default(),
            sync: SyncSettings::default(),
            history: HistorySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/mentorlink/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve an `EngineConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let reconnect = ReconnectPolicy {
            base_delay: file
                .connection
                .reconnect_base_ms
                .map_or(defaults.connection.reconnect.base_delay, Duration::from_millis),
            max_delay: file
                .connection
                .reconnect_max_secs
                .map_or(defaults.connection.reconnect.max_delay, Duration::from_secs),
            jitter: file
                .connection
                .reconnect_jitter
                .unwrap_or(defaults.connection.reconnect.jitter),
            max_attempts: file
                .connection
                .reconnect_max_attempts
                .unwrap_or(defaults.connection.reconnect.max_attempts),
        };

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.connection.server_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.session.user_id.clone()),
            auth_token: cli
                .auth_token
                .clone()
                .or_else(|| file.session.auth_token.clone()),
            device_name: file
                .session
                .device_name
                .clone()
                .unwrap_or(defaults.device_name),
            storage_path: cli
                .storage_path
                .clone()
                .or_else(|| file.storage.path.clone().map(PathBuf::from)),
            connection: ConnectionConfig {
                connect_timeout: file
                    .connection
                    .connect_timeout_secs
                    .map_or(defaults.connection.connect_timeout, Duration::from_secs),
                heartbeat_interval: file
                    .connection
                    .heartbeat_secs
                    .map_or(defaults.connection.heartbeat_interval, Duration::from_secs),
                reconnect,
                queue_capacity: file
                    .connection
                    .queue_capacity
                    .unwrap_or(defaults.connection.queue_capacity),
                queue_enabled: file
                    .connection
                    .queue_enabled
                    .unwrap_or(defaults.connection.queue_enabled),
                event_buffer: defaults.connection.event_buffer,
            },
            sync: SyncSettings {
                interval: file
                    .sync
                    .interval_secs
                    .map_or(defaults.sync.interval, Duration::from_secs),
                batch_delay: file
                    .sync
                    .batch_delay_ms
                    .map_or(defaults.sync.batch_delay, Duration::from_millis),
                max_retries: file.sync.max_retries.unwrap_or(defaults.sync.max_retries),
                pull_limit: file.sync.pull_limit.unwrap_or(defaults.sync.pull_limit),
                event_buffer: defaults.sync.event_buffer,
            },
            history: HistorySettings {
                page_size: file.history.page_size.unwrap_or(defaults.history.page_size),
                max_cached: file
                    .history
                    .max_cached
                    .unwrap_or(defaults.history.max_cached),
            },
        }
    }

    /// Builds the session identity, if the required fields are present.
    #[must_use]
    pub fn identity(&self) -> Option<SessionIdentity> {
        let user_id = self.user_id.clone()?;
        let auth_token = self.auth_token.clone()?;
        if user_id.is_empty() {
            return None;
        }
        Some(SessionIdentity::new(
            UserId::new(user_id),
            auth_token,
            self.device_name.clone(),
        ))
    }

    /// Resolves the durable store path, falling back to the per-user data
    /// directory.
    #[must_use]
    pub fn resolved_storage_path(&self) -> Option<PathBuf> {
        self.storage_path.clone().or_else(|| {
            dirs::data_dir().map(|dir| dir.join("mentorlink").join("messages.db3"))
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first messaging engine for MentorLink")]
pub struct CliArgs {
    /// WebSocket URL of the realtime server.
    #[arg(long, env = "MENTORLINK_SERVER_URL")]
    pub server_url: Option<String>,

    /// Local user id.
    #[arg(long, env = "MENTORLINK_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token for the session handshake.
    #[arg(long, env = "MENTORLINK_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Path to the durable message store.
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Path to config file (default: `~/.config/mentorlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MENTORLINK_LOG")]
    pub log_level: String,

    /// Path to a log file; stdout when omitted.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("mentorlink").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
