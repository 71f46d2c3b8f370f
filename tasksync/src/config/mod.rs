//! Client configuration.
//!
//! Each setting is taken from the first source that provides it: a
//! command-line flag, its `TASKSYNC_*` environment variable, the TOML file
//! (`~/.config/tasksync/config.toml`, or the `--config` path), or the
//! built-in default. The default file may be absent; a `--config` file must
//! exist.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tasksync_proto::tombstone::TOMBSTONE_RETENTION;

use crate::sync::SyncConfig;
use crate::transport::TransportKind;
use crate::transport::backoff::BackoffPolicy;

/// Errors raised while building the client configuration.
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

    /// A setting has an unusable value.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted name of the setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Config file layout
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    account: AccountFileConfig,
    remote: RemoteFileConfig,
    sync: SyncFileConfig,
    poll: PollFileConfig,
    storage: StorageFileConfig,
}

/// `[account]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AccountFileConfig {
    id: Option<String>,
    token: Option<String>,
    device_id: Option<String>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    url: Option<String>,
    transport: Option<String>,
    request_timeout_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    debounce_ms: Option<u64>,
    bootstrap_delay_ms: Option<u64>,
    republish_delay_secs: Option<u64>,
    tombstone_retention_days: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[poll]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PollFileConfig {
    floor_secs: Option<u64>,
    ceiling_secs: Option<u64>,
    multiplier: Option<f64>,
    error_threshold: Option<u32>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    data_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Effective configuration
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Account --
    /// Account to sign in as. `None` keeps the client local-only.
    pub account: Option<String>,
    /// Bearer token for the account.
    pub token: Option<String>,
    /// Fixed device identifier; generated and stored in `data_dir` if unset.
    pub device_id: Option<String>,

    // -- Remote --
    /// Base URL of the document server.
    pub remote_url: Option<String>,
    /// How remote changes are observed.
    pub transport: TransportKind,
    /// Timeout of a single remote request.
    pub request_timeout: Duration,

    // -- Sync --
    /// Orchestrator timing.
    pub sync: SyncConfig,
    /// Poll interval and failure policy.
    pub poll: BackoffPolicy,

    // -- Storage --
    /// Directory holding the document snapshot and device id.
    pub data_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            account: None,
            token: None,
            device_id: None,
            remote_url: None,
            transport: TransportKind::default(),
            request_timeout: Duration::from_secs(15),
            sync: SyncConfig::default(),
            poll: BackoffPolicy::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl ClientConfig {
    /// Builds the effective configuration from `cli` and the config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or a setting is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let transport = match cli.transport.as_ref().or(file.remote.transport.as_ref()) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                field: "remote.transport",
                reason,
            })?,
            None => defaults.transport,
        };

        let sync = SyncConfig {
            debounce: file
                .sync
                .debounce_ms
                .map_or(defaults.sync.debounce, Duration::from_millis),
            bootstrap_delay: file
                .sync
                .bootstrap_delay_ms
                .map_or(defaults.sync.bootstrap_delay, Duration::from_millis),
            republish_delay: file
                .sync
                .republish_delay_secs
                .map_or(defaults.sync.republish_delay, Duration::from_secs),
            tombstone_retention: file
                .sync
                .tombstone_retention_days
                .map_or(TOMBSTONE_RETENTION, |days| {
                    DAY.saturating_mul(u32::try_from(days).unwrap_or(u32::MAX))
                }),
            channel_capacity: file
                .sync
                .channel_capacity
                .unwrap_or(defaults.sync.channel_capacity),
        };
        if sync.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        let poll = BackoffPolicy {
            floor: file
                .poll
                .floor_secs
                .map_or(defaults.poll.floor, Duration::from_secs),
            ceiling: file
                .poll
                .ceiling_secs
                .map_or(defaults.poll.ceiling, Duration::from_secs),
            multiplier: file.poll.multiplier.unwrap_or(defaults.poll.multiplier),
            error_threshold: file
                .poll
                .error_threshold
                .unwrap_or(defaults.poll.error_threshold),
        };
        validate_poll(&poll)?;

        Ok(Self {
            account: cli.account.clone().or_else(|| file.account.id.clone()),
            token: cli.token.clone().or_else(|| file.account.token.clone()),
            device_id: file.account.device_id.clone(),
            remote_url: cli.remote_url.clone().or_else(|| file.remote.url.clone()),
            transport,
            request_timeout: file
                .remote
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            sync,
            poll,
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.storage.data_dir.clone())
                .unwrap_or(defaults.data_dir),
        })
    }

    /// Returns the account, remote URL and token when all three are set.
    ///
    /// `None` means the client runs local-only.
    #[must_use]
    pub fn remote_account(&self) -> Option<(&str, &str, &str)> {
        let account = self.account.as_deref().filter(|a| !a.is_empty())?;
        let url = self.remote_url.as_deref()?;
        let token = self.token.as_deref()?;
        Some((account, url, token))
    }
}

fn validate_poll(poll: &BackoffPolicy) -> Result<(), ConfigError> {
    if poll.floor.is_zero() {
        return Err(ConfigError::Invalid {
            field: "poll.floor_secs",
            reason: "must be positive".to_string(),
        });
    }
    if poll.ceiling < poll.floor {
        return Err(ConfigError::Invalid {
            field: "poll.ceiling_secs",
            reason: format!(
                "{}s is below the floor of {}s",
                poll.ceiling.as_secs(),
                poll.floor.as_secs()
            ),
        });
    }
    if !(poll.multiplier >= 1.0 && poll.multiplier.is_finite()) {
        return Err(ConfigError::Invalid {
            field: "poll.multiplier",
            reason: format!("{} must be a finite number >= 1", poll.multiplier),
        });
    }
    if poll.error_threshold == 0 {
        return Err(ConfigError::Invalid {
            field: "poll.error_threshold",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().map_or_else(|| PathBuf::from(".tasksync"), |dir| dir.join("tasksync"))
}

/// Command-line interface of the `tasksync` binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first task lists that sync across devices")]
pub struct CliArgs {
    /// What to do (default: `show`).
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Account to sync as.
    #[arg(long, env = "TASKSYNC_ACCOUNT", global = true)]
    pub account: Option<String>,

    /// Bearer token for the account.
    #[arg(long, env = "TASKSYNC_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Base URL of the document server.
    #[arg(long, env = "TASKSYNC_REMOTE_URL", global = true)]
    pub remote_url: Option<String>,

    /// How to observe remote changes (`poll` or `push`).
    #[arg(long, global = true)]
    pub transport: Option<String>,

    /// Directory for the local snapshot (default: platform data dir).
    #[arg(long, env = "TASKSYNC_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/tasksync/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKSYNC_LOG", global = true)]
    pub log_level: String,

    /// Log to this file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Client subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Sign in and keep syncing until interrupted.
    Sync,
    /// Print every list and item.
    Show,
    /// Create a list.
    AddList {
        /// Title of the new list.
        title: String,
    },
    /// Add an item to a list.
    AddItem {
        /// List id (or unambiguous prefix).
        list: String,
        /// Item text.
        content: String,
    },
    /// Flip an item's completion flag.
    Toggle {
        /// Item id (or unambiguous prefix).
        item: String,
    },
    /// Delete a list and everything in it.
    DeleteList {
        /// List id (or unambiguous prefix).
        list: String,
    },
    /// Delete an item.
    DeleteItem {
        /// Item id (or unambiguous prefix).
        item: String,
    },
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Reads the config file, falling back to an empty one when the default
/// file does not exist.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match explicit_path {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("tasksync").join("config.toml"), false),
            None => return Ok(ConfigFile::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(ConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
