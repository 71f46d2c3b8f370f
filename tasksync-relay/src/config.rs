//! Relay server configuration.
//!
//! Values come from, in order of precedence: command-line flags, their
//! `TASKSYNC_RELAY_*` environment variables, the TOML file
//! (`~/.config/tasksync-relay/config.toml` unless `--config` names another),
//! and built-in defaults.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_payload_bytes = 1048576
//! log_level = "info"
//!
//! [auth.tokens]
//! alice = "alice-secret"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised while assembling the relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read, or an explicitly named
    /// file is missing.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Parser error.
        source: toml::de::Error,
    },

    /// A value parsed but is unusable.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    server: ServerSection,
    auth: AuthSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    listen: Option<String>,
    max_payload_bytes: Option<usize>,
    log_level: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AuthSection {
    tokens: HashMap<String, String>,
}

/// Command-line flags of `tasksync-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "TaskSync document relay")]
pub struct RelayCliArgs {
    /// Socket address to listen on.
    #[arg(short, long, env = "TASKSYNC_RELAY_ADDR")]
    pub listen: Option<String>,

    /// Config file to read instead of the default location.
    #[arg(short, long, env = "TASKSYNC_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Largest accepted document, in bytes.
    #[arg(long, env = "TASKSYNC_RELAY_MAX_PAYLOAD")]
    pub max_payload_bytes: Option<usize>,

    /// Tracing filter, e.g. `info` or `tasksync_relay=debug`.
    #[arg(long, env = "TASKSYNC_RELAY_LOG")]
    pub log_level: Option<String>,
}

/// Effective relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the server listens on.
    pub bind_addr: SocketAddr,
    /// Largest accepted document payload in bytes.
    pub max_payload_size: usize,
    /// Bearer token per account. Accounts not listed accept any non-empty
    /// token.
    pub tokens: HashMap<String, String>,
    /// Tracing filter directive.
    pub log_level: String,
}

impl RelayConfig {
    /// Reads the config file (if any) and applies the command-line flags.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicitly named file is missing, the
    /// file cannot be read or parsed, or a value is out of range.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_file(path, true)?,
            None => match dirs::config_dir() {
                Some(dir) => read_file(&dir.join("tasksync-relay").join("config.toml"), false)?,
                None => FileConfig::default(),
            },
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &RelayCliArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let listen = cli
            .listen
            .as_deref()
            .or(file.server.listen.as_deref())
            .unwrap_or(DEFAULT_LISTEN);
        let bind_addr = listen.parse().map_err(|e| ConfigError::Invalid {
            field: "listen",
            reason: format!("{listen:?}: {e}"),
        })?;

        let max_payload_size = cli
            .max_payload_bytes
            .or(file.server.max_payload_bytes)
            .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
        if max_payload_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_payload_bytes",
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some((account, _)) = file.auth.tokens.iter().find(|(_, token)| token.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "auth.tokens",
                reason: format!("empty token for account {account:?}"),
            });
        }

        Ok(Self {
            bind_addr,
            max_payload_size,
            tokens: file.auth.tokens,
            log_level: cli
                .log_level
                .clone()
                .or(file.server.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

/// Parses `path`. A missing file yields the empty config unless `required`.
fn read_file(path: &Path, required: bool) -> Result<FileConfig, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
