//! Configuration system for the Rideline chat client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/rideline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

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

/// Reconnect backoff behavior for the event-channel connection.
///
/// Delay doubles from `initial_delay` up to `max_delay`; after
/// `max_attempts` failed reconnects the connection is abandoned and no
/// further automatic attempt is made.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the doubling backoff delay.
    pub max_delay: Duration,
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

/// Runtime tuning for the chat client core.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Content-dedup tolerance window in milliseconds. Durable-id equality
    /// is always the primary duplicate key; this window only matches
    /// deliveries where one side lacks a durable id.
    pub dedup_window_ms: u64,
    /// Local typing idle timeout: after this long without input a
    /// `typing: false` is emitted.
    pub typing_idle: Duration,
    /// Ceiling for a remotely observed typing indicator; the entry
    /// self-clears after this long even if `typing: false` is lost.
    pub typing_expiry: Duration,
    /// Page size for message-history fetches.
    pub history_page_size: u32,
    /// Buffer size for the UI-facing event channel.
    pub event_buffer: usize,
    /// Buffer size for the outbound frame channel.
    pub frame_buffer: usize,
    /// Timeout for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Per-request timeout for persistence API calls.
    pub api_timeout: Duration,
    /// Reconnect backoff behavior.
    pub reconnect: ReconnectConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 2_000,
            typing_idle: Duration::from_secs(2),
            typing_expiry: Duration::from_secs(5),
            history_page_size: 50,
            event_buffer: 64,
            frame_buffer: 256,
            connect_timeout: Duration::from_secs(10),
            api_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    chat: ChatFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    api_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    dedup_window_ms: Option<u64>,
    typing_idle_secs: Option<u64>,
    typing_expiry_secs: Option<u64>,
    history_page_size: Option<u32>,
    event_buffer: Option<usize>,
    frame_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the chat server (the WebSocket URL is derived).
    pub server_url: Option<String>,
    /// Local user identity string.
    pub user_id: Option<String>,
    /// Display name announced to peers.
    pub display_name: Option<String>,
    /// Whether the local user is support staff.
    pub support: bool,
    /// Runtime tuning for the client core.
    pub chat: ChatConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            user_id: None,
            display_name: None,
            support: false,
            chat: ChatConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/rideline/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = ChatConfig::default();
        let reconnect_defaults = ReconnectConfig::default();

        Self {
            server_url: cli.server_url.clone().or_else(|| file.server.url.clone()),
            user_id: cli.user_id.clone(),
            display_name: cli.display_name.clone(),
            support: cli.support,
            chat: ChatConfig {
                dedup_window_ms: file
                    .chat
                    .dedup_window_ms
                    .unwrap_or(defaults.dedup_window_ms),
                typing_idle: file
                    .chat
                    .typing_idle_secs
                    .map_or(defaults.typing_idle, Duration::from_secs),
                typing_expiry: file
                    .chat
                    .typing_expiry_secs
                    .map_or(defaults.typing_expiry, Duration::from_secs),
                history_page_size: file
                    .chat
                    .history_page_size
                    .unwrap_or(defaults.history_page_size),
                event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
                frame_buffer: file.chat.frame_buffer.unwrap_or(defaults.frame_buffer),
                connect_timeout: file
                    .server
                    .connect_timeout_secs
                    .map_or(defaults.connect_timeout, Duration::from_secs),
                api_timeout: file
                    .server
                    .api_timeout_secs
                    .map_or(defaults.api_timeout, Duration::from_secs),
                reconnect: ReconnectConfig {
                    initial_delay: file
                        .reconnect
                        .initial_delay_ms
                        .map_or(reconnect_defaults.initial_delay, Duration::from_millis),
                    max_delay: file
                        .reconnect
                        .max_delay_secs
                        .map_or(reconnect_defaults.max_delay, Duration::from_secs),
                    max_attempts: file
                        .reconnect
                        .max_attempts
                        .unwrap_or(reconnect_defaults.max_attempts),
                },
            },
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Rideline support chat client")]
pub struct CliArgs {
    /// Base HTTP URL of the chat server (e.g. `http://127.0.0.1:9400`).
    #[arg(long, env = "RIDELINE_SERVER")]
    pub server_url: Option<String>,

    /// Your user identity string.
    #[arg(long, env = "RIDELINE_USER")]
    pub user_id: Option<String>,

    /// Display name announced to peers (defaults to the user id).
    #[arg(long, env = "RIDELINE_NAME")]
    pub display_name: Option<String>,

    /// Connect as support staff instead of a customer.
    #[arg(long)]
    pub support: bool,

    /// Open this conversation immediately after connecting.
    #[arg(long)]
    pub peer: Option<String>,

    /// Path to config file (default: `~/.config/rideline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RIDELINE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/rideline.log`).
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
            return Ok(ConfigFile::default());
        };
        config_dir.join("rideline").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
