//! Configuration system for the Betterish client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/betterish/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use betterish_proto::task::{Category, Priority, Recurrence};

use crate::session::SessionOptions;
use crate::store::remote::RemoteOptions;
use crate::tasks::{ControllerOptions, RetryPolicy};

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

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    store: StoreFileConfig,
    tasks: TasksFileConfig,
    ui: UiFileConfig,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[tasks]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TasksFileConfig {
    owner: Option<String>,
    retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    undo_window_secs: Option<u64>,
    duplicate_window_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Owner used when none is configured.
pub const DEFAULT_OWNER: &str = "me";

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Store --
    /// WebSocket URL of a `betterish-store` server. `None` runs against an
    /// in-memory demo store.
    pub store_url: Option<String>,
    /// Timeout for connecting to the store.
    pub connect_timeout: Duration,
    /// Timeout for each store request.
    pub request_timeout: Duration,

    // -- Tasks --
    /// Owner whose tasks are shown.
    pub owner: String,
    /// Extra attempts after a connectivity failure.
    pub retries: u32,
    /// Delay before the first retry.
    pub retry_backoff: Duration,
    /// How long a delete can be undone.
    pub undo_window: Duration,
    /// Same-title create rejection window; `None` disables it.
    pub duplicate_window: Option<Duration>,
    /// Buffer size for the controller event channel.
    pub event_buffer: usize,

    // -- UI --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let controller = ControllerOptions::default();
        let remote = RemoteOptions::default();
        Self {
            store_url: None,
            connect_timeout: remote.connect_timeout,
            request_timeout: remote.request_timeout,
            owner: DEFAULT_OWNER.to_string(),
            retries: controller.retry.retries,
            retry_backoff: controller.retry.backoff,
            undo_window: controller.undo_window,
            duplicate_window: None,
            event_buffer: controller.event_buffer,
            timestamp_format: "%Y-%m-%d %H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/betterish/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            store_url: cli.store_url.clone().or_else(|| file.store.url.clone()),
            connect_timeout: file
                .store
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .store
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            owner: cli
                .owner
                .clone()
                .or_else(|| file.tasks.owner.clone())
                .unwrap_or(defaults.owner),
            retries: file.tasks.retries.unwrap_or(defaults.retries),
            retry_backoff: file
                .tasks
                .retry_backoff_ms
                .map_or(defaults.retry_backoff, Duration::from_millis),
            undo_window: file
                .tasks
                .undo_window_secs
                .map_or(defaults.undo_window, Duration::from_secs),
            duplicate_window: file
                .tasks
                .duplicate_window_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            event_buffer: file.tasks.event_buffer.unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Session options derived from this configuration.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            controller: ControllerOptions {
                retry: RetryPolicy {
                    retries: self.retries,
                    backoff: self.retry_backoff,
                },
                undo_window: self.undo_window,
                event_buffer: self.event_buffer,
            },
            duplicate_window: self.duplicate_window,
        }
    }

    /// Connection options for a remote store.
    #[must_use]
    pub const fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Optimistic task manager")]
pub struct CliArgs {
    /// WebSocket URL of the store server (omit for an in-memory demo store).
    #[arg(long, env = "BETTERISH_STORE_URL")]
    pub store_url: Option<String>,

    /// Owner whose tasks to manage.
    #[arg(long, env = "BETTERISH_OWNER")]
    pub owner: Option<String>,

    /// Path to config file (default: `~/.config/betterish/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "BETTERISH_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/betterish.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do (default: list).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Which tasks `list` shows.
#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListView {
    /// Everything, newest first.
    #[default]
    All,
    /// Incomplete and not snoozed.
    Active,
    /// Done, most recent first.
    Completed,
    /// Incomplete tasks one to fourteen days old.
    Promises,
    /// Recurring tasks due today.
    Today,
    /// Put away with `archive`.
    Archived,
    /// Projects with their subtask progress.
    Projects,
}

/// Subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show tasks.
    List {
        /// Which tasks to show.
        #[arg(long, value_enum, default_value_t = ListView::All)]
        view: ListView,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Add a task.
    Add {
        title: String,
        #[arg(long)]
        detail: Option<String>,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        priority: Option<Priority>,
        /// e.g. `daily`, `weekdays`, `weekly:Mon`, `days:Mon,Thu`.
        #[arg(long)]
        recurrence: Option<Recurrence>,
    },
    /// Mark tasks done.
    Complete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Mark a task not done.
    Uncomplete { id: String },
    /// Delete a task.
    Delete { id: String },
    /// Delete a task for good, with no undo.
    Purge { id: String },
    /// Move tasks out of the working lists.
    Archive {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Bring them back instead.
        #[arg(long)]
        undo: bool,
    },
    /// Turn a task into a project, optionally with first subtasks.
    Project { id: String, subtasks: Vec<String> },
    /// Change a project's subtasks.
    Subtask {
        id: String,
        #[command(subcommand)]
        action: SubtaskAction,
    },
    /// Hide a task for a while.
    Snooze {
        id: String,
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Find tasks by title or detail.
    Search { query: String },
    /// Print task changes as they happen until interrupted.
    Watch,
}

/// Edits to one subtask of a project.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SubtaskAction {
    Add { title: String },
    /// Check off subtask `n`.
    Done {
        n: u32,
        /// Uncheck it instead.
        #[arg(long)]
        undo: bool,
    },
    Rename { n: u32, title: String },
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
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
        config_dir.join("betterish").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
