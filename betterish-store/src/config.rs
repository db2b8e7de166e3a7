//! Store server settings.
//!
//! A settings file at `~/.config/betterish-store/config.toml` holds a
//! `listen` address and a `[limits]` table:
//!
//! ```toml
//! listen = "127.0.0.1:9400"
//!
//! [limits]
//! frame_bytes = 65536
//! documents = 100000
//! ```
//!
//! Flags (or their `BETTERISH_STORE_*` variables) win over the file, which
//! wins over built-in values. Unknown keys in the file are rejected.

use std::path::{Path, PathBuf};

/// Address used when neither flag nor file names one.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9400";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A limit was set to a value the server cannot run with.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Per-connection and per-collection caps enforced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest inbound WebSocket frame accepted.
    pub frame_bytes: usize,
    /// Most live documents one collection may hold.
    pub documents: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            frame_bytes: 64 * 1024,
            documents: 100_000,
        }
    }
}

/// Command-line flags for `betterish-store`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Owner-scoped document store for Betterish clients")]
pub struct StoreArgs {
    /// Address to listen on.
    #[arg(short, long, alias = "bind", env = "BETTERISH_STORE_ADDR")]
    pub listen: Option<String>,

    /// Settings file to read instead of the default one. Must exist.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "BETTERISH_STORE_FRAME_BYTES")]
    pub frame_bytes: Option<usize>,

    #[arg(long, env = "BETTERISH_STORE_DOCUMENTS")]
    pub max_documents: Option<usize>,

    /// Tracing filter, e.g. `info` or `betterish_store=debug`.
    #[arg(long, default_value = "info", env = "BETTERISH_STORE_LOG")]
    pub log_level: String,
}

/// What the server runs with after every source has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: String,
    pub limits: Limits,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            limits: Limits::default(),
            log_level: "info".to_owned(),
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    listen: Option<String>,
    limits: LimitsTable,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LimitsTable {
    frame_bytes: Option<usize>,
    documents: Option<usize>,
}

impl Settings {
    /// Reads the settings file and lays the flags over it.
    ///
    /// # Errors
    ///
    /// Fails if an explicit `--config` file is missing, if any settings
    /// file is unreadable or malformed, or if a limit is zero.
    pub fn from_args(args: &StoreArgs) -> Result<Self, ConfigError> {
        let file = read_settings_file(args.config.as_deref())?;
        Self::layered(args, file).checked()
    }

    fn layered(args: &StoreArgs, file: SettingsFile) -> Self {
        let mut settings = Self {
            log_level: args.log_level.clone(),
            ..Self::default()
        };
        overlay(&mut settings.listen, file.listen);
        overlay(&mut settings.listen, args.listen.clone());
        overlay(&mut settings.limits.frame_bytes, file.limits.frame_bytes);
        overlay(&mut settings.limits.frame_bytes, args.frame_bytes);
        overlay(&mut settings.limits.documents, file.limits.documents);
        overlay(&mut settings.limits.documents, args.max_documents);
        settings
    }

    fn checked(self) -> Result<Self, ConfigError> {
        if self.limits.frame_bytes == 0 {
            return Err(ConfigError::Zero("frame_bytes"));
        }
        if self.limits.documents == 0 {
            return Err(ConfigError::Zero("documents"));
        }
        Ok(self)
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// An explicit path must exist; the default one is optional.
fn read_settings_file(explicit: Option<&Path>) -> Result<SettingsFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("betterish-store").join("config.toml"), false),
            None => return Ok(SettingsFile::default()),
        },
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SettingsFile::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
}
