//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILMIRROR_CONFIG` (environment variable)
//! 2. `~/.config/mailmirror/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailmirror\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Command-line flags override whatever the file says.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default name of the per-directory quarantine folder.
pub const DEFAULT_QUARANTINE_DIR: &str = "_deleted";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// IMAP server and account.
    pub server: ServerConfig,
    /// Local backup tree.
    pub backup: BackupConfig,
    /// Pacing of remote operations.
    pub pacing: PacingConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// IMAP server and account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// IMAPS port (TLS from the first byte).
    pub port: u16,
    pub username: String,
    /// Plain-text password. Prefer the `MAILMIRROR_PASSWORD` environment variable.
    pub password: Option<String>,
}

/// Local backup tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory of the mirror.
    pub root: Option<PathBuf>,
    /// Name of the quarantine sub-directory created next to stale files.
    pub quarantine_dir: String,
    /// Remote folders that are neither listed nor swept.
    pub ignore_folders: BTreeSet<String>,
    /// `fsync` each message before it is renamed into place.
    pub fsync: bool,
}

/// Pacing of remote operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Pause after this many fetched messages (0 disables pacing).
    pub sleep_after_messages: u64,
    /// Length of each pause in seconds.
    pub sleep_seconds: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 993,
            username: String::new(),
            password: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: None,
            quarantine_dir: DEFAULT_QUARANTINE_DIR.to_string(),
            ignore_folders: BTreeSet::new(),
            fsync: true,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sleep_after_messages: 100,
            sleep_seconds: 30,
        }
    }
}

// ── Validation ──────────────────────────────────────────────────

impl BackupConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_quarantine_name(&self.quarantine_dir)
    }
}

/// Reject quarantine names that would escape or alias the directory they are
/// created in.
pub fn validate_quarantine_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(std::path::MAIN_SEPARATOR)
    {
        return Err(crate::error::BackupError::Config(format!(
            "invalid quarantine directory name '{name}'"
        )));
    }
    Ok(())
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILMIRROR_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailmirror").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailmirror")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailmirror.log")
}
