//! Process configuration, read once at startup.
//!
//! Sources, strongest last: built-in defaults, then a TOML file
//! (`gatepass.toml` beside the executable, or the platform config dir:
//! `~/.config/gatepass/config.toml`, `%LOCALAPPDATA%\Gatepass\config.toml`),
//! then `GATEPASS_*` environment overrides, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{OptionExt as _, Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatepassConfig {
    pub paths: PathsConfig,
    pub scan: ScanConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    /// Directory receiving one token text artifact per issued credential.
    pub tokens_dir: PathBuf,
    /// Directory receiving the attendance export pack.
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Repeated observations of the same raw string inside this window are
    /// suppressed without reaching the store.
    pub debounce_window_secs: u64,
    /// Upper bound on distinct raw strings remembered by the debounce cache.
    pub debounce_capacity: usize,
    /// Source tag written into attendance records from the scan loop.
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retries after the first attempt when the store reports busy/locked.
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.  Empty string means no
    /// file logging.
    pub json_log_file: String,
    /// Whether to also output JSON to stdout (for container pipelines).
    pub json_stdout: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// URL-safe base64 of the 32-byte token encryption key.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Shared passphrase gating the export command when set.
    #[serde(default)]
    pub admin_passphrase: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for GatepassConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            scan: ScanConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("attendance.db"),
            tokens_dir: PathBuf::from("tokens"),
            export_dir: PathBuf::from("attendance_report"),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            debounce_window_secs: 3,
            debounce_capacity: 1024,
            source: "live_scan".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_delay_ms: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            admin_passphrase: None,
        }
    }
}

impl ScanConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_window_secs)
    }
}

impl StoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl SecurityConfig {
    /// The encryption key, wrapped for transport to codec construction.
    /// Missing key is a startup error, not a per-call one.
    pub fn require_key(&self) -> Result<SecretString> {
        self.encryption_key
            .as_deref()
            .map(|k| SecretString::new(k.into()))
            .required_config(
                "encryption key not configured (set GATEPASS_KEY or [security].encryption_key)",
            )
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl GatepassConfig {
    /// Load one file.  A missing file falls back to defaults; a file that
    /// exists but fails to parse is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: GatepassConfig =
            toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Search order: the explicit path if one was given, then
    /// `gatepass.toml` beside the running binary, then the platform config
    /// directory, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        // Beside the executable.
        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("gatepass.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        // Per-user config directory.
        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("Gatepass").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("gatepass")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("GATEPASS_KEY") {
            self.security.encryption_key = Some(key);
        }
        if let Ok(db) = std::env::var("GATEPASS_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("GATEPASS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(pass) = std::env::var("GATEPASS_ADMIN_PASS") {
            self.security.admin_passphrase = Some(pass);
        }
    }
}
