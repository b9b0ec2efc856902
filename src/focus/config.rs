use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APPLICATION: &str = "focus-guard";

/// Engine settings, read from `settings.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub violations: ViolationSettings,

    #[serde(default)]
    pub pin: PinSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Heartbeat emission and delivery
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    /// Seconds between heartbeats sent by a running session
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    /// Minimum spacing between two counted heartbeats (seconds)
    #[serde(default = "default_min_spacing")]
    pub min_spacing_seconds: i64,

    /// First retry delay after a failed delivery (milliseconds)
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    /// Upper bound on the retry delay (milliseconds)
    #[serde(default = "default_retry_max")]
    pub retry_max_ms: u64,

    /// Random jitter added to each retry delay (milliseconds)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
}

fn default_interval() -> u64 {
    15
}

fn default_min_spacing() -> i64 {
    10
}

fn default_retry_base() -> u64 {
    2_000
}

fn default_retry_max() -> u64 {
    60_000
}

fn default_retry_jitter() -> u64 {
    500
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            min_spacing_seconds: default_min_spacing(),
            retry_base_ms: default_retry_base(),
            retry_max_ms: default_retry_max(),
            retry_jitter_ms: default_retry_jitter(),
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Escape-attempt detection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ViolationSettings {
    /// Lost input focus must persist this long to count (milliseconds)
    #[serde(default = "default_debounce")]
    pub focus_loss_debounce_ms: u64,

    /// Seconds a student may take to return before a guardian must intervene.
    /// Unset means no deadline.
    #[serde(default)]
    pub grace_seconds: Option<u64>,
}

fn default_debounce() -> u64 {
    100
}

impl Default for ViolationSettings {
    fn default() -> Self {
        Self {
            focus_loss_debounce_ms: default_debounce(),
            grace_seconds: None,
        }
    }
}

impl ViolationSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.focus_loss_debounce_ms)
    }

    pub fn grace(&self) -> Option<Duration> {
        self.grace_seconds.map(Duration::from_secs)
    }
}

/// Guardian PIN handling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PinSettings {
    /// Consecutive rejections before lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lockout length in seconds
    #[serde(default = "default_lockout")]
    pub lockout_seconds: i64,

    /// Require the guardian PIN to end a session early
    #[serde(default = "default_true")]
    pub require_pin_to_exit: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_lockout() -> i64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_seconds: default_lockout(),
            require_pin_to_exit: true,
        }
    }
}

impl PinSettings {
    pub fn lockout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lockout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Directory holding `state.json` (defaults to the platform data directory)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let settings: EngineSettings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML settings file: {}", path.display()))?;

        settings.validate()?;

        Ok(settings)
    }

    /// Load settings if the file exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        let hb = &self.heartbeat;
        if hb.interval_seconds == 0 {
            anyhow::bail!("heartbeat.interval_seconds must be greater than 0");
        }
        if hb.min_spacing_seconds < 0 {
            anyhow::bail!("heartbeat.min_spacing_seconds must not be negative");
        }
        if hb.min_spacing_seconds > hb.interval_seconds as i64 {
            anyhow::bail!(
                "heartbeat.min_spacing_seconds ({}) must not exceed heartbeat.interval_seconds ({})",
                hb.min_spacing_seconds,
                hb.interval_seconds
            );
        }
        if hb.retry_base_ms == 0 || hb.retry_max_ms < hb.retry_base_ms {
            anyhow::bail!(
                "heartbeat retry delays must satisfy 0 < retry_base_ms <= retry_max_ms (got {} / {})",
                hb.retry_base_ms,
                hb.retry_max_ms
            );
        }

        if self.pin.max_attempts == 0 {
            anyhow::bail!("pin.max_attempts must be at least 1");
        }
        if self.pin.lockout_seconds <= 0 {
            anyhow::bail!("pin.lockout_seconds must be greater than 0");
        }

        Ok(())
    }

    /// Directory for persistent state: configured, or the platform data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}

/// Platform data directory for focus-guard
pub fn default_data_dir() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", APPLICATION)
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .context("Could not determine data directory")
}

/// Platform-specific settings file path
pub fn get_settings_path() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", APPLICATION)
        .map(|dirs| dirs.config_dir().join("settings.toml"))
        .context("Could not determine settings file location")
}

/// Example settings file content
pub const EXAMPLE_SETTINGS: &str = include_str!("../../example-settings.toml");
