//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/vigil/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/vigil/` (~/.config/vigil/)
//! - Data: `$XDG_DATA_HOME/vigil/` (~/.local/share/vigil/)
//! - State/Logs: `$XDG_STATE_HOME/vigil/` (~/.local/state/vigil/)

use crate::calendar::CalendarZone;
use crate::error::{Error, Result};
use crate::types::Severity;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Evaluation pass settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Threshold bands per check type
    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    /// Daily trigger
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Outward notification channel
    #[serde(default)]
    pub sink: SinkConfig,

    /// Backend for external escalation actions
    #[serde(default)]
    pub actions: ActionsConfig,

    /// Owner channel
    #[serde(default)]
    pub owner: OwnerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Evaluation pass configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// IANA timezone that defines the calendar day for deduplication.
    /// Uses the system local zone when unset.
    #[serde(default)]
    pub timezone: Option<String>,

    /// Minimum hours between two escalations at the same level
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,

    /// Delay inserted between consecutive escalation actions
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,

    /// Upper bound on waiting for the database lock, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: None,
            cooldown_hours: default_cooldown_hours(),
            action_delay_ms: default_action_delay_ms(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Resolve the calendar zone used for the daily dedup window.
    pub fn calendar_zone(&self) -> Result<CalendarZone> {
        CalendarZone::from_name(self.timezone.as_deref())
    }

    pub fn validate(&self) -> Result<()> {
        self.calendar_zone()?;
        if self.cooldown_hours <= 0 {
            return Err(Error::Config(
                "engine.cooldown_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cooldown_hours() -> i64 {
    24
}

fn default_action_delay_ms() -> u64 {
    500
}

fn default_store_timeout_ms() -> u64 {
    5000
}

/// A percentage band start and the severity it fires with.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BandConfig {
    /// Lower bound of the band, in percent
    pub at: f64,
    pub severity: Severity,
}

/// An exact days-remaining window and the severity it fires with.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WindowConfig {
    pub days: i64,
    pub severity: Severity,
}

/// Threshold configuration per check type
///
/// Band lists are ordered ascending. Every band except the last covers
/// `[at, at + band_width)`; the last one is open-ended (`>= at`).
#[derive(Debug, Deserialize, Clone)]
pub struct ThresholdsConfig {
    /// Progress milestones
    #[serde(default = "default_progress_bands")]
    pub progress: Vec<BandConfig>,

    /// Budget consumption thresholds
    #[serde(default = "default_budget_bands")]
    pub budget: Vec<BandConfig>,

    /// Exact days-remaining warnings for schedule and contract deadlines
    #[serde(default = "default_deadline_windows")]
    pub deadline_windows: Vec<WindowConfig>,

    /// Width of every non-terminal band, in percentage points
    #[serde(default = "default_band_width")]
    pub band_width: f64,

    /// Warn about milestones due within this many days
    #[serde(default = "default_milestone_warning_days")]
    pub milestone_warning_days: i64,

    /// Upcoming milestones with at most this many days left are urgent
    #[serde(default = "default_milestone_urgent_days")]
    pub milestone_urgent_days: i64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            progress: default_progress_bands(),
            budget: default_budget_bands(),
            deadline_windows: default_deadline_windows(),
            band_width: default_band_width(),
            milestone_warning_days: default_milestone_warning_days(),
            milestone_urgent_days: default_milestone_urgent_days(),
        }
    }
}

fn default_progress_bands() -> Vec<BandConfig> {
    vec![
        BandConfig {
            at: 75.0,
            severity: Severity::Medium,
        },
        BandConfig {
            at: 90.0,
            severity: Severity::High,
        },
        BandConfig {
            at: 100.0,
            severity: Severity::High,
        },
    ]
}

fn default_budget_bands() -> Vec<BandConfig> {
    vec![
        BandConfig {
            at: 90.0,
            severity: Severity::High,
        },
        BandConfig {
            at: 100.0,
            severity: Severity::Critical,
        },
        BandConfig {
            at: 110.0,
            severity: Severity::Critical,
        },
    ]
}

fn default_deadline_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig {
            days: 30,
            severity: Severity::Medium,
        },
        WindowConfig {
            days: 14,
            severity: Severity::High,
        },
        WindowConfig {
            days: 7,
            severity: Severity::Critical,
        },
    ]
}

fn default_band_width() -> f64 {
    5.0
}

fn default_milestone_warning_days() -> i64 {
    7
}

fn default_milestone_urgent_days() -> i64 {
    3
}

/// Scheduler configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Five-field cron expression (minute hour day month weekday)
    #[serde(default = "default_cron")]
    pub cron: String,

    /// IANA timezone the cron expression is interpreted in (default UTC)
    #[serde(default)]
    pub timezone: Option<String>,

    /// How often the scheduler thread wakes to check for stop requests
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Run one pass immediately when the daemon starts
    #[serde(default)]
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: None,
            poll_interval_ms: default_poll_interval_ms(),
            run_on_start: false,
        }
    }
}

fn default_cron() -> String {
    "0 8 * * *".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Kind of notification sink
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Write deliveries to the log only
    #[default]
    Log,
    /// POST deliveries to an HTTP endpoint
    Webhook,
}

/// Notification sink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Endpoint URL (required for `webhook`)
    pub url: Option<String>,

    /// Bearer token sent with webhook deliveries
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            url: None,
            api_key: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kind == SinkKind::Webhook && self.url.is_none() {
            return Err(Error::Config(
                "sink.url is required when sink.kind = \"webhook\"".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "sink.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_http_timeout() -> u64 {
    10
}

/// Backend used for ticket, meeting, email and stakeholder actions
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionBackendKind {
    /// Record the action and return generated identifiers
    #[default]
    Simulated,
    /// POST the action payload to an integration endpoint
    Webhook,
}

/// Action backend configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ActionsConfig {
    #[serde(default)]
    pub backend: ActionBackendKind,

    /// Integration endpoint (required for `webhook`)
    pub webhook_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            backend: ActionBackendKind::Simulated,
            webhook_url: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

impl ActionsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == ActionBackendKind::Webhook && self.webhook_url.is_none() {
            return Err(Error::Config(
                "actions.webhook_url is required when actions.backend = \"webhook\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Owner channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OwnerConfig {
    /// Recipient id of the system owner channel
    #[serde(default = "default_owner_recipient")]
    pub recipient_id: String,
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            recipient_id: default_owner_recipient(),
        }
    }
}

fn default_owner_recipient() -> String {
    "owner".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section that can be checked without touching the network
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.sink.validate()?;
        self.actions.validate()?;
        crate::rules::RuleCatalog::validate_thresholds(&self.thresholds)?;
        crate::scheduler::parse_schedule(&self.scheduler)?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/vigil/config.toml` (~/.config/vigil/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("vigil").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/vigil/` (~/.local/share/vigil/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("vigil")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/vigil/` (~/.local/state/vigil/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("vigil")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/vigil/vigil.db` (~/.local/share/vigil/vigil.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("vigil.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("vigil.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.cooldown_hours, 24);
        assert_eq!(config.engine.action_delay_ms, 500);
        assert_eq!(config.scheduler.cron, "0 8 * * *");
        assert_eq!(config.sink.kind, SinkKind::Log);
        assert_eq!(config.actions.backend, ActionBackendKind::Simulated);
        assert_eq!(config.owner.recipient_id, "owner");
        assert_eq!(config.thresholds.progress.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[engine]
timezone = "Europe/Lisbon"
action_delay_ms = 0

[scheduler]
cron = "30 7 * * 1-5"
timezone = "Europe/Lisbon"

[sink]
kind = "webhook"
url = "https://hooks.example.com/notify"
timeout_secs = 3

[owner]
recipient_id = "ops-channel"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.engine.timezone.as_deref(), Some("Europe/Lisbon"));
        assert_eq!(config.engine.action_delay_ms, 0);
        assert_eq!(config.engine.cooldown_hours, 24);
        assert_eq!(config.scheduler.cron, "30 7 * * 1-5");
        assert_eq!(config.sink.kind, SinkKind::Webhook);
        assert_eq!(config.sink.timeout_secs, 3);
        assert_eq!(config.owner.recipient_id, "ops-channel");
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_custom_thresholds() {
        let toml = r#"
[thresholds]
band_width = 5.0
progress = [
  { at = 50.0, severity = "low" },
  { at = 100.0, severity = "high" },
]
deadline_windows = [{ days = 3, severity = "critical" }]
milestone_warning_days = 10
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.thresholds.progress.len(), 2);
        assert_eq!(config.thresholds.progress[0].severity, Severity::Low);
        assert_eq!(config.thresholds.deadline_windows[0].days, 3);
        assert_eq!(config.thresholds.milestone_warning_days, 10);
        // Budget and the urgent cutoff keep their defaults
        assert_eq!(config.thresholds.budget.len(), 3);
        assert_eq!(config.thresholds.milestone_urgent_days, 3);
    }

    #[test]
    fn test_webhook_sink_requires_url() {
        let sink = SinkConfig {
            kind: SinkKind::Webhook,
            ..Default::default()
        };
        assert!(sink.validate().is_err());

        let actions = ActionsConfig {
            backend: ActionBackendKind::Webhook,
            ..Default::default()
        };
        assert!(actions.validate().is_err());
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let engine = EngineConfig {
            timezone: Some("Mars/Olympus".to_string()),
            ..Default::default()
        };
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[owner]\nrecipient_id = \"boss\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.owner.recipient_id, "boss");

        std::fs::write(&path, "[scheduler]\ncron = \"not a cron\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
