use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("no config path available (neither XDG_CONFIG_HOME nor HOME is set)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shortens every timer by roughly an order of magnitude
    pub test_mode: bool,
    pub database: DatabaseConfig,
    pub intervals: Intervals,
    pub probe: ProbeConfig,
    pub thresholds: Thresholds,
    pub incidents: IncidentConfig,
    pub retention: RetentionConfig,
    pub ticketing: TicketingConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub query_timeout_secs: u64,
    pub max_connections: usize,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub branch_secs: u64,
    pub atm_secs: u64,
    pub health_secs: u64,
    pub branch_start_delay_secs: u64,
    pub atm_start_delay_secs: u64,
    pub roster_reload_secs: u64,
    /// Local wall-clock hour (0-23) of the daily cleanup run
    pub cleanup_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    pub count: u32,
    pub interval_ms: u64,
    pub multi_test_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub response_warning_ms: u64,
    pub response_slow_ms: u64,
    pub loss_warning_pct: f64,
    pub loss_critical_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    pub grace_secs: u64,
    pub auto_resolve_secs: u64,
    pub dedup_window_secs: u64,
    pub auto_create_tickets: bool,
    pub auto_resolve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub log_days: i64,
    pub incident_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketBackend {
    Local,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketingConfig {
    pub backend: TicketBackend,
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub memory_warn_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
    pub level: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "netwatch.db".into(),
            query_timeout_secs: 10,
            max_connections: 8,
            reconnect_attempts: 3,
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            branch_secs: 300,
            atm_secs: 60,
            health_secs: 180,
            branch_start_delay_secs: 5,
            atm_start_delay_secs: 10,
            roster_reload_secs: 86_400,
            cleanup_hour: 2,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000, count: 3, interval_ms: 1_000, multi_test_delay_ms: 1_000 }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            response_warning_ms: 500,
            response_slow_ms: 1_000,
            loss_warning_pct: 5.0,
            loss_critical_pct: 20.0,
        }
    }
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            grace_secs: 300,
            auto_resolve_secs: 600,
            dedup_window_secs: 3_600,
            auto_create_tickets: true,
            auto_resolve: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { log_days: 30, incident_days: 90 }
    }
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            backend: TicketBackend::Local,
            base_url: None,
            api_token: None,
            request_timeout_secs: 10,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { memory_warn_mb: 500 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: "compact".into(), level: "info".into() }
    }
}

impl fmt::Display for TicketBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketBackend::Local => write!(f, "local"),
            TicketBackend::Http => write!(f, "http"),
        }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/netwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("netwatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_1(f, "Test Mode", &self.test_mode)?;

        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Query Timeout (s)", &self.database.query_timeout_secs)?;
        write_1(f, "Reconnect Attempts", &self.database.reconnect_attempts)?;

        write_title_1(f, "Intervals")?;
        write_1(f, "Branch (s)", &self.intervals.branch_secs)?;
        write_1(f, "ATM (s)", &self.intervals.atm_secs)?;
        write_1(f, "Health Check (s)", &self.intervals.health_secs)?;
        write_1(f, "Cleanup Hour", &self.intervals.cleanup_hour)?;

        write_title_1(f, "Probe")?;
        write_1(f, "Timeout (ms)", &self.probe.timeout_ms)?;
        write_1(f, "Packet Count", &self.probe.count)?;
        write_1(f, "Packet Interval (ms)", &self.probe.interval_ms)?;

        write_title_1(f, "Thresholds")?;
        write_1(f, "Response Warning (ms)", &self.thresholds.response_warning_ms)?;
        write_1(f, "Response Slow (ms)", &self.thresholds.response_slow_ms)?;
        write_1(f, "Loss Warning (%)", &self.thresholds.loss_warning_pct)?;
        write_1(f, "Loss Critical (%)", &self.thresholds.loss_critical_pct)?;

        write_title_1(f, "Incidents")?;
        write_1(f, "Grace Time (s)", &self.incidents.grace_secs)?;
        write_1(f, "Auto Resolve Time (s)", &self.incidents.auto_resolve_secs)?;
        write_1(f, "Dedup Window (s)", &self.incidents.dedup_window_secs)?;
        write_1(f, "Auto Create Tickets", &self.incidents.auto_create_tickets)?;
        write_1(f, "Auto Resolve", &self.incidents.auto_resolve)?;

        write_title_1(f, "Retention")?;
        write_1(f, "Monitoring Logs (days)", &self.retention.log_days)?;
        write_1(f, "Resolved Incidents (days)", &self.retention.incident_days)?;

        write_title_1(f, "Ticketing")?;
        write_1(f, "Backend", &self.ticketing.backend)?;
        write_1(f, "Base URL", &self.ticketing.base_url.as_deref().unwrap_or("-"))?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/netwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else if let Ok(path) = env::var("NETWATCH_CONFIG") {
            normalize_toml_path(path::Path::new(&path))
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path).map_err(Error::ReadFailed)?;
            Self::from_toml_str(&raw_string)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|err| Error::ParseFailed(err.to_string()))
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &std::path::Path) -> Result<(), Error> {
        let config_str: String =
            toml::to_string_pretty(self).map_err(|err| Error::ParseFailed(err.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::WriteFailed)?;
        }

        std::fs::write(path, config_str).map_err(Error::WriteFailed)
    }

    /// Replace timers with the short test-mode set when `test_mode` is on.
    pub fn with_test_mode_overrides(mut self) -> Self {
        if !self.test_mode {
            return self;
        }

        self.incidents.grace_secs = 60;
        self.incidents.auto_resolve_secs = 120;
        self.incidents.dedup_window_secs = 300;
        self.intervals.atm_secs = 10;
        self.intervals.branch_secs = 30;
        self.intervals.health_secs = 20;
        self.intervals.branch_start_delay_secs = 1;
        self.intervals.atm_start_delay_secs = 2;
        self
    }

    pub fn grace_time(&self) -> Duration {
        Duration::from_secs(self.incidents.grace_secs)
    }

    pub fn auto_resolve_time(&self) -> Duration {
        Duration::from_secs(self.incidents.auto_resolve_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.incidents.dedup_window_secs)
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl TicketingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
