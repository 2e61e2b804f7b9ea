use std::time::Duration;

use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
// 6 attempts, sleeping 10 s × attempt in between, before the first connection is fatal
pub const DEFAULT_STARTUP_RETRIES: u32 = 6;
pub const DEFAULT_RECONNECT_BASE_SECS: u64 = 10;
pub const DEFAULT_RECONNECT_CAP_SECS: u64 = 60;
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Daemon loop cadence, startup retries and reconnect backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// When false the daemon performs startup recovery and one pass, then exits.
    #[serde(default = "bool_true")]
    pub daemonize: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_cap_secs")]
    pub reconnect_cap_secs: u64,
    /// Pending jobs of an inactive template older than this are purged at startup.
    #[serde(default = "default_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemonize: true,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            startup_retries: DEFAULT_STARTUP_RETRIES,
            reconnect_base_secs: DEFAULT_RECONNECT_BASE_SECS,
            reconnect_cap_secs: DEFAULT_RECONNECT_CAP_SECS,
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE_SECS,
        }
    }
}

impl DaemonConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_cap_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA zone name used for calendar boundaries (midnight, first of month, ...).
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Emit per-tenant begin/end and "nothing to run" status lines.
    #[serde(default)]
    pub debug: bool,
    /// Explicit `EnvFilter` directive; `RUST_LOG` still wins.
    #[serde(default)]
    pub filter: Option<String>,
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_startup_retries() -> u32 {
    DEFAULT_STARTUP_RETRIES
}
fn default_reconnect_base_secs() -> u64 {
    DEFAULT_RECONNECT_BASE_SECS
}
fn default_reconnect_cap_secs() -> u64 {
    DEFAULT_RECONNECT_CAP_SECS
}
fn default_orphan_grace_secs() -> u64 {
    DEFAULT_ORPHAN_GRACE_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// `config_path` falls back to `~/.cadence/cadence.toml`. A missing file is
    /// not an error: defaults and env overrides still apply. Nested keys use a
    /// double underscore, e.g. `CADENCE_DAEMON__TICK_INTERVAL_MS=500`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        if !std::path::Path::new(&path).exists() {
            warn!(%path, "config file not found, using defaults and environment");
        }

        Self::from_figment(
            Figment::from(Serialized::defaults(CadenceConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    /// Extract and validate a config from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: CadenceConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.tick_interval_ms == 0 {
            return Err(CoreError::Config(
                "daemon.tick_interval_ms must be greater than zero".into(),
            ));
        }
        if self.daemon.reconnect_cap_secs < self.daemon.reconnect_base_secs {
            return Err(CoreError::Config(format!(
                "daemon.reconnect_cap_secs ({}) is below daemon.reconnect_base_secs ({})",
                self.daemon.reconnect_cap_secs, self.daemon.reconnect_base_secs
            )));
        }
        self.timezone()?;
        Ok(())
    }

    /// The configured schedule time zone.
    pub fn timezone(&self) -> Result<Tz> {
        self.schedule
            .timezone
            .parse::<Tz>()
            .map_err(|e| CoreError::Config(format!("schedule.timezone: {e}")))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> Result<CadenceConfig> {
        CadenceConfig::from_figment(
            Figment::from(Serialized::defaults(CadenceConfig::default()))
                .merge(Toml::string(toml)),
        )
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = from_toml("").expect("defaults are valid");
        assert!(config.daemon.daemonize);
        assert_eq!(config.daemon.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.daemon.startup_retries, 6);
        assert_eq!(config.daemon.reconnect_base(), Duration::from_secs(10));
        assert_eq!(config.timezone().unwrap(), Tz::UTC);
        assert!(!config.log.debug);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let config = from_toml(
            r#"
            [database]
            path = "/var/lib/cadence/cadence.db"

            [daemon]
            daemonize = false
            tick_interval_ms = 250

            [schedule]
            timezone = "Europe/Prague"
            "#,
        )
        .expect("valid config");
        assert_eq!(config.database.path, "/var/lib/cadence/cadence.db");
        assert_eq!(config.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert!(!config.daemon.daemonize);
        assert_eq!(config.daemon.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Prague);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let err = from_toml("[schedule]\ntimezone = \"Mars/Olympus\"").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("schedule.timezone"));
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        assert!(from_toml("[daemon]\ntick_interval_ms = 0").is_err());
    }

    #[test]
    fn reconnect_cap_below_base_is_rejected() {
        let err = from_toml("[daemon]\nreconnect_base_secs = 30\nreconnect_cap_secs = 5").unwrap_err();
        assert!(err.to_string().contains("reconnect_cap_secs"));
    }
}
