use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{ensure, Context, Result};
use shared::protocol::{
    DEFAULT_REPEATER_PORT, DEFAULT_SEARCH_PORT, NATIVE_BEACON_PERIOD_SECS,
    NATIVE_SEARCH_PERIOD_SECS,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub ca: CaConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// How search records are retired once clients stop searching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchExpiry {
    /// Delete silently after `search_expire_secs`
    Flat,
    /// Classify as GaveUp/Single/Success and log an event
    Tiered,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaConfig {
    /// Local repeater port the beacon receiver registers with
    #[serde(default = "default_beacon_port")]
    pub beacon_port: u16,
    #[serde(default = "default_search_port")]
    pub search_port: u16,
    #[serde(default = "default_search_interface")]
    pub search_interface: IpAddr,
    #[serde(default = "default_flush_period")]
    pub flush_period_ms: u64,
    #[serde(default = "default_beacon_max_queue")]
    pub beacon_max_queue: usize,
    #[serde(default = "default_search_max_queue")]
    pub search_max_queue: usize,
    /// Re-send the repeater registration this often until confirmed, 0 = once
    #[serde(default = "default_registration_retry")]
    pub registration_retry_secs: u64,
    #[serde(default = "default_beacon_expire")]
    pub beacon_expire_secs: u64,
    #[serde(default = "default_search_expire")]
    pub search_expire_secs: u64,
    #[serde(default = "default_search_expiry")]
    pub search_expiry: SearchExpiry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Events retained before the oldest are discarded
    #[serde(default = "default_events_max")]
    pub events_max: u64,
    /// Store worker threads, each with its own connection
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Expiry sweeps, name resolution and stats
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,
    #[serde(default = "default_aggregate_interval")]
    pub aggregate_interval_secs: u64,
    #[serde(default = "default_dns_cache_max")]
    pub dns_cache_max: usize,
    #[serde(default = "default_dns_cache_max_age")]
    pub dns_cache_max_age_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_beacon_port() -> u16 {
    DEFAULT_REPEATER_PORT
}

fn default_search_port() -> u16 {
    DEFAULT_SEARCH_PORT
}

fn default_search_interface() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_flush_period() -> u64 {
    500
}

fn default_beacon_max_queue() -> usize {
    300
}

fn default_search_max_queue() -> usize {
    1000
}

fn default_registration_retry() -> u64 {
    5
}

fn default_beacon_expire() -> u64 {
    60
}

fn default_search_expire() -> u64 {
    1800
}

fn default_search_expiry() -> SearchExpiry {
    SearchExpiry::Flat
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ca-observer/observer.db")
}

fn default_events_max() -> u64 {
    100_000
}

fn default_workers() -> usize {
    2
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_periodic_interval() -> u64 {
    30
}

fn default_aggregate_interval() -> u64 {
    300
}

fn default_dns_cache_max() -> usize {
    4096
}

fn default_dns_cache_max_age() -> u64 {
    3600
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            beacon_port: default_beacon_port(),
            search_port: default_search_port(),
            search_interface: default_search_interface(),
            flush_period_ms: default_flush_period(),
            beacon_max_queue: default_beacon_max_queue(),
            search_max_queue: default_search_max_queue(),
            registration_retry_secs: default_registration_retry(),
            beacon_expire_secs: default_beacon_expire(),
            search_expire_secs: default_search_expire(),
            search_expiry: default_search_expiry(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            events_max: default_events_max(),
            workers: default_workers(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: default_periodic_interval(),
            aggregate_interval_secs: default_aggregate_interval(),
            dns_cache_max: default_dns_cache_max(),
            dns_cache_max_age_secs: default_dns_cache_max_age(),
        }
    }
}

impl CaConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(self.flush_period_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.ca.beacon_expire_secs > NATIVE_BEACON_PERIOD_SECS,
            "ca.beacon_expire_secs must exceed the {}s beacon period",
            NATIVE_BEACON_PERIOD_SECS
        );
        ensure!(
            self.ca.search_expire_secs > NATIVE_SEARCH_PERIOD_SECS,
            "ca.search_expire_secs must exceed the {}s search period",
            NATIVE_SEARCH_PERIOD_SECS
        );
        ensure!(self.ca.flush_period_ms > 0, "ca.flush_period_ms must be positive");
        ensure!(self.db.workers >= 1, "db.workers must be at least 1");
        ensure!(self.db.events_max >= 1, "db.events_max must be at least 1");
        ensure!(
            self.tasks.periodic_interval_secs > 0 && self.tasks.aggregate_interval_secs > 0,
            "tasks intervals must be positive"
        );
        Ok(())
    }
}
