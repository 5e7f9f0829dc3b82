//! Configuration for license-ledger

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::money::Bps;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("license-ledger")
}

/// How the pool amount is split among participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolPolicyKind {
    /// Same share for every participant
    Equal,
    /// Weighted by each participant's level-1 referral sales
    Proportional,
}

/// Which license sales feed a pool cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSalesWindow {
    /// Everything since the program epoch up to the cycle boundary
    Cumulative,
    /// Only sales inside the cycle's own 14-day window
    Cycle,
}

/// Terms applied when a deposit names a package missing from the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDefaults {
    #[serde(default = "default_daily_rate")]
    pub daily_rate_bps: Bps,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    #[serde(default = "default_direct_rate")]
    pub direct_referral_rate_bps: Bps,
    #[serde(default = "default_activation_rate")]
    pub activation_rate_bps: Bps,
}

impl Default for PackageDefaults {
    fn default() -> Self {
        Self {
            daily_rate_bps: default_daily_rate(),
            max_cycles: default_max_cycles(),
            direct_referral_rate_bps: default_direct_rate(),
            activation_rate_bps: default_activation_rate(),
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the ledger database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port for trigger endpoints
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// First day of pool cycle 1
    #[serde(default = "default_program_epoch")]
    pub program_epoch: NaiveDate,

    /// Length of one pool cycle in days
    #[serde(default = "default_pool_interval")]
    pub pool_interval_days: u32,

    /// Share of eligible sales paid out per pool cycle
    #[serde(default = "default_pool_rate")]
    pub pool_bonus_rate_bps: Bps,

    #[serde(default = "default_pool_policy")]
    pub pool_policy: PoolPolicyKind,

    #[serde(default = "default_pool_window")]
    pub pool_sales_window: PoolSalesWindow,

    /// Run the daily batch from the daemon
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,

    /// Seconds between scheduler ticks
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,

    /// Purchases advanced in parallel per batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Re-derive purchase state from the ledger on startup
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,

    /// Currency of pool payouts
    #[serde(default = "default_currency")]
    pub currency: String,

    /// TOML table: must stay after the plain values
    #[serde(default)]
    pub default_package: PackageDefaults,
}

fn default_currency() -> String {
    "USDT".to_string()
}

fn default_http_port() -> u16 {
    8095
}

fn default_program_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default()
}

fn default_pool_interval() -> u32 {
    14
}

fn default_pool_rate() -> Bps {
    Bps(500)
}

fn default_pool_policy() -> PoolPolicyKind {
    PoolPolicyKind::Equal
}

fn default_pool_window() -> PoolSalesWindow {
    PoolSalesWindow::Cumulative
}

fn default_daily_rate() -> Bps {
    Bps(1250)
}

fn default_max_cycles() -> u32 {
    5
}

fn default_direct_rate() -> Bps {
    Bps(1000)
}

fn default_activation_rate() -> Bps {
    Bps(500)
}

fn default_true() -> bool {
    true
}

fn default_scheduler_interval() -> u64 {
    3600
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            program_epoch: default_program_epoch(),
            pool_interval_days: default_pool_interval(),
            pool_bonus_rate_bps: default_pool_rate(),
            pool_policy: default_pool_policy(),
            pool_sales_window: default_pool_window(),
            default_package: PackageDefaults::default(),
            scheduler_enabled: true,
            scheduler_interval_secs: default_scheduler_interval(),
            max_concurrency: default_max_concurrency(),
            reconcile_on_start: true,
            currency: default_currency(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.pool_interval_days == 0 {
            return Err(EngineError::Config("pool_interval_days must be positive".into()));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be positive".into()));
        }
        if self.default_package.max_cycles == 0 {
            return Err(EngineError::Config("default_package.max_cycles must be positive".into()));
        }
        self.pool_bonus_rate_bps
            .validate("pool_bonus_rate_bps")
            .map_err(|e| EngineError::Config(e.to_string()))?;
        for (name, rate) in [
            ("daily_rate_bps", self.default_package.daily_rate_bps),
            ("direct_referral_rate_bps", self.default_package.direct_referral_rate_bps),
            ("activation_rate_bps", self.default_package.activation_rate_bps),
        ] {
            rate.validate(name).map_err(|e| EngineError::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
