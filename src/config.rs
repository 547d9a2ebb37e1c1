//! Engine configuration, defaults overridable from the environment
use crate::compatibility::CompatibilityMode;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DB_PATH_VAR: &str = "BLOODBANK_DB_PATH";
pub const SWEEP_INTERVAL_VAR: &str = "BLOODBANK_SWEEP_INTERVAL_SECS";
pub const EXPIRING_WINDOW_VAR: &str = "BLOODBANK_EXPIRING_WINDOW_DAYS";
pub const COMPATIBILITY_VAR: &str = "BLOODBANK_COMPATIBILITY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub sweep_interval: Duration,
    /// Horizon of the "expiring soon" inventory view
    pub expiring_window_days: i64,
    pub compatibility: CompatibilityMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("bloodbank.db"),
            sweep_interval: Duration::from_secs(300),
            expiring_window_days: 7,
            compatibility: CompatibilityMode::Exact,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; malformed values keep their default
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup(DB_PATH_VAR) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, SWEEP_INTERVAL_VAR).filter(|s| *s > 0) {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(days) = parse_var::<i64>(&lookup, EXPIRING_WINDOW_VAR).filter(|d| *d >= 0) {
            config.expiring_window_days = days;
        }
        if let Some(mode) = parse_var::<CompatibilityMode>(&lookup, COMPATIBILITY_VAR) {
            config.compatibility = mode;
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed configuration value");
            None
        }
    }
}
