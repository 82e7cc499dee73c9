use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "LAZY_BLACKTEA_PERF_CONFIG_PATH";

const DEFAULT_INTERVAL_MS: u64 = 1000;
const DEFAULT_RESET_SETTLE_MS: u64 = 200;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AdbSettings {
    /// Empty means "adb" from PATH.
    pub command_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerfSettings {
    pub interval_ms: u64,
    pub reset_settle_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for PerfSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            reset_settle_ms: DEFAULT_RESET_SETTLE_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

impl PerfSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub perf: PerfSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lazy_blacktea_perf.json")
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".backup");
    PathBuf::from(backup)
}

pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn save_config(config: &AppConfig, trace_id: &str) -> Result<(), AppError> {
    let path = config_path();
    save_config_to_path(config, &path, &backup_path_for(&path), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
    trace_id: &str,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(&validate_config(config.clone()))
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), trace_id))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), trace_id))?;
    Ok(())
}

pub fn clamp_perf_interval_ms(value: u64) -> u64 {
    value.clamp(500, 5000)
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    config.perf.interval_ms = clamp_perf_interval_ms(config.perf.interval_ms);
    if config.perf.reset_settle_ms > 5000 {
        config.perf.reset_settle_ms = DEFAULT_RESET_SETTLE_MS;
    }
    if config.perf.stop_timeout_ms == 0 || config.perf.stop_timeout_ms > 30_000 {
        config.perf.stop_timeout_ms = DEFAULT_STOP_TIMEOUT_MS;
    }
    if config.logging.log_level.trim().is_empty() {
        config.logging.log_level = "info".to_string();
    }
    config
}
