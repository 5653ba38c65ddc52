use crate::domain::models::Settings;
use crate::domain::timezone::{resolve_timezone, DEFAULT_TIMEZONE};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::logging::{default_log_level, normalize_level};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const REFRESH_JSON: &str = "refresh.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub schema: u8,
    pub default_timezone: String,
    pub chart_sample_minutes: u32,
    pub default_lookback_days: u32,
    pub default_future_days: u32,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            schema: 1,
            default_timezone: settings.default_timezone,
            chart_sample_minutes: settings.chart_sample_minutes,
            default_lookback_days: settings.default_lookback_days,
            default_future_days: settings.default_future_days,
            log_level: default_log_level().to_string(),
        }
    }
}

impl AppConfig {
    pub fn to_settings(&self) -> Settings {
        Settings {
            default_timezone: resolve_timezone(&self.default_timezone, DEFAULT_TIMEZONE),
            chart_sample_minutes: self.chart_sample_minutes.max(1),
            default_lookback_days: self.default_lookback_days,
            default_future_days: self.default_future_days,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshFileConfig {
    pub schema: u8,
    pub debounce_ms: u64,
    pub tick_seconds: u64,
}

impl Default for RefreshFileConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            debounce_ms: 300,
            tick_seconds: 60,
        }
    }
}

impl RefreshFileConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigBundle {
    pub app: AppConfig,
    pub refresh: RefreshFileConfig,
}

fn default_files() -> Result<Vec<(&'static str, serde_json::Value)>, InfraError> {
    Ok(vec![
        (APP_JSON, serde_json::to_value(AppConfig::default())?),
        (REFRESH_JSON, serde_json::to_value(RefreshFileConfig::default())?),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files()? {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    serde_json::from_value(parsed).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid fields in {}: {error}", path.display()))
    })
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    let app: AppConfig = read_config(&config_dir.join(APP_JSON))?;
    normalize_level(&app.log_level)?;
    Ok(ConfigBundle {
        app,
        refresh: read_config(&config_dir.join(REFRESH_JSON))?,
    })
}
