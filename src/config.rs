use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub hosts_file: PathBuf,
    #[serde(default = "default_per_host_timeout_ms")]
    pub per_host_timeout_ms: u64,
    #[serde(default = "default_client_interval_secs")]
    pub default_client_interval_secs: u64,
    #[serde(default = "default_max_client_interval_secs")]
    pub max_client_interval_secs: u64,
    #[serde(default)]
    pub background_refresh_secs: u64,
    #[serde(default = "default_warmup_on_start")]
    pub warmup_on_start: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alerts_enabled")]
    pub enabled: bool,
    #[serde(default = "default_disk_usage_threshold_percent")]
    pub disk_usage_threshold_percent: f64,
    #[serde(default = "default_root_process_alerts_enabled")]
    pub root_process_alerts_enabled: bool,
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: default_alerts_enabled(),
            disk_usage_threshold_percent: default_disk_usage_threshold_percent(),
            root_process_alerts_enabled: default_root_process_alerts_enabled(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("не удалось разобрать JSON в {path}: {source}")]
    HostsParse {
        path: String,
        source: serde_json::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let mut cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        if cfg.hosts_file.is_relative() {
            if let Some(dir) = path_ref.parent() {
                cfg.hosts_file = dir.join(&cfg.hosts_file);
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.hosts_file.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "поле hosts_file обязательно".to_string(),
            ));
        }
        if self.per_host_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "per_host_timeout_ms должен быть > 0".to_string(),
            ));
        }
        if self.max_client_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "max_client_interval_secs должно быть >= 1".to_string(),
            ));
        }
        if self.default_client_interval_secs > self.max_client_interval_secs {
            return Err(ConfigError::Validation(
                "default_client_interval_secs не может превышать max_client_interval_secs"
                    .to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Validation(
                "user_agent не должен быть пустым".to_string(),
            ));
        }

        validate_alerts(&self.alerts)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&cfg.disk_usage_threshold_percent) {
        return Err(ConfigError::Validation(
            "alerts.disk_usage_threshold_percent должно быть в диапазоне 0..100".to_string(),
        ));
    }
    if cfg.notification_buffer < 1 {
        return Err(ConfigError::Validation(
            "alerts.notification_buffer должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_per_host_timeout_ms() -> u64 {
    10_000
}

const fn default_client_interval_secs() -> u64 {
    15
}

const fn default_max_client_interval_secs() -> u64 {
    3600
}

const fn default_warmup_on_start() -> bool {
    true
}

fn default_user_agent() -> String {
    format!("fleetmon/{}", env!("CARGO_PKG_VERSION"))
}

const fn default_alerts_enabled() -> bool {
    true
}

const fn default_disk_usage_threshold_percent() -> f64 {
    90.0
}

const fn default_root_process_alerts_enabled() -> bool {
    true
}

const fn default_notification_buffer() -> usize {
    64
}
