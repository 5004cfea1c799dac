use crate::registry::HostDescriptor;
use crate::stats::{GpuEntry, SystemStats};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

pub const NO_HOSTS_CONFIGURED: &str = "не настроено ни одного хоста";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostFetchError {
    #[error("таймаут запроса: нет ответа за {after_ms} мс")]
    Timeout { after_ms: u64 },
    #[error("ошибка запроса: {0} (хост недоступен или проблема с DNS?)")]
    Request(String),
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("некорректный JSON от экспортера: {0}")]
    InvalidJson(String),
    #[error("экспортер сообщил об ошибке: {0}")]
    Exporter(String),
    #[error("задача опроса завершилась аварийно: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostMetrics {
    pub hostname: Option<String>,
    pub exporter_timestamp: Option<String>,
    pub status_code: u16,
    pub system: SystemStats,
    pub gpus: Vec<GpuEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostMetricResult {
    Ok {
        metrics: HostMetrics,
        fetched_at: SystemTime,
    },
    Err {
        error: HostFetchError,
        status_code: Option<u16>,
        fetched_at: SystemTime,
    },
}

impl HostMetricResult {
    pub fn failed(error: HostFetchError) -> Self {
        let status_code = match &error {
            HostFetchError::Status { code, .. } => Some(*code),
            _ => None,
        };
        Self::failed_with_status(error, status_code)
    }

    pub fn failed_with_status(error: HostFetchError, status_code: Option<u16>) -> Self {
        Self::Err {
            error,
            status_code,
            fetched_at: SystemTime::now(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::failed(HostFetchError::Timeout {
            after_ms: after.as_millis() as u64,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn error(&self) -> Option<&HostFetchError> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostEntry {
    pub host: HostDescriptor,
    pub result: HostMetricResult,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub round: u64,
    pub hosts: Vec<HostEntry>,
    pub last_refresh: Option<SystemTime>,
    pub refreshed_at: Option<Instant>,
    pub refresh_error: Option<String>,
}

impl Snapshot {
    pub fn initializing() -> Self {
        Self {
            generation: 0,
            round: 0,
            hosts: Vec::new(),
            last_refresh: None,
            refreshed_at: None,
            refresh_error: None,
        }
    }

    pub fn completed(generation: u64, round: u64, hosts: Vec<HostEntry>) -> Self {
        let refresh_error = hosts
            .is_empty()
            .then(|| NO_HOSTS_CONFIGURED.to_string());
        Self {
            generation,
            round,
            hosts,
            last_refresh: Some(SystemTime::now()),
            refreshed_at: Some(Instant::now()),
            refresh_error,
        }
    }

    pub fn with_refresh_error(&self, error: impl Into<String>) -> Self {
        Self {
            refresh_error: Some(error.into()),
            ..self.clone()
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_refresh.is_some()
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.refreshed_at
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn ok_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.result.is_ok()).count()
    }

    pub fn error_count(&self) -> usize {
        self.hosts.len() - self.ok_count()
    }

    #[cfg(test)]
    pub fn host_names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.host.name.as_str()).collect()
    }
}
