use crate::collectors::FetchMetrics;
use crate::registry::HostDescriptor;
use crate::snapshot::{HostFetchError, HostMetricResult, HostMetrics};
use crate::stats::{ExporterReport, ReportError};
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, SystemTime};
use tokio::time;
use tracing::{debug, warn};

const ERROR_BODY_PREVIEW_CHARS: usize = 100;

struct FetchFailure {
    error: HostFetchError,
    status_code: Option<u16>,
}

impl From<HostFetchError> for FetchFailure {
    fn from(error: HostFetchError) -> Self {
        let status_code = match &error {
            HostFetchError::Status { code, .. } => Some(*code),
            _ => None,
        };
        Self { error, status_code }
    }
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Self {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    async fn request(
        &self,
        host: &HostDescriptor,
        timeout: Duration,
    ) -> Result<HostMetrics, FetchFailure> {
        let resp = self
            .client
            .get(&host.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| classify(&err, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(HostFetchError::Status {
                code: status.as_u16(),
                body: body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
            }
            .into());
        }

        let answered = |error| FetchFailure {
            error,
            status_code: Some(status.as_u16()),
        };
        let bytes = resp.bytes().await.map_err(|err| classify(&err, timeout))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| answered(HostFetchError::InvalidJson(err.to_string())))?;
        let report = ExporterReport::from_value(&value).map_err(|err| {
            answered(match err {
                ReportError::NotAnObject => {
                    HostFetchError::InvalidJson("ожидался JSON-объект".to_string())
                }
                ReportError::Exporter(msg) => HostFetchError::Exporter(msg),
            })
        })?;

        Ok(HostMetrics {
            hostname: report.hostname,
            exporter_timestamp: report.timestamp_utc,
            status_code: status.as_u16(),
            system: report.system,
            gpus: report.gpus,
        })
    }
}

impl FetchMetrics for HttpFetcher {
    async fn fetch(&self, host: &HostDescriptor, timeout: Duration) -> HostMetricResult {
        // The outer bound drops the request future, which cancels the connection.
        match time::timeout(timeout, self.request(host, timeout)).await {
            Ok(Ok(metrics)) => {
                debug!(host = %host.name, gpus = metrics.gpus.len(), "метрики получены");
                HostMetricResult::Ok {
                    metrics,
                    fetched_at: SystemTime::now(),
                }
            }
            Ok(Err(failure)) => {
                warn!(host = %host.name, url = %host.url, error = %failure.error, "не удалось получить метрики");
                HostMetricResult::failed_with_status(failure.error, failure.status_code)
            }
            Err(_elapsed) => {
                warn!(host = %host.name, url = %host.url, "таймаут опроса хоста");
                HostMetricResult::timeout(timeout)
            }
        }
    }
}

fn classify(err: &reqwest::Error, timeout: Duration) -> HostFetchError {
    if err.is_timeout() {
        HostFetchError::Timeout {
            after_ms: timeout.as_millis() as u64,
        }
    } else if err.is_connect() {
        HostFetchError::Request("не удалось установить соединение".to_string())
    } else {
        HostFetchError::Request(err.to_string())
    }
}
