use crate::alerts::NotificationHub;
use crate::cache::{CacheRead, SnapshotCache};
use crate::collectors::FetchMetrics;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::{HostDescriptor, HostRegistry};
use crate::reload::ConfigReloader;
use crate::snapshot::{HostEntry, HostMetricResult};
use crate::stats::{GpuEntry, SystemStats};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    pub default_max_age: Duration,
    pub max_max_age: Duration,
}

impl FreshnessPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            default_max_age: Duration::from_secs(cfg.default_client_interval_secs),
            max_max_age: Duration::from_secs(cfg.max_client_interval_secs),
        }
    }

    pub fn max_age(&self, client_interval_secs: Option<u64>) -> Duration {
        client_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_max_age)
            .min(self.max_max_age)
    }
}

pub struct HttpAppState<F> {
    pub metrics: Arc<Metrics>,
    pub cache: Arc<SnapshotCache<F>>,
    pub registry: Arc<HostRegistry>,
    pub reloader: Arc<ConfigReloader>,
    pub notifications: NotificationHub,
    pub freshness: FreshnessPolicy,
}

impl<F> Clone for HttpAppState<F> {
    fn clone(&self) -> Self {
        Self {
            metrics: Arc::clone(&self.metrics),
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            reloader: Arc::clone(&self.reloader),
            notifications: self.notifications.clone(),
            freshness: self.freshness,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    client_interval_seconds: Option<String>,
    fresh: Option<String>,
}

impl DataQuery {
    fn client_interval(&self) -> Option<u64> {
        self.client_interval_seconds
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
    }

    fn force_fresh(&self) -> bool {
        matches!(
            self.fresh.as_deref().map(str::trim),
            Some("1") | Some("true") | Some("yes")
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ApiHost<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub status: &'static str,
    pub fetch_time_utc: String,
    pub hostname: Option<&'a str>,
    pub timestamp_utc: Option<&'a str>,
    pub status_code: Option<u16>,
    pub system: Option<&'a SystemStats>,
    pub gpus: &'a [GpuEntry],
    pub error: Option<String>,
}

impl<'a> From<&'a HostEntry> for ApiHost<'a> {
    fn from(entry: &'a HostEntry) -> Self {
        let HostDescriptor { name, url } = &entry.host;
        match &entry.result {
            HostMetricResult::Ok {
                metrics,
                fetched_at,
            } => Self {
                name,
                url,
                status: "ok",
                fetch_time_utc: rfc3339(*fetched_at),
                hostname: metrics.hostname.as_deref(),
                timestamp_utc: metrics.exporter_timestamp.as_deref(),
                status_code: Some(metrics.status_code),
                system: Some(&metrics.system),
                gpus: &metrics.gpus,
                error: None,
            },
            HostMetricResult::Err {
                error,
                status_code,
                fetched_at,
            } => Self {
                name,
                url,
                status: "error",
                fetch_time_utc: rfc3339(*fetched_at),
                hostname: None,
                timestamp_utc: None,
                status_code: *status_code,
                system: None,
                gpus: &[],
                error: Some(error.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiMetadata {
    pub last_refresh_utc: Option<String>,
    pub error: Option<String>,
    pub stale_for_seconds: Option<f64>,
    pub served_from: &'static str,
    pub generation: u64,
    pub host_count: usize,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ApiData<'a> {
    pub data: Vec<ApiHost<'a>>,
    pub metadata: ApiMetadata,
}

impl<'a> ApiData<'a> {
    fn from_read(read: &'a CacheRead, now: Instant) -> Self {
        let snapshot = &read.snapshot;
        Self {
            data: snapshot.hosts.iter().map(ApiHost::from).collect(),
            metadata: ApiMetadata {
                last_refresh_utc: snapshot.last_refresh.map(rfc3339),
                error: snapshot.refresh_error.clone(),
                stale_for_seconds: snapshot.age(now).map(|age| age.as_secs_f64()),
                served_from: read.served_from.as_str(),
                generation: snapshot.generation,
                host_count: snapshot.hosts.len(),
                status: if snapshot.is_initialized() {
                    "ready"
                } else {
                    "initializing"
                },
            },
        }
    }
}

pub fn build_router<F: FetchMetrics>(state: HttpAppState<F>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler::<F>))
        .route("/api/data", get(data_handler::<F>))
        .route("/api/hosts", get(hosts_handler::<F>))
        .route("/api/config/reload", post(reload_handler::<F>))
        .route(
            "/api/notifications/stream",
            get(notifications_handler::<F>),
        )
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler<F: FetchMetrics>(State(state): State<HttpAppState<F>>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn data_handler<F: FetchMetrics>(
    State(state): State<HttpAppState<F>>,
    Query(query): Query<DataQuery>,
) -> Response {
    let max_age = state.freshness.max_age(query.client_interval());
    let read = state.cache.get(max_age, query.force_fresh()).await;
    Json(ApiData::from_read(&read, Instant::now())).into_response()
}

async fn hosts_handler<F: FetchMetrics>(State(state): State<HttpAppState<F>>) -> Response {
    let view = state.registry.current();
    Json(json!({
        "generation": view.generation,
        "hosts": &*view.hosts,
    }))
    .into_response()
}

async fn reload_handler<F: FetchMetrics>(State(state): State<HttpAppState<F>>) -> Response {
    let reloader = Arc::clone(&state.reloader);
    let result = match tokio::task::spawn_blocking(move || reloader.reload()).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "задача перезагрузки списка хостов завершилась аварийно");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "не удалось перезагрузить конфигурацию" })),
            )
                .into_response();
        }
    };
    match result {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "message": format!(
                    "Конфигурация перезагружена, опрашивается хостов: {}",
                    outcome.host_count
                ),
                "hosts_count": outcome.host_count,
                "generation": outcome.generation,
            })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn notifications_handler<F: FetchMetrics>(
    State(state): State<HttpAppState<F>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notifications.subscribe();
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let event = Event::default()
                        .event("notification")
                        .json_data(&notification)
                        .unwrap_or_else(|_| Event::default().comment("bad notification"));
                    return Some((Ok(event), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "подписчик уведомлений отстал");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn rfc3339(ts: SystemTime) -> String {
    humantime::format_rfc3339_millis(ts).to_string()
}
