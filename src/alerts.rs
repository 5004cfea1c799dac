use crate::config::AlertsConfig;
use crate::metrics::Metrics;
use crate::snapshot::{HostMetricResult, Snapshot};
use crate::stats::{GpuEntry, ProcessEntry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const ROOT_OFFENDERS_SHOWN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub level: NotificationLevel,
    pub timestamp: f64,
}

impl Notification {
    fn new(title: String, body: String, level: NotificationLevel) -> Self {
        Self {
            title,
            body,
            level,
            timestamp: now_unix_f64(),
        }
    }
}

pub struct AlertEngine {
    cfg: AlertsConfig,
    active: HashSet<String>,
}

impl AlertEngine {
    pub fn new(cfg: AlertsConfig) -> Self {
        Self {
            cfg,
            active: HashSet::new(),
        }
    }

    pub fn evaluate(&mut self, snapshot: &Snapshot) -> Vec<Notification> {
        if !self.cfg.enabled {
            return Vec::new();
        }

        let mut current = HashSet::new();
        let mut fired = Vec::new();
        for (key, notification) in self.candidates(snapshot) {
            if !self.active.contains(&key) {
                info!(key = %key, "новый алерт");
                fired.push(notification);
            }
            current.insert(key);
        }
        self.active = current;
        fired
    }

    fn candidates(&self, snapshot: &Snapshot) -> Vec<(String, Notification)> {
        let mut out = Vec::new();
        for entry in &snapshot.hosts {
            let HostMetricResult::Ok { metrics, .. } = &entry.result else {
                continue;
            };
            let host = entry.host.name.as_str();

            for disk in &metrics.system.disks {
                let Some(used) = disk.percent_used else {
                    continue;
                };
                if disk.path.is_empty() {
                    continue;
                }
                if used > self.cfg.disk_usage_threshold_percent {
                    out.push((
                        format!("disk_usage:{host}:{}", disk.path),
                        Notification::new(
                            format!("Критическая заполненность диска на {host}"),
                            format!(
                                "Диск {} на {host} заполнен на {used:.1}% (порог {:.1}%)",
                                disk.path, self.cfg.disk_usage_threshold_percent
                            ),
                            NotificationLevel::Critical,
                        ),
                    ));
                }
            }

            if self.cfg.root_process_alerts_enabled {
                let offenders = root_processes(&metrics.gpus);
                if !offenders.is_empty() {
                    out.push((
                        format!("root_process:{host}"),
                        Notification::new(
                            format!("Процесс от root на {host}"),
                            root_process_body(&offenders),
                            NotificationLevel::Warning,
                        ),
                    ));
                }
            }
        }
        out
    }
}

fn root_processes(gpus: &[GpuEntry]) -> Vec<String> {
    gpus.iter()
        .filter_map(|gpu| match gpu {
            GpuEntry::Ok(stats) => Some(stats),
            GpuEntry::Err { .. } => None,
        })
        .flat_map(|stats| stats.processes.iter())
        .filter_map(|proc| match proc {
            ProcessEntry::Ok(p) if p.username.as_deref() == Some("root") => Some(format!(
                "{} (PID {})",
                p.command.as_deref().unwrap_or("неизвестно"),
                p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "?".to_string())
            )),
            _ => None,
        })
        .collect()
}

fn root_process_body(offenders: &[String]) -> String {
    let shown = offenders
        .iter()
        .take(ROOT_OFFENDERS_SHOWN)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    let mut body = format!("GPU-процессы запущены от root: {shown}");
    if offenders.len() > ROOT_OFFENDERS_SHOWN {
        body.push_str(&format!(
            " и ещё {}...",
            offenders.len() - ROOT_OFFENDERS_SHOWN
        ));
    }
    body.push_str(". Перезапустите их от своего пользователя!");
    body
}

#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn send(&self, notification: Notification) -> usize {
        self.tx.send(notification).unwrap_or(0)
    }
}

pub async fn run_notifier(
    mut engine: AlertEngine,
    mut updates: broadcast::Receiver<Arc<Snapshot>>,
    hub: NotificationHub,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки обработчика алертов");
                break;
            }
            update = updates.recv() => match update {
                Ok(snapshot) => {
                    let fired = engine.evaluate(&snapshot);
                    let count = fired.len();
                    for notification in fired {
                        warn!(title = %notification.title, body = %notification.body, "алерт");
                        let receivers = hub.send(notification);
                        debug!(receivers, "уведомление разослано");
                    }
                    metrics.inc_notifications_sent(count);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "обработчик алертов пропустил снимки");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

fn now_unix_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
