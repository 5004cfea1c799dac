use crate::collectors::FetchMetrics;
use crate::registry::HostDescriptor;
use crate::snapshot::{HostFetchError, HostMetricResult, HostMetrics};
use crate::stats::{DiskUsage, GpuEntry, GpuStats, ProcessEntry, ProcessStats, SystemStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
pub enum Behavior {
    Ok { delay: Duration },
    Fail,
    Hang,
    Panic,
}

impl Behavior {
    pub fn delayed(ms: u64) -> Self {
        Self::Ok {
            delay: Duration::from_millis(ms),
        }
    }
}

pub struct ScriptedFetcher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    default: Behavior,
    disk_percent: Mutex<f64>,
    gpu_user: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::with_default(Behavior::delayed(0))
    }

    pub fn with_default(default: Behavior) -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            default,
            disk_percent: Mutex::new(40.0),
            gpu_user: Mutex::new("alice".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(self, name: &str, behavior: Behavior) -> Self {
        self.set(name, behavior);
        self
    }

    pub fn set(&self, name: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    pub fn set_disk_percent(&self, percent: f64) {
        *self.disk_percent.lock().unwrap() = percent;
    }

    pub fn set_gpu_user(&self, user: &str) {
        *self.gpu_user.lock().unwrap() = user.to_string();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn metrics(&self, host: &HostDescriptor) -> HostMetrics {
        let disk_percent = *self.disk_percent.lock().unwrap();
        let user = self.gpu_user.lock().unwrap().clone();
        HostMetrics {
            hostname: Some(host.name.clone()),
            exporter_timestamp: None,
            status_code: 200,
            system: SystemStats {
                cpu_percent: Some(12.5),
                disks: vec![DiskUsage {
                    path: "/".to_string(),
                    label: Some("Root (/)".to_string()),
                    percent_used: Some(disk_percent),
                    ..DiskUsage::default()
                }],
                ..SystemStats::default()
            },
            gpus: vec![GpuEntry::Ok(GpuStats {
                index: Some(0),
                name: Some("Mock GPU".to_string()),
                processes: vec![ProcessEntry::Ok(ProcessStats {
                    pid: Some(4242),
                    username: Some(user.clone()),
                    command: Some("python train.py".to_string()),
                    ..ProcessStats::default()
                })],
                process_usernames: vec![user],
                ..GpuStats::default()
            })],
        }
    }
}

impl FetchMetrics for ScriptedFetcher {
    async fn fetch(&self, host: &HostDescriptor, _timeout: Duration) -> HostMetricResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&host.name)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        match behavior {
            Behavior::Ok { delay } => {
                tokio::time::sleep(delay).await;
                HostMetricResult::Ok {
                    metrics: self.metrics(host),
                    fetched_at: SystemTime::now(),
                }
            }
            Behavior::Fail => {
                HostMetricResult::failed(HostFetchError::Request("scripted failure".to_string()))
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("scripted panic for {}", host.name),
        }
    }
}

pub fn hosts(names: &[&str]) -> Vec<HostDescriptor> {
    names
        .iter()
        .map(|name| HostDescriptor {
            name: name.to_string(),
            url: format!("http://{name}.local:8000/metrics"),
        })
        .collect()
}
