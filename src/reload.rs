use crate::cache::SnapshotStore;
use crate::config::ConfigError;
use crate::metrics::Metrics;
use crate::registry::{load_hosts_file, validate_hosts, HostDescriptor, HostRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub generation: u64,
    pub host_count: usize,
}

pub struct ConfigReloader {
    source: PathBuf,
    registry: Arc<HostRegistry>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
}

impl ConfigReloader {
    pub fn new(
        source: PathBuf,
        registry: Arc<HostRegistry>,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            registry,
            store,
            metrics,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let result = load_hosts_file(&self.source).and_then(|hosts| self.apply(hosts));
        if let Err(err) = &result {
            self.metrics.inc_reload("error");
            error!(
                path = %self.source.display(),
                error = %err,
                "не удалось перезагрузить список хостов, оставляем прежний"
            );
        }
        result
    }

    pub fn apply(&self, hosts: Vec<HostDescriptor>) -> Result<ReloadOutcome, ConfigError> {
        validate_hosts(&hosts)?;
        let host_count = hosts.len();
        let generation = self.registry.replace(hosts);
        self.store.invalidate(generation);
        self.metrics.set_registry(generation, host_count);
        self.metrics.inc_reload("ok");
        info!(generation, hosts = host_count, "список хостов перезагружен");
        Ok(ReloadOutcome {
            generation,
            host_count,
        })
    }
}
