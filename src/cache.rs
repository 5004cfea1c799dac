use crate::collectors::FetchMetrics;
use crate::coordinator::RefreshCoordinator;
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    stale_below: AtomicU64,
    updates: broadcast::Sender<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            current: ArcSwap::from_pointee(Snapshot::initializing()),
            stale_below: AtomicU64::new(0),
            updates,
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn publish(&self, snapshot: Arc<Snapshot>) -> bool {
        let mut accepted = false;
        self.current.rcu(|cur| {
            accepted = snapshot.generation >= cur.generation;
            if accepted {
                Arc::clone(&snapshot)
            } else {
                Arc::clone(cur)
            }
        });
        if accepted {
            let _ = self.updates.send(snapshot);
        }
        accepted
    }

    pub fn invalidate(&self, generation: u64) {
        self.stale_below.fetch_max(generation, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.updates.subscribe()
    }

    pub fn is_fresh(&self, snapshot: &Snapshot, max_age: Duration, now: Instant) -> bool {
        if snapshot.generation < self.stale_below.load(Ordering::SeqCst) {
            return false;
        }
        match snapshot.age(now) {
            Some(age) => age <= max_age,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Cache,
    Refresh,
}

impl ServedFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Refresh => "refresh",
        }
    }
}

pub struct CacheRead {
    pub snapshot: Arc<Snapshot>,
    pub served_from: ServedFrom,
}

pub struct SnapshotCache<F> {
    store: Arc<SnapshotStore>,
    coordinator: Arc<RefreshCoordinator<F>>,
    metrics: Arc<Metrics>,
}

impl<F: FetchMetrics> SnapshotCache<F> {
    pub fn new(
        store: Arc<SnapshotStore>,
        coordinator: Arc<RefreshCoordinator<F>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            coordinator,
            metrics,
        }
    }

    pub async fn get(&self, max_age: Duration, force_fresh: bool) -> CacheRead {
        let cached = self.store.load();
        if !force_fresh && self.store.is_fresh(&cached, max_age, Instant::now()) {
            self.metrics.inc_cache_read(ServedFrom::Cache.as_str());
            return CacheRead {
                snapshot: cached,
                served_from: ServedFrom::Cache,
            };
        }

        debug!(
            force_fresh,
            max_age_secs = max_age.as_secs(),
            generation = cached.generation,
            "кэш устарел, требуется обновление"
        );
        let snapshot = self.coordinator.ensure_fresh().await;
        self.metrics.inc_cache_read(ServedFrom::Refresh.as_str());
        CacheRead {
            snapshot,
            served_from: ServedFrom::Refresh,
        }
    }
}
