use crate::cache::SnapshotStore;
use crate::collectors::{fanout, FetchMetrics};
use crate::metrics::Metrics;
use crate::registry::{HostRegistry, RegistryView};
use crate::snapshot::Snapshot;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

const MAX_ROUNDS_PER_REQUEST: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundFailure {
    #[error("сбой раунда обновления: сборщик аварийно завершился: {0}")]
    Panicked(String),
    #[error("сбой раунда обновления: сборщик был отменён")]
    Cancelled,
}

impl From<JoinError> for RoundFailure {
    fn from(err: JoinError) -> Self {
        match err.try_into_panic() {
            Ok(payload) => Self::Panicked(panic_message(payload)),
            Err(_) => Self::Cancelled,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_string(),
            Err(_) => "неизвестная паника".to_string(),
        },
    }
}

#[derive(Debug, Clone)]
struct RoundOutcome {
    snapshot: Arc<Snapshot>,
    failed: bool,
}

type RoundFuture = Shared<BoxFuture<'static, RoundOutcome>>;

struct InFlight {
    round: u64,
    result: RoundFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing { round: u64 },
}

pub struct RefreshCoordinator<F> {
    registry: Arc<HostRegistry>,
    fetcher: Arc<F>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    per_host_timeout: Duration,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    rounds: AtomicU64,
}

impl<F: FetchMetrics> RefreshCoordinator<F> {
    pub fn new(
        registry: Arc<HostRegistry>,
        fetcher: Arc<F>,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
        per_host_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            fetcher,
            store,
            metrics,
            per_host_timeout,
            in_flight: Arc::new(Mutex::new(None)),
            rounds: AtomicU64::new(0),
        }
    }

    pub async fn ensure_fresh(&self) -> Arc<Snapshot> {
        let wanted = self.registry.generation();
        let mut outcome = self.join_or_start().await;
        for _ in 1..MAX_ROUNDS_PER_REQUEST {
            if outcome.failed || outcome.snapshot.generation >= wanted {
                break;
            }
            debug!(
                got = outcome.snapshot.generation,
                wanted, "раунд собран по устаревшему списку хостов, повторяем"
            );
            outcome = self.join_or_start().await;
        }
        outcome.snapshot
    }

    pub fn state(&self) -> RefreshState {
        let slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(in_flight) => RefreshState::Refreshing {
                round: in_flight.round,
            },
            None => RefreshState::Idle,
        }
    }

    fn join_or_start(&self) -> RoundFuture {
        let fetcher = Arc::clone(&self.fetcher);
        let per_host_timeout = self.per_host_timeout;
        self.join_or_start_with(move |view, round| {
            fanout::collect(fetcher, view, per_host_timeout, round)
        })
    }

    fn join_or_start_with<C, Fut>(&self, collect: C) -> RoundFuture
    where
        C: FnOnce(Arc<RegistryView>, u64) -> Fut + Send + 'static,
        Fut: Future<Output = Snapshot> + Send + 'static,
    {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(in_flight) = slot.as_ref() {
            self.metrics.inc_coalesced();
            debug!(round = in_flight.round, "присоединяемся к идущему раунду");
            return in_flight.result.clone();
        }

        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(run_round(
            Arc::clone(&self.registry),
            collect,
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            Arc::clone(&self.in_flight),
            round,
        ));

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let result = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let failure = RoundFailure::from(err);
                    error!(round, error = %failure, "задача раунда завершилась аварийно");
                    finish(&in_flight, round);
                    RoundOutcome {
                        snapshot: store.load(),
                        failed: true,
                    }
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            round,
            result: result.clone(),
        });
        result
    }
}

async fn run_round<C, Fut>(
    registry: Arc<HostRegistry>,
    collect: C,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    round: u64,
) -> RoundOutcome
where
    C: FnOnce(Arc<RegistryView>, u64) -> Fut,
    Fut: Future<Output = Snapshot> + Send + 'static,
{
    let started = Instant::now();
    let view = registry.current();
    metrics.set_registry(view.generation, view.hosts.len());
    debug!(
        round,
        generation = view.generation,
        hosts = view.hosts.len(),
        "старт раунда опроса"
    );

    let worker = tokio::spawn(collect(view, round));
    let outcome = match worker.await {
        Ok(snapshot) => {
            let snapshot = Arc::new(snapshot);
            metrics.observe_round(&snapshot, started.elapsed());
            if !store.publish(Arc::clone(&snapshot)) {
                warn!(
                    round,
                    generation = snapshot.generation,
                    "результат раунда устарел и не опубликован"
                );
            }
            info!(
                round,
                generation = snapshot.generation,
                ok = snapshot.ok_count(),
                failed = snapshot.error_count(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "раунд опроса завершён"
            );
            RoundOutcome {
                snapshot,
                failed: false,
            }
        }
        Err(err) => {
            let failure = RoundFailure::from(err);
            metrics.inc_round_failure();
            error!(round, error = %failure, "раунд опроса завершился сбоем");
            let failed = Arc::new(store.load().with_refresh_error(failure.to_string()));
            store.publish(Arc::clone(&failed));
            RoundOutcome {
                snapshot: failed,
                failed: true,
            }
        }
    };

    finish(&in_flight, round);
    outcome
}

fn finish(in_flight: &Mutex<Option<InFlight>>, round: u64) {
    let mut slot = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|f| f.round == round) {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::HostFetchError;
    use crate::test_support::{hosts, Behavior, ScriptedFetcher};
    use futures_util::future::join_all;

    fn coordinator(
        names: &[&str],
        fetcher: ScriptedFetcher,
    ) -> (
        Arc<RefreshCoordinator<ScriptedFetcher>>,
        Arc<ScriptedFetcher>,
        Arc<HostRegistry>,
        Arc<SnapshotStore>,
    ) {
        let registry = Arc::new(HostRegistry::new(hosts(names)));
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(SnapshotStore::new(8));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&fetcher),
            Arc::clone(&store),
            Metrics::new().expect("инициализация метрик"),
            Duration::from_millis(500),
        ));
        (coordinator, fetcher, registry, store)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_round() {
        let (coordinator, fetcher, _, _) = coordinator(
            &["a", "b", "c", "d"],
            ScriptedFetcher::with_default(Behavior::delayed(100)),
        );

        let results = join_all((0..100).map(|_| coordinator.ensure_fresh())).await;

        assert_eq!(fetcher.calls(), 4);
        assert!(results.iter().all(|s| Arc::ptr_eq(s, &results[0])));
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn sequential_calls_start_new_rounds() {
        let (coordinator, fetcher, _, store) = coordinator(&["a"], ScriptedFetcher::new());

        let first = coordinator.ensure_fresh().await;
        let second = coordinator.ensure_fresh().await;

        assert_eq!(first.round, 1);
        assert_eq!(second.round, 2);
        assert_eq!(fetcher.calls(), 2);
        assert!(Arc::ptr_eq(&store.load(), &second));
    }

    #[tokio::test]
    async fn state_reports_running_round() {
        let (coordinator, _, _, _) = coordinator(
            &["a"],
            ScriptedFetcher::with_default(Behavior::delayed(200)),
        );

        let running = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.state(), RefreshState::Refreshing { round: 1 });

        running.await.unwrap();
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn failed_hosts_stay_inside_the_snapshot() {
        let (coordinator, _, _, _) = coordinator(
            &["a", "b", "c"],
            ScriptedFetcher::new()
                .with("b", Behavior::Fail)
                .with("c", Behavior::Hang),
        );

        let snapshot = coordinator.ensure_fresh().await;

        assert_eq!(snapshot.host_names(), vec!["a", "b", "c"]);
        assert!(snapshot.hosts[0].result.is_ok());
        assert!(matches!(
            snapshot.hosts[1].result.error(),
            Some(HostFetchError::Request(_))
        ));
        assert!(matches!(
            snapshot.hosts[2].result.error(),
            Some(HostFetchError::Timeout { after_ms: 500 })
        ));
        assert_eq!(snapshot.refresh_error, None);
    }

    #[tokio::test]
    async fn caller_after_reload_never_gets_old_hosts() {
        let (coordinator, _, registry, store) = coordinator(
            &["a", "b"],
            ScriptedFetcher::with_default(Behavior::delayed(200)),
        );

        let early = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.ensure_fresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let generation = registry.replace(hosts(&["d"]));

        let late = coordinator.ensure_fresh().await;
        let early = early.await.unwrap();

        assert_eq!(early.host_names(), vec!["a", "b"]);
        assert_eq!(late.host_names(), vec!["d"]);
        assert_eq!(late.generation, generation);
        assert_eq!(store.load().generation, generation);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_round() {
        let (coordinator, fetcher, _, store) = coordinator(
            &["a"],
            ScriptedFetcher::with_default(Behavior::delayed(100)),
        );

        let _ = tokio::time::timeout(Duration::from_millis(10), coordinator.ensure_fresh()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(store.load().round, 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    async fn crashing_collect(_view: Arc<RegistryView>, _round: u64) -> Snapshot {
        panic!("сборщик упал")
    }

    #[tokio::test]
    async fn crashed_round_keeps_previous_snapshot() {
        let (coordinator, _, _, store) = coordinator(&["a", "b"], ScriptedFetcher::new());
        let good = coordinator.ensure_fresh().await;

        let outcome = coordinator
            .join_or_start_with(crashing_collect)
            .await;

        assert!(outcome.failed);
        let current = store.load();
        assert!(Arc::ptr_eq(&current, &outcome.snapshot));
        assert_eq!(current.host_names(), vec!["a", "b"]);
        assert_eq!(current.last_refresh, good.last_refresh);
        assert_eq!(current.round, good.round);
        assert_eq!(
            current.refresh_error.as_deref(),
            Some("сбой раунда обновления: сборщик аварийно завершился: сборщик упал")
        );
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.metrics.round_failures_total.get(), 1.0);
        assert_eq!(coordinator.metrics.rounds_total.get(), 1.0);

        let next = coordinator.ensure_fresh().await;
        assert_eq!(next.refresh_error, None);
        assert!(next.round > good.round);
    }

    #[test]
    fn round_failure_reads_panic_payload() {
        assert_eq!(
            panic_message(Box::new("static payload")),
            "static payload".to_string()
        );
        assert_eq!(
            panic_message(Box::new(String::from("owned payload"))),
            "owned payload".to_string()
        );
        assert_eq!(panic_message(Box::new(7_u8)), "неизвестная паника".to_string());
    }
}
