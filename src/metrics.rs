use crate::snapshot::Snapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub rounds_total: Counter,
    pub round_failures_total: Counter,
    pub round_duration_seconds: Gauge,
    pub hosts_configured: Gauge,
    pub hosts_ok: Gauge,
    pub hosts_error: Gauge,
    pub host_fetch_errors_total: CounterVec,
    pub registry_generation: Gauge,
    pub last_refresh_timestamp_seconds: Gauge,
    pub cache_reads_total: CounterVec,
    pub coalesced_waiters_total: Counter,
    pub reloads_total: CounterVec,
    pub notifications_sent_total: Counter,
    pub scrape_count_total: Counter,
    pub uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let rounds_total = Counter::with_opts(opts!(
            "fleetmon_rounds_total",
            "Completed collection rounds"
        ))?;
        let round_failures_total = Counter::with_opts(opts!(
            "fleetmon_round_failures_total",
            "Collection rounds that failed as a whole"
        ))?;
        let round_duration_seconds = Gauge::with_opts(opts!(
            "fleetmon_round_duration_seconds",
            "Wall time of the last collection round"
        ))?;
        let hosts_configured = Gauge::with_opts(opts!(
            "fleetmon_hosts_configured",
            "Hosts in the active registry"
        ))?;
        let hosts_ok = Gauge::with_opts(opts!(
            "fleetmon_hosts_ok",
            "Hosts that answered in the last round"
        ))?;
        let hosts_error = Gauge::with_opts(opts!(
            "fleetmon_hosts_error",
            "Hosts that failed in the last round"
        ))?;
        let host_fetch_errors_total = CounterVec::new(
            opts!(
                "fleetmon_host_fetch_errors_total",
                "Failed exporter fetches by host"
            ),
            &["host"],
        )?;
        let registry_generation = Gauge::with_opts(opts!(
            "fleetmon_registry_generation",
            "Generation of the active host registry"
        ))?;
        let last_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "fleetmon_last_refresh_timestamp_seconds",
            "Unix time of the last published snapshot"
        ))?;
        let cache_reads_total = CounterVec::new(
            opts!(
                "fleetmon_cache_reads_total",
                "Snapshot reads by where the answer came from"
            ),
            &["served_from"],
        )?;
        let coalesced_waiters_total = Counter::with_opts(opts!(
            "fleetmon_coalesced_waiters_total",
            "Refresh requests that joined an in-flight round"
        ))?;
        let reloads_total = CounterVec::new(
            opts!("fleetmon_reloads_total", "Host list reloads by result"),
            &["result"],
        )?;
        let notifications_sent_total = Counter::with_opts(opts!(
            "fleetmon_notifications_sent_total",
            "Alert notifications broadcast to subscribers"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "fleetmon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let uptime_seconds = Gauge::with_opts(opts!(
            "fleetmon_uptime_seconds",
            "Process uptime in seconds"
        ))?;

        register(&registry, &rounds_total)?;
        register(&registry, &round_failures_total)?;
        register(&registry, &round_duration_seconds)?;
        register(&registry, &hosts_configured)?;
        register(&registry, &hosts_ok)?;
        register(&registry, &hosts_error)?;
        register(&registry, &host_fetch_errors_total)?;
        register(&registry, &registry_generation)?;
        register(&registry, &last_refresh_timestamp_seconds)?;
        register(&registry, &cache_reads_total)?;
        register(&registry, &coalesced_waiters_total)?;
        register(&registry, &reloads_total)?;
        register(&registry, &notifications_sent_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            rounds_total,
            round_failures_total,
            round_duration_seconds,
            hosts_configured,
            hosts_ok,
            hosts_error,
            host_fetch_errors_total,
            registry_generation,
            last_refresh_timestamp_seconds,
            cache_reads_total,
            coalesced_waiters_total,
            reloads_total,
            notifications_sent_total,
            scrape_count_total,
            uptime_seconds,
        }))
    }

    pub fn observe_round(&self, snapshot: &Snapshot, elapsed: Duration) {
        self.rounds_total.inc();
        self.round_duration_seconds.set(elapsed.as_secs_f64());
        self.hosts_ok.set(snapshot.ok_count() as f64);
        self.hosts_error.set(snapshot.error_count() as f64);
        for entry in snapshot.hosts.iter().filter(|e| e.result.error().is_some()) {
            self.host_fetch_errors_total
                .with_label_values(&[&entry.host.name])
                .inc();
        }
        if let Some(ts) = snapshot.last_refresh {
            let secs = ts
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            self.last_refresh_timestamp_seconds.set(secs);
        }
    }

    pub fn inc_round_failure(&self) {
        self.round_failures_total.inc();
    }

    pub fn set_registry(&self, generation: u64, host_count: usize) {
        self.registry_generation.set(generation as f64);
        self.hosts_configured.set(host_count as f64);
    }

    pub fn inc_cache_read(&self, served_from: &str) {
        self.cache_reads_total
            .with_label_values(&[served_from])
            .inc();
    }

    pub fn inc_coalesced(&self) {
        self.coalesced_waiters_total.inc();
    }

    pub fn inc_reload(&self, result: &str) {
        self.reloads_total.with_label_values(&[result]).inc();
    }

    pub fn inc_notifications_sent(&self, count: usize) {
        self.notifications_sent_total.inc_by(count as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
