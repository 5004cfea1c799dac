mod alerts;
mod cache;
mod collectors;
mod config;
mod coordinator;
mod http;
mod metrics;
mod registry;
mod reload;
mod snapshot;
mod stats;
#[cfg(test)]
mod test_support;

use alerts::{AlertEngine, NotificationHub};
use axum::serve;
use cache::{SnapshotCache, SnapshotStore};
use clap::Parser;
use collectors::fetcher::HttpFetcher;
use config::{Config, ConfigError};
use coordinator::{RefreshCoordinator, RefreshState};
use http::{FreshnessPolicy, HttpAppState};
use metrics::Metrics;
use registry::HostRegistry;
use reload::ConfigReloader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmon")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long)]
    hosts: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if let Some(hosts) = cli.hosts {
        cfg.hosts_file = hosts;
    }

    info!(
        listen = %cfg.listen,
        hosts_file = %cfg.hosts_file.display(),
        per_host_timeout_ms = cfg.per_host_timeout_ms,
        "запуск fleetmon"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let registry = match HostRegistry::load(&cfg.hosts_file) {
        Ok(registry) => registry,
        Err(err @ ConfigError::Read { .. }) => {
            warn!(error = %err, "список хостов не найден, стартуем с пустым");
            HostRegistry::new(Vec::new())
        }
        Err(err) => {
            error!(error = %err, "не удалось загрузить список хостов");
            std::process::exit(1);
        }
    };
    let registry = Arc::new(registry);
    let view = registry.current();
    metrics.set_registry(view.generation, view.hosts.len());
    info!(hosts = view.hosts.len(), "список хостов загружен");

    let store = Arc::new(SnapshotStore::new(cfg.alerts.notification_buffer));
    let fetcher = Arc::new(HttpFetcher::new(&cfg.user_agent));
    let coordinator = Arc::new(RefreshCoordinator::new(
        Arc::clone(&registry),
        fetcher,
        Arc::clone(&store),
        Arc::clone(&metrics),
        Duration::from_millis(cfg.per_host_timeout_ms),
    ));
    let cache = Arc::new(SnapshotCache::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&metrics),
    ));
    let reloader = Arc::new(ConfigReloader::new(
        cfg.hosts_file.clone(),
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&metrics),
    ));
    let hub = NotificationHub::new(cfg.alerts.notification_buffer);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let app_state = HttpAppState {
            metrics: Arc::clone(&metrics),
            cache,
            registry: Arc::clone(&registry),
            reloader: Arc::clone(&reloader),
            notifications: hub.clone(),
            freshness: FreshnessPolicy::from_config(&cfg),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let notifier_task = if cfg.alerts.enabled {
        Some(tokio::spawn(alerts::run_notifier(
            AlertEngine::new(cfg.alerts.clone()),
            store.subscribe(),
            hub,
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    let refresh_task = if cfg.background_refresh_secs > 0 {
        let coordinator = Arc::clone(&coordinator);
        let mut shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(cfg.background_refresh_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки фонового обновления");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let RefreshState::Refreshing { round } = coordinator.state() {
                            debug!(round, "раунд уже идёт, тик пропущен");
                            continue;
                        }
                        coordinator.ensure_fresh().await;
                    }
                }
            }
        }))
    } else {
        None
    };

    if cfg.warmup_on_start {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let snapshot = coordinator.ensure_fresh().await;
            info!(
                hosts = snapshot.hosts.len(),
                ok = snapshot.ok_count(),
                "прогрев кэша завершён"
            );
        });
    }

    let reload_task = spawn_reload_on_hangup(Arc::clone(&reloader), shutdown_rx.clone());

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    if let Some(task) = refresh_task {
        let _ = task.await;
    }
    if let Some(task) = notifier_task {
        let _ = task.await;
    }
    if let Some(task) = reload_task {
        let _ = task.await;
    }
    let _ = http_task.await;
}

#[cfg(unix)]
fn spawn_reload_on_hangup(
    reloader: Arc<ConfigReloader>,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            warn!(error = %err, "не удалось подписаться на SIGHUP");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!(path = %reloader.source().display(), "SIGHUP: перезагрузка списка хостов");
                    let _ = reloader.reload();
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _reloader: Arc<ConfigReloader>,
    _shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    None
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
