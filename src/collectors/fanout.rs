use crate::collectors::FetchMetrics;
use crate::registry::RegistryView;
use crate::snapshot::{HostEntry, HostFetchError, HostMetricResult, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time;

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub async fn collect<F: FetchMetrics>(
    fetcher: Arc<F>,
    view: Arc<RegistryView>,
    per_host_timeout: Duration,
    round: u64,
) -> Snapshot {
    let handles: Vec<JoinHandle<HostMetricResult>> = view
        .hosts
        .iter()
        .cloned()
        .map(|host| {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move {
                match time::timeout(per_host_timeout, fetcher.fetch(&host, per_host_timeout)).await
                {
                    Ok(result) => result,
                    Err(_elapsed) => HostMetricResult::timeout(per_host_timeout),
                }
            })
        })
        .collect();
    let _guard = AbortOnDrop(handles.iter().map(JoinHandle::abort_handle).collect());

    let mut hosts = Vec::with_capacity(handles.len());
    for (host, handle) in view.hosts.iter().zip(handles) {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => HostMetricResult::failed(HostFetchError::TaskFailed(err.to_string())),
        };
        hosts.push(HostEntry {
            host: host.clone(),
            result,
        });
    }

    Snapshot::completed(view.generation, round, hosts)
}
