pub mod fanout;
pub mod fetcher;

use crate::registry::HostDescriptor;
use crate::snapshot::HostMetricResult;
use std::future::Future;
use std::time::Duration;

pub trait FetchMetrics: Send + Sync + 'static {
    fn fetch(
        &self,
        host: &HostDescriptor,
        timeout: Duration,
    ) -> impl Future<Output = HostMetricResult> + Send;
}
