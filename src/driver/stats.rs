use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cumulative driver counters, updated lock-free from every channel.
#[derive(Debug, Default)]
pub struct DriverStatistics {
    jobs_queued: AtomicU64,
    jobs_ended: AtomicU64,
    bundles_dispatched: AtomicU64,
    bundles_returned: AtomicU64,
    bundles_failed: AtomicU64,
    bundles_requeued: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_executed: AtomicU64,
    elapsed_nanos: AtomicU64,
    node_execution_nanos: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    nodes_connected: AtomicU64,
    clients_connected: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub jobs_queued: u64,
    pub jobs_ended: u64,
    pub bundles_dispatched: u64,
    pub bundles_returned: u64,
    pub bundles_failed: u64,
    pub bundles_requeued: u64,
    pub tasks_dispatched: u64,
    pub tasks_executed: u64,
    /// Driver-measured round trip of all returned bundles
    pub elapsed_ms: u64,
    /// Execution time reported by the nodes themselves
    pub node_execution_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub nodes_connected: u64,
    pub clients_connected: u64,
}

fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

impl DriverStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn job_queued(&self) {
        add(&self.jobs_queued, 1);
    }

    pub(crate) fn job_ended(&self) {
        add(&self.jobs_ended, 1);
    }

    pub(crate) fn bundle_dispatched(&self, task_count: usize) {
        add(&self.bundles_dispatched, 1);
        add(&self.tasks_dispatched, task_count as u64);
    }

    pub(crate) fn bundle_executed(
        &self,
        task_count: usize,
        elapsed: Duration,
        node_execution: Option<Duration>,
    ) {
        add(&self.bundles_returned, 1);
        add(&self.tasks_executed, task_count as u64);
        add(&self.elapsed_nanos, elapsed.as_nanos() as u64);
        if let Some(node_execution) = node_execution {
            add(&self.node_execution_nanos, node_execution.as_nanos() as u64);
        }
    }

    pub(crate) fn bundle_failed(&self) {
        add(&self.bundles_returned, 1);
        add(&self.bundles_failed, 1);
    }

    pub(crate) fn bundle_requeued(&self) {
        add(&self.bundles_requeued, 1);
    }

    pub(crate) fn bytes_in(&self, bytes: usize) {
        add(&self.bytes_in, bytes as u64);
    }

    pub(crate) fn bytes_out(&self, bytes: usize) {
        add(&self.bytes_out, bytes as u64);
    }

    pub(crate) fn node_connected(&self) {
        add(&self.nodes_connected, 1);
    }

    pub(crate) fn node_disconnected(&self) {
        saturating_decrement(&self.nodes_connected);
    }

    pub(crate) fn client_connected(&self) {
        add(&self.clients_connected, 1);
    }

    pub(crate) fn client_disconnected(&self) {
        saturating_decrement(&self.clients_connected);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatisticsSnapshot {
            jobs_queued: load(&self.jobs_queued),
            jobs_ended: load(&self.jobs_ended),
            bundles_dispatched: load(&self.bundles_dispatched),
            bundles_returned: load(&self.bundles_returned),
            bundles_failed: load(&self.bundles_failed),
            bundles_requeued: load(&self.bundles_requeued),
            tasks_dispatched: load(&self.tasks_dispatched),
            tasks_executed: load(&self.tasks_executed),
            elapsed_ms: load(&self.elapsed_nanos) / 1_000_000,
            node_execution_ms: load(&self.node_execution_nanos) / 1_000_000,
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            nodes_connected: load(&self.nodes_connected),
            clients_connected: load(&self.clients_connected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_never_underflow() {
        let stats = DriverStatistics::new();
        stats.node_disconnected();
        stats.node_connected();
        stats.node_connected();
        stats.node_disconnected();
        assert_eq!(stats.snapshot().nodes_connected, 1);
    }

    #[test]
    fn executed_bundles_accumulate_time() {
        let stats = DriverStatistics::new();
        stats.bundle_executed(4, Duration::from_millis(30), Some(Duration::from_millis(20)));
        stats.bundle_executed(2, Duration::from_millis(10), None);
        stats.bundle_failed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bundles_returned, 3);
        assert_eq!(snapshot.bundles_failed, 1);
        assert_eq!(snapshot.tasks_executed, 6);
        assert_eq!(snapshot.elapsed_ms, 40);
        assert_eq!(snapshot.node_execution_ms, 20);
    }
}
