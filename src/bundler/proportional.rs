use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::bundler::{Bundler, Parameters};
use crate::error::Result;
use crate::id::ChannelId;

pub(crate) const ALGORITHM: &str = "proportional";

#[derive(Debug, Clone, PartialEq)]
pub struct ProportionalSettings {
    /// Size used until a node has reported its first bundle
    pub initial_size: usize,
    /// Number of per-task samples averaged for each node
    pub performance_cache_size: usize,
    /// Exponent applied to each node's score; higher favours fast nodes more
    pub proportionality_factor: f64,
    /// Total number of tasks shared out across the pool
    pub max_size: usize,
}

impl Default for ProportionalSettings {
    fn default() -> Self {
        Self {
            initial_size: 5,
            performance_cache_size: 20,
            proportionality_factor: 1.0,
            max_size: 100,
        }
    }
}

impl ProportionalSettings {
    pub(crate) fn from_parameters(values: &BTreeMap<String, String>) -> Result<Self> {
        let params = Parameters::new(
            ALGORITHM,
            values,
            &[
                "initial_size",
                "performance_cache_size",
                "proportionality_factor",
                "max_size",
            ],
        );
        let defaults = Self::default();
        Ok(Self {
            initial_size: params.positive("initial_size", defaults.initial_size)?,
            performance_cache_size: params
                .positive("performance_cache_size", defaults.performance_cache_size)?,
            proportionality_factor: params
                .non_negative_f64("proportionality_factor", defaults.proportionality_factor)?,
            max_size: params.positive("max_size", defaults.max_size)?,
        })
    }
}

#[derive(Debug)]
struct NodePerformance {
    samples: VecDeque<f64>,
    size: usize,
}

impl NodePerformance {
    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }
}

/// Per-node rolling performance shared by every proportional bundler of one
/// load-balancer generation.
#[derive(Debug, Default)]
pub struct PerformanceTable {
    nodes: Mutex<HashMap<ChannelId, NodePerformance>>,
}

impl PerformanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned table only holds statistics; keep using them.
    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, NodePerformance>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, channel: ChannelId, initial_size: usize) {
        self.lock().insert(
            channel,
            NodePerformance {
                samples: VecDeque::new(),
                size: initial_size,
            },
        );
    }

    fn unregister(&self, channel: ChannelId, settings: &ProportionalSettings) {
        let mut nodes = self.lock();
        if nodes.remove(&channel).is_some() {
            rebalance(&mut nodes, settings);
        }
    }

    fn size_of(&self, channel: ChannelId) -> Option<usize> {
        self.lock().get(&channel).map(|node| node.size)
    }

    fn record(&self, channel: ChannelId, per_task_nanos: f64, settings: &ProportionalSettings) {
        let mut nodes = self.lock();
        let Some(node) = nodes.get_mut(&channel) else {
            return;
        };
        if node.samples.len() == settings.performance_cache_size {
            node.samples.pop_front();
        }
        node.samples.push_back(per_task_nanos);
        rebalance(&mut nodes, settings);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Share `max_size` out across nodes with a known mean, in proportion to
/// `(1 / mean) ^ factor`. Nodes without samples keep their current size.
fn rebalance(nodes: &mut HashMap<ChannelId, NodePerformance>, settings: &ProportionalSettings) {
    let scores: Vec<(ChannelId, f64)> = nodes
        .iter()
        .filter_map(|(channel, node)| {
            let mean = node.mean()?;
            let score = if mean > 0.0 { 1.0 / mean } else { f64::MAX };
            Some((*channel, score.powf(settings.proportionality_factor)))
        })
        .collect();
    let total: f64 = scores.iter().map(|(_, score)| score).sum();
    if !total.is_finite() || total <= 0.0 {
        return;
    }
    for (channel, score) in scores {
        if let Some(node) = nodes.get_mut(&channel) {
            let share = (settings.max_size as f64 * score / total).round() as usize;
            node.size = share.clamp(1, settings.max_size);
        }
    }
}

/// Sizes each node's bundles by its share of the pool's total throughput.
#[derive(Debug)]
pub struct ProportionalBundler {
    channel: ChannelId,
    settings: ProportionalSettings,
    table: Arc<PerformanceTable>,
}

impl ProportionalBundler {
    pub fn new(
        channel: ChannelId,
        settings: ProportionalSettings,
        table: Arc<PerformanceTable>,
    ) -> Self {
        table.register(channel, settings.initial_size);
        Self {
            channel,
            settings,
            table,
        }
    }
}

impl Bundler for ProportionalBundler {
    fn next_size(&self) -> usize {
        self.table
            .size_of(self.channel)
            .unwrap_or(self.settings.initial_size)
    }

    fn feedback(&mut self, task_count: usize, elapsed: Duration) {
        if task_count == 0 {
            return;
        }
        let per_task = elapsed.as_nanos() as f64 / task_count as f64;
        self.table.record(self.channel, per_task, &self.settings);
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}

impl Drop for ProportionalBundler {
    fn drop(&mut self) {
        self.table.unregister(self.channel, &self.settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProportionalSettings {
        ProportionalSettings {
            initial_size: 3,
            performance_cache_size: 4,
            proportionality_factor: 1.0,
            max_size: 90,
        }
    }

    fn pair() -> (Arc<PerformanceTable>, ProportionalBundler, ProportionalBundler) {
        let table = Arc::new(PerformanceTable::new());
        let fast = ProportionalBundler::new(ChannelId::from(1), settings(), Arc::clone(&table));
        let slow = ProportionalBundler::new(ChannelId::from(2), settings(), Arc::clone(&table));
        (table, fast, slow)
    }

    #[test]
    fn uses_initial_size_before_feedback() {
        let (_, fast, slow) = pair();
        assert_eq!(fast.next_size(), 3);
        assert_eq!(slow.next_size(), 3);
    }

    #[test]
    fn faster_node_gets_larger_share() {
        let (_, mut fast, mut slow) = pair();
        fast.feedback(10, Duration::from_millis(100));
        slow.feedback(10, Duration::from_millis(200));
        assert_eq!(fast.next_size(), 60);
        assert_eq!(slow.next_size(), 30);
    }

    #[test]
    fn factor_sharpens_the_split() {
        let table = Arc::new(PerformanceTable::new());
        let settings = ProportionalSettings {
            proportionality_factor: 2.0,
            max_size: 100,
            ..settings()
        };
        let mut fast = ProportionalBundler::new(ChannelId::from(1), settings.clone(), Arc::clone(&table));
        let mut slow = ProportionalBundler::new(ChannelId::from(2), settings, Arc::clone(&table));
        fast.feedback(1, Duration::from_millis(10));
        slow.feedback(1, Duration::from_millis(30));
        assert_eq!(fast.next_size(), 90);
        assert_eq!(slow.next_size(), 10);
    }

    #[test]
    fn dropping_a_bundler_rebalances_the_rest() {
        let (table, mut fast, mut slow) = pair();
        fast.feedback(10, Duration::from_millis(100));
        slow.feedback(10, Duration::from_millis(200));
        drop(slow);
        assert_eq!(table.len(), 1);
        assert_eq!(fast.next_size(), 90);
    }

    #[test]
    fn rolling_mean_forgets_old_samples() {
        let (_, mut fast, mut slow) = pair();
        slow.feedback(1, Duration::from_millis(20));
        fast.feedback(1, Duration::from_millis(100));
        for _ in 0..4 {
            fast.feedback(1, Duration::from_millis(20));
        }
        assert_eq!(fast.next_size(), 45);
        assert_eq!(slow.next_size(), 45);
    }
}
