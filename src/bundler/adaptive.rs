use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::bundler::{Bundler, Parameters};
use crate::error::Result;

pub(crate) const ALGORITHM: &str = "adaptive";

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSettings {
    pub initial_size: usize,
    /// Wall-clock time one bundle should take
    pub target: Duration,
    /// Number of per-task samples kept in the rolling window
    pub sample_window: usize,
    /// Samples needed before the size is adjusted at all
    pub min_samples: usize,
    /// Number of consecutive guesses checked for stability
    pub stability_window: usize,
    /// Largest coefficient of variation of those guesses deemed stable
    pub stability_threshold: f64,
    /// Relative deviation from the stable size that restarts the search
    pub max_deviation: f64,
    pub max_size: usize,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            initial_size: 5,
            target: Duration::from_millis(200),
            sample_window: 64,
            min_samples: 4,
            stability_window: 5,
            stability_threshold: 0.05,
            max_deviation: 0.5,
            max_size: 10_000,
        }
    }
}

impl AdaptiveSettings {
    pub(crate) fn from_parameters(values: &BTreeMap<String, String>) -> Result<Self> {
        let params = Parameters::new(
            ALGORITHM,
            values,
            &[
                "initial_size",
                "target_ms",
                "sample_window",
                "min_samples",
                "stability_window",
                "stability_threshold",
                "max_deviation",
                "max_size",
            ],
        );
        let defaults = Self::default();
        let target_ms = params.positive("target_ms", defaults.target.as_millis() as usize)?;
        let max_size = params.positive("max_size", defaults.max_size)?;
        Ok(Self {
            initial_size: params.positive("initial_size", defaults.initial_size)?.min(max_size),
            target: Duration::from_millis(target_ms as u64),
            sample_window: params.positive("sample_window", defaults.sample_window)?,
            min_samples: params.positive("min_samples", defaults.min_samples)?,
            stability_window: params.positive("stability_window", defaults.stability_window)?,
            stability_threshold: params
                .non_negative_f64("stability_threshold", defaults.stability_threshold)?,
            max_deviation: params.non_negative_f64("max_deviation", defaults.max_deviation)?,
            max_size,
        })
    }
}

/// Sizes bundles so that one bundle takes about `target` to execute.
///
/// Keeps a rolling window of per-task execution times. Once enough samples
/// exist, each feedback produces a guess `target / mean`. When the last
/// `stability_window` guesses agree closely the size is pinned to their mean
/// and only a guess deviating by more than `max_deviation` unpins it.
#[derive(Debug, Clone)]
pub struct AdaptiveBundler {
    settings: AdaptiveSettings,
    samples: VecDeque<f64>,
    guesses: VecDeque<usize>,
    size: usize,
    stable: bool,
}

impl AdaptiveBundler {
    pub fn new(settings: AdaptiveSettings) -> Self {
        Self {
            size: settings.initial_size.max(1),
            samples: VecDeque::with_capacity(settings.sample_window),
            guesses: VecDeque::with_capacity(settings.stability_window),
            stable: false,
            settings,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    fn guess(&self) -> usize {
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        if mean <= 0.0 {
            return self.settings.max_size;
        }
        let size = (self.settings.target.as_nanos() as f64 / mean).round();
        (size as usize).clamp(1, self.settings.max_size)
    }
}

impl Bundler for AdaptiveBundler {
    fn next_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, task_count: usize, elapsed: Duration) {
        if task_count == 0 {
            return;
        }
        if self.samples.len() == self.settings.sample_window {
            self.samples.pop_front();
        }
        self.samples
            .push_back(elapsed.as_nanos() as f64 / task_count as f64);
        if self.samples.len() < self.settings.min_samples {
            return;
        }

        let guess = self.guess();
        if self.stable {
            let deviation = (guess as f64 - self.size as f64).abs() / self.size as f64;
            if deviation <= self.settings.max_deviation {
                return;
            }
            tracing::debug!(size = self.size, guess, "Bundle size left stable state");
            self.stable = false;
            self.guesses.clear();
        }

        if self.guesses.len() == self.settings.stability_window {
            self.guesses.pop_front();
        }
        self.guesses.push_back(guess);
        self.size = guess;

        if self.guesses.len() == self.settings.stability_window
            && coefficient_of_variation(&self.guesses) <= self.settings.stability_threshold
        {
            let mean = self.guesses.iter().sum::<usize>() as f64 / self.guesses.len() as f64;
            self.size = (mean.round() as usize).clamp(1, self.settings.max_size);
            self.stable = true;
            tracing::debug!(size = self.size, "Bundle size stable");
        }
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}

fn coefficient_of_variation(values: &VecDeque<usize>) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AdaptiveSettings {
        AdaptiveSettings {
            initial_size: 2,
            target: Duration::from_millis(100),
            sample_window: 16,
            min_samples: 4,
            stability_window: 4,
            stability_threshold: 0.05,
            max_deviation: 0.5,
            max_size: 1_000,
        }
    }

    fn run(bundler: &mut AdaptiveBundler, per_task: Duration) {
        let size = bundler.next_size();
        bundler.feedback(size, per_task * size as u32);
    }

    #[test]
    fn converges_under_constant_latency() {
        let settings = settings();
        let bound = settings.min_samples + settings.stability_window;
        let mut bundler = AdaptiveBundler::new(settings);
        for _ in 0..bound {
            run(&mut bundler, Duration::from_millis(10));
        }
        assert!(bundler.is_stable());
        assert_eq!(bundler.next_size(), 10);
    }

    #[test]
    fn keeps_initial_size_until_enough_samples() {
        let mut bundler = AdaptiveBundler::new(settings());
        for _ in 0..3 {
            run(&mut bundler, Duration::from_millis(1));
        }
        assert_eq!(bundler.next_size(), 2);
        assert!(!bundler.is_stable());
    }

    #[test]
    fn small_jitter_keeps_stable_size() {
        let mut bundler = AdaptiveBundler::new(settings());
        for _ in 0..8 {
            run(&mut bundler, Duration::from_millis(10));
        }
        assert!(bundler.is_stable());
        run(&mut bundler, Duration::from_millis(12));
        assert!(bundler.is_stable());
        assert_eq!(bundler.next_size(), 10);
    }

    #[test]
    fn large_deviation_restarts_search() {
        let mut bundler = AdaptiveBundler::new(AdaptiveSettings {
            sample_window: 4,
            max_deviation: 0.3,
            ..settings()
        });
        for _ in 0..8 {
            run(&mut bundler, Duration::from_millis(10));
        }
        assert!(bundler.is_stable());

        run(&mut bundler, Duration::from_millis(50));
        assert!(!bundler.is_stable());
        assert_eq!(bundler.next_size(), 5);

        for _ in 0..8 {
            run(&mut bundler, Duration::from_millis(50));
        }
        assert!(bundler.is_stable());
        assert_eq!(bundler.next_size(), 2);
    }

    #[test]
    fn size_is_clamped() {
        let mut bundler = AdaptiveBundler::new(AdaptiveSettings {
            max_size: 50,
            ..settings()
        });
        for _ in 0..8 {
            bundler.feedback(10, Duration::ZERO);
        }
        assert_eq!(bundler.next_size(), 50);

        let mut bundler = AdaptiveBundler::new(settings());
        for _ in 0..8 {
            bundler.feedback(1, Duration::from_secs(10));
        }
        assert_eq!(bundler.next_size(), 1);
    }
}
