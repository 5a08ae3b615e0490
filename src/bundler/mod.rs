//! Bundle sizing strategies.
//!
//! Every node channel owns one [`Bundler`] for its whole lifetime. Before each
//! dispatch the channel asks it for a size; after each successful bundle it
//! feeds back how many tasks ran and how long the exchange took.
//!
//! The active algorithm is held by the [`LoadBalancer`] and can be swapped at
//! runtime. A swap bumps a generation counter; channels pick up a new bundler
//! the next time they go idle, so a bundle in flight always reports back to
//! the bundler that sized it.

mod adaptive;
mod fixed;
mod proportional;

pub use adaptive::{AdaptiveBundler, AdaptiveSettings};
pub use fixed::{FixedBundler, FixedSettings};
pub use proportional::{PerformanceTable, ProportionalBundler, ProportionalSettings};

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::LoadBalancerConfig;
use crate::error::{DispatchError, Result};
use crate::id::ChannelId;

pub trait Bundler: Send {
    /// Number of tasks to put in the next bundle, at least 1.
    fn next_size(&self) -> usize;

    /// Report a completed bundle.
    fn feedback(&mut self, task_count: usize, elapsed: Duration);

    fn algorithm(&self) -> &'static str;
}

pub const ALGORITHMS: [&str; 3] = [
    fixed::ALGORITHM,
    adaptive::ALGORITHM,
    proportional::ALGORITHM,
];

/// Typed access to the string parameters of one algorithm.
pub(crate) struct Parameters<'a> {
    algorithm: &'a str,
    values: &'a BTreeMap<String, String>,
}

impl<'a> Parameters<'a> {
    pub(crate) fn new(
        algorithm: &'a str,
        values: &'a BTreeMap<String, String>,
        known: &[&str],
    ) -> Self {
        for name in values.keys() {
            if !known.contains(&name.as_str()) {
                tracing::warn!(algorithm, parameter = %name, "Ignoring unknown load-balancer parameter");
            }
        }
        Self { algorithm, values }
    }

    pub(crate) fn get<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.values.get(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| self.invalid(name, value)),
            None => Ok(default),
        }
    }

    pub(crate) fn positive(&self, name: &str, default: usize) -> Result<usize> {
        let value = self.get(name, default)?;
        if value == 0 {
            return Err(self.invalid(name, "0"));
        }
        Ok(value)
    }

    pub(crate) fn non_negative_f64(&self, name: &str, default: f64) -> Result<f64> {
        let value: f64 = self.get(name, default)?;
        if !value.is_finite() || value < 0.0 {
            return Err(self.invalid(name, &value.to_string()));
        }
        Ok(value)
    }

    fn invalid(&self, name: &str, value: &str) -> DispatchError {
        DispatchError::InvalidParameter {
            algorithm: self.algorithm.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum BundlerFactory {
    Fixed(FixedSettings),
    Adaptive(AdaptiveSettings),
    Proportional(ProportionalSettings, Arc<PerformanceTable>),
}

impl BundlerFactory {
    fn from_config(config: &LoadBalancerConfig) -> Result<Self> {
        let name = config.algorithm.as_str();
        match name {
            fixed::ALGORITHM => Ok(BundlerFactory::Fixed(FixedSettings::from_parameters(
                &config.parameters,
            )?)),
            adaptive::ALGORITHM => Ok(BundlerFactory::Adaptive(
                AdaptiveSettings::from_parameters(&config.parameters)?,
            )),
            proportional::ALGORITHM => Ok(BundlerFactory::Proportional(
                ProportionalSettings::from_parameters(&config.parameters)?,
                Arc::new(PerformanceTable::new()),
            )),
            other => Err(DispatchError::UnknownAlgorithm(other.to_string())),
        }
    }

    fn create(&self, channel: ChannelId) -> Box<dyn Bundler> {
        match self {
            BundlerFactory::Fixed(settings) => Box::new(FixedBundler::new(settings.clone())),
            BundlerFactory::Adaptive(settings) => Box::new(AdaptiveBundler::new(settings.clone())),
            BundlerFactory::Proportional(settings, table) => Box::new(ProportionalBundler::new(
                channel,
                settings.clone(),
                Arc::clone(table),
            )),
        }
    }
}

#[derive(Debug)]
struct ActiveAlgorithm {
    config: LoadBalancerConfig,
    factory: BundlerFactory,
    generation: u64,
}

/// Holds the active load-balancing algorithm and creates per-channel bundlers.
#[derive(Debug)]
pub struct LoadBalancer {
    active: RwLock<ActiveAlgorithm>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Result<Self> {
        let factory = BundlerFactory::from_config(&config)?;
        Ok(Self {
            active: RwLock::new(ActiveAlgorithm {
                config,
                factory,
                generation: 0,
            }),
        })
    }

    pub fn config(&self) -> Result<LoadBalancerConfig> {
        Ok(self.active.read()?.config.clone())
    }

    /// Bumped on every successful [`LoadBalancer::set_algorithm`].
    pub fn generation(&self) -> Result<u64> {
        Ok(self.active.read()?.generation)
    }

    /// Validate and activate a new algorithm. On error the current one stays.
    pub fn set_algorithm(&self, config: LoadBalancerConfig) -> Result<u64> {
        let factory = BundlerFactory::from_config(&config)?;
        let mut active = self.active.write()?;
        active.generation += 1;
        tracing::info!(
            algorithm = %config.algorithm,
            parameters = ?config.parameters,
            generation = active.generation,
            "Load-balancing algorithm changed"
        );
        active.config = config;
        active.factory = factory;
        Ok(active.generation)
    }

    /// A fresh bundler for `channel` and the generation it belongs to.
    pub fn create_bundler(&self, channel: ChannelId) -> Result<(u64, Box<dyn Bundler>)> {
        let (generation, factory) = {
            let active = self.active.read()?;
            (active.generation, active.factory.clone())
        };
        Ok((generation, factory.create(channel)))
    }
}
