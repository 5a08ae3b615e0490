use std::collections::BTreeMap;
use std::time::Duration;

use crate::bundler::{Bundler, Parameters};
use crate::error::Result;

pub(crate) const ALGORITHM: &str = "fixed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedSettings {
    pub size: usize,
}

impl Default for FixedSettings {
    fn default() -> Self {
        Self { size: 5 }
    }
}

impl FixedSettings {
    pub(crate) fn from_parameters(values: &BTreeMap<String, String>) -> Result<Self> {
        let params = Parameters::new(ALGORITHM, values, &["size"]);
        Ok(Self {
            size: params.positive("size", Self::default().size)?,
        })
    }
}

/// Always hands out the same bundle size and ignores feedback.
#[derive(Debug, Clone)]
pub struct FixedBundler {
    settings: FixedSettings,
}

impl FixedBundler {
    pub fn new(settings: FixedSettings) -> Self {
        Self { settings }
    }
}

impl Bundler for FixedBundler {
    fn next_size(&self) -> usize {
        self.settings.size
    }

    fn feedback(&mut self, _task_count: usize, _elapsed: Duration) {}

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_does_not_change_size() {
        let mut bundler = FixedBundler::new(FixedSettings { size: 4 });
        bundler.feedback(4, Duration::from_secs(30));
        bundler.feedback(1, Duration::from_nanos(1));
        assert_eq!(bundler.next_size(), 4);
    }

    #[test]
    fn parses_size() {
        let values = BTreeMap::from([("size".to_string(), " 12 ".to_string())]);
        assert_eq!(FixedSettings::from_parameters(&values).unwrap().size, 12);
        assert_eq!(
            FixedSettings::from_parameters(&BTreeMap::new()).unwrap(),
            FixedSettings::default()
        );
    }
}
