//! Configuration surface consumed by the core.
//!
//! Everything here is plain data passed down explicitly; nothing reads a
//! mutable global. [`Config::from_env`] overlays `BRANCHMAP_*` variables on
//! top of the defaults, the same way the worker count is taken from
//! scheduler hints in [`crate::runtime`].

use crate::aggregate::AggregationOperator;
use crate::error::{Error, Result};
use crate::runtime;

/// How realizations are drawn from the branch space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingMode {
    #[default]
    FullEnumeration,
    Sample {
        num_samples: usize,
    },
}

/// Weight assigned to sampled realizations.
///
/// `Uniform` gives every sample `1 / num_samples`; `Frequency` keeps the
/// weight of the sampled source branch, leaving it to the draw frequency to
/// represent the rest of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightMode {
    #[default]
    Uniform,
    Frequency,
}

/// Execution substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Run every task inline on the caller's thread.
    Sequential,
    /// Submit all tasks up front to a local work-stealing pool.
    Pool { workers: usize },
    /// Broker-style dispatch: at most `max_in_flight` tasks queued at once.
    Queue {
        workers: usize,
        max_in_flight: usize,
    },
}

impl Default for ExecutorKind {
    fn default() -> Self {
        ExecutorKind::Pool {
            workers: runtime::detect_thread_config().count,
        }
    }
}

/// Shape of a work item, for weighting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemKind {
    /// Cheap per unit (e.g. a single-location source).
    Point,
    #[default]
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightPolicy {
    /// Multiplier applied to the unit count of point-like items.
    pub point_factor: f64,
}

impl Default for WeightPolicy {
    fn default() -> Self {
        WeightPolicy {
            point_factor: 1.0 / 40.0,
        }
    }
}

impl WeightPolicy {
    pub fn item_weight(&self, units: u64, kind: ItemKind) -> f64 {
        match kind {
            ItemKind::Point => units as f64 * self.point_factor,
            ItemKind::Extended => units as f64,
        }
    }
}

/// Resource ceilings. `None` means unlimited.
///
/// Realizations, items per group and the declared key space (see
/// `Stage::with_key_space`) are checked before anything is dispatched.
/// Keys are checked again on every fold, for oracles that return more
/// than was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limits {
    /// Distinct keys in a per-item result.
    pub max_keys: Option<usize>,
    pub max_items_per_group: Option<usize>,
    pub max_realizations: Option<usize>,
}

impl Limits {
    pub fn check(&self, what: &'static str, limit: Option<usize>, got: usize) -> Result<()> {
        match limit {
            Some(limit) if got > limit => Err(Error::Overflow { what, limit, got }),
            _ => Ok(()),
        }
    }

    pub fn check_keys(&self, got: usize) -> Result<()> {
        self.check("result keys", self.max_keys, got)
    }

    pub fn check_group_items(&self, got: usize) -> Result<()> {
        self.check("items per group", self.max_items_per_group, got)
    }

    pub fn check_realizations(&self, got: usize) -> Result<()> {
        self.check("realizations", self.max_realizations, got)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Desired number of blocks; drives the partition `max_weight`.
    pub concurrency_target: usize,
    pub random_seed: u64,
    pub sampling: SamplingMode,
    pub weight_mode: WeightMode,
    pub aggregation: AggregationOperator,
    pub executor: ExecutorKind,
    pub weighting: WeightPolicy,
    pub limits: Limits,
    /// Quantile levels in `[0, 1]` computed across realizations.
    pub quantiles: Vec<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            concurrency_target: runtime::detect_thread_config().count * 2,
            random_seed: 42,
            sampling: SamplingMode::default(),
            weight_mode: WeightMode::default(),
            aggregation: AggregationOperator::default(),
            executor: ExecutorKind::default(),
            weighting: WeightPolicy::default(),
            limits: Limits::default(),
            quantiles: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{key}={raw:?} is not valid"))),
        _ => Ok(None),
    }
}

/// Comma-separated levels, e.g. `0.15,0.5,0.85`.
fn parse_quantiles(list: &str) -> Result<Vec<f64>> {
    list.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| {
            q.parse::<f64>()
                .map_err(|_| Error::InvalidConfig(format!("quantile {q:?} is not a number")))
        })
        .collect()
}

impl Config {
    pub fn with_concurrency_target(mut self, target: usize) -> Self {
        self.concurrency_target = target;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingMode) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_weight_mode(mut self, mode: WeightMode) -> Self {
        self.weight_mode = mode;
        self
    }

    pub fn with_aggregation(mut self, op: AggregationOperator) -> Self {
        self.aggregation = op;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_quantiles(mut self, quantiles: Vec<f64>) -> Self {
        self.quantiles = quantiles;
        self
    }

    /// Defaults overlaid with `BRANCHMAP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        if let Some(v) = env_parse::<usize>("BRANCHMAP_CONCURRENT_TASKS")? {
            cfg.concurrency_target = v;
        }
        if let Some(v) = env_parse::<u64>("BRANCHMAP_SEED")? {
            cfg.random_seed = v;
        }
        if let Some(n) = env_parse::<usize>("BRANCHMAP_SAMPLES")? {
            cfg.sampling = if n == 0 {
                SamplingMode::FullEnumeration
            } else {
                SamplingMode::Sample { num_samples: n }
            };
        }
        if let Some(mode) = env_parse::<String>("BRANCHMAP_WEIGHT_MODE")? {
            cfg.weight_mode = match mode.to_ascii_lowercase().as_str() {
                "uniform" => WeightMode::Uniform,
                "frequency" => WeightMode::Frequency,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown weight mode {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = env_parse::<f64>("BRANCHMAP_POINT_WEIGHT")? {
            cfg.weighting.point_factor = v;
        }

        let workers = runtime::detect_thread_config().count;
        let max_in_flight = env_parse::<usize>("BRANCHMAP_MAX_IN_FLIGHT")?.unwrap_or(workers * 2);
        if let Some(kind) = env_parse::<String>("BRANCHMAP_EXECUTOR")? {
            cfg.executor = match kind.to_ascii_lowercase().as_str() {
                "sequential" | "no" => ExecutorKind::Sequential,
                "pool" => ExecutorKind::Pool { workers },
                "queue" => ExecutorKind::Queue {
                    workers,
                    max_in_flight,
                },
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "unknown executor {other:?}"
                    )));
                }
            };
        }

        cfg.limits.max_keys = env_parse("BRANCHMAP_MAX_KEYS")?;
        cfg.limits.max_items_per_group = env_parse("BRANCHMAP_MAX_ITEMS")?;
        cfg.limits.max_realizations = env_parse("BRANCHMAP_MAX_REALIZATIONS")?;

        if let Some(list) = env_parse::<String>("BRANCHMAP_QUANTILES")? {
            cfg.quantiles = parse_quantiles(&list)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_target == 0 {
            return Err(Error::InvalidConfig(
                "concurrency_target must be positive".into(),
            ));
        }
        if let SamplingMode::Sample { num_samples: 0 } = self.sampling {
            return Err(Error::InvalidConfig("num_samples must be positive".into()));
        }
        if !(self.weighting.point_factor.is_finite() && self.weighting.point_factor >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "point weight factor {} must be finite and non-negative",
                self.weighting.point_factor
            )));
        }
        if let Some(q) = self.quantiles.iter().find(|q| !(0.0..=1.0).contains(*q)) {
            return Err(Error::InvalidConfig(format!(
                "quantile {q} is outside [0, 1]"
            )));
        }
        match self.executor {
            ExecutorKind::Pool { workers: 0 } | ExecutorKind::Queue { workers: 0, .. } => Err(
                Error::InvalidConfig("a worker pool needs at least one worker".into()),
            ),
            ExecutorKind::Queue {
                max_in_flight: 0, ..
            } => Err(Error::InvalidConfig("max_in_flight must be positive".into())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_items_are_discounted() {
        let policy = WeightPolicy::default();
        assert_eq!(policy.item_weight(80, ItemKind::Point), 2.0);
        assert_eq!(policy.item_weight(80, ItemKind::Extended), 80.0);
        let custom = WeightPolicy { point_factor: 0.5 };
        assert_eq!(custom.item_weight(10, ItemKind::Point), 5.0);
    }

    #[test]
    fn limits_report_overflow() {
        let limits = Limits {
            max_realizations: Some(4),
            ..Limits::default()
        };
        assert!(limits.check_realizations(4).is_ok());
        let err = limits.check_realizations(6).unwrap_err();
        assert!(matches!(
            err,
            Error::Overflow {
                limit: 4,
                got: 6,
                ..
            }
        ));
        assert!(limits.check_keys(usize::MAX).is_ok());
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().with_concurrency_target(0).validate().is_err());
        assert!(
            Config::default()
                .with_sampling(SamplingMode::Sample { num_samples: 0 })
                .validate()
                .is_err()
        );
        assert!(
            Config::default()
                .with_executor(ExecutorKind::Queue {
                    workers: 2,
                    max_in_flight: 0
                })
                .validate()
                .is_err()
        );
        assert!(
            Config::default()
                .with_executor(ExecutorKind::Sequential)
                .validate()
                .is_ok()
        );
        assert!(Config::default().with_quantiles(vec![0.0, 0.5, 1.0]).validate().is_ok());
        assert!(Config::default().with_quantiles(vec![1.5]).validate().is_err());
        assert!(Config::default().with_quantiles(vec![f64::NAN]).validate().is_err());
    }

    #[test]
    fn quantile_lists_parse() {
        assert_eq!(parse_quantiles("0.15, 0.5,0.85").unwrap(), vec![0.15, 0.5, 0.85]);
        assert_eq!(parse_quantiles("0.5,").unwrap(), vec![0.5]);
        assert!(matches!(parse_quantiles("median"), Err(Error::InvalidConfig(_))));
    }
}
