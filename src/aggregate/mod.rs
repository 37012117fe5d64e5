//! Folding partial results into per-realization aggregates.
//!
//! Two nested folds: partials for the same `(group, variant)` are combined
//! as they arrive, then every merged group value is fanned out to the
//! realizations that depend on it. Both use the configured operator, so the
//! outcome does not depend on completion order.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::assoc::{AssociationIndex, VariantKey};
use crate::config::Limits;
use crate::error::{Error, Result};
use crate::execution::TransferStats;
use crate::logictree::GroupId;

pub mod extent;
pub mod operator;
pub mod types;

pub use extent::{Extent, ExtentTracker};
pub use operator::{AggregationOperator, compose_probabilities};
pub use types::{Composable, Diagnostics, GroupStats, ItemStats, PartialResult, ProbabilityMap};

/// Quantile `q` of `values` under `weights`: sort, normalise the
/// cumulative weights, then interpolate linearly between neighbours.
/// Below the first cumulative weight the smallest value is returned.
pub fn weighted_quantile(values: &[f64], weights: &[f64], q: f64) -> f64 {
    let mut pairs: Vec<(f64, f64)> = values.iter().copied().zip(weights.iter().copied()).collect();
    let Some(&(last, _)) = pairs.iter().max_by(|a, b| a.0.total_cmp(&b.0)) else {
        return 0.0;
    };
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let total: f64 = pairs.iter().map(|p| p.1).sum();
    if !total.is_finite() || total <= 0.0 {
        return f64::NAN;
    }

    let mut prev: Option<(f64, f64)> = None;
    let mut cum = 0.0;
    for (v, w) in pairs {
        cum += w / total;
        if q <= cum {
            return match prev {
                Some((c0, v0)) if cum > c0 => v0 + (q - c0) / (cum - c0) * (v - v0),
                _ => v,
            };
        }
        prev = Some((cum, v));
    }
    last
}

/// Running total for one stage.
///
/// Every `(group, variant)` the index knows about starts at zero, so a group
/// whose items were all pruned still shows up as an explicit zero.
pub struct Aggregator<'a, V: Composable> {
    assoc: &'a AssociationIndex,
    op: AggregationOperator,
    limits: Limits,
    groups: BTreeMap<(GroupId, VariantKey), V>,
    diagnostics: Diagnostics,
    extents: ExtentTracker,
    absorbed: usize,
}

impl<'a, V: Composable> Aggregator<'a, V> {
    pub fn new(assoc: &'a AssociationIndex, op: AggregationOperator, limits: Limits) -> Self {
        let groups = assoc
            .keys()
            .map(|(g, v)| ((g, v.to_string()), V::default()))
            .collect();
        Aggregator {
            assoc,
            op,
            limits,
            groups,
            diagnostics: Diagnostics::default(),
            extents: ExtentTracker::default(),
            absorbed: 0,
        }
    }

    /// Partial results folded in so far.
    pub fn num_absorbed(&self) -> usize {
        self.absorbed
    }

    pub fn group_value(&self, group: GroupId, variant: &str) -> Option<&V> {
        self.groups.get(&(group, variant.to_string()))
    }

    /// Merge one partial result into the running group totals.
    ///
    /// Each value is merged into a copy of its total and only committed
    /// once every key, ceiling and extent has passed, so a rejected
    /// partial leaves the totals untouched.
    pub fn absorb(&mut self, partial: PartialResult<V>) -> Result<()> {
        let PartialResult {
            values,
            diagnostics,
            extents,
        } = partial;

        if let Some((group, variant)) = values.keys().find(|k| !self.groups.contains_key(*k)) {
            return Err(Error::UnknownAssociation {
                group: *group,
                variant: variant.clone(),
            });
        }
        let mut staged = Vec::with_capacity(values.len());
        for (key, value) in values {
            self.limits.check_keys(value.num_keys())?;
            let mut merged = self.groups.get(&key).cloned().unwrap_or_default();
            self.op.combine(&mut merged, &value)?;
            self.limits.check_keys(merged.num_keys())?;
            staged.push((key, merged));
        }
        self.extents.check_merge(&extents)?;

        self.groups.extend(staged);
        self.extents.merge_tracker(&extents)?;
        self.diagnostics.merge(diagnostics);
        self.absorbed += 1;
        Ok(())
    }

    /// Fan the group totals out to realizations.
    pub fn finish(self) -> Result<AggregateResult<V>> {
        let n = self.assoc.num_realizations();
        let mut values = vec![V::default(); n];
        for ((group, variant), value) in &self.groups {
            for &ordinal in self.assoc.realizations_for(*group, variant) {
                self.op.combine(&mut values[ordinal], value)?;
            }
        }
        for value in &values {
            self.limits.check_keys(value.num_keys())?;
        }
        info!(
            realizations = n,
            groups = self.groups.len(),
            partials = self.absorbed,
            "aggregated"
        );
        Ok(AggregateResult {
            values,
            weights: self.assoc.realizations().iter().map(|r| r.weight).collect(),
            sampled: self.assoc.sampled(),
            groups: self.groups,
            diagnostics: self.diagnostics,
            extents: self.extents,
            transfer: TransferStats::default(),
        })
    }
}

/// One value per realization ordinal, plus the side channels.
#[derive(Debug, Clone)]
pub struct AggregateResult<V> {
    pub values: Vec<V>,
    pub weights: Vec<f64>,
    pub sampled: bool,
    /// Merged value per `(group, variant)` before fan-out.
    pub groups: BTreeMap<(GroupId, VariantKey), V>,
    pub diagnostics: Diagnostics,
    pub extents: ExtentTracker,
    pub transfer: TransferStats,
}

impl<V: Composable> AggregateResult<V> {
    pub fn get(&self, ordinal: usize) -> Option<&V> {
        self.values.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> {
        self.values.iter().enumerate()
    }

    /// Mean over realizations, weighted by realization weight when
    /// `weighted`, plain otherwise. Linear regardless of the aggregation
    /// operator.
    pub fn mean(&self, weighted: bool) -> Result<V> {
        let mut acc = V::default();
        if self.values.is_empty() {
            return Ok(acc);
        }
        let plain = 1.0 / self.values.len() as f64;
        for (value, &w) in self.values.iter().zip(&self.weights) {
            let w = if weighted { w } else { plain };
            acc.compose_with(value, &|a, b| a + w * b)?;
        }
        debug!(weighted, realizations = self.values.len(), "computed mean");
        Ok(acc)
    }

    /// Weighted under full enumeration; sampled realizations already
    /// carry their weight as draw frequency.
    pub fn statistical_mean(&self) -> Result<V> {
        self.mean(!self.sampled)
    }

    /// Entry-wise quantile across realizations, see [`weighted_quantile`].
    /// Realization weights are used when `weighted`, equal weights
    /// otherwise.
    pub fn quantile(&self, q: f64, weighted: bool) -> Result<V> {
        if !(0.0..=1.0).contains(&q) {
            return Err(Error::InvalidConfig(format!("quantile {q} is outside [0, 1]")));
        }
        let weights = if weighted {
            self.weights.clone()
        } else {
            vec![1.0; self.values.len()]
        };
        let values: Vec<&V> = self.values.iter().collect();
        let out = V::reduce_entries(&values, &|column| weighted_quantile(column, &weights, q))?;
        debug!(q, weighted, realizations = self.values.len(), "computed quantile");
        Ok(out)
    }

    /// Same weighting rule as [`AggregateResult::statistical_mean`].
    pub fn statistical_quantile(&self, q: f64) -> Result<V> {
        self.quantile(q, !self.sampled)
    }
}
