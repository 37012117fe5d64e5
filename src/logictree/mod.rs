//! Branch space: datasets × source modifiers × variant levels.
//!
//! The enumeration order fixes realization ordinals, and every downstream
//! index is keyed by ordinal, so the loops below must stay in input order:
//! datasets outermost, then modifier levels, then variant levels, with the
//! last level varying fastest.

use itertools::Itertools;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::{Config, Limits, SamplingMode, WeightMode};
use crate::error::{Error, Result};

pub mod sampling;
use sampling::{sample_one, sample_paths};

/// Branch weights at one level must sum to 1 within this tolerance.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

pub type GroupId = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: String,
    /// Concrete model choice this branch selects.
    pub value: String,
    pub weight: f64,
}

impl Branch {
    pub fn new(id: impl Into<String>, value: impl Into<String>, weight: f64) -> Self {
        Branch {
            id: id.into(),
            value: value.into(),
            weight,
        }
    }
}

/// One decision level. For variant levels `label` is the category the
/// level applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSet {
    pub label: String,
    pub branches: Vec<Branch>,
}

impl BranchSet {
    pub fn new(label: impl Into<String>, branches: Vec<Branch>) -> Self {
        BranchSet {
            label: label.into(),
            branches,
        }
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for br in &self.branches {
            if !(br.weight > 0.0 && br.weight <= 1.0) {
                return Err(Error::InvalidBranch {
                    level: self.label.clone(),
                    branch: br.id.clone(),
                    reason: format!("weight {} outside (0, 1]", br.weight),
                });
            }
            if !ids.insert(br.id.as_str()) {
                return Err(Error::InvalidBranch {
                    level: self.label.clone(),
                    branch: br.id.clone(),
                    reason: "duplicated branch id".into(),
                });
            }
        }
        if self.branches.is_empty() {
            return Ok(());
        }
        let sum: f64 = self.branches.iter().map(|b| b.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(Error::InvalidWeight {
                level: self.label.clone(),
                sum,
            });
        }
        Ok(())
    }
}

/// A candidate input dataset: a top-level branch plus the categories its
/// work items fall into.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub branch: Branch,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicTree {
    pub datasets: Vec<Dataset>,
    /// Further source levels, applied to every dataset.
    pub modifiers: Vec<BranchSet>,
    /// One level per category.
    pub variants: Vec<BranchSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub id: GroupId,
    pub category: String,
}

/// A fully resolved source path and the work groups it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceModel {
    pub ordinal: usize,
    pub path: Vec<String>,
    pub weight: f64,
    pub groups: Vec<GroupSpec>,
}

impl SourceModel {
    pub fn path_string(&self) -> String {
        self.path.join("_")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Realization {
    pub ordinal: usize,
    pub source: usize,
    pub path: Vec<String>,
    pub variant_path: Vec<String>,
    /// Chosen variant value per category, in level order.
    pub variants: Vec<(String, String)>,
    pub weight: f64,
}

impl Realization {
    pub fn variant_for(&self, category: &str) -> Option<&str> {
        self.variants
            .iter()
            .find(|(c, _)| c == category)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enumeration {
    pub source_models: Vec<SourceModel>,
    pub realizations: Vec<Realization>,
    pub sampled: bool,
}

impl Enumeration {
    pub fn num_groups(&self) -> usize {
        self.source_models.iter().map(|sm| sm.groups.len()).sum()
    }

    pub fn total_weight(&self) -> f64 {
        self.realizations.iter().map(|r| r.weight).sum()
    }
}

/// Index combinations, one branch per level, last level fastest.
fn cartesian(levels: &[&BranchSet]) -> Vec<Vec<usize>> {
    if levels.is_empty() {
        return vec![Vec::new()];
    }
    levels
        .iter()
        .map(|set| 0..set.branches.len())
        .multi_cartesian_product()
        .collect()
}

impl LogicTree {
    fn validate(&self) -> Result<()> {
        let top = BranchSet::new(
            "datasets",
            self.datasets.iter().map(|d| d.branch.clone()).collect(),
        );
        top.validate()?;
        for set in self.modifiers.iter().chain(&self.variants) {
            set.validate()?;
        }
        let mut labels = BTreeSet::new();
        for set in &self.variants {
            if !labels.insert(set.label.as_str()) {
                return Err(Error::InvalidBranch {
                    level: set.label.clone(),
                    branch: String::new(),
                    reason: "two variant levels share a category".into(),
                });
            }
        }
        Ok(())
    }

    fn source_levels(&self) -> Vec<&BranchSet> {
        self.modifiers.iter().collect()
    }

    /// Variant levels relevant to a dataset, in tree order; categories
    /// without a level are an error.
    fn variant_levels_for(&self, sm: &SourceModel) -> Result<Vec<&BranchSet>> {
        for g in &sm.groups {
            if !self.variants.iter().any(|set| set.label == g.category) {
                return Err(Error::MissingCategory {
                    path: sm.path_string(),
                    group: g.id,
                    category: g.category.clone(),
                });
            }
        }
        Ok(self
            .variants
            .iter()
            .filter(|set| sm.groups.iter().any(|g| g.category == set.label))
            .collect())
    }

    /// Resolve one source path from (dataset index, modifier choices).
    fn source_model(
        &self,
        ordinal: usize,
        dataset: usize,
        choice: &[usize],
        next_group: &mut GroupId,
    ) -> SourceModel {
        let ds = &self.datasets[dataset];
        let mut path = vec![ds.branch.id.clone()];
        let mut weight = ds.branch.weight;
        for (set, &i) in self.modifiers.iter().zip(choice) {
            path.push(set.branches[i].id.clone());
            weight *= set.branches[i].weight;
        }
        let mut seen = BTreeSet::new();
        let groups = ds
            .categories
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .map(|c| {
                let id = *next_group;
                *next_group += 1;
                GroupSpec {
                    id,
                    category: c.clone(),
                }
            })
            .collect();
        SourceModel {
            ordinal,
            path,
            weight,
            groups,
        }
    }

    fn realization(
        &self,
        ordinal: usize,
        sm: &SourceModel,
        levels: &[&BranchSet],
        choice: &[usize],
        weight: f64,
    ) -> Realization {
        let mut variant_path = Vec::with_capacity(levels.len());
        let mut variants = Vec::with_capacity(levels.len());
        for (set, &i) in levels.iter().zip(choice) {
            let br = &set.branches[i];
            variant_path.push(br.id.clone());
            variants.push((set.label.clone(), br.value.clone()));
        }
        Realization {
            ordinal,
            source: sm.ordinal,
            path: sm.path.clone(),
            variant_path,
            variants,
            weight,
        }
    }

    /// Enumerate or sample the branch space according to `cfg`.
    pub fn realizations(&self, cfg: &Config) -> Result<Enumeration> {
        self.validate()?;
        let out = match cfg.sampling {
            SamplingMode::FullEnumeration => self.enumerate(&cfg.limits)?,
            SamplingMode::Sample { num_samples } => {
                self.sample(num_samples, cfg.random_seed, cfg.weight_mode, &cfg.limits)?
            }
        };
        if out.realizations.is_empty() {
            return Err(Error::EmptyTree);
        }
        info!(
            source_models = out.source_models.len(),
            groups = out.num_groups(),
            realizations = out.realizations.len(),
            sampled = out.sampled,
            "logic tree resolved"
        );
        Ok(out)
    }

    fn enumerate(&self, limits: &Limits) -> Result<Enumeration> {
        let modifier_levels = self.source_levels();
        let modifier_paths = cartesian(&modifier_levels);

        let mut source_models = Vec::new();
        let mut next_group: GroupId = 0;
        for d in 0..self.datasets.len() {
            for choice in &modifier_paths {
                let ordinal = source_models.len();
                source_models.push(self.source_model(ordinal, d, choice, &mut next_group));
            }
        }

        // count before materializing, so an oversized tree fails cheaply
        let mut expected = 0usize;
        for sm in &source_models {
            let levels = self.variant_levels_for(sm)?;
            let n = levels
                .iter()
                .fold(1usize, |acc, set| acc.saturating_mul(set.branches.len()));
            expected = expected.saturating_add(n);
        }
        limits.check_realizations(expected)?;

        let mut realizations = Vec::with_capacity(expected);
        for sm in &source_models {
            let levels = self.variant_levels_for(sm)?;
            for choice in cartesian(&levels) {
                let weight = levels
                    .iter()
                    .zip(&choice)
                    .fold(sm.weight, |w, (set, &i)| w * set.branches[i].weight);
                let ordinal = realizations.len();
                realizations.push(self.realization(ordinal, sm, &levels, &choice, weight));
            }
            debug!(path = %sm.path_string(), total = realizations.len(), "enumerated source model");
        }

        Ok(Enumeration {
            source_models,
            realizations,
            sampled: false,
        })
    }

    fn sample(
        &self,
        num_samples: usize,
        seed: u64,
        mode: WeightMode,
        limits: &Limits,
    ) -> Result<Enumeration> {
        limits.check_realizations(num_samples)?;
        if self.datasets.is_empty() || self.modifiers.iter().any(|s| s.branches.is_empty()) {
            return Err(Error::EmptyTree);
        }

        let dataset_set = BranchSet::new(
            "datasets",
            self.datasets.iter().map(|d| d.branch.clone()).collect(),
        );
        let mut source_levels = vec![&dataset_set];
        source_levels.extend(self.source_levels());

        let mut rng = StdRng::seed_from_u64(seed);
        let drawn = sample_paths(&source_levels, num_samples, &mut rng);

        // repeated draws of one source path share its groups
        let mut source_models: Vec<SourceModel> = Vec::new();
        let mut next_group: GroupId = 0;
        let mut realizations = Vec::with_capacity(num_samples);
        for (idx, choice) in drawn.iter().enumerate() {
            let (dataset, modifiers) = (choice[0], &choice[1..]);
            let sm_idx = match source_models.iter().position(|sm| {
                sm.path[0] == self.datasets[dataset].branch.id
                    && sm.path[1..]
                        .iter()
                        .zip(self.modifiers.iter().zip(modifiers))
                        .all(|(id, (set, &i))| *id == set.branches[i].id)
            }) {
                Some(pos) => pos,
                None => {
                    let ordinal = source_models.len();
                    source_models.push(self.source_model(ordinal, dataset, modifiers, &mut next_group));
                    ordinal
                }
            };
            let sm = &source_models[sm_idx];
            let levels = self.variant_levels_for(sm)?;
            if levels.iter().any(|set| set.branches.is_empty()) {
                return Err(Error::EmptyTree);
            }
            let mut sub = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
            let variant_choice = sample_one(&levels, &mut sub);
            let weight = match mode {
                WeightMode::Uniform => 1.0 / num_samples as f64,
                WeightMode::Frequency => sm.weight,
            };
            let ordinal = realizations.len();
            realizations.push(self.realization(ordinal, sm, &levels, &variant_choice, weight));
        }

        Ok(Enumeration {
            source_models,
            realizations,
            sampled: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorKind;

    pub(crate) fn two_level_tree() -> LogicTree {
        LogicTree {
            datasets: vec![Dataset {
                branch: Branch::new("sm1", "model.xml", 1.0),
                categories: vec!["T1".into(), "T2".into()],
            }],
            modifiers: vec![],
            variants: vec![
                BranchSet::new(
                    "T1",
                    vec![
                        Branch::new("b11", "A", 0.5),
                        Branch::new("b12", "B", 0.3),
                        Branch::new("b13", "C", 0.2),
                    ],
                ),
                BranchSet::new(
                    "T2",
                    vec![Branch::new("b21", "D", 0.6), Branch::new("b22", "E", 0.4)],
                ),
            ],
        }
    }

    fn cfg() -> Config {
        Config::default().with_executor(ExecutorKind::Sequential)
    }

    #[test]
    fn full_enumeration_orders_last_level_fastest() {
        let out = two_level_tree().realizations(&cfg()).unwrap();
        assert_eq!(out.realizations.len(), 6);
        let pairs: Vec<(String, String)> = out
            .realizations
            .iter()
            .map(|r| (r.variants[0].1.clone(), r.variants[1].1.clone()))
            .collect();
        let expected = [
            ("A", "D"),
            ("A", "E"),
            ("B", "D"),
            ("B", "E"),
            ("C", "D"),
            ("C", "E"),
        ];
        for (got, want) in pairs.iter().zip(expected) {
            assert_eq!((got.0.as_str(), got.1.as_str()), want);
        }
        for (i, r) in out.realizations.iter().enumerate() {
            assert_eq!(r.ordinal, i);
        }
        assert!((out.realizations[0].weight - 0.3).abs() < 1e-12);
        assert!((out.total_weight() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn groups_get_dense_ids_in_dataset_order() {
        let mut tree = two_level_tree();
        tree.datasets[0].branch.weight = 0.5;
        tree.datasets.push(Dataset {
            branch: Branch::new("sm2", "other.xml", 0.5),
            categories: vec!["T2".into()],
        });
        let out = tree.realizations(&cfg()).unwrap();
        let ids: Vec<Vec<GroupId>> = out
            .source_models
            .iter()
            .map(|sm| sm.groups.iter().map(|g| g.id).collect())
            .collect();
        assert_eq!(ids, vec![vec![0, 1], vec![2]]);
        // the second dataset only sees the T2 level
        assert_eq!(out.realizations.len(), 6 + 2);
        assert_eq!(out.realizations[6].variant_path, vec!["b21".to_string()]);
        assert!((out.total_weight() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn modifiers_multiply_source_paths() {
        let mut tree = two_level_tree();
        tree.modifiers.push(BranchSet::new(
            "mfd",
            vec![Branch::new("a", "a", 0.25), Branch::new("b", "b", 0.75)],
        ));
        let out = tree.realizations(&cfg()).unwrap();
        assert_eq!(out.source_models.len(), 2);
        assert_eq!(out.source_models[1].path, vec!["sm1", "b"]);
        assert_eq!(out.realizations.len(), 12);
        assert!((out.total_weight() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bad_weights_are_rejected() {
        let mut tree = two_level_tree();
        tree.variants[1].branches[1].weight = 0.3;
        assert!(matches!(
            tree.realizations(&cfg()),
            Err(Error::InvalidWeight { .. })
        ));
        let mut tree = two_level_tree();
        tree.variants[0].branches[0].weight = 0.0;
        assert!(matches!(
            tree.realizations(&cfg()),
            Err(Error::InvalidBranch { .. })
        ));
    }

    #[test]
    fn empty_tree_is_an_error() {
        let mut tree = two_level_tree();
        tree.variants[1].branches.clear();
        assert!(matches!(tree.realizations(&cfg()), Err(Error::EmptyTree)));
        let empty = LogicTree {
            datasets: vec![],
            modifiers: vec![],
            variants: vec![],
        };
        assert!(matches!(empty.realizations(&cfg()), Err(Error::EmptyTree)));
    }

    #[test]
    fn missing_category_level_is_reported() {
        let mut tree = two_level_tree();
        tree.datasets[0].categories.push("T3".into());
        assert!(matches!(
            tree.realizations(&cfg()),
            Err(Error::MissingCategory { group: 2, .. })
        ));
    }

    #[test]
    fn realization_ceiling_applies_before_enumeration() {
        let cfg = cfg().with_limits(Limits {
            max_realizations: Some(5),
            ..Limits::default()
        });
        assert!(matches!(
            two_level_tree().realizations(&cfg),
            Err(Error::Overflow { got: 6, .. })
        ));
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let cfg = cfg()
            .with_seed(7)
            .with_sampling(SamplingMode::Sample { num_samples: 10 });
        let a = two_level_tree().realizations(&cfg).unwrap();
        let b = two_level_tree().realizations(&cfg).unwrap();
        assert_eq!(a, b);
        assert!(a.sampled);
        assert_eq!(a.realizations.len(), 10);
        assert_eq!(a.source_models.len(), 1);
        for r in &a.realizations {
            assert!((r.weight - 0.1).abs() < 1e-12);
            assert_eq!(r.variants.len(), 2);
        }
    }

    #[test]
    fn frequency_mode_keeps_source_weight() {
        let mut tree = two_level_tree();
        tree.datasets[0].branch.weight = 0.4;
        tree.datasets.push(Dataset {
            branch: Branch::new("sm2", "other.xml", 0.6),
            categories: vec!["T1".into()],
        });
        let cfg = cfg()
            .with_sampling(SamplingMode::Sample { num_samples: 20 })
            .with_weight_mode(WeightMode::Frequency);
        let out = tree.realizations(&cfg).unwrap();
        for r in &out.realizations {
            let expected = if r.path[0] == "sm1" { 0.4 } else { 0.6 };
            assert_eq!(r.weight, expected);
        }
        // repeated draws share source models
        assert!(out.source_models.len() <= 2);
    }
}

#[cfg(test)]
pub(crate) use tests::two_level_tree;
