//! Association between (group, variant) pairs and the realizations they feed.
//!
//! For a tree with categories T1 ∈ {A, B, C} and T2 ∈ {D, E} owned by one
//! source path, the index reads
//!
//! ```text
//! (0, A) -> [0, 1]     (1, D) -> [0, 2, 4]
//! (0, B) -> [2, 3]     (1, E) -> [1, 3, 5]
//! (0, C) -> [4, 5]
//! ```
//!
//! Built once after enumeration; read-only afterwards.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logictree::{Enumeration, GroupId, Realization, SourceModel};

pub type VariantKey = String;

#[derive(Debug, Clone)]
pub struct AssociationIndex {
    realizations: Vec<Realization>,
    source_models: Vec<SourceModel>,
    buckets: BTreeMap<GroupId, BTreeMap<VariantKey, Vec<usize>>>,
    categories: BTreeMap<GroupId, String>,
    sampled: bool,
}

impl AssociationIndex {
    pub fn build(enumeration: Enumeration) -> Result<Self> {
        let Enumeration {
            source_models,
            realizations,
            sampled,
        } = enumeration;

        let mut buckets: BTreeMap<GroupId, BTreeMap<VariantKey, Vec<usize>>> = BTreeMap::new();
        let mut categories = BTreeMap::new();
        for sm in &source_models {
            for g in &sm.groups {
                categories.insert(g.id, g.category.clone());
            }
        }

        for rlz in &realizations {
            let sm = &source_models[rlz.source];
            if sm.groups.is_empty() {
                return Err(Error::OrphanRealization {
                    ordinal: rlz.ordinal,
                });
            }
            for g in &sm.groups {
                let variant = rlz
                    .variant_for(&g.category)
                    .ok_or_else(|| Error::MissingCategory {
                        path: sm.path_string(),
                        group: g.id,
                        category: g.category.clone(),
                    })?;
                buckets
                    .entry(g.id)
                    .or_default()
                    .entry(variant.to_string())
                    .or_default()
                    .push(rlz.ordinal);
            }
        }

        let pairs: usize = buckets.values().map(|v| v.len()).sum();
        info!(
            groups = buckets.len(),
            pairs,
            realizations = realizations.len(),
            "association index built"
        );

        Ok(AssociationIndex {
            realizations,
            source_models,
            buckets,
            categories,
            sampled,
        })
    }

    /// Ordinals fed by `(group, variant)`, ascending; empty when unused.
    pub fn realizations_for(&self, group: GroupId, variant: &str) -> &[usize] {
        self.buckets
            .get(&group)
            .and_then(|by_variant| by_variant.get(variant))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Variants some realization actually needs for `group`.
    pub fn variants_for(&self, group: GroupId) -> Vec<&str> {
        self.buckets
            .get(&group)
            .map(|by_variant| by_variant.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_live(&self, group: GroupId) -> bool {
        self.buckets.contains_key(&group)
    }

    /// Every `(group, variant)` pair with at least one dependent realization.
    pub fn keys(&self) -> impl Iterator<Item = (GroupId, &str)> + '_ {
        self.buckets
            .iter()
            .flat_map(|(&g, by_variant)| by_variant.keys().map(move |v| (g, v.as_str())))
    }

    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.buckets.keys().copied()
    }

    pub fn category(&self, group: GroupId) -> Option<&str> {
        self.categories.get(&group).map(|c| c.as_str())
    }

    /// Drop items whose group no realization depends on.
    pub fn prune<T>(&self, items: Vec<T>, group_of: impl Fn(&T) -> GroupId) -> Vec<T> {
        let before = items.len();
        let kept: Vec<T> = items
            .into_iter()
            .filter(|it| self.is_live(group_of(it)))
            .collect();
        if kept.len() < before {
            debug!(dropped = before - kept.len(), "pruned items of dead groups");
        }
        kept
    }

    /// `(group, variant)` pairs a realization draws evidence from.
    pub fn dependencies(&self, ordinal: usize) -> Vec<(GroupId, &str)> {
        self.keys()
            .filter(|&(g, v)| self.realizations_for(g, v).binary_search(&ordinal).is_ok())
            .collect()
    }

    pub fn realizations(&self) -> &[Realization] {
        &self.realizations
    }

    pub fn num_realizations(&self) -> usize {
        self.realizations.len()
    }

    pub fn source_models(&self) -> &[SourceModel] {
        &self.source_models
    }

    pub fn sampled(&self) -> bool {
        self.sampled
    }
}
