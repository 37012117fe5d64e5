use ahash::AHashMap;
use ndarray::{Array1, Zip};
use std::collections::{BTreeMap, BTreeSet};

use super::extent::ExtentTracker;
use crate::assoc::VariantKey;
use crate::error::{Error, Result};
use crate::execution::TransferSize;
use crate::logictree::GroupId;

/// Values the aggregator can fold element-wise.
///
/// `Default` must be the all-zero value; keys absent on one side count as 0.
pub trait Composable: Clone + Default + Send + TransferSize + 'static {
    fn compose_with(&mut self, other: &Self, f: &dyn Fn(f64, f64) -> f64) -> Result<()>;

    /// Distinct keys held, for the result-size ceiling.
    fn num_keys(&self) -> usize;

    /// Position-wise reduction across several values: `f` sees one entry
    /// per value, in order, with 0 where a value has no entry.
    fn reduce_entries(values: &[&Self], f: &dyn Fn(&[f64]) -> f64) -> Result<Self>;
}

impl TransferSize for f64 {
    fn transfer_size(&self) -> usize {
        std::mem::size_of::<f64>()
    }
}

impl Composable for f64 {
    fn compose_with(&mut self, other: &Self, f: &dyn Fn(f64, f64) -> f64) -> Result<()> {
        *self = f(*self, *other);
        Ok(())
    }

    fn num_keys(&self) -> usize {
        1
    }

    fn reduce_entries(values: &[&Self], f: &dyn Fn(&[f64]) -> f64) -> Result<Self> {
        let column: Vec<f64> = values.iter().map(|v| **v).collect();
        Ok(f(&column))
    }
}

/// Sparse key -> curve map; every curve has `num_levels` entries.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbabilityMap {
    num_levels: usize,
    curves: BTreeMap<u32, Array1<f64>>,
}

impl ProbabilityMap {
    pub fn new(num_levels: usize) -> Self {
        ProbabilityMap {
            num_levels,
            curves: BTreeMap::new(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    pub fn insert(&mut self, key: u32, curve: Array1<f64>) -> Result<()> {
        if curve.len() != self.num_levels {
            return Err(Error::ShapeMismatch {
                key,
                expected: self.num_levels,
                got: curve.len(),
            });
        }
        self.curves.insert(key, curve);
        Ok(())
    }

    pub fn get(&self, key: u32) -> Option<&Array1<f64>> {
        self.curves.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Array1<f64>)> {
        self.curves.iter().map(|(&k, v)| (k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }
}

impl TransferSize for ProbabilityMap {
    fn transfer_size(&self) -> usize {
        self.curves.len() * (std::mem::size_of::<u32>() + self.num_levels * std::mem::size_of::<f64>())
    }
}

impl Composable for ProbabilityMap {
    fn compose_with(&mut self, other: &Self, f: &dyn Fn(f64, f64) -> f64) -> Result<()> {
        if other.curves.is_empty() {
            return Ok(());
        }
        // a fresh accumulator takes the shape of the first real value
        if self.curves.is_empty() && self.num_levels == 0 {
            self.num_levels = other.num_levels;
        }
        if other.num_levels != self.num_levels {
            let key = other.curves.keys().next().copied().unwrap_or_default();
            return Err(Error::ShapeMismatch {
                key,
                expected: self.num_levels,
                got: other.num_levels,
            });
        }
        for (&key, curve) in &other.curves {
            match self.curves.get_mut(&key) {
                Some(acc) => Zip::from(acc).and(curve).for_each(|a, &b| *a = f(*a, b)),
                None => {
                    self.curves.insert(key, curve.mapv(|b| f(0.0, b)));
                }
            }
        }
        Ok(())
    }

    fn num_keys(&self) -> usize {
        self.curves.len()
    }

    fn reduce_entries(values: &[&Self], f: &dyn Fn(&[f64]) -> f64) -> Result<Self> {
        let mut out = ProbabilityMap::default();
        let mut shaped = values.iter().filter(|v| !v.curves.is_empty());
        let Some(first) = shaped.next() else {
            return Ok(out);
        };
        out.num_levels = first.num_levels;
        if let Some(bad) = shaped.find(|v| v.num_levels != out.num_levels) {
            return Err(Error::ShapeMismatch {
                key: bad.curves.keys().next().copied().unwrap_or_default(),
                expected: out.num_levels,
                got: bad.num_levels,
            });
        }

        let keys: BTreeSet<u32> = values.iter().flat_map(|v| v.curves.keys().copied()).collect();
        let mut column = vec![0.0; values.len()];
        for key in keys {
            let curve = Array1::from_shape_fn(out.num_levels, |level| {
                for (slot, v) in column.iter_mut().zip(values) {
                    *slot = v.curves.get(&key).map_or(0.0, |c| c[level]);
                }
                f(&column)
            });
            out.curves.insert(key, curve);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ItemStats {
    /// Compute seconds spent on the item, summed over its blocks.
    pub calc_time: f64,
    /// Blocks the item (or its pieces) contributed to.
    pub num_split: u32,
    /// Sub-units the oracle actually processed.
    pub units: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupStats {
    pub items: usize,
    pub units: u64,
    pub calc_time: f64,
}

/// Side-channel counters; merged commutatively like the values.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    items: AHashMap<(GroupId, String), ItemStats>,
}

impl Diagnostics {
    pub fn record(&mut self, group: GroupId, item: &str, calc_time: f64, units: u64) {
        let st = self.items.entry((group, item.to_string())).or_default();
        st.calc_time += calc_time;
        st.num_split += 1;
        st.units += units;
    }

    pub fn merge(&mut self, other: Diagnostics) {
        for (key, st) in other.items {
            let acc = self.items.entry(key).or_default();
            acc.calc_time += st.calc_time;
            acc.num_split += st.num_split;
            acc.units += st.units;
        }
    }

    pub fn item(&self, group: GroupId, item: &str) -> Option<&ItemStats> {
        self.items.get(&(group, item.to_string()))
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    /// Items sorted by descending compute time.
    pub fn slowest_items(&self) -> Vec<(GroupId, &str, ItemStats)> {
        let mut rows: Vec<_> = self
            .items
            .iter()
            .map(|((g, id), st)| (*g, id.as_str(), *st))
            .collect();
        rows.sort_by(|a, b| {
            b.2.calc_time
                .total_cmp(&a.2.calc_time)
                .then_with(|| (a.0, a.1).cmp(&(b.0, b.1)))
        });
        rows
    }

    pub fn by_group(&self) -> BTreeMap<GroupId, GroupStats> {
        let mut out: BTreeMap<GroupId, GroupStats> = BTreeMap::new();
        for ((g, _), st) in &self.items {
            let acc = out.entry(*g).or_default();
            acc.items += 1;
            acc.units += st.units;
            acc.calc_time += st.calc_time;
        }
        out
    }
}

/// What one block execution hands back.
#[derive(Debug, Clone, Default)]
pub struct PartialResult<V> {
    pub values: BTreeMap<(GroupId, VariantKey), V>,
    pub diagnostics: Diagnostics,
    pub extents: ExtentTracker,
}

impl<V> PartialResult<V> {
    pub fn new() -> Self {
        PartialResult {
            values: BTreeMap::new(),
            diagnostics: Diagnostics::default(),
            extents: ExtentTracker::default(),
        }
    }

    pub fn insert(&mut self, group: GroupId, variant: impl Into<VariantKey>, value: V) {
        self.values.insert((group, variant.into()), value);
    }
}

impl<V: TransferSize> TransferSize for PartialResult<V> {
    fn transfer_size(&self) -> usize {
        let values: usize = self
            .values
            .iter()
            .map(|((_, v), val)| std::mem::size_of::<GroupId>() + v.len() + val.transfer_size())
            .sum();
        let stats = self.diagnostics.num_items() * std::mem::size_of::<ItemStats>();
        values + stats + self.extents.transfer_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::compose_probabilities;
    use ndarray::array;

    fn pmap(entries: &[(u32, [f64; 2])]) -> ProbabilityMap {
        let mut m = ProbabilityMap::new(2);
        for &(k, c) in entries {
            m.insert(k, Array1::from_vec(c.to_vec())).unwrap();
        }
        m
    }

    #[test]
    fn sparse_keys_union_on_compose() {
        let mut acc = pmap(&[(1, [0.1, 0.2])]);
        let other = pmap(&[(1, [0.5, 0.5]), (4, [0.3, 0.0])]);
        acc.compose_with(&other, &compose_probabilities).unwrap();
        assert_eq!(acc.len(), 2);
        let c1 = acc.get(1).unwrap();
        assert!((c1[0] - 0.55).abs() < 1e-12);
        assert!((c1[1] - 0.6).abs() < 1e-12);
        assert_eq!(acc.get(4).unwrap(), &array![0.3, 0.0]);
    }

    #[test]
    fn default_adopts_shape() {
        let mut acc = ProbabilityMap::default();
        acc.compose_with(&pmap(&[(0, [0.1, 0.1])]), &|a, b| a + b).unwrap();
        assert_eq!(acc.num_levels(), 2);
        let mut wrong = ProbabilityMap::new(3);
        wrong.insert(9, Array1::zeros(3)).unwrap();
        assert!(matches!(
            acc.compose_with(&wrong, &|a, b| a + b),
            Err(Error::ShapeMismatch { key: 9, .. })
        ));
    }

    #[test]
    fn entries_reduce_over_the_key_union() {
        let a = pmap(&[(1, [0.1, 0.2])]);
        let b = pmap(&[(1, [0.3, 0.4]), (5, [0.6, 0.8])]);
        let empty = ProbabilityMap::default();
        let max = ProbabilityMap::reduce_entries(&[&a, &b, &empty], &|col| {
            assert_eq!(col.len(), 3);
            col.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        })
        .unwrap();
        assert_eq!(max.num_levels(), 2);
        assert_eq!(max.get(1).unwrap(), &array![0.3, 0.4]);
        // absent in `a` and `empty`, which count as zero
        let min = ProbabilityMap::reduce_entries(&[&a, &b], &|col| col.iter().copied().fold(1.0, f64::min))
            .unwrap();
        assert_eq!(min.get(5).unwrap(), &array![0.0, 0.0]);

        let mut wide = ProbabilityMap::new(3);
        wide.insert(2, Array1::zeros(3)).unwrap();
        assert!(matches!(
            ProbabilityMap::reduce_entries(&[&a, &wide], &|col| col[0]),
            Err(Error::ShapeMismatch { key: 2, expected: 2, got: 3 })
        ));
    }

    #[test]
    fn insert_checks_curve_length() {
        let mut m = ProbabilityMap::new(3);
        assert!(m.insert(0, Array1::zeros(2)).is_err());
    }

    #[test]
    fn diagnostics_merge_counts_splits() {
        let mut a = Diagnostics::default();
        a.record(0, "src-1", 0.5, 10);
        let mut b = Diagnostics::default();
        b.record(0, "src-1", 0.25, 5);
        b.record(1, "src-2", 2.0, 1);
        a.merge(b);
        let st = a.item(0, "src-1").unwrap();
        assert_eq!(st.num_split, 2);
        assert_eq!(st.units, 15);
        assert!((st.calc_time - 0.75).abs() < 1e-12);
        assert_eq!(a.slowest_items()[0].1, "src-2");
        let groups = a.by_group();
        assert_eq!(groups[&0].items, 1);
        assert_eq!(groups[&1].units, 1);
    }
}
