//! Grow-only bounding extents, kept per (group, item) for derived outputs
//! such as disaggregation bin ranges. They never feed the main aggregate.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::execution::TransferSize;
use crate::logictree::GroupId;

type Bounds = SmallVec<[f64; 4]>;

/// Axis-aligned box. Starts empty; `merge` only ever grows it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extent {
    lo: Bounds,
    hi: Bounds,
}

impl Extent {
    pub fn is_empty(&self) -> bool {
        self.lo.is_empty()
    }

    pub fn num_axes(&self) -> usize {
        self.lo.len()
    }

    pub fn min(&self, axis: usize) -> Option<f64> {
        self.lo.get(axis).copied()
    }

    pub fn max(&self, axis: usize) -> Option<f64> {
        self.hi.get(axis).copied()
    }

    fn check_axes(&self, got: usize) -> Result<()> {
        if !self.is_empty() && got != self.num_axes() {
            return Err(Error::ShapeMismatch {
                key: 0,
                expected: self.num_axes(),
                got,
            });
        }
        Ok(())
    }

    /// Grow to cover `values[axis]` along every axis. An axis given no
    /// values keeps its bounds.
    pub fn merge(&mut self, values: &[&[f64]]) -> Result<()> {
        if values.iter().all(|v| v.is_empty()) {
            return Ok(());
        }
        self.check_axes(values.len())?;
        if self.is_empty() {
            self.lo = values.iter().map(|_| f64::INFINITY).collect();
            self.hi = values.iter().map(|_| f64::NEG_INFINITY).collect();
        }
        for (axis, vals) in values.iter().enumerate() {
            for &v in vals.iter() {
                self.lo[axis] = self.lo[axis].min(v);
                self.hi[axis] = self.hi[axis].max(v);
            }
        }
        Ok(())
    }

    pub fn merge_extent(&mut self, other: &Extent) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        self.check_axes(other.num_axes())?;
        for axis in 0..self.num_axes() {
            self.lo[axis] = self.lo[axis].min(other.lo[axis]);
            self.hi[axis] = self.hi[axis].max(other.hi[axis]);
        }
        Ok(())
    }

    /// Bin edges of width `width` covering the axis, snapped outward to
    /// multiples of `width`.
    pub fn bin_edges(&self, axis: usize, width: f64) -> Vec<f64> {
        let (Some(lo), Some(hi)) = (self.min(axis), self.max(axis)) else {
            return Vec::new();
        };
        if !(width > 0.0) || !lo.is_finite() || !hi.is_finite() {
            return Vec::new();
        }
        let first = (lo / width).floor() as i64;
        let last = ((hi / width).ceil() as i64).max(first + 1);
        (first..=last).map(|i| i as f64 * width).collect()
    }
}

impl TransferSize for Extent {
    fn transfer_size(&self) -> usize {
        2 * self.lo.len() * std::mem::size_of::<f64>()
    }
}

/// One [`Extent`] per (group, item).
#[derive(Debug, Clone, Default)]
pub struct ExtentTracker {
    boxes: AHashMap<(GroupId, u32), Extent>,
}

impl ExtentTracker {
    pub fn merge(&mut self, group: GroupId, item: u32, values: &[&[f64]]) -> Result<()> {
        self.boxes
            .entry((group, item))
            .or_default()
            .merge(values)
            .map_err(|e| with_key(e, item))
    }

    /// Fails where [`ExtentTracker::merge_tracker`] would, without
    /// touching anything.
    pub fn check_merge(&self, other: &ExtentTracker) -> Result<()> {
        for (key, ext) in &other.boxes {
            if let Some(mine) = self.boxes.get(key) {
                if !ext.is_empty() {
                    mine.check_axes(ext.num_axes())
                        .map_err(|e| with_key(e, key.1))?;
                }
            }
        }
        Ok(())
    }

    /// All or nothing: on a shape mismatch no box has grown.
    pub fn merge_tracker(&mut self, other: &ExtentTracker) -> Result<()> {
        self.check_merge(other)?;
        for (&(group, item), ext) in &other.boxes {
            self.boxes
                .entry((group, item))
                .or_default()
                .merge_extent(ext)
                .map_err(|e| with_key(e, item))?;
        }
        Ok(())
    }

    pub fn get(&self, group: GroupId, item: u32) -> Option<&Extent> {
        self.boxes.get(&(group, item))
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.values().all(Extent::is_empty)
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Non-empty extents ordered by (group, item).
    pub fn sorted(&self) -> Vec<((GroupId, u32), &Extent)> {
        let mut rows: Vec<_> = self
            .boxes
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(&k, e)| (k, e))
            .collect();
        rows.sort_by_key(|&(k, _)| k);
        rows
    }
}

fn with_key(err: Error, item: u32) -> Error {
    match err {
        Error::ShapeMismatch { expected, got, .. } => Error::ShapeMismatch {
            key: item,
            expected,
            got,
        },
        other => other,
    }
}

impl TransferSize for ExtentTracker {
    fn transfer_size(&self) -> usize {
        self.boxes
            .values()
            .map(|e| std::mem::size_of::<(GroupId, u32)>() + e.transfer_size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_grows() {
        let mut e = Extent::default();
        assert!(e.is_empty());
        e.merge(&[&[10.0, 50.0], &[-3.0]]).unwrap();
        assert!(!e.is_empty());
        e.merge(&[&[5.0], &[2.0, 1.0]]).unwrap();
        assert_eq!((e.min(0), e.max(0)), (Some(5.0), Some(50.0)));
        assert_eq!((e.min(1), e.max(1)), (Some(-3.0), Some(2.0)));
    }

    #[test]
    fn empty_operand_is_neutral() {
        let mut a = Extent::default();
        let mut b = Extent::default();
        b.merge(&[&[1.0, 2.0]]).unwrap();
        a.merge_extent(&b).unwrap();
        assert_eq!(a, b);
        a.merge_extent(&Extent::default()).unwrap();
        assert_eq!(a, b);
        // nothing to cover leaves an empty box empty
        let mut c = Extent::default();
        c.merge(&[&[], &[]]).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn axis_count_is_fixed_after_first_merge() {
        let mut e = Extent::default();
        e.merge(&[&[1.0], &[2.0]]).unwrap();
        assert!(e.merge(&[&[1.0]]).is_err());
    }

    #[test]
    fn bin_edges_snap_outward() {
        let mut e = Extent::default();
        e.merge(&[&[12.0, 37.5]]).unwrap();
        assert_eq!(e.bin_edges(0, 10.0), vec![10.0, 20.0, 30.0, 40.0]);
        assert!(e.bin_edges(1, 10.0).is_empty());
    }

    #[test]
    fn tracker_keeps_one_box_per_pair() {
        let mut t = ExtentTracker::default();
        assert!(t.is_empty());
        t.merge(0, 7, &[&[1.0]]).unwrap();
        let mut other = ExtentTracker::default();
        other.merge(0, 7, &[&[9.0]]).unwrap();
        other.merge(1, 7, &[&[4.0]]).unwrap();
        t.merge_tracker(&other).unwrap();
        assert_eq!(t.len(), 2);
        let e = t.get(0, 7).unwrap();
        assert_eq!((e.min(0), e.max(0)), (Some(1.0), Some(9.0)));
        assert_eq!(t.sorted()[1].0, (1, 7));
    }
}
