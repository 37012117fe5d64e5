//! Greedy weight-bounded blocking of work items.
//!
//! `max_weight = max(total / target, lightest item)`. Items are packed in
//! input order; a block is closed when the next item would push it past
//! `max_weight` (an exact fit stays in). Items heavier than `max_weight`
//! are optionally split first, and whatever is still too heavy travels
//! alone. Blocks never mix homogeneity keys.

use indexmap::IndexMap;
use std::hash::Hash;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Block<K, T> {
    pub key: K,
    pub items: Vec<T>,
    pub weight: f64,
    /// Built from items that exceeded `max_weight` before splitting.
    pub heavy: bool,
}

impl<K, T> Block<K, T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Partition<K, T> {
    pub blocks: Vec<Block<K, T>>,
    pub max_weight: f64,
    pub total_weight: f64,
    /// Items at or under `max_weight`.
    pub light_items: usize,
    /// Items over `max_weight`, counted before splitting.
    pub heavy_items: usize,
}

impl<K, T> Partition<K, T> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// `max(total / target, min_item)`.
pub fn max_weight(total: f64, target: usize, min_item: f64) -> f64 {
    (total / target.max(1) as f64).max(min_item)
}

struct Packer<'a, K, T> {
    key: &'a K,
    max_weight: f64,
    heavy: bool,
    cur: Vec<T>,
    cur_w: f64,
    out: &'a mut Vec<Block<K, T>>,
}

impl<K: Clone, T> Packer<'_, K, T> {
    fn flush(&mut self) {
        if self.cur.is_empty() {
            return;
        }
        self.out.push(Block {
            key: self.key.clone(),
            items: std::mem::take(&mut self.cur),
            weight: self.cur_w,
            heavy: self.heavy,
        });
        self.cur_w = 0.0;
    }

    fn push(&mut self, item: T, w: f64) {
        if w > self.max_weight {
            self.flush();
            self.cur.push(item);
            self.cur_w = w;
            self.flush();
            return;
        }
        if !self.cur.is_empty() && self.cur_w + w > self.max_weight {
            self.flush();
        }
        self.cur.push(item);
        self.cur_w += w;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    target: usize,
}

impl Partitioner {
    pub fn new(target: usize) -> Result<Self> {
        if target == 0 {
            return Err(Error::InvalidConfig(
                "concurrency target must be positive".into(),
            ));
        }
        Ok(Partitioner { target })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn partition<T, K>(
        &self,
        items: Vec<T>,
        weight: impl Fn(&T) -> f64,
        key: impl Fn(&T) -> K,
    ) -> Result<Partition<K, T>>
    where
        K: Hash + Eq + Clone,
    {
        self.partition_splitting(items, weight, key, |item| vec![item])
    }

    /// Like [`Partitioner::partition`], but heavy items go through `split`
    /// first; its pieces are packed with the same rule. A splitter that
    /// returns no pieces would lose the item, so that is an error.
    pub fn partition_splitting<T, K>(
        &self,
        items: Vec<T>,
        weight: impl Fn(&T) -> f64,
        key: impl Fn(&T) -> K,
        mut split: impl FnMut(T) -> Vec<T>,
    ) -> Result<Partition<K, T>>
    where
        K: Hash + Eq + Clone,
    {
        if items.is_empty() {
            return Err(Error::NoWork);
        }

        let mut total = 0.0f64;
        let mut min_item = f64::INFINITY;
        let mut groups: IndexMap<K, Vec<(T, f64)>> = IndexMap::new();
        for item in items {
            let w = weight(&item);
            if !(w.is_finite() && w >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "item weight {w} must be finite and non-negative"
                )));
            }
            total += w;
            min_item = min_item.min(w);
            groups.entry(key(&item)).or_default().push((item, w));
        }
        let max_w = max_weight(total, self.target, min_item);
        info!(max_weight = max_w, total_weight = total, target = self.target, "using max weight");

        let mut blocks = Vec::new();
        let (mut light_items, mut heavy_items) = (0usize, 0usize);
        for (k, members) in groups {
            let (light, heavy): (Vec<_>, Vec<_>) =
                members.into_iter().partition(|&(_, w)| w <= max_w);
            light_items += light.len();
            heavy_items += heavy.len();

            let mut packer = Packer {
                key: &k,
                max_weight: max_w,
                heavy: false,
                cur: Vec::new(),
                cur_w: 0.0,
                out: &mut blocks,
            };
            for (item, w) in light {
                packer.push(item, w);
            }
            packer.flush();

            packer.heavy = true;
            for (item, w) in heavy {
                let pieces = split(item);
                if pieces.is_empty() {
                    return Err(Error::InvalidConfig(format!(
                        "splitter returned no pieces for a heavy item of weight {w}"
                    )));
                }
                if pieces.len() > 1 {
                    debug!(pieces = pieces.len(), "split heavy item");
                }
                for piece in pieces {
                    let w = weight(&piece);
                    packer.push(piece, w);
                }
                packer.flush();
            }
        }

        info!(
            blocks = blocks.len(),
            light = light_items,
            heavy = heavy_items,
            "partitioned work"
        );
        Ok(Partition {
            blocks,
            max_weight: max_w,
            total_weight: total,
            light_items,
            heavy_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn five_equal_items_two_targets() {
        let items = vec![10.0, 10.0, 10.0, 10.0, 10.0];
        let p = Partitioner::new(2)
            .unwrap()
            .partition(items, |w| *w, |_| 0u32)
            .unwrap();
        assert_eq!(p.max_weight, 25.0);
        let sizes: Vec<usize> = p.blocks.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(p.blocks.iter().all(|b| b.weight <= 25.0));
        assert_eq!(p.light_items, 5);
        assert_eq!(p.heavy_items, 0);
    }

    #[test]
    fn exact_fit_stays_in_block() {
        let p = Partitioner::new(2)
            .unwrap()
            .partition(vec![5.0, 5.0, 5.0, 5.0], |w| *w, |_| 'a')
            .unwrap();
        assert_eq!(p.max_weight, 10.0);
        assert_eq!(p.num_blocks(), 2);
        assert_eq!(p.blocks[0].items, vec![5.0, 5.0]);
    }

    #[test]
    fn heavy_items_travel_alone() {
        let items = vec![1.0, 100.0, 1.0, 1.0];
        let p = Partitioner::new(4)
            .unwrap()
            .partition(items, |w| *w, |_| 0u8)
            .unwrap();
        assert!((p.max_weight - 25.75).abs() < 1e-12);
        assert_eq!(p.heavy_items, 1);
        let heavy: Vec<_> = p.blocks.iter().filter(|b| b.heavy).collect();
        assert_eq!(heavy.len(), 1);
        assert_eq!(heavy[0].items, vec![100.0]);
        // light blocks come first and keep input order
        assert_eq!(p.blocks[0].items, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn splitter_breaks_heavy_items() {
        let items = vec![(0u32, 40.0), (0, 1.0), (1, 1.0)];
        let p = Partitioner::new(2)
            .unwrap()
            .partition_splitting(
                items,
                |it| it.1,
                |it| it.0,
                |it| vec![(it.0, it.1 / 4.0); 4],
            )
            .unwrap();
        assert_eq!(p.max_weight, 21.0);
        assert_eq!(p.heavy_items, 1);
        let heavy: Vec<_> = p.blocks.iter().filter(|b| b.heavy).collect();
        assert_eq!(heavy.len(), 2);
        assert!(heavy.iter().all(|b| b.weight <= 21.0 && b.key == 0));
        let pieces: usize = heavy.iter().map(|b| b.len()).sum();
        assert_eq!(pieces, 4);
    }

    #[test]
    fn splitter_may_not_swallow_items() {
        let err = Partitioner::new(2)
            .unwrap()
            .partition_splitting(vec![1.0, 1.0, 100.0], |w| *w, |_| 0, |_| Vec::new())
            .unwrap_err();
        match err {
            Error::InvalidConfig(msg) => assert!(msg.contains("no pieces")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn zero_weight_items_are_kept() {
        let p = Partitioner::new(3)
            .unwrap()
            .partition(vec![0.0, 0.0], |w| *w, |_| 0)
            .unwrap();
        let n: usize = p.blocks.iter().map(|b| b.len()).sum();
        assert_eq!(n, 2);
    }

    #[test]
    fn empty_input_is_no_work() {
        let err = Partitioner::new(2)
            .unwrap()
            .partition(Vec::<f64>::new(), |w| *w, |_| 0)
            .unwrap_err();
        assert!(matches!(err, Error::NoWork));
        assert!(Partitioner::new(0).is_err());
    }

    #[test]
    fn negative_weight_is_rejected() {
        assert!(
            Partitioner::new(1)
                .unwrap()
                .partition(vec![-1.0], |w| *w, |_| 0)
                .is_err()
        );
    }

    proptest! {
        #[test]
        fn blocks_respect_keys_bounds_and_coverage(
            items in prop::collection::vec((0u8..4, 0.0f64..50.0), 1..80),
            target in 1usize..16,
        ) {
            let indexed: Vec<(usize, u8, f64)> =
                items.iter().enumerate().map(|(i, &(k, w))| (i, k, w)).collect();
            let p = Partitioner::new(target)
                .unwrap()
                .partition(indexed, |it| it.2, |it| it.1)
                .unwrap();
            let total: f64 = items.iter().map(|it| it.1).sum();
            let min_item = items.iter().map(|it| it.1).fold(f64::INFINITY, f64::min);
            let bound = (total / target as f64).max(min_item);
            prop_assert!((p.max_weight - bound).abs() < 1e-9);

            let mut seen = vec![0usize; items.len()];
            for b in &p.blocks {
                prop_assert!(!b.items.is_empty());
                prop_assert!(b.items.iter().all(|it| it.1 == b.key));
                if b.items.len() > 1 {
                    prop_assert!(b.weight <= p.max_weight + 1e-9);
                }
                for it in &b.items {
                    seen[it.0] += 1;
                }
            }
            prop_assert!(seen.iter().all(|&n| n == 1));
            prop_assert_eq!(p.light_items + p.heavy_items, items.len());
        }
    }
}
