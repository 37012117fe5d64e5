mod common;

use branchmap::config::{ExecutorKind, SamplingMode};
use branchmap::execution::Sequential;
use branchmap::partition::Partitioner;
use branchmap::{BlockArgs, PartialResult, Stage};
use common::{Item, index, item, sum_config, two_level_tree};
use proptest::prelude::*;
use std::sync::Arc;

fn table(variant: &str) -> f64 {
    match variant {
        "A" => 0.01,
        "B" => 0.02,
        "C" => 0.03,
        "D" => 0.04,
        "E" => 0.05,
        _ => f64::NAN,
    }
}

fn lookup(args: &BlockArgs<Item, ()>) -> anyhow::Result<PartialResult<f64>> {
    let mut out = PartialResult::new();
    for v in &args.variants {
        out.insert(args.group, v.clone(), table(v));
    }
    Ok(out)
}

#[test]
fn two_level_tree_sums_per_realization() {
    let cfg = sum_config(ExecutorKind::Sequential, 2);
    let assoc = index(&cfg);
    assert_eq!(assoc.num_realizations(), 6);
    let items = vec![item("t1", 0, 1, 0.0), item("t2", 1, 1, 0.0)];
    let out = Stage::new(&cfg, &assoc)
        .run_with(&Sequential, items, Arc::new(()), lookup)
        .unwrap();
    let expected = [0.05, 0.06, 0.06, 0.07, 0.07, 0.08];
    for (ordinal, want) in expected.into_iter().enumerate() {
        let got = *out.get(ordinal).unwrap();
        assert!((got - want).abs() < 1e-12, "realization {ordinal}: {got} != {want}");
    }
    let weights: f64 = out.weights.iter().sum();
    assert!((weights - 1.0).abs() < 1e-9);
}

#[test]
fn five_items_two_blocks_target() {
    let items: Vec<f64> = vec![10.0; 5];
    let p = Partitioner::new(2)
        .unwrap()
        .partition(items, |w| *w, |_| "g")
        .unwrap();
    assert!(p.blocks.iter().all(|b| b.weight <= 25.0));
    assert_eq!(p.blocks.iter().map(|b| b.len()).sum::<usize>(), 5);
}

#[test]
fn sampled_tree_is_reproducible() {
    let cfg = sum_config(ExecutorKind::Sequential, 2)
        .with_sampling(SamplingMode::Sample { num_samples: 5 })
        .with_seed(7);
    let a = two_level_tree().realizations(&cfg).unwrap();
    let b = two_level_tree().realizations(&cfg).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.realizations.len(), 5);
    assert!(a.sampled);
    for r in &a.realizations {
        assert!((r.weight - 0.2).abs() < 1e-12);
    }
}

proptest! {
    #[test]
    fn full_enumeration_counts_and_weights(
        sizes in prop::collection::vec(1usize..4, 1..4),
    ) {
        use branchmap::logictree::{Branch, BranchSet, Dataset, LogicTree};

        let variants: Vec<BranchSet> = sizes
            .iter()
            .enumerate()
            .map(|(l, &n)| {
                let branches = (0..n)
                    .map(|j| Branch::new(format!("b{l}{j}"), format!("v{l}{j}"), 1.0 / n as f64))
                    .collect();
                BranchSet::new(format!("L{l}"), branches)
            })
            .collect();
        let tree = LogicTree {
            datasets: vec![Dataset {
                branch: Branch::new("sm", "sm", 1.0),
                categories: variants.iter().map(|s| s.label.clone()).collect(),
            }],
            modifiers: vec![],
            variants,
        };
        let cfg = sum_config(ExecutorKind::Sequential, 1);
        let out = tree.realizations(&cfg).unwrap();
        prop_assert_eq!(out.realizations.len(), sizes.iter().product::<usize>());
        prop_assert!((out.total_weight() - 1.0).abs() < 1e-6);
        for (i, r) in out.realizations.iter().enumerate() {
            prop_assert_eq!(r.ordinal, i);
        }
    }
}
