mod common;

use branchmap::config::ExecutorKind;
use branchmap::execution::{AnyExecutor, LocalPool, QueueExecutor, Sequential};
use branchmap::{AggregationOperator, BlockArgs, Error, PartialResult, Stage};
use common::{Item, index, item, sum_config};
use std::sync::Arc;

fn items() -> Vec<Item> {
    (0..60)
        .map(|i| item(format!("it{i}"), (i % 2) as u32, 1 + (i * 7 % 13) as u64, 0.001 * i as f64))
        .collect()
}

/// Each variant of the block's group accumulates the items' values.
fn accumulate(args: &BlockArgs<Item, ()>) -> anyhow::Result<PartialResult<f64>> {
    let mut out = PartialResult::new();
    let total: f64 = args.items.iter().map(|it| it.value).sum();
    for (k, v) in args.variants.iter().enumerate() {
        out.insert(args.group, v.clone(), total * (k + 1) as f64 / 10.0);
    }
    for it in &args.items {
        out.diagnostics.record(args.group, &it.id, 0.0, it.units);
    }
    Ok(out)
}

#[test]
fn every_substrate_gives_the_same_aggregate() {
    for op in [AggregationOperator::Sum, AggregationOperator::ProbabilityComposition] {
        let cfg = sum_config(ExecutorKind::Sequential, 8).with_aggregation(op);
        let assoc = index(&cfg);
        let stage = Stage::new(&cfg, &assoc);

        let base = stage
            .run_with(&Sequential, items(), Arc::new(()), accumulate)
            .unwrap();
        let pool = stage
            .run_with(&LocalPool::new(4).unwrap(), items(), Arc::new(()), accumulate)
            .unwrap();
        let queue = stage
            .run_with(&QueueExecutor::new(3, 2).unwrap(), items(), Arc::new(()), accumulate)
            .unwrap();

        for other in [&pool, &queue] {
            assert_eq!(other.len(), base.len());
            for (a, b) in base.values.iter().zip(&other.values) {
                assert!((a - b).abs() < 1e-12);
            }
            assert_eq!(other.transfer.num_tasks, base.transfer.num_tasks);
            assert_eq!(other.transfer.sent, base.transfer.sent);
            assert_eq!(other.transfer.received, base.transfer.received);
            assert_eq!(other.diagnostics.num_items(), 60);
        }
    }
}

#[test]
fn executor_follows_configuration() {
    let cfg = sum_config(
        ExecutorKind::Queue {
            workers: 2,
            max_in_flight: 1,
        },
        4,
    );
    let assoc = index(&cfg);
    let out = Stage::new(&cfg, &assoc)
        .run(items(), Arc::new(()), accumulate)
        .unwrap();
    assert_eq!(out.len(), 6);
    assert!(AnyExecutor::from_kind(ExecutorKind::Pool { workers: 0 }).is_err());
}

#[test]
fn failing_block_aborts_the_batch() {
    let cfg = sum_config(ExecutorKind::Sequential, 30);
    let assoc = index(&cfg);
    let err = Stage::new(&cfg, &assoc)
        .run_with(
            &LocalPool::new(2).unwrap(),
            items(),
            Arc::new(()),
            |args: &BlockArgs<Item, ()>| -> anyhow::Result<PartialResult<f64>> {
                if args.items.iter().any(|it| it.id == "it17") {
                    anyhow::bail!("rupture generation failed");
                }
                accumulate(args)
            },
        )
        .unwrap_err();
    match err {
        Error::Worker { label, source, .. } => {
            assert!(label.contains("group 1"));
            assert!(source.to_string().contains("rupture generation failed"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn panicking_oracle_becomes_a_worker_error() {
    let cfg = sum_config(ExecutorKind::Sequential, 4);
    let assoc = index(&cfg);
    let err = Stage::new(&cfg, &assoc)
        .run_with(
            &QueueExecutor::new(2, 2).unwrap(),
            items(),
            Arc::new(()),
            |_: &BlockArgs<Item, ()>| -> anyhow::Result<PartialResult<f64>> { panic!("boom") },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Worker { .. }));
    assert_eq!(err.kind(), branchmap::ErrorKind::Worker);
}
