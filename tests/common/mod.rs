#![allow(dead_code)]

use branchmap::config::{Config, ExecutorKind};
use branchmap::logictree::{Branch, BranchSet, Dataset, GroupId, LogicTree};
use branchmap::{AggregationOperator, AssociationIndex, WorkItem};

/// One dataset owning categories T1 ∈ {A, B, C} and T2 ∈ {D, E}; groups 0
/// and 1 respectively.
pub fn two_level_tree() -> LogicTree {
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

pub fn sum_config(executor: ExecutorKind, target: usize) -> Config {
    Config::default()
        .with_executor(executor)
        .with_concurrency_target(target)
        .with_aggregation(AggregationOperator::Sum)
}

pub fn index(cfg: &Config) -> AssociationIndex {
    AssociationIndex::build(two_level_tree().realizations(cfg).unwrap()).unwrap()
}

#[derive(Debug, Clone)]
pub struct Item {
    pub id: String,
    pub group: GroupId,
    pub units: u64,
    pub value: f64,
}

impl WorkItem for Item {
    fn id(&self) -> &str {
        &self.id
    }

    fn group(&self) -> GroupId {
        self.group
    }

    fn units(&self) -> u64 {
        self.units
    }
}

pub fn item(id: impl Into<String>, group: GroupId, units: u64, value: f64) -> Item {
    Item {
        id: id.into(),
        group,
        units,
        value,
    }
}
