//! One stage end to end: prune, partition, dispatch, fold.

use ahash::AHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateResult, Aggregator, Composable, PartialResult};
use crate::assoc::{AssociationIndex, VariantKey};
use crate::config::{Config, ItemKind};
use crate::error::Result;
use crate::execution::{
    AnyExecutor, CancelToken, Completions, Executor, Oracle, Task, TransferSize, TransferStats,
};
use crate::logictree::GroupId;
use crate::partition::{Block, Partitioner};

/// A unit of domain work, owned by exactly one group.
pub trait WorkItem: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn group(&self) -> GroupId;

    /// Effective sub-units (e.g. ruptures); drives the item weight.
    fn units(&self) -> u64;

    fn kind(&self) -> ItemKind {
        ItemKind::Extended
    }

    /// Pieces to pack in place of an item heavier than the block bound.
    fn split(self) -> Vec<Self> {
        vec![self]
    }
}

/// Arguments of one oracle invocation.
#[derive(Debug, Clone)]
pub struct BlockArgs<T, C> {
    pub group: GroupId,
    /// Variants some realization needs for this group.
    pub variants: Vec<VariantKey>,
    pub items: Vec<T>,
    pub weight: f64,
    pub context: Arc<C>,
}

impl<T, C> TransferSize for BlockArgs<T, C> {
    fn transfer_size(&self) -> usize {
        std::mem::size_of::<GroupId>()
            + self.items.len() * std::mem::size_of::<T>()
            + self.variants.iter().map(String::len).sum::<usize>()
    }
}

/// Output of pruning and partitioning, before dispatch.
#[derive(Debug, Clone)]
pub struct Plan<T> {
    pub blocks: Vec<Block<GroupId, T>>,
    pub max_weight: f64,
    pub light_items: usize,
    pub heavy_items: usize,
    /// Items dropped because no realization depends on their group.
    pub pruned: usize,
}

pub struct Stage<'a> {
    cfg: &'a Config,
    assoc: &'a AssociationIndex,
    cancel: CancelToken,
    progress: bool,
    key_space: Option<usize>,
}

impl<'a> Stage<'a> {
    pub fn new(cfg: &'a Config, assoc: &'a AssociationIndex) -> Self {
        Stage {
            cfg,
            assoc,
            cancel: CancelToken::new(),
            progress: false,
            key_space: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Number of distinct keys the oracle may return per value (sites,
    /// say). Checked against `max_keys` before dispatch.
    pub fn with_key_space(mut self, keys: usize) -> Self {
        self.key_space = Some(keys);
        self
    }

    pub fn plan<T: WorkItem>(&self, items: Vec<T>) -> Result<Plan<T>> {
        let total = items.len();
        let live = if total == 0 {
            items
        } else {
            self.assoc.prune(items, |it| it.group())
        };
        let pruned = total - live.len();
        if pruned > 0 {
            info!(pruned, kept = live.len(), "dropped items no realization depends on");
        }

        let mut per_group: AHashMap<GroupId, usize> = AHashMap::new();
        for it in &live {
            *per_group.entry(it.group()).or_default() += 1;
        }
        for &n in per_group.values() {
            self.cfg.limits.check_group_items(n)?;
        }

        if live.is_empty() && pruned > 0 {
            return Ok(Plan {
                blocks: Vec::new(),
                max_weight: 0.0,
                light_items: 0,
                heavy_items: 0,
                pruned,
            });
        }

        let policy = self.cfg.weighting;
        let partition = Partitioner::new(self.cfg.concurrency_target)?.partition_splitting(
            live,
            |it| policy.item_weight(it.units(), it.kind()),
            |it| it.group(),
            T::split,
        )?;
        Ok(Plan {
            blocks: partition.blocks,
            max_weight: partition.max_weight,
            light_items: partition.light_items,
            heavy_items: partition.heavy_items,
            pruned,
        })
    }

    /// Tasks in dispatch order, heaviest block first.
    pub fn build_tasks<T: WorkItem, C>(
        &self,
        plan: Plan<T>,
        context: Arc<C>,
    ) -> Vec<Task<BlockArgs<T, C>>> {
        let mut blocks = plan.blocks;
        blocks.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        blocks
            .into_iter()
            .enumerate()
            .map(|(id, block)| {
                let category = self.assoc.category(block.key).unwrap_or("?");
                let label = format!(
                    "group {} ({category}), {} item(s), first {}, weight {:.1}",
                    block.key,
                    block.items.len(),
                    block.items.first().map(WorkItem::id).unwrap_or("-"),
                    block.weight,
                );
                let variants = self
                    .assoc
                    .variants_for(block.key)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                Task {
                    id,
                    label,
                    args: BlockArgs {
                        group: block.key,
                        variants,
                        items: block.items,
                        weight: block.weight,
                        context: Arc::clone(&context),
                    },
                }
            })
            .collect()
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) =
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} blocks {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb
    }

    /// Fold completions into `agg` until the stream ends or fails.
    ///
    /// On interrupt the aggregator holds exactly the partials of the tasks
    /// that completed before it; nothing from abandoned tasks gets in.
    pub fn drain<A, V>(
        &self,
        mut stream: Completions<A, PartialResult<V>>,
        agg: &mut Aggregator<'_, V>,
    ) -> Result<TransferStats>
    where
        A: TransferSize,
        V: Composable,
    {
        let pb = self.progress_bar(stream.outstanding().len());
        for done in stream.by_ref() {
            let done = match done {
                Ok(done) => done,
                Err(err) => {
                    pb.abandon();
                    return Err(err);
                }
            };
            debug!(task = done.task, elapsed = done.elapsed, "block done");
            if let Err(err) = agg.absorb(done.result) {
                pb.abandon();
                return Err(err);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(stream.stats())
    }

    pub fn run<T, C, V, F>(&self, items: Vec<T>, context: Arc<C>, oracle: F) -> Result<AggregateResult<V>>
    where
        T: WorkItem,
        C: Send + Sync + 'static,
        V: Composable,
        F: Fn(&BlockArgs<T, C>) -> anyhow::Result<PartialResult<V>> + Send + Sync + 'static,
    {
        let executor = AnyExecutor::from_kind(self.cfg.executor)?;
        self.run_with(&executor, items, context, oracle)
    }

    pub fn run_with<E, T, C, V, F>(
        &self,
        executor: &E,
        items: Vec<T>,
        context: Arc<C>,
        oracle: F,
    ) -> Result<AggregateResult<V>>
    where
        E: Executor,
        T: WorkItem,
        C: Send + Sync + 'static,
        V: Composable,
        F: Fn(&BlockArgs<T, C>) -> anyhow::Result<PartialResult<V>> + Send + Sync + 'static,
    {
        self.cfg.validate()?;
        self.cfg
            .limits
            .check_realizations(self.assoc.num_realizations())?;
        if let Some(keys) = self.key_space {
            self.cfg.limits.check_keys(keys)?;
        }

        let plan = self.plan(items)?;
        let mut agg = Aggregator::new(self.assoc, self.cfg.aggregation, self.cfg.limits);
        if plan.blocks.is_empty() {
            warn!(pruned = plan.pruned, "every item was pruned; result is all zeros");
            return agg.finish();
        }
        info!(
            executor = executor.name(),
            blocks = plan.blocks.len(),
            light = plan.light_items,
            heavy = plan.heavy_items,
            max_weight = plan.max_weight,
            "dispatching"
        );

        let tasks = self.build_tasks(plan, context);
        let oracle: Oracle<BlockArgs<T, C>, PartialResult<V>> = Arc::new(oracle);
        let stream = executor.submit(tasks, oracle, &self.cancel);
        let transfer = self.drain(stream, &mut agg)?;
        info!(
            tasks = transfer.num_tasks,
            sent = transfer.sent,
            received = transfer.received,
            max_received = transfer.max_received,
            "data transfer"
        );

        let mut result = agg.finish()?;
        for (group, item, st) in result.diagnostics.slowest_items().into_iter().take(3) {
            debug!(group, item, calc_time = st.calc_time, splits = st.num_split, "slow item");
        }
        result.transfer = transfer;
        Ok(result)
    }
}
