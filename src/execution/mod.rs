//! Dispatch of independent tasks and collection of their results in
//! completion order.
//!
//! Three substrates share one contract: [`Sequential`] runs inline on the
//! caller's thread, [`LocalPool`] submits everything up front to a rayon
//! pool, and [`QueueExecutor`] feeds a bounded queue from which dedicated
//! worker threads pull, enqueuing the next task whenever one completes.
//! Tasks communicate only through their owned arguments and the returned
//! message, so no worker ever touches shared mutable state.

use anyhow::anyhow;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ExecutorKind;
use crate::error::{Error, Result};

pub mod cancel;
pub mod pool;
pub mod queue;

pub use cancel::CancelToken;
pub use pool::LocalPool;
pub use queue::QueueExecutor;

/// How often a blocked drain re-checks cancellation.
const POLL: Duration = Duration::from_millis(25);

/// Approximate payload size in bytes, for transfer statistics.
pub trait TransferSize {
    fn transfer_size(&self) -> usize;
}

impl<T: TransferSize> TransferSize for Vec<T> {
    fn transfer_size(&self) -> usize {
        self.iter().map(TransferSize::transfer_size).sum()
    }
}

impl<T: TransferSize> TransferSize for Arc<T> {
    // shared, not copied per task
    fn transfer_size(&self) -> usize {
        0
    }
}

/// The oracle a task runs: pure in its arguments.
pub type Oracle<A, R> = Arc<dyn Fn(&A) -> anyhow::Result<R> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Task<A> {
    pub id: usize,
    /// Human-readable context, reported with failures.
    pub label: String,
    pub args: A,
}

#[derive(Debug)]
pub struct Completed<R> {
    pub task: usize,
    pub label: String,
    pub result: R,
    /// Seconds spent inside the oracle.
    pub elapsed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub num_tasks: usize,
    pub sent: usize,
    pub received: usize,
    pub max_received: usize,
}

pub(crate) enum Outcome<R> {
    Done(anyhow::Result<R>),
    /// Not run: the halt token tripped before the task started.
    Skipped,
}

pub(crate) struct Message<R> {
    task: usize,
    outcome: Outcome<R>,
    elapsed: f64,
}

impl<R> Message<R> {
    pub(crate) fn skipped(task: usize) -> Self {
        Message {
            task,
            outcome: Outcome::Skipped,
            elapsed: 0.0,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one task, turning a panic into an ordinary failure.
pub(crate) fn run_task<A, R>(oracle: &Oracle<A, R>, task: &Task<A>) -> Message<R> {
    let t0 = Instant::now();
    let res = match panic::catch_unwind(AssertUnwindSafe(|| oracle(&task.args))) {
        Ok(res) => res,
        Err(payload) => Err(anyhow!("worker panicked: {}", panic_message(payload.as_ref()))),
    };
    Message {
        task: task.id,
        outcome: Outcome::Done(res),
        elapsed: t0.elapsed().as_secs_f64(),
    }
}

pub trait Executor {
    fn name(&self) -> &'static str;

    /// Dispatch `tasks` and return the stream of their results.
    fn submit<A, R>(
        &self,
        tasks: Vec<Task<A>>,
        oracle: Oracle<A, R>,
        cancel: &CancelToken,
    ) -> Completions<A, R>
    where
        A: TransferSize + Send + 'static,
        R: TransferSize + Send + 'static;
}

/// Degenerate executor: no workers, every task runs in `next()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl Executor for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn submit<A, R>(
        &self,
        tasks: Vec<Task<A>>,
        oracle: Oracle<A, R>,
        cancel: &CancelToken,
    ) -> Completions<A, R>
    where
        A: TransferSize + Send + 'static,
        R: TransferSize + Send + 'static,
    {
        let labels = labels_of(&tasks);
        let stats = TransferStats {
            num_tasks: tasks.len(),
            sent: tasks.iter().map(|t| t.args.transfer_size()).sum(),
            ..TransferStats::default()
        };
        Completions::new(
            Source::Inline {
                pending: tasks.into(),
                oracle,
            },
            labels,
            cancel.child(),
            stats,
        )
    }
}

/// Executor selected by configuration.
pub enum AnyExecutor {
    Sequential(Sequential),
    Pool(LocalPool),
    Queue(QueueExecutor),
}

impl AnyExecutor {
    pub fn from_kind(kind: ExecutorKind) -> Result<Self> {
        Ok(match kind {
            ExecutorKind::Sequential => AnyExecutor::Sequential(Sequential),
            ExecutorKind::Pool { workers } => AnyExecutor::Pool(LocalPool::new(workers)?),
            ExecutorKind::Queue {
                workers,
                max_in_flight,
            } => AnyExecutor::Queue(QueueExecutor::new(workers, max_in_flight)?),
        })
    }
}

impl Executor for AnyExecutor {
    fn name(&self) -> &'static str {
        match self {
            AnyExecutor::Sequential(e) => e.name(),
            AnyExecutor::Pool(e) => e.name(),
            AnyExecutor::Queue(e) => e.name(),
        }
    }

    fn submit<A, R>(
        &self,
        tasks: Vec<Task<A>>,
        oracle: Oracle<A, R>,
        cancel: &CancelToken,
    ) -> Completions<A, R>
    where
        A: TransferSize + Send + 'static,
        R: TransferSize + Send + 'static,
    {
        match self {
            AnyExecutor::Sequential(e) => e.submit(tasks, oracle, cancel),
            AnyExecutor::Pool(e) => e.submit(tasks, oracle, cancel),
            AnyExecutor::Queue(e) => e.submit(tasks, oracle, cancel),
        }
    }
}

pub(crate) fn labels_of<A>(tasks: &[Task<A>]) -> BTreeMap<usize, String> {
    tasks.iter().map(|t| (t.id, t.label.clone())).collect()
}

/// Tasks waiting to be queued, for the bounded-pipeline substrate.
pub(crate) struct Feed<A> {
    pub(crate) pending: VecDeque<Task<A>>,
    pub(crate) tx: Option<Sender<Task<A>>>,
    /// Tasks queued before the first completion.
    pub(crate) window: usize,
}

pub(crate) enum Source<A, R> {
    Inline {
        pending: VecDeque<Task<A>>,
        oracle: Oracle<A, R>,
    },
    Channel {
        rx: Receiver<Message<R>>,
        feed: Option<Feed<A>>,
        /// Keeps the pool alive while its jobs drain.
        _keepalive: Option<Arc<rayon::ThreadPool>>,
    },
}

enum Wait<R> {
    Message(Message<R>),
    Cancelled,
    Disconnected,
}

/// Results in completion order.
///
/// Yields `Ok` per finished task. The first failure, interrupt or deadline
/// ends the stream with one `Err`; tasks still outstanding at that point are
/// abandoned and their results are never yielded.
pub struct Completions<A, R> {
    source: Source<A, R>,
    outstanding: BTreeMap<usize, String>,
    halt: CancelToken,
    completed: usize,
    stats: TransferStats,
    done: bool,
}

impl<A: TransferSize, R: TransferSize> Completions<A, R> {
    pub(crate) fn new(
        source: Source<A, R>,
        outstanding: BTreeMap<usize, String>,
        halt: CancelToken,
        stats: TransferStats,
    ) -> Self {
        let mut out = Completions {
            source,
            outstanding,
            halt,
            completed: 0,
            stats,
            done: false,
        };
        out.prime();
        out
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn outstanding(&self) -> Vec<usize> {
        self.outstanding.keys().copied().collect()
    }

    /// Queue the next pending task, if the substrate feeds lazily.
    fn feed_one(&mut self) -> bool {
        let Source::Channel {
            feed: Some(feed), ..
        } = &mut self.source
        else {
            return false;
        };
        let Some(task) = feed.pending.pop_front() else {
            return false;
        };
        let Some(tx) = &feed.tx else {
            return false;
        };
        self.stats.sent += task.args.transfer_size();
        if tx.send(task).is_err() {
            debug!("queue closed before dispatch");
            return false;
        }
        true
    }

    fn prime(&mut self) {
        let window = match &self.source {
            Source::Channel {
                feed: Some(feed), ..
            } => feed.window.max(1),
            _ => 0,
        };
        for _ in 0..window {
            if !self.feed_one() {
                break;
            }
        }
    }

    fn abandon(&mut self) {
        self.halt.cancel();
        self.done = true;
        if let Source::Channel {
            feed: Some(feed), ..
        } = &mut self.source
        {
            feed.pending.clear();
            feed.tx = None;
        }
    }

    fn interrupt(&mut self) -> Error {
        self.abandon();
        let outstanding = self.outstanding();
        warn!(
            completed = self.completed,
            outstanding = outstanding.len(),
            tasks = ?outstanding,
            "interrupted; abandoning outstanding tasks"
        );
        Error::Interrupted {
            completed: self.completed,
            outstanding,
        }
    }

    fn wait(rx: &Receiver<Message<R>>, halt: &CancelToken) -> Wait<R> {
        loop {
            match rx.recv_timeout(POLL) {
                Ok(msg) => return Wait::Message(msg),
                Err(RecvTimeoutError::Timeout) => {
                    if halt.is_cancelled() {
                        return Wait::Cancelled;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Wait::Disconnected,
            }
        }
    }

    fn settle(&mut self, msg: Message<R>) -> Result<Completed<R>> {
        let Some(label) = self.outstanding.remove(&msg.task) else {
            return Err(Error::Worker {
                task: msg.task,
                label: String::new(),
                source: anyhow!("result for a task that was never submitted"),
            });
        };
        match msg.outcome {
            Outcome::Skipped => {
                self.outstanding.insert(msg.task, label);
                Err(self.interrupt())
            }
            Outcome::Done(Err(source)) => {
                self.abandon();
                Err(Error::Worker {
                    task: msg.task,
                    label,
                    source,
                })
            }
            Outcome::Done(Ok(result)) => {
                self.completed += 1;
                let size = result.transfer_size();
                self.stats.received += size;
                self.stats.max_received = self.stats.max_received.max(size);
                self.feed_one();
                Ok(Completed {
                    task: msg.task,
                    label,
                    result,
                    elapsed: msg.elapsed,
                })
            }
        }
    }
}

impl<A: TransferSize, R: TransferSize> Iterator for Completions<A, R> {
    type Item = Result<Completed<R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.outstanding.is_empty() {
            self.done = true;
            return None;
        }
        if self.halt.is_cancelled() {
            return Some(Err(self.interrupt()));
        }
        let msg = match &mut self.source {
            Source::Inline { pending, oracle } => {
                let task = pending.pop_front()?;
                run_task(oracle, &task)
            }
            Source::Channel { rx, .. } => match Self::wait(rx, &self.halt) {
                Wait::Message(msg) => msg,
                Wait::Cancelled => return Some(Err(self.interrupt())),
                Wait::Disconnected => {
                    let (task, label) = self
                        .outstanding
                        .iter()
                        .next()
                        .map(|(&t, l)| (t, l.clone()))
                        .unwrap_or_default();
                    self.abandon();
                    return Some(Err(Error::Worker {
                        task,
                        label,
                        source: anyhow!("workers exited with {} task(s) outstanding", self.outstanding.len()),
                    }));
                }
            },
        };
        Some(self.settle(msg))
    }
}

impl<A, R> Drop for Completions<A, R> {
    fn drop(&mut self) {
        // dropping the stream early stops workers from starting new tasks
        self.halt.cancel();
    }
}
