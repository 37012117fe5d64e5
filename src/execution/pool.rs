use rayon::ThreadPool;
use std::sync::Arc;
use std::sync::mpsc;
use tracing::debug;

use super::{
    CancelToken, Completions, Executor, Message, Oracle, Source, Task, TransferSize, TransferStats,
    labels_of, run_task,
};
use crate::error::{Error, Result};
use crate::runtime;

/// Everything submitted up front to a dedicated rayon pool.
pub struct LocalPool {
    pool: Arc<ThreadPool>,
}

impl LocalPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidConfig(
                "a worker pool needs at least one worker".into(),
            ));
        }
        let pool = runtime::build_worker_pool(workers)
            .map_err(|e| Error::InvalidConfig(format!("cannot build worker pool: {e}")))?;
        Ok(LocalPool {
            pool: Arc::new(pool),
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for LocalPool {
    fn name(&self) -> &'static str {
        "pool"
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
        let halt = cancel.child();
        let stats = TransferStats {
            num_tasks: tasks.len(),
            sent: tasks.iter().map(|t| t.args.transfer_size()).sum(),
            ..TransferStats::default()
        };
        debug!(tasks = tasks.len(), workers = self.workers(), "submitting to pool");

        let (tx, rx) = mpsc::channel::<Message<R>>();
        for task in tasks {
            let tx = tx.clone();
            let oracle = Arc::clone(&oracle);
            let halt = halt.clone();
            self.pool.spawn(move || {
                let msg = if halt.is_cancelled() {
                    Message::skipped(task.id)
                } else {
                    run_task(&oracle, &task)
                };
                // the receiver is gone once the stream was abandoned
                let _ = tx.send(msg);
            });
        }

        Completions::new(
            Source::Channel {
                rx,
                feed: None,
                _keepalive: Some(Arc::clone(&self.pool)),
            },
            labels,
            halt,
            stats,
        )
    }
}
