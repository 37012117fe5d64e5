use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

use super::{
    CancelToken, Completions, Executor, Feed, Message, Oracle, Source, Task, TransferSize,
    TransferStats, labels_of, run_task,
};
use crate::error::{Error, Result};

/// Broker-style dispatch: a task queue drained by dedicated worker
/// threads. At most `max_in_flight` tasks sit in the queue or run at once;
/// each completion enqueues the next pending task.
#[derive(Debug, Clone, Copy)]
pub struct QueueExecutor {
    workers: usize,
    max_in_flight: usize,
}

impl QueueExecutor {
    pub fn new(workers: usize, max_in_flight: usize) -> Result<Self> {
        if workers == 0 || max_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "queue executor needs workers and a positive in-flight bound".into(),
            ));
        }
        Ok(QueueExecutor {
            workers,
            max_in_flight,
        })
    }
}

fn worker_loop<A, R>(
    jobs: Arc<Mutex<Receiver<Task<A>>>>,
    results: mpsc::Sender<Message<R>>,
    oracle: Oracle<A, R>,
    halt: CancelToken,
) {
    loop {
        let next = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(task) = next else {
            break;
        };
        let msg = if halt.is_cancelled() {
            Message::skipped(task.id)
        } else {
            run_task(&oracle, &task)
        };
        if results.send(msg).is_err() {
            break;
        }
    }
}

impl Executor for QueueExecutor {
    fn name(&self) -> &'static str {
        "queue"
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
            ..TransferStats::default()
        };

        let (job_tx, job_rx) = mpsc::channel::<Task<A>>();
        let (res_tx, res_rx) = mpsc::channel::<Message<R>>();
        let jobs = Arc::new(Mutex::new(job_rx));
        let workers = self.workers.min(tasks.len().max(1));
        for i in 0..workers {
            let jobs = Arc::clone(&jobs);
            let results = res_tx.clone();
            let oracle = Arc::clone(&oracle);
            let halt = halt.clone();
            // workers exit on their own once the job queue closes
            let spawned = thread::Builder::new()
                .name(format!("branchmap-queue-{i}"))
                .spawn(move || worker_loop(jobs, results, oracle, halt));
            if let Err(err) = spawned {
                debug!(%err, "could not spawn queue worker");
            }
        }
        debug!(
            tasks = tasks.len(),
            workers,
            max_in_flight = self.max_in_flight,
            "submitting to queue"
        );

        let pending: VecDeque<Task<A>> = tasks.into();
        Completions::new(
            Source::Channel {
                rx: res_rx,
                feed: Some(Feed {
                    pending,
                    tx: Some(job_tx),
                    window: self.max_in_flight,
                }),
                _keepalive: None,
            },
            labels,
            halt,
            stats,
        )
    }
}
