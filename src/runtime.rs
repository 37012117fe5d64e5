use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Where a worker count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSource {
    Hint(&'static str),
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    pub count: usize,
    pub source: ThreadSource,
}

/// Scheduler hints, most specific first. Our own variable wins over
/// whatever the batch system exported.
pub const THREAD_HINTS: [&str; 6] = [
    "BRANCHMAP_THREADS",
    "RAYON_NUM_THREADS",
    "SLURM_CPUS_PER_TASK",
    "SLURM_CPUS_ON_NODE",
    "PBS_NP",
    "OMP_NUM_THREADS",
];

/// A hint counts only when it parses to a positive integer; anything
/// else falls through to the next one.
fn parse_hint(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

fn first_hint(hints: &[&'static str]) -> Option<ThreadConfig> {
    hints.iter().find_map(|&key| {
        let count = parse_hint(&std::env::var(key).ok()?)?;
        Some(ThreadConfig {
            count,
            source: ThreadSource::Hint(key),
        })
    })
}

/// Worker count from [`THREAD_HINTS`], falling back to the hardware.
pub fn detect_thread_config() -> ThreadConfig {
    let cfg = first_hint(&THREAD_HINTS).unwrap_or_else(|| ThreadConfig {
        count: std::thread::available_parallelism().map_or(1, |n| n.get()),
        source: ThreadSource::Hardware,
    });
    debug!(count = cfg.count, source = ?cfg.source, "worker count");
    cfg
}

/// Dedicated pool for one executor; never the global rayon pool, so a
/// stage can be sized independently of whatever else runs in-process.
pub fn build_worker_pool(workers: usize) -> Result<ThreadPool, rayon::ThreadPoolBuildError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("branchmap-worker-{i}"))
        .build()?;
    info!(workers, "worker pool ready");
    Ok(pool)
}

// -------------------------------------------------------------------------------------
// Interrupt signal
// -------------------------------------------------------------------------------------

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signum: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM into a flag polled by [`interrupt_requested`].
pub fn install_interrupt_handler() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let failed = unsafe {
            libc::signal(libc::SIGINT, handler) == libc::SIG_ERR
                || libc::signal(libc::SIGTERM, handler) == libc::SIG_ERR
        };
        if failed {
            warn!("could not install interrupt handler; Ctrl-C will abort the process");
        }
    });
}

pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
