use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::runtime;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    deadline: Option<Instant>,
    watch_signals: bool,
    parent: Option<CancelToken>,
}

/// Shared stop signal. A token reports cancellation when it was cancelled
/// explicitly, when its deadline passed, when a watched interrupt signal
/// arrived, or when its parent reports cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Token that also trips on SIGINT/SIGTERM (see
    /// [`runtime::install_interrupt_handler`]).
    pub fn watching_signals() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                watch_signals: true,
                ..Inner::default()
            }),
        }
    }

    /// Same token, plus a deadline that behaves like an interrupt.
    pub fn with_deadline(self, deadline: Instant) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                parent: Some(self),
                ..Inner::default()
            }),
        }
    }

    /// Token cancelled with `self`, but cancellable on its own.
    pub fn child(&self) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let inner = &self.inner;
        inner.flag.load(Ordering::SeqCst)
            || inner.deadline.is_some_and(|d| Instant::now() >= d)
            || (inner.watch_signals && runtime::interrupt_requested())
            || inner.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}
