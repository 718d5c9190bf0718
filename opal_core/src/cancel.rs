//! Cooperative cancellation for in-flight compilations.
//!
//! A [`CancelToken`] is shared between the compilation worker and whoever may
//! want to abandon the work (tier policy, shutdown, a compile-time alarm).
//! Phases poll it at phase boundaries and at bounded points inside
//! long-running loops; they never block on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CompileError, Result};

struct Inner {
    cancelled: AtomicBool,
    /// Absolute point after which the token reports cancelled on its own.
    deadline: Option<Instant>,
}

/// Shared flag that requests a compilation stop at the next safe point.
///
/// Cloning is cheap (one `Arc`). Once cancelled, a token stays cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A token that only cancels when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// A token that additionally trips once `budget` has elapsed, serving as
    /// the global compile-time alarm.
    pub fn with_deadline(budget: Duration) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + budget),
            }),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Poll point: returns [`CompileError::Cancelled`] once cancellation has
    /// been requested or the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CompileError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
