//! Resource limits and cooperative cancellation for guest execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rquickjs::Runtime;

/// Memory and stack limits applied to each interpreter runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum heap in bytes; `0` means unlimited.
    pub max_memory: usize,
    /// Maximum native stack in bytes; `0` means unlimited.
    pub max_stack_size: usize,
}

impl ResourceLimits {
    /// Apply the limits to a runtime before any guest code runs.
    pub fn apply(&self, runtime: &Runtime) {
        if self.max_memory > 0 {
            runtime.set_memory_limit(self.max_memory);
        }
        if self.max_stack_size > 0 {
            runtime.set_max_stack_size(self.max_stack_size);
        }
    }
}

/// Cancellation state shared between the host timer, the job pump and the
/// interpreter's interrupt handler.
///
/// Cancelled once [`cancel`](Self::cancel) is called or the deadline passes,
/// whichever comes first.
#[derive(Debug)]
pub struct CancellationToken {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
}

impl CancellationToken {
    /// A token cancelled after `timeout`. A timeout too large to represent as
    /// an instant means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancel();
                true
            }
            _ => false,
        }
    }

    /// A guard that cancels this token when dropped.
    pub fn guard(self: &Arc<Self>) -> CancelGuard {
        CancelGuard(Arc::clone(self))
    }

    /// Time left before the deadline, `None` without one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Cancels its token on drop, so abandoning an evaluation also stops it.
#[derive(Debug)]
pub struct CancelGuard(Arc<CancellationToken>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// The timeout for one call: the smaller of the runtime-level and call-level
/// values. Zero means "not set".
pub fn effective_timeout(runtime: Option<Duration>, call: Option<Duration>) -> Option<Duration> {
    let runtime = runtime.filter(|t| !t.is_zero());
    let call = call.filter(|t| !t.is_zero());
    match (runtime, call) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Make the interpreter abort guest code once `token` is cancelled.
///
/// Must be called while no other thread holds the runtime.
pub fn arm_interrupt(runtime: &Runtime, token: Arc<CancellationToken>) {
    runtime.set_interrupt_handler(Some(Box::new(move || token.is_cancelled())));
}

pub fn disarm_interrupt(runtime: &Runtime) {
    runtime.set_interrupt_handler(None);
}
