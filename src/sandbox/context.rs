//! Ownership of one interpreter runtime and its single context.

use rquickjs::{Context, Runtime};
use tracing::debug;

use super::limits::{self, ResourceLimits};
use crate::error::{Result, SandboxError};

/// An isolated guest context with no capabilities installed.
///
/// Created with only the language built-ins (no I/O, no timers). After
/// [`dispose`](Self::dispose) every accessor returns
/// [`SandboxError::Disposed`].
///
/// Owned by exactly one thread at a time: an evaluation moves it onto the
/// blocking pool and back. The context handle is never cloned.
pub struct GuestContext {
    runtime: Option<Runtime>,
    context: Option<Context>,
}

impl GuestContext {
    pub fn create(limits: &ResourceLimits) -> Result<Self> {
        let runtime = Runtime::new().map_err(SandboxError::runtime_init)?;
        limits.apply(&runtime);
        let context = Context::full(&runtime).map_err(SandboxError::runtime_init)?;
        debug!(
            max_memory = limits.max_memory,
            max_stack_size = limits.max_stack_size,
            "created guest context"
        );
        Ok(Self {
            runtime: Some(runtime),
            context: Some(context),
        })
    }

    pub fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(SandboxError::Disposed)
    }

    pub fn context(&self) -> Result<&Context> {
        self.context.as_ref().ok_or(SandboxError::Disposed)
    }

    pub fn is_disposed(&self) -> bool {
        self.runtime.is_none()
    }

    /// Release the context, then the runtime. Idempotent.
    pub fn dispose(&mut self) {
        if let Some(runtime) = &self.runtime {
            limits::disarm_interrupt(runtime);
            runtime.run_gc();
        }
        if self.context.take().is_some() || self.runtime.is_some() {
            debug!("disposed guest context");
        }
        self.runtime.take();
    }
}

impl Drop for GuestContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
