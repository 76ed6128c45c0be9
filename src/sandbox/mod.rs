//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod context;
pub mod executor;
pub mod io;
pub mod limits;
pub mod loader;
pub mod transform;

use std::sync::Arc;

pub use cache::{global_engine, SharedEngine, TransformCache};
pub use config::{EvalOptions, RuntimeOptions, RuntimeOptionsBuilder};
pub use context::GuestContext;
pub use executor::{
    ErrorDescriptor, ExecutionResult, RuntimeInstance, Validation, STALLED_ERROR_NAME,
    TIMEOUT_ERROR_NAME, TIMEOUT_MESSAGE,
};
pub use io::{CapturedOutput, ConsoleOutput};
pub use limits::{CancelGuard, CancellationToken, ResourceLimits};
pub use loader::DEFAULT_ENTRY;
pub use transform::{Passthrough, SourceTransform, StripTypeImports, TransformError};

use crate::error::Result;
use crate::vfs::Volume;

/// Create a runtime instance on the global engine.
///
/// `volume` is mounted as is when given (after the source transform runs
/// over it); otherwise a fresh volume is built from
/// [`RuntimeOptions::mount_filesystem`].
pub fn create_runtime(options: RuntimeOptions, volume: Option<Arc<Volume>>) -> Result<RuntimeInstance> {
    global_engine().create_runtime(options, volume)
}
