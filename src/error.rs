//! Error types for the JavaScript sandbox.
//!
//! Guest-side failures (exceptions, syntax errors, timeouts) are not errors
//! at this level: they are reported as
//! [`ExecutionResult::Failure`](crate::sandbox::ExecutionResult). A
//! [`SandboxError`] means the host could not do what was asked.

use thiserror::Error;

use crate::sandbox::TransformError;
use crate::vfs::FsError;

/// Errors raised by the sandbox host.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The interpreter runtime or context could not be created.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// The runtime instance was already torn down.
    #[error("runtime instance has already been disposed")]
    Disposed,

    /// One or more teardown steps failed. Every step was still attempted.
    #[error("failed to dispose runtime: {}", .0.join("; "))]
    Dispose(Vec<String>),

    /// A capability provider failed to install.
    #[error("failed to install capability '{name}': {source}")]
    Capability {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The mounted source tree could not be transformed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The mounted filesystem tree could not be built.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] FsError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Check if this error is the use-after-dispose error.
    pub fn is_disposed(&self) -> bool {
        matches!(self, SandboxError::Disposed)
    }

    /// Check if this error came from teardown.
    pub fn is_dispose_failure(&self) -> bool {
        matches!(self, SandboxError::Dispose(_))
    }

    pub(crate) fn runtime_init(err: impl std::fmt::Display) -> Self {
        SandboxError::RuntimeInit(anyhow::anyhow!("{err}"))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
