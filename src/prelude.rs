//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    config::{EvalOptions, RuntimeOptions},
    create_runtime,
    executor::{ExecutionResult, RuntimeInstance, Validation},
};
pub use crate::vfs::Volume;
