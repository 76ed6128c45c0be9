//! # QuickJS Sandbox
//!
//! Capability-scoped execution of untrusted JavaScript on an embedded
//! QuickJS interpreter.
//!
//! Each [`RuntimeInstance`] owns one interpreter runtime with a single
//! context. A fresh context has only the language built-ins; everything
//! else is granted explicitly through [`RuntimeOptions`]:
//!
//! - **Filesystem**: an in-memory [`Volume`](vfs::Volume) exposed as `__fs`
//!   and as the `fs` / `node:fs` modules. The host filesystem is never
//!   reachable.
//! - **Network**: `__net.fetch`, backed by a pluggable transport.
//! - **Environment and globals**: read-only `__env` and plain data on
//!   `globalThis`.
//! - **Console**: always installed, captured into [`ConsoleOutput`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use quickjs_sandbox_rs::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = RuntimeOptions::builder()
//!         .execution_timeout(Duration::from_secs(5))
//!         .max_memory(32 * 1024 * 1024) // 32MB
//!         .build();
//!
//!     let mut runtime = create_runtime(options, None)?;
//!     let result = runtime
//!         .eval_code("export default 1 + 1;", None, EvalOptions::default())
//!         .await?;
//!
//!     assert_eq!(result.data(), Some(&serde_json::json!(2)));
//!     assert!(runtime.is_disposed());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! 1. **Capability isolation**: guest code sees only what was granted
//! 2. **Resource limits**: heap and stack are bounded per runtime
//! 3. **Interrupt handler**: a deadline stops even tight loops
//! 4. **Guaranteed disposal**: every evaluation tears the runtime down

pub mod bridge;
pub mod capability;
pub mod error;
pub mod prelude;
pub mod sandbox;
pub mod vfs;

// Re-export main types at crate root for convenience
pub use error::{Result, SandboxError};
pub use sandbox::cache::{global_engine, SharedEngine};
pub use sandbox::config::{EvalOptions, RuntimeOptions, RuntimeOptionsBuilder};
pub use sandbox::executor::{ErrorDescriptor, ExecutionResult, RuntimeInstance, Validation};
pub use sandbox::io::ConsoleOutput;
pub use sandbox::create_runtime;
