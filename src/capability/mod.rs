//! Capability providers: the only way host functionality reaches the guest.
//!
//! A fresh guest context has no I/O at all. Each [`CapabilityProvider`]
//! decides, from the runtime options, whether to contribute a
//! [`Capability`], and the [`ValueBridge`] installs it. Denied capabilities
//! install nothing, so guest code touching them fails with a
//! `ReferenceError`.

mod console;
mod environment;
mod filesystem;
mod globals;
mod network;

pub use console::ConsoleProvider;
pub use environment::EnvironmentProvider;
pub use filesystem::{filesystem_capability, FilesystemProvider, FS_OPERATIONS};
pub use globals::GlobalsProvider;
#[cfg(feature = "network")]
pub use network::ReqwestBackend;
pub use network::{HttpRequest, HttpResponse, NetworkBackend, NetworkError, NetworkProvider};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rquickjs::Ctx;
use tracing::debug;

use crate::bridge::{HostError, HostFunction, HostValue, ValueBridge};
use crate::error::{Result, SandboxError};
use crate::sandbox::{ConsoleOutput, RuntimeOptions};
use crate::vfs::Volume;

/// Cleanup run when the owning runtime is disposed.
pub type DisposeFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A bundle of host functions and values ready to be installed.
pub struct Capability {
    pub(crate) name: &'static str,
    pub(crate) namespace: Option<String>,
    pub(crate) functions: Vec<(String, HostFunction)>,
    pub(crate) globals: Vec<(String, HostValue)>,
    pub(crate) scripts: Vec<(String, &'static str)>,
    pub(crate) shim: Option<&'static str>,
    pub(crate) dispose: Option<DisposeFn>,
}

impl Capability {
    /// Functions become globals directly.
    pub fn global(name: &'static str) -> Self {
        Self {
            name,
            namespace: None,
            functions: Vec::new(),
            globals: Vec::new(),
            scripts: Vec::new(),
            shim: None,
            dispose: None,
        }
    }

    /// Functions are grouped under `globalThis[namespace]`.
    pub fn namespace(name: &'static str, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::global(name)
        }
    }

    pub fn with_function(mut self, name: impl Into<String>, function: HostFunction) -> Self {
        self.functions.push((name.into(), function));
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: HostValue) -> Self {
        self.globals.push((name.into(), value));
        self
    }

    /// Set `globalThis[name]` to whatever `source` evaluates to in the guest.
    /// Runs before the namespace and its shim are installed.
    pub fn with_script_global(mut self, name: impl Into<String>, source: &'static str) -> Self {
        self.scripts.push((name.into(), source));
        self
    }

    /// Guest-side wrapper applied to the namespace object. The source must
    /// evaluate to `(raw, promiseReturningNames) => api`.
    pub fn with_shim(mut self, shim: &'static str) -> Self {
        self.shim = Some(shim);
        self
    }

    pub fn on_dispose<F>(mut self, dispose: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.dispose = Some(Box::new(dispose));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn function(&self, name: &str) -> Option<&HostFunction> {
        self.functions
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, function)| function)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("functions", &self.functions.len())
            .field("globals", &self.globals.len())
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

/// An installed capability, owned by the runtime until disposal.
pub struct CapabilityHandle {
    name: &'static str,
    pub(crate) installed: Vec<String>,
    dispose: Option<DisposeFn>,
    disposed: bool,
}

impl CapabilityHandle {
    pub(crate) fn new(name: &'static str, installed: Vec<String>, dispose: Option<DisposeFn>) -> Self {
        Self {
            name,
            installed,
            dispose,
            disposed: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Global bindings this capability created.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Run the dispose hook once. A panicking hook is reported as an error.
    pub fn dispose(&mut self) -> anyhow::Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        let Some(dispose) = self.dispose.take() else {
            return Ok(());
        };
        match catch_unwind(AssertUnwindSafe(dispose)) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("dispose hook for '{}' panicked", self.name)),
        }
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("name", &self.name)
            .field("installed", &self.installed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// What a provider may draw on when deciding what to grant.
pub struct Grants<'a> {
    pub options: &'a RuntimeOptions,
    pub volume: &'a Arc<Volume>,
    pub console: &'a ConsoleOutput,
}

/// Produces a capability for a runtime, or nothing when not permitted.
pub trait CapabilityProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>>;
}

/// Ordered set of providers installed into every new runtime.
#[derive(Debug)]
pub struct CapabilityRegistry {
    providers: Vec<Box<dyn CapabilityProvider>>,
}

impl CapabilityRegistry {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Globals, filesystem, console, environment, network; in that order.
    pub fn standard() -> Self {
        Self::empty()
            .register(GlobalsProvider)
            .register(FilesystemProvider)
            .register(ConsoleProvider)
            .register(EnvironmentProvider)
            .register(NetworkProvider)
    }

    pub fn register(mut self, provider: impl CapabilityProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Install every granted capability, appending handles to `handles` as
    /// they succeed so the caller can dispose them even if a later provider
    /// fails.
    pub fn install_all<'js>(
        &self,
        ctx: &Ctx<'js>,
        bridge: &ValueBridge,
        grants: &Grants<'_>,
        handles: &mut Vec<CapabilityHandle>,
    ) -> Result<()> {
        for provider in &self.providers {
            let Some(capability) = provider.provide(grants)? else {
                debug!(capability = provider.name(), "capability not granted");
                continue;
            };
            let handle = bridge
                .install(ctx, capability)
                .map_err(|e| SandboxError::Capability {
                    name: provider.name(),
                    source: anyhow::anyhow!("{e}"),
                })?;
            handles.push(handle);
        }
        Ok(())
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Positional argument access with Node-style type errors.
pub(crate) struct Args<'a>(pub &'a [HostValue]);

impl<'a> Args<'a> {
    pub fn get(&self, idx: usize) -> &'a HostValue {
        const UNDEFINED: &HostValue = &HostValue::Undefined;
        self.0.get(idx).unwrap_or(UNDEFINED)
    }

    pub fn string(&self, idx: usize, name: &str) -> std::result::Result<String, HostError> {
        match self.get(idx) {
            HostValue::String(s) => Ok(s.clone()),
            HostValue::Bytes(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            other => Err(HostError::invalid_arg(name, "of type string", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_order() {
        assert_eq!(
            CapabilityRegistry::standard().provider_names(),
            ["globals", "filesystem", "console", "environment", "network"]
        );
    }

    #[test]
    fn test_handle_dispose_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut handle = CapabilityHandle::new(
            "counter",
            vec![],
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        handle.dispose().unwrap();
        handle.dispose().unwrap();
        assert!(handle.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_dispose_is_reported() {
        let mut handle =
            CapabilityHandle::new("boom", vec![], Some(Box::new(|| panic!("teardown"))));
        let err = handle.dispose().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_args() {
        let values = [HostValue::from("a"), HostValue::Number(1.0)];
        let args = Args(&values);
        assert_eq!(args.string(0, "path").unwrap(), "a");
        let err = args.string(1, "path").unwrap_err();
        assert_eq!(err.code(), Some("ERR_INVALID_ARG_TYPE"));
        assert!(args.get(5).is_nullish());
    }
}
