//! The boundary between guest values and host values.
//!
//! [`ValueBridge`] turns [`HostFunction`]s into guest callables, marshals
//! their arguments into [`HostValue`]s and their results back, and keeps
//! track of promises handed to the guest for host work still in flight.
//! Completed host work is queued on a channel and delivered by the
//! executor's job pump, always on the thread that holds the context.
//!
//! The resolve and reject functions of those promises never leave the guest:
//! they sit in a registry object inside the context, keyed by call id, so the
//! bridge itself holds only `Send` state and can move with the context.

mod function;
mod value;

pub use function::{AsyncHostFn, HostError, HostFunction, SyncHostFn};
pub(crate) use function::{throw, to_exception};
pub use value::{from_js, to_json, HostValue, MarshalError, MarshalMode};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, IntoJs, Object, Value};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::capability::{Capability, CapabilityHandle};

const CALLBACK_SHIM: &str = include_str!("callback_shim.js");
const PENDING_SOURCE: &str = include_str!("pending.js");

/// Hidden, non-writable global holding the guest-side resolvers.
const PENDING_REGISTRY: &str = "__hostPending";

struct Completion {
    id: u64,
    outcome: Result<HostValue, HostError>,
}

struct BridgeState {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    sender: mpsc::Sender<Completion>,
    receiver: Mutex<mpsc::Receiver<Completion>>,
    runtime: Option<Handle>,
    disposed: AtomicBool,
}

/// Marshals values and calls across the sandbox boundary for one runtime.
#[derive(Clone)]
pub struct ValueBridge {
    state: Arc<BridgeState>,
}

impl ValueBridge {
    /// Create a bridge. Async host functions are spawned on `runtime`; without
    /// one they reject immediately.
    pub fn new(runtime: Option<Handle>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            state: Arc::new(BridgeState {
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                sender,
                receiver: Mutex::new(receiver),
                runtime,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Install a capability's functions and values into the guest.
    ///
    /// On failure the capability's dispose hook is run before the error is
    /// returned.
    pub fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        capability: Capability,
    ) -> rquickjs::Result<CapabilityHandle> {
        let Capability {
            name,
            namespace,
            functions,
            globals,
            scripts,
            shim,
            dispose,
        } = capability;

        let installed = (|| -> rquickjs::Result<Vec<String>> {
            let mut installed = Vec::new();
            let global = ctx.globals();
            for (key, value) in globals {
                global.set(key.as_str(), value)?;
                installed.push(key);
            }
            for (key, source) in scripts {
                let value: Value<'js> = ctx.eval(source)?;
                global.set(key.as_str(), value)?;
                installed.push(key);
            }
            match &namespace {
                Some(namespace) => {
                    self.install_namespace(ctx, namespace, &functions, shim)?;
                    installed.push(namespace.clone());
                }
                None => {
                    for (function_name, function) in &functions {
                        self.install_function(ctx, &global, function_name, function.clone())?;
                        installed.push(function_name.clone());
                    }
                }
            }
            Ok(installed)
        })();

        let mut handle = CapabilityHandle::new(name, Vec::new(), dispose);
        match installed {
            Ok(names) => {
                debug!(capability = name, bindings = ?names, "installed capability");
                handle.installed = names;
                Ok(handle)
            }
            Err(err) => {
                if let Err(dispose_err) = handle.dispose() {
                    warn!(capability = name, error = %dispose_err, "dispose after failed install");
                }
                Err(err)
            }
        }
    }

    /// Expose a host function as `target[name]`.
    pub fn install_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: &Object<'js>,
        name: &str,
        function: HostFunction,
    ) -> rquickjs::Result<()> {
        if matches!(function, HostFunction::Async(_)) {
            self.registry(ctx)?;
        }
        target.set(name, self.make_function(ctx, name, function)?)
    }

    /// The guest-side resolver registry, defined on first use. It is created
    /// while capabilities are installed, before any guest code runs, and
    /// cannot be replaced afterwards.
    fn registry<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let global = ctx.globals();
        if let Some(registry) = global.get::<_, Option<Object<'js>>>(PENDING_REGISTRY)? {
            return Ok(registry);
        }
        let registry: Object<'js> = ctx.eval(PENDING_SOURCE)?;
        let descriptor = Object::new(ctx.clone())?;
        descriptor.set("value", registry.clone())?;
        let define: Function<'js> = global.get::<_, Object>("Object")?.get("defineProperty")?;
        define.call::<_, ()>((global, PENDING_REGISTRY, descriptor))?;
        Ok(registry)
    }

    /// Build `globalThis[namespace]` from a set of functions, passing the raw
    /// object through `shim` (or the default callback shim when any function
    /// returns a promise).
    pub fn install_namespace<'js>(
        &self,
        ctx: &Ctx<'js>,
        namespace: &str,
        functions: &[(String, HostFunction)],
        shim: Option<&str>,
    ) -> rquickjs::Result<()> {
        let raw = Object::new(ctx.clone())?;
        let mut promise_returning = Vec::new();
        for (name, function) in functions {
            if function.returns_promise() {
                promise_returning.push(name.clone());
            }
            self.install_function(ctx, &raw, name, function.clone())?;
        }

        let shim = match shim {
            Some(shim) => Some(shim),
            None if !promise_returning.is_empty() => Some(CALLBACK_SHIM),
            None => None,
        };
        let api: Value<'js> = match shim {
            Some(source) => {
                let wrap: Function<'js> = ctx.eval(source)?;
                wrap.call((raw, promise_returning))?
            }
            None => {
                let freeze: Function<'js> = ctx.globals().get::<_, Object>("Object")?.get("freeze")?;
                freeze.call((raw,))?
            }
        };
        ctx.globals().set(namespace, api)
    }

    fn make_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        function: HostFunction,
    ) -> rquickjs::Result<Function<'js>> {
        let bridge = self.clone();
        let label = name.to_string();
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                bridge.invoke(&ctx, &label, &function, args.0)
            },
        )
    }

    fn invoke<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        function: &HostFunction,
        args: Vec<Value<'js>>,
    ) -> rquickjs::Result<Value<'js>> {
        let mut host_args = Vec::with_capacity(args.len());
        for arg in args {
            match from_js(ctx, arg, MarshalMode::Arguments) {
                Ok(value) => host_args.push(value),
                Err(err) => return Err(throw(ctx, &HostError::from(err))),
            }
        }

        match function {
            HostFunction::Sync(f) => match f(&host_args) {
                Ok(value) => value.into_js(ctx),
                Err(err) => Err(throw(ctx, &err)),
            },
            HostFunction::Deferred(f) => settled_promise(ctx, f(&host_args)),
            HostFunction::Async(f) => self.spawn(ctx, name, f(host_args)),
        }
    }

    fn spawn<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        future: BoxFuture<'static, Result<HostValue, HostError>>,
    ) -> rquickjs::Result<Value<'js>> {
        let handle = match &self.state.runtime {
            Some(handle) if !self.state.disposed.load(Ordering::Acquire) => handle,
            _ => {
                return settled_promise(
                    ctx,
                    Err(HostError::new(
                        "Error",
                        format!("{name}: no async runtime is available to the sandbox"),
                    )),
                )
            }
        };

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let create: Function<'js> = self.registry(ctx)?.get("create")?;
        let promise: Value<'js> = create.call((id as f64,))?;
        let sender = self.state.sender.clone();
        let task = handle.spawn(async move {
            let outcome = future.await;
            // The receiver is gone once the runtime is disposed.
            let _ = sender.send(Completion { id, outcome });
        });

        self.state.tasks.lock().insert(id, task.abort_handle());
        debug!(call = name, id, "spawned async host call");
        Ok(promise)
    }

    /// Whether host work handed to the guest is still outstanding.
    pub fn has_pending(&self) -> bool {
        !self.state.tasks.lock().is_empty()
    }

    /// Settle promises for completed host work. With `wait`, blocks up to that
    /// long for the first completion. Returns how many were delivered.
    pub(crate) fn deliver_completions<'js>(&self, ctx: &Ctx<'js>, wait: Option<Duration>) -> usize {
        let completions: Vec<Completion> = {
            let receiver = self.state.receiver.lock();
            let first = match wait {
                Some(timeout) => receiver.recv_timeout(timeout).ok(),
                None => None,
            };
            first.into_iter().chain(receiver.try_iter()).collect()
        };

        let delivered = completions.len();
        for completion in completions {
            let id = completion.id;
            if let Err(err) = self.settle(ctx, completion) {
                warn!(id, error = %err, "failed to settle host promise");
            }
        }
        delivered
    }

    fn settle<'js>(&self, ctx: &Ctx<'js>, completion: Completion) -> rquickjs::Result<()> {
        if self.state.tasks.lock().remove(&completion.id).is_none() {
            return Ok(());
        }
        let settle: Function<'js> = self.registry(ctx)?.get("settle")?;
        let id = completion.id as f64;
        match completion.outcome {
            Ok(value) => settle.call((id, true, value)),
            Err(error) => settle.call((id, false, to_exception(ctx, &error)?)),
        }
    }

    /// Abort outstanding host work. The guest-side resolvers go away with
    /// the context, so this does not need it.
    pub fn dispose(&self) {
        if self.state.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<AbortHandle> = self.state.tasks.lock().drain().map(|(_, task)| task).collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "aborting outstanding host calls");
        }
        for task in tasks {
            task.abort();
        }
        self.state.receiver.lock().try_iter().for_each(drop);
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::Acquire)
    }
}

/// A promise that is already resolved or rejected.
fn settled_promise<'js>(
    ctx: &Ctx<'js>,
    outcome: Result<HostValue, HostError>,
) -> rquickjs::Result<Value<'js>> {
    let (promise, resolve, reject) = ctx.promise()?;
    match outcome {
        Ok(value) => resolve.call::<_, ()>((value,))?,
        Err(error) => reject.call::<_, ()>((to_exception(ctx, &error)?,))?,
    }
    Ok(promise.into_value())
}
