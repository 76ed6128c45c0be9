//! Core execution engine for the JavaScript sandbox.
//!
//! A [`RuntimeInstance`] is single-use: one `eval_code` or `validate_code`
//! call runs, and the instance is disposed before the call returns, on
//! every path.

use std::sync::Arc;
use std::time::Duration;

use rquickjs::promise::PromiseState;
use rquickjs::{CatchResultExt, CaughtError, Ctx, Module, Promise, Value};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::cache::SharedEngine;
use super::config::{EvalOptions, RuntimeOptions};
use super::context::GuestContext;
use super::io::ConsoleOutput;
use super::limits::{self, CancellationToken};
use super::loader::{ModuleLoader, ModuleResolver, DEFAULT_ENTRY};
use super::transform::{SourceTransform, TransformError};
use crate::bridge::{self, MarshalError, ValueBridge};
use crate::capability::{CapabilityHandle, CapabilityRegistry, Grants};
use crate::error::{Result, SandboxError};
use crate::vfs::Volume;

/// `name` of the error reported when the deadline passes.
pub const TIMEOUT_ERROR_NAME: &str = "ExecutionTimeout";
/// `message` of the error reported when the deadline passes.
pub const TIMEOUT_MESSAGE: &str =
    "The script execution has exceeded the maximum allowed time limit.";
/// `name` of the error reported when guest code awaits something that can
/// never settle.
pub const STALLED_ERROR_NAME: &str = "ExecutionStalled";

/// Jobs run per pump iteration before host completions are checked again.
const JOB_BATCH: usize = 64;

/// A guest error, normalized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDescriptor {
    pub fn new(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack,
        }
    }

    pub fn timeout() -> Self {
        Self::new(TIMEOUT_ERROR_NAME, TIMEOUT_MESSAGE, None)
    }

    fn stalled() -> Self {
        Self::new(
            STALLED_ERROR_NAME,
            "The script is waiting on a promise that no pending work can settle.",
            None,
        )
    }

    fn from_transform(err: &TransformError) -> Self {
        Self::new("SyntaxError", err.to_string(), None)
    }

    fn from_marshal(err: MarshalError) -> Self {
        Self::new("TypeError", err.to_string(), None)
    }

    pub fn is_timeout(&self) -> bool {
        self.name == TIMEOUT_ERROR_NAME
    }

    pub fn is_syntax_error(&self) -> bool {
        self.name == "SyntaxError"
    }
}

/// Outcome of [`RuntimeInstance::eval_code`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The entry module's `default` export, deep-cloned as JSON.
    Success(serde_json::Value),
    Failure(ErrorDescriptor),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ExecutionResult::Success(data) => Some(data),
            ExecutionResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(error) => Some(error),
        }
    }

    pub fn is_syntax_error(&self) -> bool {
        self.error().is_some_and(ErrorDescriptor::is_syntax_error)
    }

    pub fn is_timeout(&self) -> bool {
        self.error().is_some_and(ErrorDescriptor::is_timeout)
    }
}

/// Serializes as `{ok: true, data}` or `{ok: false, error, isSyntaxError}`.
impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ExecutionResult::Success(data) => {
                let mut state = serializer.serialize_struct("ExecutionResult", 2)?;
                state.serialize_field("ok", &true)?;
                state.serialize_field("data", data)?;
                state.end()
            }
            ExecutionResult::Failure(error) => {
                let mut state = serializer.serialize_struct("ExecutionResult", 3)?;
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
                state.serialize_field("isSyntaxError", &error.is_syntax_error())?;
                state.end()
            }
        }
    }
}

/// Outcome of [`RuntimeInstance::validate_code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(ErrorDescriptor),
}

/// Serializes as `{ok: true}` or like a failed [`ExecutionResult`].
impl Serialize for Validation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Validation::Valid => {
                let mut state = serializer.serialize_struct("Validation", 1)?;
                state.serialize_field("ok", &true)?;
                state.end()
            }
            Validation::Invalid(error) => ExecutionResult::Failure(error.clone()).serialize(serializer),
        }
    }
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match self {
            Validation::Valid => None,
            Validation::Invalid(error) => Some(error),
        }
    }
}

/// One guest runtime with its capabilities, volume and console.
pub struct RuntimeInstance {
    /// Moved onto the blocking pool while an evaluation runs.
    guest: Option<GuestContext>,
    bridge: ValueBridge,
    capabilities: Vec<CapabilityHandle>,
    volume: Arc<Volume>,
    console: ConsoleOutput,
    transform: Arc<dyn SourceTransform>,
    options: Arc<RuntimeOptions>,
    disposed: bool,
}

impl RuntimeInstance {
    pub(crate) fn create(
        engine: SharedEngine,
        options: RuntimeOptions,
        volume: Option<Arc<Volume>>,
    ) -> Result<Self> {
        let options = Arc::new(options);
        let volume = match volume {
            Some(volume) => volume,
            None => {
                let volume = Volume::with_capacity(options.max_volume_bytes);
                volume.mount(&options.mount_tree(), "/")?;
                Arc::new(volume)
            }
        };

        // Transform failures surface here, before any guest code runs.
        let transform = options.transform();
        transform.transform_tree(&volume)?;

        let guest = GuestContext::create(&options.limits())?;
        let builtins = Arc::new(engine.builtins().granted(&options));
        guest.runtime()?.set_loader(
            ModuleResolver::new(volume.clone(), builtins.clone()),
            ModuleLoader::new(volume.clone(), builtins, transform.clone(), engine),
        );

        // From here on, an early return drops the instance, which disposes it.
        let mut instance = Self {
            guest: Some(guest),
            bridge: ValueBridge::new(Handle::try_current().ok()),
            capabilities: Vec::new(),
            volume,
            console: ConsoleOutput::new(),
            transform,
            options,
            disposed: false,
        };
        instance.install_capabilities()?;
        if instance.options.enable_test_utilities {
            instance.preload("test")?;
        }

        info!(
            capabilities = ?instance.capabilities.iter().map(CapabilityHandle::name).collect::<Vec<_>>(),
            transform = instance.transform.id(),
            "runtime instance created"
        );
        Ok(instance)
    }

    fn install_capabilities(&mut self) -> Result<()> {
        let registry = CapabilityRegistry::standard();
        let grants = Grants {
            options: &self.options,
            volume: &self.volume,
            console: &self.console,
        };
        let bridge = &self.bridge;
        let handles = &mut self.capabilities;
        self.guest
            .as_ref()
            .ok_or(SandboxError::Disposed)?
            .context()?
            .with(|ctx| registry.install_all(&ctx, bridge, &grants, handles))
    }

    fn guest(&self) -> Result<&GuestContext> {
        self.guest.as_ref().ok_or(SandboxError::Disposed)
    }

    fn preload(&self, module: &str) -> Result<()> {
        let source = format!("import '{module}';");
        let token = CancellationToken::new(None);
        let bridge = &self.bridge;
        let interval = self.options.job_pump_interval;
        self.guest()?
            .context()?
            .with(|ctx| evaluate_module(&ctx, bridge, "<preload>", source, &token, interval))
            .map(|_| ())
            .map_err(|e| {
                SandboxError::RuntimeInit(anyhow::anyhow!(
                    "failed to preload '{module}': {}: {}",
                    e.name,
                    e.message
                ))
            })
    }

    /// Evaluate `code` as an ES module named `filename` (default
    /// `/src/index.js`) and return its `default` export.
    ///
    /// The instance is disposed before this returns. Guest failures come
    /// back as [`ExecutionResult::Failure`]; a disposal failure is returned
    /// as an error only when the evaluation itself succeeded.
    pub async fn eval_code(
        &mut self,
        code: &str,
        filename: Option<&str>,
        options: EvalOptions,
    ) -> Result<ExecutionResult> {
        if self.disposed {
            return Err(SandboxError::Disposed);
        }
        let filename = filename.unwrap_or(DEFAULT_ENTRY).to_string();
        let timeout = limits::effective_timeout(self.options.execution_timeout, options.execution_timeout);
        debug!(filename = %filename, ?timeout, "evaluating guest code");

        let result = match self.run(code, filename, timeout).await {
            Ok(result) => result,
            Err(err) => {
                if let Err(dispose_err) = self.dispose() {
                    warn!(error = %dispose_err, "dispose failed after host error");
                }
                return Err(err);
            }
        };
        let succeeded = result.is_success();
        self.finish(result, succeeded)
    }

    async fn run(
        &mut self,
        code: &str,
        filename: String,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let source = match self.transform.transform_file(&filename, code) {
            Ok(source) => source,
            Err(err) => return Ok(ExecutionResult::Failure(ErrorDescriptor::from_transform(&err))),
        };

        let token = Arc::new(CancellationToken::new(timeout));
        // If this future is dropped mid-evaluation the worker is told to stop;
        // it then drops the guest on its own thread.
        let _cancel_on_drop = token.guard();
        let guest = self.guest.take().ok_or(SandboxError::Disposed)?;
        limits::arm_interrupt(guest.runtime()?, token.clone());

        let job = EvalJob {
            bridge: self.bridge.clone(),
            filename,
            source,
            token: token.clone(),
            pump_interval: self.options.job_pump_interval,
        };
        let mut worker = tokio::task::spawn_blocking(move || {
            let result = job.run(&guest);
            (guest, result)
        });

        let mut timed_out = false;
        let finished = match token.deadline() {
            None => worker.await,
            Some(deadline) => tokio::select! {
                finished = &mut worker => finished,
                _ = tokio::time::sleep_until(deadline.into()) => {
                    token.cancel();
                    timed_out = true;
                    // The worker sees the token at its next interrupt check or
                    // pump iteration and hands the guest back.
                    worker.await
                }
            },
        };

        let result = match finished {
            Ok((guest, result)) => {
                self.guest = Some(guest);
                result
            }
            Err(err) => worker_failed(err),
        };
        if timed_out {
            warn!(?timeout, "guest execution timed out");
            return Ok(ExecutionResult::Failure(ErrorDescriptor::timeout()));
        }
        Ok(result)
    }

    /// Compile `code` as a module without linking or running it.
    ///
    /// Missing imports are not detected. The instance is disposed before
    /// this returns.
    pub fn validate_code(
        &mut self,
        code: &str,
        filename: Option<&str>,
        _options: EvalOptions,
    ) -> Result<Validation> {
        if self.disposed {
            return Err(SandboxError::Disposed);
        }
        let filename = filename.unwrap_or(DEFAULT_ENTRY);
        let validation = match self.compile(code, filename) {
            Ok(validation) => validation,
            Err(err) => {
                if let Err(dispose_err) = self.dispose() {
                    warn!(error = %dispose_err, "dispose failed after host error");
                }
                return Err(err);
            }
        };
        let valid = validation.is_valid();
        self.finish(validation, valid)
    }

    fn compile(&self, code: &str, filename: &str) -> Result<Validation> {
        let source = match self.transform.transform_file(filename, code) {
            Ok(source) => source,
            Err(err) => return Ok(Validation::Invalid(ErrorDescriptor::from_transform(&err))),
        };
        let validation = self.guest()?.context()?.with(|ctx| {
            match Module::declare(ctx.clone(), filename, source).catch(&ctx) {
                Ok(_) => Validation::Valid,
                Err(caught) => Validation::Invalid(describe_caught(caught)),
            }
        });
        Ok(validation)
    }

    fn finish<T>(&mut self, result: T, succeeded: bool) -> Result<T> {
        match self.dispose() {
            Ok(()) => Ok(result),
            Err(err) if succeeded => Err(err),
            Err(err) => {
                warn!(error = %err, "dispose failed after unsuccessful execution");
                Ok(result)
            }
        }
    }

    /// Tear down capabilities, outstanding host work, then the interpreter.
    ///
    /// Every step runs even if an earlier one fails; failures are collected
    /// into [`SandboxError::Dispose`]. Calling this again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let mut failures = Vec::new();
        for handle in self.capabilities.iter_mut().rev() {
            if let Err(err) = handle.dispose() {
                error!(capability = handle.name(), error = %err, "failed to dispose capability");
                failures.push(format!("{}: {err}", handle.name()));
            }
        }
        self.capabilities.clear();
        self.bridge.dispose();
        if let Some(mut guest) = self.guest.take() {
            guest.dispose();
        }
        debug!(failures = failures.len(), "runtime instance disposed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Dispose(failures))
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// The volume guest code sees. Remains readable after disposal.
    pub fn mounted_filesystem(&self) -> Arc<Volume> {
        Arc::clone(&self.volume)
    }

    /// Captured guest console output.
    pub fn console_output(&self) -> &ConsoleOutput {
        &self.console
    }

    /// Capabilities installed into this runtime (empty after disposal).
    pub fn capabilities(&self) -> &[CapabilityHandle] {
        &self.capabilities
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }
}

impl Drop for RuntimeInstance {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!(error = %err, "dispose failed while dropping runtime instance");
        }
    }
}

impl std::fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("capabilities", &self.capabilities)
            .field("transform", &self.transform.id())
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Work moved onto the blocking pool for one evaluation.
struct EvalJob {
    bridge: ValueBridge,
    filename: String,
    source: String,
    token: Arc<CancellationToken>,
    pump_interval: Duration,
}

impl EvalJob {
    fn run(self, guest: &GuestContext) -> ExecutionResult {
        let EvalJob {
            bridge,
            filename,
            source,
            token,
            pump_interval,
        } = self;
        let outcome = match guest.context() {
            Ok(context) => context
                .with(|ctx| evaluate_module(&ctx, &bridge, &filename, source, &token, pump_interval)),
            Err(err) => Err(ErrorDescriptor::new("InternalError", err.to_string(), None)),
        };
        match outcome {
            Ok(data) => ExecutionResult::Success(data),
            Err(error) => ExecutionResult::Failure(error),
        }
    }
}

/// The guest went down with a panicking worker; there is nothing left to
/// hand back.
fn worker_failed(err: JoinError) -> ExecutionResult {
    error!(error = %err, "execution worker failed");
    ExecutionResult::Failure(ErrorDescriptor::new(
        "InternalError",
        format!("execution worker failed: {err}"),
        None,
    ))
}

/// Compile, link and run a module, pump its jobs until its evaluation
/// promise settles, and return its `default` export as JSON.
fn evaluate_module<'js>(
    ctx: &Ctx<'js>,
    bridge: &ValueBridge,
    filename: &str,
    source: String,
    token: &CancellationToken,
    pump_interval: Duration,
) -> std::result::Result<serde_json::Value, ErrorDescriptor> {
    let declared = Module::declare(ctx.clone(), filename, source)
        .catch(ctx)
        .map_err(|caught| describe(token, caught))?;
    let (module, promise) = declared
        .eval()
        .catch(ctx)
        .map_err(|caught| describe(token, caught))?;

    pump(ctx, bridge, &promise, token, pump_interval)?;

    let exported: Value<'js> = module
        .namespace()
        .and_then(|namespace| namespace.get("default"))
        .catch(ctx)
        .map_err(|caught| describe(token, caught))?;
    bridge::to_json(ctx, exported).map_err(ErrorDescriptor::from_marshal)
}

/// Drive the job queue and host completions until `promise` settles.
///
/// Checks `token` every iteration. When nothing is runnable and no host
/// work is outstanding the promise can never settle: without a deadline
/// that is reported as a stall, with one the pump idles until it passes.
fn pump<'js>(
    ctx: &Ctx<'js>,
    bridge: &ValueBridge,
    promise: &Promise<'js>,
    token: &CancellationToken,
    interval: Duration,
) -> std::result::Result<(), ErrorDescriptor> {
    loop {
        if token.is_cancelled() {
            return Err(ErrorDescriptor::timeout());
        }

        let delivered = bridge.deliver_completions(ctx, None);
        let mut ran = 0;
        while ran < JOB_BATCH && ctx.execute_pending_job() {
            ran += 1;
        }

        match promise.state() {
            PromiseState::Resolved => return Ok(()),
            PromiseState::Rejected => return Err(describe(token, rejection(ctx, promise))),
            PromiseState::Pending => {}
        }

        if ran == 0 && delivered == 0 {
            if !bridge.has_pending() && token.deadline().is_none() {
                return Err(ErrorDescriptor::stalled());
            }
            bridge.deliver_completions(ctx, Some(interval));
        }
    }
}

fn rejection<'js>(ctx: &Ctx<'js>, promise: &Promise<'js>) -> CaughtError<'js> {
    match promise.result::<Value<'js>>() {
        Some(result) => match result.catch(ctx) {
            Ok(value) => CaughtError::Value(value),
            Err(caught) => caught,
        },
        None => CaughtError::Error(rquickjs::Error::Unknown),
    }
}

/// Normalize a guest failure, reporting a timeout if the token fired.
fn describe(token: &CancellationToken, caught: CaughtError<'_>) -> ErrorDescriptor {
    if token.is_cancelled() {
        return ErrorDescriptor::timeout();
    }
    describe_caught(caught)
}

fn describe_caught(caught: CaughtError<'_>) -> ErrorDescriptor {
    match caught {
        CaughtError::Exception(exception) => {
            let name = exception
                .as_object()
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let stack = exception.stack().filter(|stack| !stack.trim().is_empty());
            ErrorDescriptor::new(name, exception.message().unwrap_or_default(), stack)
        }
        CaughtError::Value(value) => {
            let field = |key: &str| {
                value
                    .as_object()
                    .and_then(|object| object.get::<_, Option<String>>(key).ok().flatten())
            };
            let message = field("message").unwrap_or_else(|| {
                value
                    .get::<rquickjs::convert::Coerced<String>>()
                    .map(|coerced| coerced.0)
                    .unwrap_or_else(|_| "unknown error".to_string())
            });
            ErrorDescriptor::new(field("name").unwrap_or_else(|| "Error".to_string()), message, None)
        }
        CaughtError::Error(err) => ErrorDescriptor::new("InternalError", err.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeout_descriptor() {
        let timeout = ErrorDescriptor::timeout();
        assert!(timeout.is_timeout());
        assert_eq!(timeout.name, "ExecutionTimeout");
        assert!(timeout.stack.is_none());
    }

    #[test]
    fn test_result_serialization() {
        let ok = ExecutionResult::Success(json!({ "a": 1 }));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "ok": true, "data": { "a": 1 } }));

        let failed = ExecutionResult::Failure(ErrorDescriptor::new("SyntaxError", "unexpected token", None));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({
                "ok": false,
                "error": { "name": "SyntaxError", "message": "unexpected token" },
                "isSyntaxError": true
            })
        );
        assert!(failed.is_syntax_error());
        assert!(!failed.is_timeout());

        assert_eq!(serde_json::to_value(Validation::Valid).unwrap(), json!({ "ok": true }));
    }

    #[test]
    fn test_describe_thrown_values() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let caught = ctx
                .eval::<(), _>("throw new RangeError('too far')")
                .catch(&ctx)
                .unwrap_err();
            let described = describe_caught(caught);
            assert_eq!(described.name, "RangeError");
            assert_eq!(described.message, "too far");

            let caught = ctx.eval::<(), _>("throw 'plain'").catch(&ctx).unwrap_err();
            let described = describe_caught(caught);
            assert_eq!(described.name, "Error");
            assert_eq!(described.message, "plain");

            let caught = ctx
                .eval::<(), _>("throw { name: 'Custom', message: 'shaped' }")
                .catch(&ctx)
                .unwrap_err();
            assert_eq!(
                describe_caught(caught),
                ErrorDescriptor::new("Custom", "shaped", None)
            );
        });
    }

    #[test]
    fn test_cancelled_token_reports_timeout() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        let token = CancellationToken::new(None);
        token.cancel();
        context.with(|ctx| {
            let caught = ctx.eval::<(), _>("throw new Error('x')").catch(&ctx).unwrap_err();
            assert!(describe(&token, caught).is_timeout());
        });
    }

    #[test]
    fn test_eval_on_isolated_engine() {
        let mut runtime = SharedEngine::isolated()
            .create_runtime(RuntimeOptions::default(), None)
            .unwrap();
        let result = tokio_test::block_on(runtime.eval_code(
            "export default [typeof console.log, 'x'];",
            None,
            EvalOptions::default(),
        ))
        .unwrap();
        assert_eq!(result.data(), Some(&json!(["function", "x"])));
        assert!(runtime.is_disposed());
        assert!(runtime.dispose().is_ok());
    }

    fn failing_handle(name: &'static str) -> CapabilityHandle {
        CapabilityHandle::new(name, vec![], Some(Box::new(move || Err(anyhow::anyhow!("{name} broke")))))
    }

    #[test]
    fn test_dispose_aggregates_failures() {
        let mut runtime = SharedEngine::isolated()
            .create_runtime(RuntimeOptions::default(), None)
            .unwrap();
        runtime.capabilities.push(failing_handle("first"));
        runtime.capabilities.push(CapabilityHandle::new(
            "panicky",
            vec![],
            Some(Box::new(|| panic!("hook panicked"))),
        ));

        match runtime.dispose() {
            Err(SandboxError::Dispose(failures)) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("panicky"));
                assert!(failures[1].contains("first broke"));
            }
            other => panic!("expected dispose failure, got {other:?}"),
        }
        assert!(runtime.is_disposed());
        assert!(runtime.dispose().is_ok());
    }

    #[test]
    fn test_dispose_failure_surfaces_only_after_success() {
        let mut runtime = SharedEngine::isolated()
            .create_runtime(RuntimeOptions::default(), None)
            .unwrap();
        runtime.capabilities.push(failing_handle("hook"));
        let err = tokio_test::block_on(runtime.eval_code("export default 1;", None, EvalOptions::default()))
            .unwrap_err();
        assert!(err.is_dispose_failure());

        let mut runtime = SharedEngine::isolated()
            .create_runtime(RuntimeOptions::default(), None)
            .unwrap();
        runtime.capabilities.push(failing_handle("hook"));
        let result = tokio_test::block_on(runtime.eval_code("throw new Error('x');", None, EvalOptions::default()))
            .unwrap();
        assert_eq!(result.error().unwrap().message, "x");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abandoned_evaluation_stops_the_worker() {
        let mut runtime = SharedEngine::isolated()
            .create_runtime(RuntimeOptions::default(), None)
            .unwrap();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            runtime.eval_code("while (true) {}", None, EvalOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
        // The guest stays with the worker; teardown here must not wait on it.
        assert!(runtime.guest.is_none());
        runtime.dispose().unwrap();
        assert!(runtime.is_disposed());
        // Shutting down this test's runtime joins the blocking pool, so a
        // worker still spinning on the loop would hang here.
    }

    #[test]
    fn test_pump_reports_stall() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        let bridge = ValueBridge::new(None);
        let token = CancellationToken::new(None);
        let result = context.with(|ctx| {
            evaluate_module(
                &ctx,
                &bridge,
                "/src/index.js",
                "await new Promise(() => {}); export default 1;".to_string(),
                &token,
                Duration::from_millis(1),
            )
        });
        assert_eq!(result.unwrap_err().name, STALLED_ERROR_NAME);
    }
}
