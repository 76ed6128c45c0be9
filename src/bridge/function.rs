//! Host callables exposed to guest code and the errors they raise.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use rquickjs::{Ctx, Exception, Value};

use super::value::{HostValue, MarshalError};
use crate::vfs::FsError;

/// Synchronous host callback.
pub type SyncHostFn = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, HostError> + Send + Sync>;

/// Asynchronous host callback, driven on the Tokio runtime that created the
/// sandbox.
pub type AsyncHostFn =
    Arc<dyn Fn(Vec<HostValue>) -> BoxFuture<'static, Result<HostValue, HostError>> + Send + Sync>;

/// A host function installed into the guest.
#[derive(Clone)]
pub enum HostFunction {
    /// Returns its value directly; failures throw in the guest.
    Sync(SyncHostFn),
    /// Runs immediately but hands the guest a promise. Reactions run on a
    /// later turn of the job queue.
    Deferred(SyncHostFn),
    /// Resolves its promise once the host future completes.
    Async(AsyncHostFn),
}

impl HostFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        HostFunction::Sync(Arc::new(f))
    }

    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        HostFunction::Deferred(Arc::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> BoxFuture<'static, Result<HostValue, HostError>>
            + Send
            + Sync
            + 'static,
    {
        HostFunction::Async(Arc::new(f))
    }

    /// Whether the guest receives a promise from this function.
    pub fn returns_promise(&self) -> bool {
        !matches!(self, HostFunction::Sync(_))
    }

    /// Invoke a synchronous or deferred function directly from the host.
    /// Async functions report an error.
    pub fn call_blocking(&self, args: &[HostValue]) -> Result<HostValue, HostError> {
        match self {
            HostFunction::Sync(f) | HostFunction::Deferred(f) => f(args),
            HostFunction::Async(_) => Err(HostError::new(
                "Error",
                "asynchronous host functions cannot be called synchronously",
            )),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            HostFunction::Sync(_) => "Sync",
            HostFunction::Deferred(_) => "Deferred",
            HostFunction::Async(_) => "Async",
        };
        f.debug_tuple("HostFunction").field(&kind).finish()
    }
}

/// An error raised by host code, re-thrown in the guest as an `Error`
/// instance with `name`, `message` and any extra properties attached.
#[derive(Debug, Clone, PartialEq)]
pub struct HostError {
    pub name: String,
    pub message: String,
    pub properties: BTreeMap<String, HostValue>,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// A `TypeError` carrying Node's `ERR_INVALID_ARG_TYPE` code.
    pub fn invalid_arg(name: &str, expected: &str, actual: &HostValue) -> Self {
        Self::type_error(format!(
            "The \"{name}\" argument must be {expected}. Received {}",
            actual.type_name()
        ))
        .with_property("code", "ERR_INVALID_ARG_TYPE")
    }

    /// A `RangeError` carrying Node's `ERR_OUT_OF_RANGE` code.
    pub fn out_of_range(name: &str, range: &str, actual: f64) -> Self {
        Self::new(
            "RangeError",
            format!("The value of \"{name}\" is out of range. It must be {range}. Received {actual}"),
        )
        .with_property("code", "ERR_OUT_OF_RANGE")
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.properties.get("code").and_then(HostValue::as_str)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for HostError {}

impl From<FsError> for HostError {
    fn from(err: FsError) -> Self {
        let mut error = HostError::new("Error", err.to_string())
            .with_property("code", err.code.as_str())
            .with_property("errno", f64::from(err.code.errno()))
            .with_property("syscall", err.syscall);
        if let Some(path) = err.path {
            error = error.with_property("path", path);
        }
        if let Some(dest) = err.dest {
            error = error.with_property("dest", dest);
        }
        error
    }
}

impl From<MarshalError> for HostError {
    fn from(err: MarshalError) -> Self {
        HostError::type_error(err.to_string()).with_property("code", "ERR_SANDBOX_MARSHAL")
    }
}

/// Build the guest `Error` object for a host error.
pub(crate) fn to_exception<'js>(ctx: &Ctx<'js>, error: &HostError) -> rquickjs::Result<Value<'js>> {
    let exception = Exception::from_message(ctx.clone(), &error.message)?;
    let object = exception.as_object();
    object.set("name", error.name.as_str())?;
    for (key, value) in &error.properties {
        object.set(key.as_str(), value.clone())?;
    }
    Ok(exception.into_object().into_value())
}

/// Throw a host error into the guest, returning the pending-exception marker.
pub(crate) fn throw(ctx: &Ctx<'_>, error: &HostError) -> rquickjs::Error {
    match to_exception(ctx, error) {
        Ok(value) => ctx.throw(value),
        Err(err) => err,
    }
}
