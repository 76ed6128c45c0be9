//! Runtime configuration with builder pattern.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use super::limits::ResourceLimits;
use super::transform::{Passthrough, SourceTransform, StripTypeImports};
use crate::capability::NetworkBackend;
use crate::error::{Result, SandboxError};
use crate::vfs::Volume;

/// Options fixed for the lifetime of one runtime instance.
///
/// Deserializes from the camelCase JSON shape used by embedders, e.g.
/// `{"allowFs": true, "executionTimeout": 2, "env": {"MODE": "test"}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeOptions {
    /// Install the `__fs` capability and the `fs` / `node:fs` modules.
    #[serde(alias = "allowFs")]
    pub allow_filesystem: bool,
    /// Initial tree for a freshly created volume: objects are directories,
    /// strings are file contents.
    #[serde(alias = "mountFs")]
    pub mount_filesystem: Option<serde_json::Value>,
    /// Install the `__net` capability.
    #[serde(alias = "allowFetch")]
    pub allow_network: bool,
    /// Plain data copied onto `globalThis`.
    pub globals: BTreeMap<String, serde_json::Value>,
    /// Variables readable through `__env`.
    pub env: BTreeMap<String, String>,
    /// Default wall-clock limit for each evaluation, in seconds.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub execution_timeout: Option<Duration>,
    /// Run guest sources through the source transform before loading.
    ///
    /// The built-in transform only blanks type-only import and export
    /// statements; annotated TypeScript needs a real transpiler supplied
    /// through `source_transform`.
    pub transform_source: bool,
    /// Make the `test` module available and preload it.
    #[serde(alias = "enableTestUtils")]
    pub enable_test_utilities: bool,
    pub max_memory: usize,
    pub max_stack_size: usize,
    /// Byte budget of a volume created for this runtime; `0` means unlimited.
    /// A volume passed in by the caller keeps its own budget.
    pub max_volume_bytes: u64,
    /// How long the job pump sleeps when idle with host work outstanding.
    #[serde(skip)]
    pub job_pump_interval: Duration,
    /// Overrides the built-in transform when `transform_source` is set.
    #[serde(skip)]
    pub source_transform: Option<Arc<dyn SourceTransform>>,
    /// Overrides the default HTTP transport.
    #[serde(skip)]
    pub network_backend: Option<Arc<dyn NetworkBackend>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            allow_filesystem: false,
            mount_filesystem: None,
            allow_network: false,
            globals: BTreeMap::new(),
            env: BTreeMap::new(),
            execution_timeout: None,
            transform_source: false,
            enable_test_utilities: false,
            max_memory: 64 * 1024 * 1024, // 64MB
            max_stack_size: 1024 * 1024,  // 1MB
            max_volume_bytes: Volume::DEFAULT_CAPACITY,
            job_pump_interval: Duration::from_millis(1),
            source_transform: None,
            network_backend: None,
        }
    }
}

impl RuntimeOptions {
    /// Create a new builder for RuntimeOptions.
    pub fn builder() -> RuntimeOptionsBuilder {
        RuntimeOptionsBuilder::default()
    }

    /// Parse options from their JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SandboxError::Config(e.to_string()))
    }

    /// The tree mounted into a new volume; `{"src": {}}` unless configured.
    pub fn mount_tree(&self) -> serde_json::Value {
        self.mount_filesystem
            .clone()
            .unwrap_or_else(|| serde_json::json!({ "src": {} }))
    }

    /// The transform applied to guest sources.
    pub fn transform(&self) -> Arc<dyn SourceTransform> {
        if !self.transform_source {
            return Arc::new(Passthrough);
        }
        self.source_transform
            .clone()
            .unwrap_or_else(|| Arc::new(StripTypeImports))
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_memory: self.max_memory,
            max_stack_size: self.max_stack_size,
        }
    }
}

fn deserialize_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<f64>::deserialize(deserializer)? {
        Some(seconds) if seconds > 0.0 => Duration::try_from_secs_f64(seconds)
            .map(Some)
            .map_err(|e| D::Error::custom(format!("timeout of {seconds} seconds: {e}"))),
        _ => Ok(None),
    }
}

/// Builder for creating RuntimeOptions instances.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptionsBuilder {
    options: RuntimeOptions,
}

impl RuntimeOptionsBuilder {
    /// Allow guest filesystem access.
    pub fn allow_filesystem(mut self, allow: bool) -> Self {
        self.options.allow_filesystem = allow;
        self
    }

    /// Set the initial volume tree.
    pub fn mount_filesystem(mut self, tree: serde_json::Value) -> Self {
        self.options.mount_filesystem = Some(tree);
        self
    }

    /// Allow outbound HTTP.
    pub fn allow_network(mut self, allow: bool) -> Self {
        self.options.allow_network = allow;
        self
    }

    /// Add a global value.
    pub fn global(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.globals.insert(name.into(), value);
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(name.into(), value.into());
        self
    }

    /// Set the default execution timeout.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.options.execution_timeout = Some(timeout);
        self
    }

    /// Enable the source transform.
    pub fn transform_source(mut self, enable: bool) -> Self {
        self.options.transform_source = enable;
        self
    }

    /// Use a custom source transform (implies `transform_source`).
    pub fn source_transform(mut self, transform: Arc<dyn SourceTransform>) -> Self {
        self.options.transform_source = true;
        self.options.source_transform = Some(transform);
        self
    }

    /// Preload the `test` module.
    pub fn enable_test_utilities(mut self, enable: bool) -> Self {
        self.options.enable_test_utilities = enable;
        self
    }

    /// Set the maximum heap size in bytes.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.options.max_memory = bytes;
        self
    }

    /// Set the maximum native stack size in bytes.
    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.options.max_stack_size = bytes;
        self
    }

    /// Set the byte budget of a freshly created volume.
    pub fn max_volume_bytes(mut self, bytes: u64) -> Self {
        self.options.max_volume_bytes = bytes;
        self
    }

    /// Set the idle interval of the job pump.
    pub fn job_pump_interval(mut self, interval: Duration) -> Self {
        self.options.job_pump_interval = interval;
        self
    }

    /// Use a custom HTTP transport.
    pub fn network_backend(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.options.network_backend = Some(backend);
        self
    }

    /// Build the RuntimeOptions.
    pub fn build(self) -> RuntimeOptions {
        self.options
    }
}

/// Per-call options for evaluation and validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EvalOptions {
    /// Wall-clock limit for this call, in seconds. The smaller of this and
    /// the runtime's timeout applies.
    #[serde(deserialize_with = "deserialize_seconds")]
    pub execution_timeout: Option<Duration>,
}

impl EvalOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            execution_timeout: Some(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_options() {
        let options = RuntimeOptions::default();
        assert!(!options.allow_filesystem);
        assert!(!options.allow_network);
        assert_eq!(options.max_memory, 64 * 1024 * 1024);
        assert_eq!(options.job_pump_interval, Duration::from_millis(1));
        assert_eq!(options.max_volume_bytes, Volume::DEFAULT_CAPACITY);
        assert_eq!(options.mount_tree(), json!({ "src": {} }));
        assert_eq!(options.transform().id(), "passthrough");
    }

    #[test]
    fn test_builder() {
        let options = RuntimeOptions::builder()
            .allow_filesystem(true)
            .execution_timeout(Duration::from_secs(5))
            .env("MODE", "test")
            .global("answer", json!(42))
            .transform_source(true)
            .build();

        assert!(options.allow_filesystem);
        assert_eq!(options.execution_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(options.globals.get("answer"), Some(&json!(42)));
        assert_eq!(options.transform().id(), "strip-type-imports");
    }

    #[test]
    fn test_from_json() {
        let options = RuntimeOptions::from_json(
            r#"{"allowFs": true, "mountFs": {"src": {"a.js": "x"}}, "executionTimeout": 1.5,
                "enableTestUtils": true, "env": {"A": "1"}}"#,
        )
        .unwrap();
        assert!(options.allow_filesystem);
        assert!(options.enable_test_utilities);
        assert_eq!(options.execution_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.mount_tree(), json!({ "src": { "a.js": "x" } }));
        assert_eq!(options.max_stack_size, 1024 * 1024);

        let options = RuntimeOptions::from_json(r#"{"executionTimeout": 0}"#).unwrap();
        assert_eq!(options.execution_timeout, None);

        assert!(RuntimeOptions::from_json(r#"{"allowFs": "yes"}"#).is_err());
    }

    #[test]
    fn test_unrepresentable_timeout_is_a_config_error() {
        let err = RuntimeOptions::from_json(r#"{"executionTimeout": 1e300}"#).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert!(err.to_string().contains("timeout of"));
    }

    #[test]
    fn test_typescript_switch_is_not_accepted() {
        let options = RuntimeOptions::from_json(r#"{"transformTypescript": true}"#).unwrap();
        assert!(!options.transform_source);
        assert_eq!(options.transform().id(), "passthrough");
    }
}
