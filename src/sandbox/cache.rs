//! Process-wide engine state shared by every runtime instance.
//!
//! Interpreter runtimes are cheap but never shared; what is shared is the
//! work that does not depend on a particular runtime: the sources of the
//! built-in modules and the output of source transforms.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use super::config::RuntimeOptions;
use super::executor::RuntimeInstance;
use super::transform::{SourceTransform, TransformError};
use crate::capability::FS_OPERATIONS;
use crate::error::Result;
use crate::vfs::Volume;

const TEST_UTILITIES: &str = include_str!("js/test_utils.js");
const NODE_BUFFER: &str =
    "const { Buffer } = globalThis;\nexport { Buffer };\nexport default { Buffer };\n";

/// Entries kept before the transform cache starts over.
const TRANSFORM_CACHE_CAPACITY: usize = 1024;

type TransformKey = (String, String, String);

/// A thread-safe cache of transformed sources.
///
/// Keyed by transform id, filename and source text, so a hit always
/// reproduces exactly what the transform would return.
#[derive(Debug, Default)]
pub struct TransformCache {
    cache: RwLock<HashMap<TransformKey, Arc<str>>>,
}

impl TransformCache {
    /// Create a new empty transform cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cached transform result or compute it if not present.
    pub fn get_or_transform(
        &self,
        transform: &dyn SourceTransform,
        filename: &str,
        source: &str,
    ) -> std::result::Result<Arc<str>, TransformError> {
        let key = (
            transform.id().to_string(),
            filename.to_string(),
            source.to_string(),
        );

        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(Arc::clone(hit));
        }

        // Transform outside any lock
        let output: Arc<str> = transform.transform_file(filename, source)?.into();

        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing));
        }
        if cache.len() >= TRANSFORM_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(key, Arc::clone(&output));
        Ok(output)
    }

    /// Clear all cached transforms.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Get the number of cached transforms.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sources of the modules resolvable without touching the volume.
#[derive(Debug)]
pub struct BuiltinModules {
    test: Arc<str>,
    fs: Arc<str>,
    buffer: Arc<str>,
}

impl BuiltinModules {
    fn new() -> Self {
        Self {
            test: TEST_UTILITIES.into(),
            fs: node_fs_module().into(),
            buffer: NODE_BUFFER.into(),
        }
    }

    /// The built-ins a runtime with `options` may import.
    pub fn granted(&self, options: &RuntimeOptions) -> HashMap<String, Arc<str>> {
        let mut granted = HashMap::new();
        if options.enable_test_utilities {
            granted.insert("test".to_string(), Arc::clone(&self.test));
        }
        if options.allow_filesystem {
            granted.insert("fs".to_string(), Arc::clone(&self.fs));
            granted.insert("node:fs".to_string(), Arc::clone(&self.fs));
            granted.insert("buffer".to_string(), Arc::clone(&self.buffer));
            granted.insert("node:buffer".to_string(), Arc::clone(&self.buffer));
        }
        granted
    }
}

/// `fs` / `node:fs`: the `__fs` namespace as an ES module.
fn node_fs_module() -> String {
    let mut names: Vec<String> = Vec::with_capacity(FS_OPERATIONS.len() * 2 + 2);
    for name in FS_OPERATIONS {
        names.push((*name).to_string());
        names.push(format!("{name}Sync"));
    }
    names.push("constants".to_string());
    names.push("promises".to_string());
    format!(
        "const fs = globalThis.__fs;\nexport default fs;\nexport const {{ {} }} = fs;\n",
        names.join(", ")
    )
}

/// Shared state behind [`SharedEngine`].
#[derive(Debug)]
pub struct Engine {
    transforms: TransformCache,
    builtins: BuiltinModules,
}

impl Engine {
    fn new() -> Self {
        Self {
            transforms: TransformCache::new(),
            builtins: BuiltinModules::new(),
        }
    }

    pub fn transforms(&self) -> &TransformCache {
        &self.transforms
    }

    pub fn builtins(&self) -> &BuiltinModules {
        &self.builtins
    }
}

/// A handle to the process-wide engine.
#[derive(Clone, Debug)]
pub struct SharedEngine {
    engine: Arc<Engine>,
}

impl SharedEngine {
    /// An engine independent of the global one, mainly for tests.
    pub fn isolated() -> Self {
        Self {
            engine: Arc::new(Engine::new()),
        }
    }

    /// Create a runtime instance; see [`create_runtime`](super::create_runtime).
    pub fn create_runtime(
        &self,
        options: RuntimeOptions,
        volume: Option<Arc<Volume>>,
    ) -> Result<RuntimeInstance> {
        RuntimeInstance::create(self.clone(), options, volume)
    }

    /// Whether two handles share the same engine.
    pub fn ptr_eq(&self, other: &SharedEngine) -> bool {
        Arc::ptr_eq(&self.engine, &other.engine)
    }
}

impl std::ops::Deref for SharedEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// The global engine, initialized on first use.
static GLOBAL_ENGINE: LazyLock<SharedEngine> = LazyLock::new(|| SharedEngine {
    engine: Arc::new(Engine::new()),
});

/// Get the global engine.
pub fn global_engine() -> SharedEngine {
    GLOBAL_ENGINE.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::transform::StripTypeImports;

    #[derive(Debug)]
    struct Counting(std::sync::atomic::AtomicUsize);

    impl SourceTransform for Counting {
        fn id(&self) -> &str {
            "counting"
        }

        fn transform_file(
            &self,
            _filename: &str,
            source: &str,
        ) -> std::result::Result<String, TransformError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(source.to_uppercase())
        }
    }

    #[test]
    fn test_transform_cache_reuses_results() {
        let cache = TransformCache::new();
        let transform = Counting(Default::default());
        let first = cache.get_or_transform(&transform, "/a.js", "x").unwrap();
        let second = cache.get_or_transform(&transform, "/a.js", "x").unwrap();
        assert_eq!(&*first, "X");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transform.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        cache.get_or_transform(&transform, "/a.js", "y").unwrap();
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_transform_errors_are_not_cached() {
        let cache = TransformCache::new();
        assert!(cache
            .get_or_transform(&StripTypeImports, "/bad.ts", "import type {")
            .is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_builtins_follow_options() {
        let engine = SharedEngine::isolated();
        let none = engine.builtins().granted(&RuntimeOptions::default());
        assert!(none.is_empty());

        let options = RuntimeOptions::builder()
            .allow_filesystem(true)
            .enable_test_utilities(true)
            .build();
        let granted = engine.builtins().granted(&options);
        assert!(granted.contains_key("test"));
        assert!(granted["node:fs"].contains("readFileSync"));
        assert!(Arc::ptr_eq(&granted["fs"], &granted["node:fs"]));
        assert!(granted["node:buffer"].contains("export { Buffer }"));
    }

    #[test]
    fn test_global_engine_is_shared() {
        assert!(global_engine().ptr_eq(&global_engine()));
        assert!(!global_engine().ptr_eq(&SharedEngine::isolated()));
    }
}
