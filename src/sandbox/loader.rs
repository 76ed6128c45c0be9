//! ES module resolution and loading against the mounted volume.
//!
//! Specifiers resolve, in order, to a granted built-in (`test`, `fs`,
//! `node:fs`), or to a file in the volume: absolute specifiers are taken as
//! is, `./` and `../` are joined onto the importing module's directory.
//! Extensionless specifiers are tried with [`LOOKUP_SUFFIXES`]. Bare
//! package names are never looked up anywhere else.

use std::collections::HashMap;
use std::sync::Arc;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module};
use tracing::{debug, trace};

use super::cache::SharedEngine;
use super::transform::SourceTransform;
use crate::bridge::{self, HostError};
use crate::vfs::{path, Volume};

/// Default filename for evaluated entry code.
pub const DEFAULT_ENTRY: &str = "/src/index.js";

/// Suffixes tried, in order, when resolving a relative or absolute
/// specifier.
pub const LOOKUP_SUFFIXES: &[&str] = &["", ".js", ".mjs", ".ts", ".mts", "/index.js", "/index.ts"];

type Builtins = Arc<HashMap<String, Arc<str>>>;

/// Resolve `specifier` relative to the module `base`.
///
/// Returns `None` for bare specifiers.
pub fn normalize_specifier(base: &str, specifier: &str) -> Option<String> {
    if specifier.starts_with('/') {
        return Some(path::normalize(specifier));
    }
    let relative = specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../");
    if relative {
        return Some(path::join(&path::dirname(base), specifier));
    }
    None
}

fn module_not_found(ctx: &Ctx<'_>, specifier: &str, base: &str) -> rquickjs::Error {
    let error = HostError::new(
        "ModuleNotFoundError",
        format!("Cannot find module '{specifier}' imported from '{base}'"),
    )
    .with_property("code", "ERR_MODULE_NOT_FOUND")
    .with_property("specifier", specifier);
    bridge::throw(ctx, &error)
}

/// Maps import specifiers to canonical module names.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    volume: Arc<Volume>,
    builtins: Builtins,
}

impl ModuleResolver {
    pub fn new(volume: Arc<Volume>, builtins: Builtins) -> Self {
        Self { volume, builtins }
    }

    /// Resolution without an interpreter: the canonical name, or `None`.
    pub fn lookup(&self, base: &str, specifier: &str) -> Option<String> {
        if self.builtins.contains_key(specifier) {
            return Some(specifier.to_string());
        }
        let candidate = normalize_specifier(base, specifier)?;
        LOOKUP_SUFFIXES.iter().find_map(|suffix| {
            let path = format!("{candidate}{suffix}");
            self.volume
                .is_file(&path)
                .then(|| self.volume.realpath(&path).unwrap_or(path))
        })
    }
}

impl Resolver for ModuleResolver {
    fn resolve<'js>(&mut self, ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        match self.lookup(base, name) {
            Some(resolved) => {
                trace!(base, specifier = name, resolved = %resolved, "resolved module");
                Ok(resolved)
            }
            None => {
                debug!(base, specifier = name, "module not found");
                Err(module_not_found(ctx, name, base))
            }
        }
    }
}

/// Reads resolved modules from built-ins or the volume, applying the
/// runtime's source transform through the engine's cache.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    volume: Arc<Volume>,
    builtins: Builtins,
    transform: Arc<dyn SourceTransform>,
    engine: SharedEngine,
}

impl ModuleLoader {
    pub fn new(
        volume: Arc<Volume>,
        builtins: Builtins,
        transform: Arc<dyn SourceTransform>,
        engine: SharedEngine,
    ) -> Self {
        Self {
            volume,
            builtins,
            transform,
            engine,
        }
    }

    fn source(&self, ctx: &Ctx<'_>, name: &str) -> rquickjs::Result<Arc<str>> {
        if let Some(source) = self.builtins.get(name) {
            return Ok(Arc::clone(source));
        }
        let raw = self
            .volume
            .read_to_string(name)
            .map_err(|_| module_not_found(ctx, name, name))?;
        if !self.transform.handles(name) {
            return Ok(raw.into());
        }
        self.engine
            .transforms()
            .get_or_transform(self.transform.as_ref(), name, &raw)
            .map_err(|e| {
                let error = HostError::new("SyntaxError", e.to_string())
                    .with_property("code", "ERR_SOURCE_TRANSFORM");
                bridge::throw(ctx, &error)
            })
    }
}

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = self.source(ctx, name)?;
        debug!(module = name, bytes = source.len(), "loading module");
        Module::declare(ctx.clone(), name, source.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ModuleResolver {
        let volume = Volume::from_tree(&json!({
            "src": {
                "index.js": "",
                "util.ts": "",
                "lib": { "index.js": "" },
                "data.mjs": ""
            }
        }))
        .unwrap();
        let builtins = HashMap::from([("test".to_string(), Arc::<str>::from(""))]);
        ModuleResolver::new(Arc::new(volume), Arc::new(builtins))
    }

    #[test]
    fn test_normalize_specifier() {
        assert_eq!(
            normalize_specifier("/src/index.js", "./a.js").as_deref(),
            Some("/src/a.js")
        );
        assert_eq!(
            normalize_specifier("/src/lib/x.js", "../a").as_deref(),
            Some("/src/a")
        );
        assert_eq!(
            normalize_specifier("/src/index.js", "/abs//b.js").as_deref(),
            Some("/abs/b.js")
        );
        assert_eq!(normalize_specifier("/src/index.js", "lodash"), None);
    }

    #[test]
    fn test_lookup_tries_extensions() {
        let resolver = resolver();
        assert_eq!(
            resolver.lookup("/src/index.js", "./util").as_deref(),
            Some("/src/util.ts")
        );
        assert_eq!(
            resolver.lookup("/src/index.js", "./lib").as_deref(),
            Some("/src/lib/index.js")
        );
        assert_eq!(
            resolver.lookup("/src/index.js", "./data").as_deref(),
            Some("/src/data.mjs")
        );
        assert_eq!(resolver.lookup("/src/index.js", "test").as_deref(), Some("test"));
        assert_eq!(resolver.lookup("/src/index.js", "./missing"), None);
        assert_eq!(resolver.lookup("/src/index.js", "fs"), None);
    }

    #[test]
    fn test_missing_module_error_shape() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let _ = module_not_found(&ctx, "./nope", "/src/index.js");
            let thrown = ctx.catch();
            let object = thrown.as_object().unwrap();
            let name: String = object.get("name").unwrap();
            let code: String = object.get("code").unwrap();
            assert_eq!(name, "ModuleNotFoundError");
            assert_eq!(code, "ERR_MODULE_NOT_FOUND");
        });
    }
}
