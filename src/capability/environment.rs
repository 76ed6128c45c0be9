use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Args, Capability, CapabilityProvider, Grants};
use crate::bridge::{HostFunction, HostValue};
use crate::error::Result;

/// Read-only `__env` lookups over the configured variables.
///
/// Only granted when at least one variable is configured. Values are dropped
/// when the runtime is disposed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentProvider;

impl CapabilityProvider for EnvironmentProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>> {
        if grants.options.env.is_empty() {
            return Ok(None);
        }
        let vars = Arc::new(RwLock::new(Some(grants.options.env.clone())));
        Ok(Some(environment_capability(vars)))
    }
}

type Vars = Arc<RwLock<Option<BTreeMap<String, String>>>>;

fn environment_capability(vars: Vars) -> Capability {
    let get_vars = vars.clone();
    let has_vars = vars.clone();
    let key_vars = vars.clone();
    Capability::namespace("environment", "__env")
        .with_function(
            "get",
            HostFunction::sync(move |args| {
                let name = Args(args).string(0, "name")?;
                Ok(get_vars
                    .read()
                    .as_ref()
                    .and_then(|vars| vars.get(&name).cloned())
                    .map(HostValue::String)
                    .unwrap_or_default())
            }),
        )
        .with_function(
            "has",
            HostFunction::sync(move |args| {
                let name = Args(args).string(0, "name")?;
                Ok(HostValue::Bool(
                    has_vars.read().as_ref().is_some_and(|vars| vars.contains_key(&name)),
                ))
            }),
        )
        .with_function(
            "keys",
            HostFunction::sync(move |_| {
                let keys = key_vars
                    .read()
                    .as_ref()
                    .map(|vars| vars.keys().cloned().map(HostValue::String).collect())
                    .unwrap_or_default();
                Ok(HostValue::Array(keys))
            }),
        )
        .on_dispose(move || {
            vars.write().take();
            Ok(())
        })
}
