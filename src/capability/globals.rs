use super::{Capability, CapabilityProvider, Grants};
use crate::bridge::HostValue;
use crate::error::Result;

/// Copies the configured `globals` onto `globalThis` as plain data.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalsProvider;

impl CapabilityProvider for GlobalsProvider {
    fn name(&self) -> &'static str {
        "globals"
    }

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>> {
        if grants.options.globals.is_empty() {
            return Ok(None);
        }
        let capability = grants
            .options
            .globals
            .iter()
            .fold(Capability::global("globals"), |capability, (name, value)| {
                capability.with_global(name.clone(), HostValue::from(value.clone()))
            });
        Ok(Some(capability))
    }
}
