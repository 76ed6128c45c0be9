//! Guest `console`, captured per runtime and mirrored to `tracing`.

use tracing::{debug, error, info, warn};

use super::{Capability, CapabilityProvider, Grants};
use crate::bridge::{HostFunction, HostValue};
use crate::error::Result;
use crate::sandbox::ConsoleOutput;

/// Target for guest log events.
pub const GUEST_LOG_TARGET: &str = "quickjs_sandbox::guest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Log,
    Info,
    Debug,
    Trace,
    Warn,
    Error,
}

const METHODS: &[(&str, Level)] = &[
    ("log", Level::Log),
    ("info", Level::Info),
    ("debug", Level::Debug),
    ("trace", Level::Trace),
    ("warn", Level::Warn),
    ("error", Level::Error),
];

/// Always granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleProvider;

impl CapabilityProvider for ConsoleProvider {
    fn name(&self) -> &'static str {
        "console"
    }

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>> {
        let mut capability = Capability::namespace("console", "console");
        for &(name, level) in METHODS {
            let output = grants.console.clone();
            capability = capability.with_function(
                name,
                HostFunction::sync(move |args| {
                    emit(&output, level, &format_args(args));
                    Ok(HostValue::Undefined)
                }),
            );
        }
        Ok(Some(capability))
    }
}

fn format_args(args: &[HostValue]) -> String {
    args.iter()
        .map(|arg| match arg {
            HostValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit(output: &ConsoleOutput, level: Level, line: &str) {
    match level {
        Level::Log | Level::Info => {
            info!(target: GUEST_LOG_TARGET, "{line}");
            output.stdout.push_line(line);
        }
        Level::Debug | Level::Trace => {
            debug!(target: GUEST_LOG_TARGET, "{line}");
            output.stdout.push_line(line);
        }
        Level::Warn => {
            warn!(target: GUEST_LOG_TARGET, "{line}");
            output.stderr.push_line(line);
        }
        Level::Error => {
            error!(target: GUEST_LOG_TARGET, "{line}");
            output.stderr.push_line(line);
        }
    }
}
