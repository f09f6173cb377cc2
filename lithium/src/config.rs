//! Code generation policy.
//!
//! A [CodegenConfig] is built once, before code generation starts, and is then only read. Nothing
//! in the backend consults process-wide flags while generating code.

use std::{env, error::Error};

/// Policy knobs for one code generation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct CodegenConfig {
    /// Emit extra runtime checks (e.g. zap freshly reserved stack slots).
    pub debug_code: bool,
    /// Call the runtime's trace hooks on function entry and exit.
    pub trace: bool,
    /// If non-zero, every deoptimisation guard decrements a shared counter and deoptimises
    /// unconditionally when it reaches zero, after which the counter is reset to this value.
    pub deopt_every_n_times: u32,
    /// Emit a breakpoint before jumping to a deoptimisation entry.
    pub trap_on_deopt: bool,
    /// Use inline bump-pointer allocation fast paths.
    pub inline_new: bool,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            debug_code: false,
            trace: false,
            deopt_every_n_times: 0,
            trap_on_deopt: false,
            inline_new: true,
        }
    }
}

impl CodegenConfig {
    /// Build a config from the `LITHIUM_*` environment variables. Unset variables take their
    /// [Default] values.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, Box<dyn Error>> {
        let mut c = Self::default();
        if let Some(x) = lookup("LITHIUM_DEBUG_CODE") {
            c.debug_code = parse_bool("LITHIUM_DEBUG_CODE", &x)?;
        }
        if let Some(x) = lookup("LITHIUM_TRACE") {
            c.trace = parse_bool("LITHIUM_TRACE", &x)?;
        }
        if let Some(x) = lookup("LITHIUM_DEOPT_EVERY_N") {
            c.deopt_every_n_times = x
                .parse::<u32>()
                .map_err(|e| format!("Invalid LITHIUM_DEOPT_EVERY_N value '{x}': {e}"))?;
        }
        if let Some(x) = lookup("LITHIUM_TRAP_ON_DEOPT") {
            c.trap_on_deopt = parse_bool("LITHIUM_TRAP_ON_DEOPT", &x)?;
        }
        if let Some(x) = lookup("LITHIUM_INLINE_NEW") {
            c.inline_new = parse_bool("LITHIUM_INLINE_NEW", &x)?;
        }
        Ok(c)
    }
}

fn parse_bool(var: &str, s: &str) -> Result<bool, Box<dyn Error>> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(format!("{var} must be one of 0, 1, true, false (got '{s}')").into()),
    }
}
