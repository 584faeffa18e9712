//! Runtime configuration for the profiler.
//!
//! The profiler has no CLI; everything it needs arrives either at install time
//! or through the configuration entry points of the export layer
//! (`SetEntryMain`, `SetExpectedCoverage`). This module holds the plain-data
//! configuration those paths populate.

use widestring::{U16Str, U16String};

use crate::Token;

/// Identity of the configured entry method ("main").
///
/// Delivered exactly once via `SetEntryMain` before any JIT event. The rewrite
/// gate compares every JIT-compiled method against this identity to decide
/// whether the method receives the `EnterMain`/`LeaveMain` probe pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMain {
    /// Simple name of the assembly containing the entry method (UTF-16)
    pub assembly_name: U16String,
    /// Name of the module containing the entry method (UTF-16)
    pub module_name: U16String,
    /// `MethodDef` token of the entry method within that module
    pub token: Token,
}

impl EntryMain {
    /// True if `(module_name, token)` identifies this entry method.
    ///
    /// Assembly name is deliberately not part of the comparison: a module name
    /// is unique within a process and the original host passes module-qualified
    /// identities only.
    #[must_use]
    pub fn matches(&self, module_name: &U16Str, token: Token) -> bool {
        self.token == token && self.module_name.as_ustr() == module_name
    }
}

/// Profiler configuration.
///
/// All fields are plain data with sensible defaults; construct with
/// [`ProfilerConfig::default`] and override what the deployment needs.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// Entry-method identity, if already known at install time.
    /// Usually `None` here and delivered later through `SetEntryMain`.
    pub entry_main: Option<EntryMain>,

    /// Instrument only the entry method; all other methods are recorded as
    /// skipped and re-JITted once the entry method has been compiled.
    pub main_only: bool,

    /// Assumed size of a thread stack in bytes (default: 8 MiB).
    pub stack_limit_bytes: usize,

    /// Fraction of `stack_limit_bytes` that may be consumed before
    /// [`near_stack_overflow`](crate::runtime::near_stack_overflow) reports
    /// danger (default: 0.8).
    pub stack_margin: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            entry_main: None,
            main_only: false,
            stack_limit_bytes: 8 * 1024 * 1024,
            stack_margin: 0.8,
        }
    }
}

impl ProfilerConfig {
    /// Configuration with an entry-method identity already resolved.
    #[must_use]
    pub fn with_entry_main(assembly_name: U16String, module_name: U16String, token: Token) -> Self {
        Self {
            entry_main: Some(EntryMain {
                assembly_name,
                module_name,
                token,
            }),
            ..Self::default()
        }
    }

    /// Enable or disable the main-only instrumentation policy.
    #[must_use]
    pub fn main_only(mut self, enabled: bool) -> Self {
        self.main_only = enabled;
        self
    }

    /// Override the assumed thread stack size.
    #[must_use]
    pub fn stack_limit(mut self, bytes: usize) -> Self {
        self.stack_limit_bytes = bytes;
        self
    }

    /// Override the stack-consumption margin factor.
    #[must_use]
    pub fn stack_margin(mut self, factor: f64) -> Self {
        self.stack_margin = factor;
        self
    }
}
