//! # dotprobe Prelude
//!
//! Convenient re-exports of the most commonly used types for embedding or
//! testing the profiler: the profiler value and its host seams, the coverage
//! data model, and error handling.
//!
//! ```rust
//! use dotprobe::prelude::*;
//!
//! let table = MethodTable::new();
//! assert!(table.is_empty());
//! ```

/// The main error type for all dotprobe operations
pub use crate::Error;

/// The result type used throughout dotprobe
pub use crate::Result;

/// Metadata token type
pub use crate::Token;

/// Profiler configuration and entry-method identity
pub use crate::config::{EntryMain, ProfilerConfig};

/// The profiler runtime and its global accessor
pub use crate::runtime::{profiler, Profiler};

/// Thread tracking types
pub use crate::runtime::{ThreadId, ThreadLocalTable, ThreadTracker};

/// Coverage data model
pub use crate::coverage::{
    CoverageEvent, CoverageKind, CoverageTrace, ExpectedStep, MethodRecord, MethodTable, TraceLog,
};

/// Host and rewriter seams
pub use crate::rewrite::{
    FunctionId, FunctionInfo, ModuleId, ModuleInfo, ProfilingHost, RewriteRequest, Rewriter,
};

/// The probe address table
pub use crate::runtime::{ProbeTable, PROBE_COUNT};

/// Wire helpers a consumer-side test bench needs
pub use crate::wire::{deserialize_history, DecodedEvent, DecodedTrace};
