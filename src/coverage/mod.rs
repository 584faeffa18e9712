//! Coverage recording: the method table, the trace data structures and the
//! expected-coverage checker.
//!
//! Everything in this module is passive data mutated by the probe runtime
//! under the profiler's coarse lock; nothing here performs locking of its own
//! except the [`MethodTable`], whose readers are lock-free by design.

mod expected;
mod methods;
mod trace;

pub use expected::{ExpectedCoverage, ExpectedStep, ExpectedVerdict};
pub use methods::{MethodRecord, MethodTable};
pub use trace::{CoverageEvent, CoverageKind, CoverageTrace, TraceLog};
