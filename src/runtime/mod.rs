//! The probe runtime: thread tracking, shadow frames, probe entry points and
//! the profiler value that ties them together.

mod frames;
mod probes;
mod profiler;
mod tls;
mod tracker;

pub use frames::{EnterOutcome, Frame, FrameStack};
pub use probes::{ProbeTable, PROBE_COUNT};
pub use profiler::{profiler, Profiler};
pub use tls::{ThreadId, ThreadLocalTable};
pub use tracker::{near_stack_overflow, ThreadTracker};
