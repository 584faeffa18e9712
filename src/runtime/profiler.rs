//! The profiler runtime: process-wide state with an explicit lifecycle.
//!
//! One [`Profiler`] value owns everything the probes mutate: the method
//! table, the trace log, the thread tracker and the shadow stacks. A single
//! coarse mutex guards trace mutation, shadow-stack mutation and slot
//! creation; the enable gates are atomics readable without the lock. Probe
//! entry points reach the value through a process-global slot installed once
//! at library attach; probes arriving before install are ignored.

use std::{
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, RwLock,
    },
};

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use crate::{
    config::{EntryMain, ProfilerConfig},
    coverage::{
        CoverageKind, CoverageTrace, ExpectedCoverage, ExpectedStep, ExpectedVerdict, MethodTable,
        TraceLog,
    },
    rewrite::{FunctionId, Instrumenter, ModuleId, ProfilingHost},
    runtime::{
        frames::{EnterOutcome, FrameStack},
        near_stack_overflow,
        probes::ProbeTable,
        tracker::ThreadTracker,
        ThreadId,
    },
    Result, Token,
};

/// Sentinel for "no function id recorded".
const INCORRECT_FUNCTION_ID: usize = usize::MAX;

/// State mutated by probes, guarded by the coarse profiler mutex.
#[derive(Debug, Default)]
struct RuntimeState {
    log: TraceLog,
    stacks: FxHashMap<ThreadId, FrameStack>,
    expected: Option<ExpectedCoverage>,
    main_thread: Option<ThreadId>,
}

/// The profiler runtime.
pub struct Profiler {
    config: RwLock<ProfilerConfig>,
    host: Arc<dyn ProfilingHost>,
    instrumenter: Instrumenter,
    tracker: ThreadTracker,
    methods: MethodTable,
    state: Mutex<RuntimeState>,
    call_targets: DashMap<(u32, u32), (ModuleId, Token)>,
    probes_enabled: AtomicBool,
    instrumentation_enabled: AtomicBool,
    main_entered: AtomicBool,
    main_left: AtomicBool,
    main_function: AtomicUsize,
    stack_bottom: AtomicUsize,
}

static PROFILER: OnceLock<Profiler> = OnceLock::new();

/// The installed profiler, if any.
pub fn profiler() -> Option<&'static Profiler> {
    PROFILER.get()
}

impl Profiler {
    /// Creates a profiler around a host connection.
    ///
    /// The value is fully functional on its own (tests drive it directly);
    /// [`Profiler::install`] additionally publishes it to the probe shims.
    #[must_use]
    pub fn new(host: Arc<dyn ProfilingHost>, config: ProfilerConfig) -> Self {
        let instrumenter = Instrumenter::new(Arc::clone(&host), ProbeTable::collect());
        Profiler {
            config: RwLock::new(config),
            host,
            instrumenter,
            tracker: ThreadTracker::new(),
            methods: MethodTable::new(),
            state: Mutex::new(RuntimeState::default()),
            call_targets: DashMap::new(),
            probes_enabled: AtomicBool::new(false),
            instrumentation_enabled: AtomicBool::new(true),
            main_entered: AtomicBool::new(false),
            main_left: AtomicBool::new(false),
            main_function: AtomicUsize::new(INCORRECT_FUNCTION_ID),
            stack_bottom: AtomicUsize::new(0),
        }
    }

    /// Installs a profiler into the process-global slot the probes read.
    ///
    /// Idempotent: a second install is warned about and the existing instance
    /// is returned.
    pub fn install(host: Arc<dyn ProfilingHost>, config: ProfilerConfig) -> &'static Profiler {
        let profiler = Profiler::new(host, config);
        profiler.anchor_stack_bottom();
        if PROFILER.set(profiler).is_err() {
            log::warn!("profiler is already installed");
        }
        PROFILER.get().expect("profiler slot was just populated")
    }

    /// Disables all gates and marks the run finished. Accumulated history
    /// stays drainable; probes arriving afterwards are no-ops.
    pub fn shutdown(&self) {
        log::debug!("profiler shutdown");
        self.probes_enabled.store(false, Ordering::SeqCst);
        self.instrumentation_enabled.store(false, Ordering::SeqCst);
    }

    // ------------------------------ gates and configuration

    /// True while probes record coverage.
    pub fn probes_enabled(&self) -> bool {
        self.probes_enabled.load(Ordering::SeqCst)
    }

    /// True while JIT events lead to instrumentation.
    pub fn instrumentation_enabled(&self) -> bool {
        self.instrumentation_enabled.load(Ordering::SeqCst)
    }

    /// Re-enables instrumentation of newly JIT-compiled methods.
    pub fn enable_instrumentation(&self) {
        if self.instrumentation_enabled.swap(true, Ordering::SeqCst) {
            log::warn!("enable_instrumentation: instrumentation already enabled");
        }
    }

    /// Stops instrumenting newly JIT-compiled methods. Already instrumented
    /// bodies keep their probes.
    pub fn disable_instrumentation(&self) {
        if !self.instrumentation_enabled.swap(false, Ordering::SeqCst) {
            log::warn!("disable_instrumentation: instrumentation already disabled");
        }
    }

    /// True once `EnterMain` has fired.
    pub fn main_entered(&self) -> bool {
        self.main_entered.load(Ordering::SeqCst)
    }

    /// True once `LeaveMain` has fired.
    pub fn main_left(&self) -> bool {
        self.main_left.load(Ordering::SeqCst)
    }

    /// Delivers the entry-method identity. Expected exactly once, before any
    /// probe fires.
    pub fn set_entry_main(&self, main: EntryMain) {
        log::debug!(
            "received entry main: {} {}",
            main.module_name.to_string_lossy(),
            main.token
        );
        let mut config = write_lock!(self.config);
        if config.entry_main.is_some() {
            log::warn!("entry main configured twice; replacing");
        }
        config.entry_main = Some(main);
    }

    /// Records the host-level function id of the entry method.
    pub fn set_main_function(&self, function: FunctionId) {
        debug_assert_ne!(function, INCORRECT_FUNCTION_ID);
        self.main_function.store(function, Ordering::SeqCst);
    }

    /// True if `function` is the recorded entry method.
    pub fn is_main_function(&self, function: FunctionId) -> bool {
        self.main_function.load(Ordering::SeqCst) == function
    }

    /// Installs the expected-coverage list. Every later event is checked
    /// against it until it is exhausted; a mismatch is a fatal path
    /// divergence.
    pub fn set_expected_coverage(&self, steps: Vec<ExpectedStep>) {
        lock!(self.state).expected = Some(ExpectedCoverage::new(steps));
    }

    /// Records the statically resolved callee of a call site.
    ///
    /// The probe a call site fires carries only its offset, so the rewriter
    /// reports resolved targets here while instrumenting. `Call` probes mark
    /// the pending frame they push with this expectation, which is what a
    /// later `Enter` reconciles against; call sites the rewriter could not
    /// resolve simply stay unregistered.
    pub fn register_call_target(
        &self,
        caller: u32,
        offset: u32,
        callee_module: ModuleId,
        callee_token: Token,
    ) {
        self.call_targets
            .insert((caller, offset), (callee_module, callee_token));
    }

    /// The method table of this process run.
    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// The thread tracker.
    pub fn tracker(&self) -> &ThreadTracker {
        &self.tracker
    }

    /// The instrumentation gate.
    pub fn instrumenter(&self) -> &Instrumenter {
        &self.instrumenter
    }

    /// The probe address table, stable for the profiler's lifetime.
    pub fn probe_table(&self) -> &ProbeTable {
        self.instrumenter.probes()
    }

    // ------------------------------ host event routing

    /// Routes a JIT-compilation notification into the rewrite gate.
    ///
    /// # Errors
    /// Host and rewriter failures propagate; per the error policy the export
    /// layer treats them as fatal for the run.
    pub fn on_jit_compilation_started(&self, function: FunctionId) -> Result<()> {
        if !self.instrumentation_enabled() {
            return Ok(());
        }
        let config = read_lock!(self.config).clone();
        if let Some(outcome) = self.instrumenter.instrument(function, &self.methods, &config)? {
            if outcome.is_main {
                self.set_main_function(function);
            }
        }
        Ok(())
    }

    /// A thread ended; its tracker slot and shadow stack go with it.
    pub fn on_thread_destroyed(&self, thread: ThreadId) {
        let mut state = lock!(self.state);
        if self.tracker.is_tracked(thread) {
            self.tracker.lose_current(thread);
        }
        state.stacks.remove(&thread);
    }

    /// An exception began unwinding `function` on the current thread.
    pub fn on_exception_unwind_function_enter(&self, function: FunctionId) {
        let thread = self.host.current_thread();
        if self.tracker.unwind_enter(thread, function).is_err() {
            fatal!("exception unwind on untracked thread {thread}");
        }
    }

    /// The unwind of the innermost function completed.
    pub fn on_exception_unwind_function_leave(&self) {
        let thread = self.host.current_thread();
        let main_only = read_lock!(self.config).main_only;
        let result = self
            .tracker
            .unwind_leave(thread, |function| main_only && !self.is_main_function(function));
        if result.is_err() {
            fatal!("exception unwind leave on untracked thread {thread}");
        }
    }

    // ------------------------------ probe semantics

    /// `EnterMain`: enable probes, reset per-thread state, open a trace.
    pub fn on_enter_main(&self, offset: u32, method_id: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        if self.probes_enabled.swap(true, Ordering::SeqCst) {
            log::warn!("EnterMain while probes are already enabled");
        }
        self.tracker.clear();
        state.stacks.clear();
        self.tracker.track_current(thread);
        if self.tracker.push(thread).is_err() {
            fatal!("EnterMain failed to track thread {thread}");
        }
        let stack = state.stacks.entry(thread).or_default();
        stack.push_entered(method_id);
        state.main_thread = Some(thread);
        self.main_entered.store(true, Ordering::SeqCst);
        state.log.open_trace(offset, method_id, thread);
    }

    /// `Enter`: reconcile the shadow stack, raise the balance, record.
    pub fn on_enter(&self, offset: u32, method_id: u32, is_spontaneous: bool) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        if !self.tracker.is_tracked(thread) {
            self.tracker.track_current(thread);
        }
        let stack = state.stacks.entry(thread).or_default();
        let outcome = stack.enter(method_id, is_spontaneous);
        if outcome != EnterOutcome::Resolved && self.tracker.push(thread).is_err() {
            fatal!("Enter failed to raise balance on thread {thread}");
        }
        self.record(&mut state, thread, offset, CoverageKind::Enter, Some(method_id));
    }

    /// `Leave`: record, pop the shadow frame, lower the balance.
    pub fn on_leave(&self, offset: u32, method_id: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        self.record(&mut state, thread, offset, CoverageKind::Leave, Some(method_id));
        if let Some(stack) = state.stacks.get_mut(&thread) {
            stack.leave();
        }
        match self.tracker.pop(thread) {
            Ok(true) => {}
            Ok(false) => self.tracker.lose_current(thread),
            Err(_) => fatal!("Leave on untracked thread {thread}"),
        }
    }

    /// `LeaveMain`: disable probes, record, close the trace, verify balance.
    pub fn on_leave_main(&self, offset: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        self.probes_enabled.store(false, Ordering::SeqCst);
        state.main_thread = None;
        self.record(&mut state, thread, offset, CoverageKind::LeaveMain, None);
        if !state.log.close_current() {
            fatal!("LeaveMain with no open trace");
        }
        self.main_left.store(true, Ordering::SeqCst);
        if let Some(stack) = state.stacks.get_mut(&thread) {
            stack.leave();
        }
        match self.tracker.pop(thread) {
            Ok(false) => self.tracker.lose_current(thread),
            Ok(true) => fatal!("main left but stack is non-empty on thread {thread}"),
            Err(_) => fatal!("LeaveMain on untracked thread {thread}"),
        }
    }

    /// `BranchHit`: record only.
    pub fn on_branch(&self, offset: u32, method_id: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        self.record(&mut state, thread, offset, CoverageKind::BranchHit, Some(method_id));
    }

    /// `Call`: record, then push a pending frame for the callee.
    ///
    /// The event is recorded while the calling method still owns the stack
    /// top, so the expected-coverage check sees the caller, not the frame
    /// being pushed.
    pub fn on_call(&self, offset: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        if !self.tracker.is_tracked(thread) {
            self.tracker.track_current(thread);
        }
        self.record(&mut state, thread, offset, CoverageKind::Call, None);
        let caller = state
            .stacks
            .get(&thread)
            .and_then(FrameStack::top)
            .and_then(|frame| frame.method);
        let expected = caller.and_then(|caller| {
            self.call_targets
                .get(&(caller, offset))
                .map(|entry| *entry)
                .and_then(|(module, token)| self.methods.lookup(token, module))
        });
        state.stacks.entry(thread).or_default().push_pending(expected);
        if self.tracker.push(thread).is_err() {
            fatal!("Call failed to raise balance on thread {thread}");
        }
    }

    /// `Tailcall`: the frame is consumed before the target is entered.
    ///
    /// The expected-coverage check runs against the tail-calling frame before
    /// it is popped; the event itself is appended after the balance drops.
    pub fn on_tailcall(&self, offset: u32) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        self.check_expected(&mut state, thread, offset, None);
        if self.tracker.depth(thread).unwrap_or(0) > 1 {
            if let Some(stack) = state.stacks.get_mut(&thread) {
                stack.leave();
            }
            match self.tracker.pop(thread) {
                Ok(_) => {}
                Err(_) => fatal!("Tailcall on untracked thread {thread}"),
            }
        } else {
            log::warn!("tailcall at the entry frame; balance preserved");
        }
        self.append(&mut state, thread, offset, CoverageKind::Tailcall, None);
    }

    /// `FinalizeCall`: pop the frame of an extern callee whose `Enter` never
    /// fired. No event is recorded.
    pub fn on_finalize_call(&self) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        let popped = state
            .stacks
            .get_mut(&thread)
            .is_some_and(FrameStack::finalize_call);
        if popped {
            log::trace!("extern callee left on thread {thread}");
            match self.tracker.pop(thread) {
                Ok(true) => {}
                Ok(false) => self.tracker.lose_current(thread),
                Err(_) => fatal!("FinalizeCall on untracked thread {thread}"),
            }
        }
    }

    /// Path-validation point without an event payload.
    pub fn on_coverage_point(&self) {
        let thread = self.host.current_thread();
        let mut state = lock!(self.state);
        self.check_expected(&mut state, thread, 0, None);
    }

    /// Appends one event to the open trace, running the expected-coverage
    /// check first. No open trace is fatal; so is divergence.
    fn record(
        &self,
        state: &mut RuntimeState,
        thread: ThreadId,
        offset: u32,
        kind: CoverageKind,
        method: Option<u32>,
    ) {
        self.check_expected(state, thread, offset, method);
        self.append(state, thread, offset, kind, method);
    }

    /// Appends without checking. `Tailcall` checks against the frame it is
    /// about to consume and appends only after the pop.
    fn append(
        &self,
        state: &mut RuntimeState,
        thread: ThreadId,
        offset: u32,
        kind: CoverageKind,
        method: Option<u32>,
    ) {
        let Some(trace) = state.log.current_mut() else {
            fatal!("adding coverage with no open trace");
        };
        trace.add(offset, kind, method, thread);
    }

    fn check_expected(
        &self,
        state: &mut RuntimeState,
        thread: ThreadId,
        offset: u32,
        method: Option<u32>,
    ) {
        let Some(expected) = state.expected.as_mut() else {
            return;
        };
        if expected.is_expired() {
            return;
        }
        let frame_method = state
            .stacks
            .get(&thread)
            .and_then(FrameStack::top)
            .and_then(|frame| frame.method);
        let method = method.or(frame_method).unwrap_or(u32::MAX);
        let label = self.tracker.current_mapped_id(thread).unwrap_or(0);
        if expected.check(method, offset, label) == ExpectedVerdict::Diverged {
            fatal!("Path divergence");
        }
    }

    // ------------------------------ consumer surface

    /// Takes everything recorded so far as one serialized history buffer.
    ///
    /// The swap happens under the coarse lock, so the drain observes a
    /// quiescent snapshot; in-flight probes complete first.
    pub fn drain_history(&self) -> Vec<u8> {
        let traces: Vec<CoverageTrace> = lock!(self.state).log.drain();
        match crate::wire::serialize_history(&traces, &self.methods) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("history serialization failed: {e}");
                crate::wire::empty_history()
            }
        }
    }

    /// Attaches the consumer's label to the calling thread.
    pub fn map_current_thread(&self, id: i32) {
        let thread = self.host.current_thread();
        self.tracker.map_current(thread, id);
    }

    /// Drains the `(os thread, label)` table for wire export.
    pub fn snapshot_thread_mapping(&self) -> Vec<(ThreadId, i32)> {
        self.tracker.snapshot_mapping()
    }

    /// True when the calling thread is close to exhausting its stack.
    pub fn near_stack_overflow(&self) -> bool {
        let config = read_lock!(self.config);
        near_stack_overflow(
            self.stack_bottom.load(Ordering::Relaxed),
            config.stack_limit_bytes,
            config.stack_margin,
        )
    }

    /// Anchors the stack-bottom marker at the current stack position.
    pub fn anchor_stack_bottom(&self) {
        let marker = 0u8;
        self.stack_bottom
            .store(std::ptr::addr_of!(marker) as usize, Ordering::Relaxed);
    }

    /// Writes the uncatchable-exception sidecar for the calling thread.
    ///
    /// # Errors
    /// Propagates I/O failures from creating or writing the file.
    pub fn dump_uncatchable_exception(&self, exception_name: &str) -> Result<()> {
        let thread = self.host.current_thread();
        let mapped = self.tracker.current_mapped_id(thread).unwrap_or(0);
        write_exception_info(Path::new("exception.info"), mapped, exception_name)
    }
}

/// Writes `"<mapped_thread_id> <exception_name>"` to `path`.
pub(crate) fn write_exception_info(path: &Path, mapped_id: i32, exception_name: &str) -> Result<()> {
    let mut file = std::fs::File::create(path)?;
    write!(file, "{mapped_id} {exception_name}")?;
    Ok(())
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("probes_enabled", &self.probes_enabled())
            .field("instrumentation_enabled", &self.instrumentation_enabled())
            .field("main_entered", &self.main_entered())
            .field("main_left", &self.main_left())
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_sidecar_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exception.info");
        write_exception_info(&path, 3, "System.StackOverflowException").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "3 System.StackOverflowException");
    }
}
