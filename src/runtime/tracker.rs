//! Per-thread stack-depth accounting and exception-unwind bookkeeping.
//!
//! [`ThreadTracker`] owns three per-thread tables: the stack balance (nesting
//! depth maintained by the enter/leave probes), the function currently being
//! unwound by an exception, and the external thread label chosen by the
//! consumer. A thread becomes tracked on its first probe hit and is lost again
//! once its balance returns to zero with the entry frame popped.

use crate::{
    rewrite::FunctionId,
    runtime::tls::{ThreadId, ThreadLocalTable},
    Error, Result,
};

/// Tracks stack balance, unwind state and external labels per thread.
#[derive(Debug, Default)]
pub struct ThreadTracker {
    balances: ThreadLocalTable<i32>,
    unwind_functions: ThreadLocalTable<FunctionId>,
    mapping: ThreadLocalTable<i32>,
}

impl ThreadTracker {
    /// Creates a tracker with no known threads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a tracking slot for `thread` with a zero stack balance.
    pub fn track_current(&self, thread: ThreadId) {
        log::trace!("<<thread {thread} tracked>>");
        self.balances.track(thread, 0);
    }

    /// True if `thread` has a tracking slot.
    pub fn is_tracked(&self, thread: ThreadId) -> bool {
        self.balances.exists(thread)
    }

    /// Current stack balance of `thread`, if tracked.
    pub fn depth(&self, thread: ThreadId) -> Option<i32> {
        self.balances.load(thread)
    }

    /// Raises the stack balance of `thread`, returning the new depth.
    ///
    /// # Errors
    /// [`Error::UntrackedThread`] if `thread` has no slot.
    pub fn push(&self, thread: ThreadId) -> Result<i32> {
        self.balances
            .update(thread, |depth| depth + 1)
            .ok_or(Error::UntrackedThread)
    }

    /// Lowers the stack balance of `thread`.
    ///
    /// Returns `true` while frames remain. A `false` result means the entry
    /// frame has been popped and the caller must [`lose_current`](Self::lose_current).
    ///
    /// # Errors
    /// [`Error::UntrackedThread`] if `thread` has no slot.
    pub fn pop(&self, thread: ThreadId) -> Result<bool> {
        let depth = self
            .balances
            .update(thread, |depth| depth - 1)
            .ok_or(Error::UntrackedThread)?;
        Ok(depth != 0)
    }

    /// Removes the tracking slot of `thread`.
    pub fn lose_current(&self, thread: ThreadId) {
        log::trace!("<<thread {thread} lost>>");
        self.balances.remove(thread);
        self.unwind_functions.remove(thread);
    }

    /// Records the function an exception is currently unwinding on `thread`.
    ///
    /// # Errors
    /// [`Error::UntrackedThread`] if `thread` has no slot. Unlike ordinary
    /// probes, unwind events never create trackers lazily: an unwind through
    /// an unknown thread means the runtime lost a frame somewhere.
    pub fn unwind_enter(&self, thread: ThreadId, function: FunctionId) -> Result<()> {
        if !self.is_tracked(thread) {
            return Err(Error::UntrackedThread);
        }
        self.unwind_functions.store(thread, function);
        Ok(())
    }

    /// Completes the unwind of the function recorded by [`unwind_enter`](Self::unwind_enter).
    ///
    /// `skip_pop` receives the unwound function and decides whether the
    /// configured policy exempts it from balance accounting (main-only runs
    /// ignore unwinds through non-main functions). Otherwise the balance is
    /// popped, and the tracker slot is dropped when the entry frame went with it.
    ///
    /// # Errors
    /// [`Error::UntrackedThread`] if `thread` has no slot.
    pub fn unwind_leave(
        &self,
        thread: ThreadId,
        skip_pop: impl FnOnce(FunctionId) -> bool,
    ) -> Result<()> {
        if !self.is_tracked(thread) {
            return Err(Error::UntrackedThread);
        }
        let Some(function) = self.unwind_functions.remove(thread) else {
            return Ok(());
        };
        if skip_pop(function) {
            return Ok(());
        }
        if !self.pop(thread)? {
            // entry frame unwound; the thread is done
            self.lose_current(thread);
        }
        Ok(())
    }

    /// Attaches the consumer-chosen label to `thread`.
    pub fn map_current(&self, thread: ThreadId, id: i32) {
        self.mapping.store(thread, id);
    }

    /// The consumer-chosen label of `thread`, if any.
    pub fn current_mapped_id(&self, thread: ThreadId) -> Option<i32> {
        self.mapping.load(thread)
    }

    /// Drains the label table for wire export.
    pub fn snapshot_mapping(&self) -> Vec<(ThreadId, i32)> {
        let pairs = self.mapping.snapshot();
        self.mapping.clear();
        pairs
    }

    /// Drops all balance and unwind slots. Labels survive; they were chosen by
    /// the consumer before the run started and are drained separately.
    pub fn clear(&self) {
        self.balances.clear();
        self.unwind_functions.clear();
    }
}

/// Heuristic check for imminent stack exhaustion.
///
/// Compares the address of a local against the `stack_bottom` anchor captured
/// at install time; once the distance exceeds `limit_bytes * margin`, callers
/// should suppress further instrumentation on this thread rather than risk
/// overflowing inside a probe.
#[inline(never)]
#[must_use]
pub fn near_stack_overflow(stack_bottom: usize, limit_bytes: usize, margin: f64) -> bool {
    let marker = 0u8;
    let top = std::ptr::addr_of!(marker) as usize;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let allowed = (limit_bytes as f64 * margin) as usize;
    stack_bottom.saturating_sub(top) > allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_balance() {
        let tracker = ThreadTracker::new();
        tracker.track_current(1);
        assert_eq!(tracker.push(1).unwrap(), 1);
        assert_eq!(tracker.push(1).unwrap(), 2);
        assert!(tracker.pop(1).unwrap());
        assert!(!tracker.pop(1).unwrap());
        assert_eq!(tracker.depth(1), Some(0));
    }

    #[test]
    fn untracked_thread_is_an_error() {
        let tracker = ThreadTracker::new();
        assert!(matches!(tracker.push(9), Err(Error::UntrackedThread)));
        assert!(matches!(tracker.pop(9), Err(Error::UntrackedThread)));
        assert!(matches!(
            tracker.unwind_enter(9, 4),
            Err(Error::UntrackedThread)
        ));
    }

    #[test]
    fn lose_current_drops_slot() {
        let tracker = ThreadTracker::new();
        tracker.track_current(3);
        tracker.push(3).unwrap();
        tracker.lose_current(3);
        assert!(!tracker.is_tracked(3));
    }

    #[test]
    fn unwind_leave_pops_and_loses_on_entry_frame() {
        let tracker = ThreadTracker::new();
        tracker.track_current(5);
        tracker.push(5).unwrap();
        tracker.unwind_enter(5, 77).unwrap();
        tracker.unwind_leave(5, |_| false).unwrap();
        // balance hit zero, slot dropped
        assert!(!tracker.is_tracked(5));
    }

    #[test]
    fn unwind_leave_respects_skip_policy() {
        let tracker = ThreadTracker::new();
        tracker.track_current(5);
        tracker.push(5).unwrap();
        tracker.unwind_enter(5, 77).unwrap();
        tracker.unwind_leave(5, |function| function != 123).unwrap();
        // pop was skipped; thread still tracked at depth 1
        assert_eq!(tracker.depth(5), Some(1));
    }

    #[test]
    fn unwind_leave_without_enter_is_a_no_op() {
        let tracker = ThreadTracker::new();
        tracker.track_current(5);
        tracker.push(5).unwrap();
        tracker.unwind_leave(5, |_| false).unwrap();
        assert_eq!(tracker.depth(5), Some(1));
    }

    #[test]
    fn mapping_snapshot_drains() {
        let tracker = ThreadTracker::new();
        tracker.map_current(1, 10);
        tracker.map_current(2, 20);
        assert_eq!(tracker.current_mapped_id(1), Some(10));
        let mut pairs = tracker.snapshot_mapping();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(1, 10), (2, 20)]);
        assert!(tracker.snapshot_mapping().is_empty());
    }

    #[test]
    fn clear_keeps_labels() {
        let tracker = ThreadTracker::new();
        tracker.track_current(1);
        tracker.map_current(1, 10);
        tracker.clear();
        assert!(!tracker.is_tracked(1));
        assert_eq!(tracker.current_mapped_id(1), Some(10));
    }

    #[test]
    fn stack_overflow_heuristic() {
        let anchor = {
            let local = 0u8;
            std::ptr::addr_of!(local) as usize
        };
        // a generous limit is never exceeded by a few stack frames
        assert!(!near_stack_overflow(anchor, 64 * 1024 * 1024, 0.8));
        // a zero limit always trips once any stack has been consumed
        assert!(near_stack_overflow(usize::MAX, 0, 0.8));
    }
}
