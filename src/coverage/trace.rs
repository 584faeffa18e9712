//! The coverage trace: an ordered record of control-flow events for one run
//! of the instrumented entry method.
//!
//! A trace opens when `EnterMain` fires and closes at the matching
//! `LeaveMain`; at most one trace is open at a time. Every event whose method
//! id is present also registers that method in the trace's visited set, which
//! is what the wire layer later serializes method records from.

use std::collections::BTreeSet;

use crate::runtime::ThreadId;

/// Kind of a recorded control-flow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CoverageKind {
    /// The configured entry method was entered; opens a trace.
    EnterMain = 0,
    /// An instrumented method was entered.
    Enter = 1,
    /// The entry method returned; closes the trace.
    LeaveMain = 2,
    /// An instrumented method returned.
    Leave = 3,
    /// A branch at the recorded offset was taken.
    BranchHit = 4,
    /// A call site was reached.
    Call = 5,
    /// A tail call consumed the current frame.
    Tailcall = 6,
}

impl CoverageKind {
    /// Decodes a wire kind value.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CoverageKind::EnterMain),
            1 => Some(CoverageKind::Enter),
            2 => Some(CoverageKind::LeaveMain),
            3 => Some(CoverageKind::Leave),
            4 => Some(CoverageKind::BranchHit),
            5 => Some(CoverageKind::Call),
            6 => Some(CoverageKind::Tailcall),
            _ => None,
        }
    }
}

/// One recorded control-flow event.
///
/// `method` is present for `Enter`/`Leave`/`BranchHit`; call-shaped events and
/// the trace-bracketing pair carry no id (the entry method's id is implicit in
/// the trace itself). The thread id never leaves the process; the wire format
/// is offset, kind and method id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageEvent {
    /// IL offset inside the owning method
    pub offset: u32,
    /// What happened at that offset
    pub kind: CoverageKind,
    /// Interned method id, where the kind carries one
    pub method: Option<u32>,
    /// Thread the probe fired on
    pub thread: ThreadId,
}

/// An ordered, append-only list of coverage events for one entry-method run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageTrace {
    events: Vec<CoverageEvent>,
    visited: BTreeSet<u32>,
}

impl CoverageTrace {
    /// Opens a trace whose first event is `EnterMain` at `offset` on `thread`.
    ///
    /// `main_method` is registered as visited immediately; the `EnterMain`
    /// event itself carries no id.
    #[must_use]
    pub fn open(offset: u32, main_method: u32, thread: ThreadId) -> Self {
        let mut visited = BTreeSet::new();
        visited.insert(main_method);
        CoverageTrace {
            events: vec![CoverageEvent {
                offset,
                kind: CoverageKind::EnterMain,
                method: None,
                thread,
            }],
            visited,
        }
    }

    /// Appends an event. First appearance of a method id registers it in the
    /// visited set.
    pub fn add(&mut self, offset: u32, kind: CoverageKind, method: Option<u32>, thread: ThreadId) {
        if let Some(id) = method {
            self.visited.insert(id);
        }
        self.events.push(CoverageEvent {
            offset,
            kind,
            method,
            thread,
        });
    }

    /// The recorded events, in append order.
    #[must_use]
    pub fn events(&self) -> &[CoverageEvent] {
        &self.events
    }

    /// Distinct method ids that appeared in this trace, ascending.
    #[must_use]
    pub fn visited_methods(&self) -> &BTreeSet<u32> {
        &self.visited
    }

    /// Detaches everything recorded so far for a mid-run drain.
    ///
    /// The returned trace owns the events and visited set accumulated up to
    /// this point; `self` stays open and continues recording from empty.
    #[must_use]
    pub fn split_off_recorded(&mut self) -> CoverageTrace {
        CoverageTrace {
            events: std::mem::take(&mut self.events),
            visited: std::mem::take(&mut self.visited),
        }
    }
}

/// The accumulated traces of a process run: closed traces plus, while the
/// entry method is executing, the open one.
#[derive(Debug, Default)]
pub struct TraceLog {
    closed: Vec<CoverageTrace>,
    current: Option<CoverageTrace>,
}

impl TraceLog {
    /// An empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh trace, making it current.
    ///
    /// An already-open trace is moved to the closed list as-is; the caller is
    /// expected to have warned about the unbalanced `EnterMain`.
    pub fn open_trace(&mut self, offset: u32, main_method: u32, thread: ThreadId) {
        if let Some(stale) = self.current.take() {
            self.closed.push(stale);
        }
        self.current = Some(CoverageTrace::open(offset, main_method, thread));
    }

    /// The open trace, if any.
    pub fn current_mut(&mut self) -> Option<&mut CoverageTrace> {
        self.current.as_mut()
    }

    /// Closes the current trace. Returns `false` when none was open.
    pub fn close_current(&mut self) -> bool {
        match self.current.take() {
            Some(trace) => {
                self.closed.push(trace);
                true
            }
            None => false,
        }
    }

    /// Number of traces held, including an open one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.closed.len() + usize::from(self.current.is_some())
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.current.is_none()
    }

    /// Takes every trace recorded so far, resetting the log.
    ///
    /// Closed traces move out whole. An open trace ships its events recorded
    /// up to this point and stays open, continuing from an empty event list;
    /// later events go out with the next drain.
    pub fn drain(&mut self) -> Vec<CoverageTrace> {
        let mut drained = std::mem::take(&mut self.closed);
        if let Some(current) = self.current.as_mut() {
            if !current.events().is_empty() {
                drained.push(current.split_off_recorded());
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_registers_main_as_visited() {
        let trace = CoverageTrace::open(0, 1, 7);
        assert_eq!(trace.events().len(), 1);
        assert_eq!(trace.events()[0].kind, CoverageKind::EnterMain);
        assert_eq!(trace.events()[0].method, None);
        assert!(trace.visited_methods().contains(&1));
    }

    #[test]
    fn visited_set_matches_distinct_ids() {
        let mut trace = CoverageTrace::open(0, 1, 7);
        trace.add(10, CoverageKind::Enter, Some(2), 7);
        trace.add(14, CoverageKind::BranchHit, Some(2), 7);
        trace.add(20, CoverageKind::Leave, Some(2), 7);
        trace.add(5, CoverageKind::Call, None, 7);
        assert_eq!(
            trace.visited_methods().iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn log_drain_resets() {
        let mut log = TraceLog::new();
        log.open_trace(0, 1, 7);
        log.current_mut().unwrap().add(10, CoverageKind::Leave, Some(1), 7);
        assert!(log.close_current());
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert!(log.is_empty());
        assert!(log.drain().is_empty());
    }

    #[test]
    fn drain_ships_open_trace_once() {
        let mut log = TraceLog::new();
        log.open_trace(0, 1, 7);
        log.current_mut().unwrap().add(4, CoverageKind::BranchHit, Some(1), 7);

        let first = log.drain();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].events().len(), 2);

        // still open, continues from empty; nothing to ship until a new event
        assert!(log.drain().is_empty());
        log.current_mut().unwrap().add(8, CoverageKind::BranchHit, Some(1), 7);
        let second = log.drain();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].events().len(), 1);
        assert_eq!(second[0].events()[0].offset, 8);
    }

    #[test]
    fn reopening_moves_stale_trace_to_closed() {
        let mut log = TraceLog::new();
        log.open_trace(0, 1, 7);
        log.open_trace(2, 1, 7);
        assert_eq!(log.len(), 2);
        // the stale trace was not appended to
        let drained = log.drain();
        assert_eq!(drained[0].events().len(), 1);
        assert_eq!(drained[1].events()[0].offset, 2);
    }
}
