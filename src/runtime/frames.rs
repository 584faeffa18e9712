//! Shadow call-frame bookkeeping for the probe runtime.
//!
//! The stack balance alone cannot answer two questions the probes have:
//! whether the frame on top ever received its `Enter` (an extern callee never
//! fires one), and whether an `Enter` arrived for a method the call site did
//! not predict (tiered compilation and tailcall targets do this). Each thread
//! therefore carries a small shadow stack of [`Frame`] markers alongside its
//! balance counter.

/// One shadow frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Interned method id executing in this frame. `None` while the frame is
    /// pending (pushed by a call site whose callee is unknown).
    pub method: Option<u32>,
    /// Set once the frame's `Enter` probe fired. Pending frames that never
    /// get this marker belong to unmanaged callees.
    pub entered: bool,
    /// The frame was synthesized for an `Enter` the call site did not predict.
    pub spontaneous: bool,
}

impl Frame {
    fn pending(expected: Option<u32>) -> Self {
        Frame {
            method: expected,
            entered: false,
            spontaneous: false,
        }
    }

    fn entered(method: u32) -> Self {
        Frame {
            method: Some(method),
            entered: true,
            spontaneous: false,
        }
    }
}

/// How an `Enter` was reconciled against the shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// The pending top frame was resolved in place. The balance was already
    /// raised by the call site that pushed it.
    Resolved,
    /// A new frame was pushed; the balance must be raised.
    Pushed,
    /// The entered method contradicted the pending frame's expectation; a
    /// spontaneous frame was synthesized on top. The balance must be raised.
    Synthesized,
}

/// Per-thread shadow stack.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    /// An empty shadow stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an already-entered frame for `method`. Used by `EnterMain` where
    /// no call site precedes the entry.
    pub fn push_entered(&mut self, method: u32) {
        self.frames.push(Frame::entered(method));
    }

    /// Pushes a pending frame for a call site. `expected` carries the callee
    /// method id when the rewriter could resolve it statically.
    pub fn push_pending(&mut self, expected: Option<u32>) {
        self.frames.push(Frame::pending(expected));
    }

    /// Reconciles an `Enter` probe for `method` against the stack top.
    ///
    /// A pending top frame is resolved in place unless it expected a different
    /// method: that mismatch (with `is_spontaneous` unset and the frame itself
    /// not spontaneous) synthesizes a new spontaneous frame for the entry the
    /// runtime produced on its own. With no pending frame on top, the enter is
    /// an ordinary nested call and pushes.
    pub fn enter(&mut self, method: u32, is_spontaneous: bool) -> EnterOutcome {
        match self.frames.last_mut() {
            Some(top) if !top.entered => match top.method {
                Some(expected) if expected != method && !is_spontaneous && !top.spontaneous => {
                    log::debug!(
                        "spontaneous enter: expected method {expected}, entered {method}"
                    );
                    self.frames.push(Frame {
                        method: Some(method),
                        entered: true,
                        spontaneous: true,
                    });
                    EnterOutcome::Synthesized
                }
                _ => {
                    top.method = Some(method);
                    top.entered = true;
                    EnterOutcome::Resolved
                }
            },
            _ => {
                self.frames.push(Frame::entered(method));
                EnterOutcome::Pushed
            }
        }
    }

    /// Pops the top frame.
    pub fn leave(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Pops the top frame if it is pending (its `Enter` never fired).
    ///
    /// Returns `true` when a frame was popped; the caller must lower the
    /// balance to match.
    pub fn finalize_call(&mut self) -> bool {
        match self.frames.last() {
            Some(top) if !top.entered => {
                self.frames.pop();
                true
            }
            _ => false,
        }
    }

    /// The frame on top, if any.
    #[must_use]
    pub fn top(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no frames are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops every frame.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_enter_pushes() {
        let mut stack = FrameStack::new();
        stack.push_entered(1);
        assert_eq!(stack.enter(2, false), EnterOutcome::Pushed);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top().unwrap().method, Some(2));
    }

    #[test]
    fn pending_frame_is_resolved_in_place() {
        let mut stack = FrameStack::new();
        stack.push_entered(1);
        stack.push_pending(None);
        assert_eq!(stack.enter(2, false), EnterOutcome::Resolved);
        assert_eq!(stack.len(), 2);
        let top = stack.top().unwrap();
        assert_eq!(top.method, Some(2));
        assert!(top.entered);
        assert!(!top.spontaneous);
    }

    #[test]
    fn mismatched_expectation_synthesizes_spontaneous_frame() {
        let mut stack = FrameStack::new();
        stack.push_entered(1);
        stack.push_pending(Some(2));
        assert_eq!(stack.enter(9, false), EnterOutcome::Synthesized);
        assert_eq!(stack.len(), 3);
        let top = stack.top().unwrap();
        assert_eq!(top.method, Some(9));
        assert!(top.spontaneous);
        // leaving pops only the synthetic frame; the pending one remains
        stack.leave();
        assert_eq!(stack.len(), 2);
        assert!(!stack.top().unwrap().entered);
    }

    #[test]
    fn declared_spontaneous_enter_takes_pending_frame() {
        let mut stack = FrameStack::new();
        stack.push_pending(Some(2));
        assert_eq!(stack.enter(9, true), EnterOutcome::Resolved);
        assert_eq!(stack.top().unwrap().method, Some(9));
    }

    #[test]
    fn finalize_pops_only_pending_frames() {
        let mut stack = FrameStack::new();
        stack.push_entered(1);
        stack.push_pending(None);
        assert!(stack.finalize_call());
        assert_eq!(stack.len(), 1);
        // entered frame stays put
        assert!(!stack.finalize_call());
        assert_eq!(stack.len(), 1);
    }
}
