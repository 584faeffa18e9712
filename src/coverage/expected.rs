//! Expected-coverage checking.
//!
//! A consumer replaying a previously recorded run can install the expected
//! event sequence up front; the runtime then compares every recorded event
//! against the head of that list. Any mismatch is a path divergence, which is
//! fatal to the run. Once the list is exhausted the checker enters a terminal
//! `expired` state: events continue to be recorded but are no longer checked.

use std::collections::VecDeque;

/// One expected coverage step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedStep {
    /// Interned id of the method the event must occur in
    pub method: u32,
    /// IL offset the event must carry
    pub offset: u32,
    /// Consumer-chosen label of the thread the event must occur on
    pub thread: i32,
}

/// Verdict of checking one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVerdict {
    /// Event matched the head of the list.
    Matched,
    /// The list is exhausted; the event was not checked.
    Expired,
    /// Event contradicted the head of the list. Fatal.
    Diverged,
}

/// Mutable cursor over the configured expected sequence.
#[derive(Debug)]
pub struct ExpectedCoverage {
    steps: VecDeque<ExpectedStep>,
    expired: bool,
}

impl ExpectedCoverage {
    /// Wraps a step list. An empty list starts out expired.
    #[must_use]
    pub fn new(steps: Vec<ExpectedStep>) -> Self {
        let expired = steps.is_empty();
        Self {
            steps: steps.into(),
            expired,
        }
    }

    /// True once every configured step has been consumed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Compares one recorded event against the head of the list.
    ///
    /// `method` is the id of the method executing when the event fired (the
    /// shadow-stack top), not the event's own payload; call-shaped events
    /// carry no id of their own but still occur inside a method.
    pub fn check(&mut self, method: u32, offset: u32, thread: i32) -> ExpectedVerdict {
        if self.expired {
            return ExpectedVerdict::Expired;
        }
        let Some(head) = self.steps.front() else {
            self.expired = true;
            return ExpectedVerdict::Expired;
        };
        if head.method != method || head.offset != offset || head.thread != thread {
            log::error!(
                "path divergence: expected method {} offset {} thread {}, got method {} offset {} thread {}",
                head.method, head.offset, head.thread, method, offset, thread
            );
            return ExpectedVerdict::Diverged;
        }
        self.steps.pop_front();
        if self.steps.is_empty() {
            self.expired = true;
        }
        ExpectedVerdict::Matched
    }
}
