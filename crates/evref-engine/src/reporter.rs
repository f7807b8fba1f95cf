//! Unhandled-failure reporting.
//!
//! Observer callbacks that fail are never allowed to escape the
//! combinator; their reasons are handed to a [`FailureReporter`] and then
//! converted into a failure of the derived reference. The reporter is
//! injectable; the default logs through `tracing`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::failure::Reason;

/// Sink for failure reasons that no caller handled directly.
pub trait FailureReporter: fmt::Debug {
    fn report(&mut self, context: &str, reason: &Reason);
}

/// Default reporter: structured warning via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&mut self, context: &str, reason: &Reason) {
        tracing::warn!(context, reason = %reason, "unhandled eventual-reference failure");
    }
}

/// Reporter that records everything it sees; cloned handles share the log.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    log: Rc<RefCell<Vec<(String, Reason)>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(String, Reason)> {
        self.log.borrow().clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&mut self, context: &str, reason: &Reason) {
        self.log.borrow_mut().push((context.to_string(), reason.clone()));
    }
}
