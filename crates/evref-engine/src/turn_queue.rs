//! Turn scheduling: the "run this later, in a future turn" seam.
//!
//! A [`Turn`] is pure data — deliver this send to this reference — so the
//! scheduling policy is swappable. [`FifoTurnQueue`] is the default: a
//! deterministic, manually steppable FIFO. The engine never executes a
//! dispatch synchronously; everything routes through the scheduler, which
//! is what gives the never-in-the-calling-turn guarantee.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::ObserverId;
use crate::join::JoinId;
use crate::operation::Op;
use crate::value_model::{RefHandle, Value};

// ---------------------------------------------------------------------------
// SendRecord / Continuation — a recorded operation and where its outcome goes
// ---------------------------------------------------------------------------

/// Where the outcome of a delivered operation is routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// Resolve this reply reference with the outcome.
    Reply(RefHandle),
    /// Fire an observer cell (exactly-once win/lose callbacks); the
    /// callback's own outcome resolves `child`.
    Observer { cell: ObserverId, child: RefHandle },
    /// Record the outcome into one slot of a join tracker.
    Join { tracker: JoinId, index: usize },
    /// Complete a zero-width join; the outcome itself is ignored.
    JoinFinish { tracker: JoinId },
}

/// One recorded operation: name, arguments, and outcome routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRecord {
    pub op: Op,
    pub args: Vec<Value>,
    pub continuation: Continuation,
}

/// A scheduled delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Scheduling sequence number, for witness correlation.
    pub seq: u64,
    /// The reference the send is delivered to.
    pub target: RefHandle,
    pub send: SendRecord,
}

// ---------------------------------------------------------------------------
// TurnScheduler — the injectable scheduling seam
// ---------------------------------------------------------------------------

/// Scheduling policy for turns.
///
/// Implementations must never run a turn reentrantly from `schedule`;
/// turns only execute when the engine asks for the next one. No relative
/// ordering against other host work is required, but turns scheduled
/// against the same reference must come back in scheduling order.
pub trait TurnScheduler: fmt::Debug {
    fn schedule(&mut self, turn: Turn);
    fn take_next(&mut self) -> Option<Turn>;
    /// Number of turns waiting to execute.
    fn pending(&self) -> usize;
}

/// Default scheduler: strict FIFO with counters.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct FifoTurnQueue {
    queue: VecDeque<Turn>,
    total_scheduled: u64,
    total_taken: u64,
}

impl FifoTurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_scheduled(&self) -> u64 {
        self.total_scheduled
    }

    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }
}

impl TurnScheduler for FifoTurnQueue {
    fn schedule(&mut self, turn: Turn) {
        self.total_scheduled += 1;
        self.queue.push_back(turn);
    }

    fn take_next(&mut self) -> Option<Turn> {
        let turn = self.queue.pop_front();
        if turn.is_some() {
            self.total_taken += 1;
        }
        turn
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
