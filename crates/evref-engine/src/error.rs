//! API-misuse errors.
//!
//! These are distinct from failure-as-data ([`crate::failure::Reason`]):
//! a `RefError` means the caller handed the engine something it cannot
//! act on at all, not that an eventual operation lost.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_model::{ClosureId, RefHandle};

/// Errors from engine entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefError {
    /// The handle does not name a record in this engine.
    InvalidHandle { handle: RefHandle },
    /// The turn queue is at its configured depth limit.
    TurnQueueFull { max_depth: usize },
    /// A closure id does not name a registered closure.
    UnknownClosure { id: ClosureId },
    /// No registered adapter recognized the foreign value.
    NoAdapter,
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHandle { handle } => write!(f, "{handle} is not a known reference"),
            Self::TurnQueueFull { max_depth } => {
                write!(f, "turn queue is full (max {max_depth})")
            }
            Self::UnknownClosure { id } => write!(f, "{id} is not a registered closure"),
            Self::NoAdapter => f.write_str("no registered adapter recognized the foreign value"),
        }
    }
}

impl std::error::Error for RefError {}
