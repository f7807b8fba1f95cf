//! Failure-as-data: reasons carried by failed references, composite join
//! failures, and the native-fault escape hatch.
//!
//! In the steady state a failure is a value, not a raised error: a settled
//! reference can be tagged as failed with a [`Reason`], and that reason
//! propagates through every subsequent operation dispatched against it.
//! [`raise`] deliberately converts a reason back into a native error for
//! callers that want synchronous surfacing outside the reference system.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value_model::Value;

// ---------------------------------------------------------------------------
// Reason — why a reference failed
// ---------------------------------------------------------------------------

/// An opaque failure reason.
///
/// The engine never interprets reasons beyond carrying them; the `Joined`
/// variant is produced by the join combinator and keeps every failing
/// element's individual reason retrievable by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Human-readable failure description, optionally with a diagnostic
    /// trace captured where the failure originated.
    Message {
        text: String,
        trace: Option<String>,
    },
    /// A caller-supplied value used verbatim as the reason.
    Value(Value),
    /// Composite failure from joining several references. `reasons` is
    /// keyed by element index; indices of elements that succeeded are
    /// absent. `trace` is taken from the first failing index whose reason
    /// carries one, and is absent when none does.
    Joined {
        reasons: BTreeMap<usize, Reason>,
        trace: Option<String>,
    },
}

impl Reason {
    /// A plain textual reason with no trace.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            trace: None,
        }
    }

    /// A textual reason carrying a diagnostic trace.
    pub fn traced(text: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            trace: Some(trace.into()),
        }
    }

    /// Reason used when a descriptor has no handler for an operation and
    /// no fallback.
    pub fn unsupported(op_name: &str) -> Self {
        Self::message(format!("reference does not support operation: {op_name}"))
    }

    /// Builds the composite join failure, selecting the trace from the
    /// first failing index (in index order) whose reason carries one.
    pub fn joined(reasons: BTreeMap<usize, Reason>) -> Self {
        let trace = reasons
            .values()
            .find_map(|reason| reason.trace().map(str::to_string));
        Self::Joined { reasons, trace }
    }

    /// The diagnostic trace, if this reason carries one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Message { trace, .. } | Self::Joined { trace, .. } => trace.as_deref(),
            Self::Value(_) => None,
        }
    }

    /// For composite reasons, the individual reason recorded at `index`.
    pub fn reason_at(&self, index: usize) -> Option<&Reason> {
        match self {
            Self::Joined { reasons, .. } => reasons.get(&index),
            _ => None,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { text, .. } => f.write_str(text),
            Self::Value(value) => write!(f, "{value}"),
            Self::Joined { reasons, .. } => {
                f.write_str("cannot join: ")?;
                for (i, (index, reason)) in reasons.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "index {index}: {reason}")?;
                }
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fault — the escape hatch into native error handling
// ---------------------------------------------------------------------------

/// A failure reason surfaced as a native error.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("eventual reference failed: {reason}")]
pub struct Fault {
    pub reason: Reason,
}

/// Converts a reason into a [`Fault`] for callers that want `?`-style
/// propagation instead of failure-as-data.
pub fn raise(reason: Reason) -> Fault {
    Fault { reason }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_display() {
        let reason = Reason::message("boom");
        assert_eq!(reason.to_string(), "boom");
        assert!(reason.trace().is_none());
    }

    #[test]
    fn traced_reason_exposes_trace() {
        let reason = Reason::traced("boom", "at line 3");
        assert_eq!(reason.trace(), Some("at line 3"));
    }

    #[test]
    fn value_reason_display() {
        let reason = Reason::Value(Value::Int(7));
        assert_eq!(reason.to_string(), "7");
        assert!(reason.trace().is_none());
    }

    #[test]
    fn joined_selects_first_trace_in_index_order() {
        let mut reasons = BTreeMap::new();
        reasons.insert(4, Reason::traced("later", "trace-4"));
        reasons.insert(1, Reason::message("no trace"));
        reasons.insert(2, Reason::traced("earlier", "trace-2"));
        let joined = Reason::joined(reasons);
        assert_eq!(joined.trace(), Some("trace-2"));
    }

    #[test]
    fn joined_without_traces_has_none() {
        let mut reasons = BTreeMap::new();
        reasons.insert(0, Reason::message("a"));
        reasons.insert(1, Reason::message("b"));
        let joined = Reason::joined(reasons);
        assert!(joined.trace().is_none());
    }

    #[test]
    fn joined_keeps_individual_reasons_by_index() {
        let mut reasons = BTreeMap::new();
        reasons.insert(1, Reason::message("boom"));
        let joined = Reason::joined(reasons);
        assert_eq!(joined.reason_at(1), Some(&Reason::message("boom")));
        assert!(joined.reason_at(0).is_none());
        assert!(joined.reason_at(2).is_none());
    }

    #[test]
    fn joined_display_lists_indices() {
        let mut reasons = BTreeMap::new();
        reasons.insert(0, Reason::message("a"));
        reasons.insert(2, Reason::message("b"));
        assert_eq!(
            Reason::joined(reasons).to_string(),
            "cannot join: index 0: a; index 2: b"
        );
    }

    #[test]
    fn unsupported_names_the_operation() {
        let reason = Reason::unsupported("frobnicate");
        assert_eq!(
            reason.to_string(),
            "reference does not support operation: frobnicate"
        );
    }

    #[test]
    fn raise_wraps_reason() {
        let fault = raise(Reason::message("boom"));
        assert_eq!(fault.to_string(), "eventual reference failed: boom");
        assert_eq!(fault.reason, Reason::message("boom"));
    }

    #[test]
    fn serde_reason_round_trip() {
        let mut reasons = BTreeMap::new();
        reasons.insert(1, Reason::traced("boom", "tr"));
        let values = vec![
            Reason::message("plain"),
            Reason::Value(Value::Null),
            Reason::joined(reasons),
        ];
        for reason in &values {
            let json = serde_json::to_string(reason).expect("serialize");
            let back: Reason = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(&back, reason);
        }
    }
}
