//! Named operations dispatchable against a reference.
//!
//! The built-in set is closed; anything else travels through the explicit
//! `Custom` branch and is default-denied unless a descriptor supplies a
//! handler or fallback.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An operation name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Observe settlement: deliver the resolved value or the failure
    /// reason to the registered continuation.
    When,
    /// Read a named property.
    Get,
    /// Write a named property; settles to the stored value.
    Put,
    /// Delete a named property; settles to `true`.
    Del,
    /// Invoke a named member with an argument list.
    Post,
    /// Enumerate own property names.
    Keys,
    /// Probe answered only by local-only markers; a no-op everywhere it is
    /// supported and a failure everywhere else.
    IsLocal,
    /// Caller-defined operation, dispatched by name.
    Custom(String),
}

impl Op {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::When => "when",
            Self::Get => "get",
            Self::Put => "put",
            Self::Del => "del",
            Self::Post => "post",
            Self::Keys => "keys",
            Self::IsLocal => "is_local",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_name() {
        assert_eq!(Op::When.to_string(), "when");
        assert_eq!(Op::Get.to_string(), "get");
        assert_eq!(Op::Put.to_string(), "put");
        assert_eq!(Op::Del.to_string(), "del");
        assert_eq!(Op::Post.to_string(), "post");
        assert_eq!(Op::Keys.to_string(), "keys");
        assert_eq!(Op::IsLocal.to_string(), "is_local");
        assert_eq!(Op::custom("propfind").to_string(), "propfind");
    }

    #[test]
    fn ordering_supports_table_keys() {
        // Ops key descriptor tables; ordering just has to be total.
        let mut ops = vec![Op::custom("b"), Op::When, Op::custom("a"), Op::Get];
        ops.sort();
        assert_eq!(ops.len(), 4);
    }

    #[test]
    fn serde_round_trip() {
        let ops = vec![
            Op::When,
            Op::Get,
            Op::Put,
            Op::Del,
            Op::Post,
            Op::Keys,
            Op::IsLocal,
            Op::custom("propfind"),
        ];
        for op in &ops {
            let json = serde_json::to_string(op).expect("serialize");
            let back: Op = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(&back, op);
        }
    }
}
