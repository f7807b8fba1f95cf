//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Configurable engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum turn-queue depth before new sends are refused.
    pub max_turn_depth: usize,
    /// Maximum sends recorded against a single pending reference. Guards
    /// against unbounded queue growth on a deferred that is never
    /// resolved; overflowing sends fail rather than queue.
    pub max_pending_sends: usize,
    /// Maximum turns executed per `run_until_idle` call.
    pub turn_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turn_depth: 65_536,
            max_pending_sends: 4_096,
            turn_budget: 1_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_turn_depth, 65_536);
        assert_eq!(config.max_pending_sends, 4_096);
        assert_eq!(config.turn_budget, 1_000_000);
    }

    #[test]
    fn serde_round_trip() {
        let config = EngineConfig {
            max_turn_depth: 8,
            max_pending_sends: 2,
            turn_budget: 100,
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: EngineConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
