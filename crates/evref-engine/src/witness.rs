//! Structured witness log: every externally observable engine transition
//! is recorded as a serializable event, with per-event-type counters.
//!
//! The log is the primary observability surface; tests also use it to
//! assert deterministic replay (same script, same log).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::assimilation::Ticket;
use crate::engine::ObserverId;
use crate::join::JoinId;
use crate::value_model::RefHandle;

/// Which observer continuation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverBranch {
    Win,
    Lose,
}

/// A recorded engine transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WitnessEvent {
    DeferredCreated { handle: RefHandle },
    ImmediateCreated { handle: RefHandle },
    FailureCreated { handle: RefHandle },
    CustomCreated { handle: RefHandle },
    LocalOnlyCreated { handle: RefHandle, inner: RefHandle },
    AdoptedCreated { handle: RefHandle, ticket: Ticket },
    /// A pending reference was resolved; it now forwards to `target`.
    Resolved { handle: RefHandle, target: RefHandle },
    /// A resolution attempt against an already-resolved reference was
    /// ignored (first resolution wins).
    ResolutionIgnored { handle: RefHandle },
    /// Sends recorded while pending were replayed, in order.
    QueueReplayed { handle: RefHandle, replayed: usize },
    SendScheduled { seq: u64, target: RefHandle, op: String },
    /// A send reached a pending reference and was recorded in its queue.
    SendParked { handle: RefHandle, depth: usize },
    SendDelivered { seq: u64, target: RefHandle, op: String },
    ObserverRegistered { cell: ObserverId, child: RefHandle },
    ObserverFired { cell: ObserverId, branch: ObserverBranch },
    /// A second continuation delivery against an already-fired observer
    /// was suppressed.
    ObserverSuppressed { cell: ObserverId },
    JoinStarted { tracker: JoinId, width: usize },
    JoinSettled { tracker: JoinId, failures: usize },
    TicketSettled { ticket: Ticket, won: bool },
}

impl WitnessEvent {
    /// Stable event-type name, used as the counter key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeferredCreated { .. } => "deferred_created",
            Self::ImmediateCreated { .. } => "immediate_created",
            Self::FailureCreated { .. } => "failure_created",
            Self::CustomCreated { .. } => "custom_created",
            Self::LocalOnlyCreated { .. } => "local_only_created",
            Self::AdoptedCreated { .. } => "adopted_created",
            Self::Resolved { .. } => "resolved",
            Self::ResolutionIgnored { .. } => "resolution_ignored",
            Self::QueueReplayed { .. } => "queue_replayed",
            Self::SendScheduled { .. } => "send_scheduled",
            Self::SendParked { .. } => "send_parked",
            Self::SendDelivered { .. } => "send_delivered",
            Self::ObserverRegistered { .. } => "observer_registered",
            Self::ObserverFired { .. } => "observer_fired",
            Self::ObserverSuppressed { .. } => "observer_suppressed",
            Self::JoinStarted { .. } => "join_started",
            Self::JoinSettled { .. } => "join_settled",
            Self::TicketSettled { .. } => "ticket_settled",
        }
    }
}

/// Accumulating event log with counters.
#[derive(Debug, Default)]
pub struct WitnessLog {
    events: Vec<WitnessEvent>,
    counts: BTreeMap<String, u64>,
}

impl WitnessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: WitnessEvent) {
        *self.counts.entry(event.name().to_string()).or_insert(0) += 1;
        self.events.push(event);
    }

    /// Removes and returns all accumulated events. Counters are kept.
    pub fn drain(&mut self) -> Vec<WitnessEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[WitnessEvent] {
        &self.events
    }

    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_by_name() {
        let mut log = WitnessLog::new();
        log.record(WitnessEvent::DeferredCreated {
            handle: RefHandle(0),
        });
        log.record(WitnessEvent::DeferredCreated {
            handle: RefHandle(1),
        });
        log.record(WitnessEvent::ResolutionIgnored {
            handle: RefHandle(0),
        });
        assert_eq!(log.count("deferred_created"), 2);
        assert_eq!(log.count("resolution_ignored"), 1);
        assert_eq!(log.count("resolved"), 0);
        assert_eq!(log.events().len(), 3);
    }

    #[test]
    fn drain_keeps_counters() {
        let mut log = WitnessLog::new();
        log.record(WitnessEvent::SendScheduled {
            seq: 0,
            target: RefHandle(0),
            op: "get".to_string(),
        });
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert!(log.events().is_empty());
        assert_eq!(log.count("send_scheduled"), 1);
    }

    #[test]
    fn serde_event_round_trip() {
        let events = vec![
            WitnessEvent::DeferredCreated {
                handle: RefHandle(0),
            },
            WitnessEvent::Resolved {
                handle: RefHandle(0),
                target: RefHandle(1),
            },
            WitnessEvent::SendDelivered {
                seq: 3,
                target: RefHandle(1),
                op: "when".to_string(),
            },
            WitnessEvent::ObserverFired {
                cell: ObserverId(0),
                branch: ObserverBranch::Win,
            },
            WitnessEvent::JoinSettled {
                tracker: JoinId(1),
                failures: 2,
            },
            WitnessEvent::TicketSettled {
                ticket: Ticket(5),
                won: false,
            },
        ];
        for event in &events {
            let json = serde_json::to_string(event).expect("serialize");
            let back: WitnessEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(&back, event);
        }
    }
}
