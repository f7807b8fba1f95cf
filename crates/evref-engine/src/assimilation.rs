//! Foreign assimilation: adapting outside asynchronous values into the
//! reference contract.
//!
//! Adoption is explicit, not duck-typed: an [`AdapterRegistry`] holds
//! named adapters, each recognizing one foreign shape. An adapter wires
//! the foreign value to a [`Completion`] — a two-callback sink whose
//! first `win`/`lose` call per ticket sticks — or registers a
//! [`CompletionSource`] that the engine polls at turn boundaries. Either
//! way the foreign outcome lands in a shared inbox and settles the
//! adopted reference in a later turn, exactly once.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, TryRecvError};

use serde::{Deserialize, Serialize};

use crate::failure::Reason;
use crate::value_model::{RefHandle, Value};

// ---------------------------------------------------------------------------
// Ticket — names one adopted foreign completion
// ---------------------------------------------------------------------------

/// Names one adopted foreign completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Inbox / Completion — the push-style sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct Inbox {
    completed: Vec<(Ticket, Result<Value, Reason>)>,
    settled: BTreeSet<Ticket>,
    duplicates_dropped: u64,
}

impl Inbox {
    /// Records an outcome for `ticket`; only the first per ticket sticks.
    fn settle(&mut self, ticket: Ticket, outcome: Result<Value, Reason>) -> bool {
        if !self.settled.insert(ticket) {
            self.duplicates_dropped += 1;
            return false;
        }
        self.completed.push((ticket, outcome));
        true
    }
}

pub(crate) type SharedInbox = Rc<RefCell<Inbox>>;

/// Two-callback completion sink for one adopted foreign value.
///
/// Clones share the ticket; across all clones, only the first `win` or
/// `lose` call has effect. The outcome is buffered and applied by the
/// engine at the next turn boundary, never synchronously.
#[derive(Debug, Clone)]
pub struct Completion {
    ticket: Ticket,
    inbox: SharedInbox,
}

impl Completion {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn win(&self, value: Value) {
        self.inbox.borrow_mut().settle(self.ticket, Ok(value));
    }

    pub fn lose(&self, reason: Reason) {
        self.inbox.borrow_mut().settle(self.ticket, Err(reason));
    }
}

// ---------------------------------------------------------------------------
// Thenable / CompletionSource — the two foreign shapes
// ---------------------------------------------------------------------------

/// A foreign value that can register a completion callback pair.
pub trait Thenable {
    fn subscribe(self: Box<Self>, completion: Completion);
}

/// A foreign value whose outcome must be polled for.
///
/// Polled once per turn boundary; returning `Some` removes the source.
pub trait CompletionSource: fmt::Debug {
    fn poll(&mut self) -> Option<Result<Value, Reason>>;
}

/// A foreign outcome that is already known at adoption time. The adopted
/// reference still settles in a later turn, never synchronously.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyThenable(pub Result<Value, Reason>);

impl Thenable for ReadyThenable {
    fn subscribe(self: Box<Self>, completion: Completion) {
        match self.0 {
            Ok(value) => completion.win(value),
            Err(reason) => completion.lose(reason),
        }
    }
}

/// Completion source backed by a standard mpsc channel carrying the
/// foreign outcome. Disconnection before an outcome arrives settles the
/// adopted reference as a failure.
#[derive(Debug)]
pub struct ChannelSource {
    receiver: Receiver<Result<Value, Reason>>,
}

impl ChannelSource {
    pub fn new(receiver: Receiver<Result<Value, Reason>>) -> Self {
        Self { receiver }
    }
}

impl CompletionSource for ChannelSource {
    fn poll(&mut self) -> Option<Result<Value, Reason>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Reason::message(
                "foreign completion channel disconnected",
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// AdapterRegistry — explicit recognition of foreign shapes
// ---------------------------------------------------------------------------

/// Handed to an adapter that recognizes a foreign value: take the
/// completion for push-style wiring, or set a source for poll-style.
#[derive(Debug)]
pub struct AdoptionBinding {
    completion: Completion,
    source: Option<Box<dyn CompletionSource>>,
}

impl AdoptionBinding {
    pub(crate) fn new(completion: Completion) -> Self {
        Self {
            completion,
            source: None,
        }
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub fn set_source(&mut self, source: Box<dyn CompletionSource>) {
        self.source = Some(source);
    }

    pub(crate) fn take_source(&mut self) -> Option<Box<dyn CompletionSource>> {
        self.source.take()
    }
}

/// Recognizes one foreign asynchronous shape.
///
/// Adopted values are handed over as `&mut dyn Any` wrapping an `Option`
/// of the concrete type, so a recognizing adapter can take ownership.
pub trait AssimilationAdapter: fmt::Debug {
    fn name(&self) -> &'static str;
    /// Returns true if the foreign value was recognized and wired up.
    fn adopt(&self, foreign: &mut dyn Any, binding: &mut AdoptionBinding) -> bool;
}

/// Adapter for `Option<Result<Value, Reason>>`: an already-completed
/// outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadyAdapter;

impl AssimilationAdapter for ReadyAdapter {
    fn name(&self) -> &'static str {
        "ready"
    }

    fn adopt(&self, foreign: &mut dyn Any, binding: &mut AdoptionBinding) -> bool {
        let Some(slot) = foreign.downcast_mut::<Option<Result<Value, Reason>>>() else {
            return false;
        };
        let Some(outcome) = slot.take() else {
            return false;
        };
        Box::new(ReadyThenable(outcome)).subscribe(binding.completion());
        true
    }
}

/// Adapter for `Option<Receiver<Result<Value, Reason>>>`: an mpsc channel
/// delivering the outcome later.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelAdapter;

impl AssimilationAdapter for ChannelAdapter {
    fn name(&self) -> &'static str {
        "mpsc_channel"
    }

    fn adopt(&self, foreign: &mut dyn Any, binding: &mut AdoptionBinding) -> bool {
        let Some(slot) = foreign.downcast_mut::<Option<Receiver<Result<Value, Reason>>>>() else {
            return false;
        };
        let Some(receiver) = slot.take() else {
            return false;
        };
        binding.set_source(Box::new(ChannelSource::new(receiver)));
        true
    }
}

/// Ordered list of adapters; the first to recognize a foreign value wins.
#[derive(Debug)]
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn AssimilationAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { adapters: vec![] }
    }

    /// Registry preloaded with the built-in adapters.
    pub fn builtin() -> Self {
        Self {
            adapters: vec![Box::new(ReadyAdapter), Box::new(ChannelAdapter)],
        }
    }

    pub fn register(&mut self, adapter: Box<dyn AssimilationAdapter>) {
        self.adapters.push(adapter);
    }

    /// Walks the adapters; returns the recognizing adapter's name.
    pub(crate) fn adopt(
        &self,
        foreign: &mut dyn Any,
        binding: &mut AdoptionBinding,
    ) -> Option<&'static str> {
        self.adapters
            .iter()
            .find(|adapter| adapter.adopt(foreign, binding))
            .map(|adapter| adapter.name())
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// AssimilationState — per-engine bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct AssimilationState {
    inbox: SharedInbox,
    next_ticket: u64,
    bindings: BTreeMap<Ticket, RefHandle>,
    sources: Vec<(Ticket, Box<dyn CompletionSource>)>,
    pub(crate) registry: AdapterRegistry,
}

impl AssimilationState {
    pub(crate) fn new(registry: AdapterRegistry) -> Self {
        Self {
            inbox: Rc::new(RefCell::new(Inbox::default())),
            next_ticket: 0,
            bindings: BTreeMap::new(),
            sources: Vec::new(),
            registry,
        }
    }

    /// Issues a fresh ticket bound to `handle` and its completion sink.
    pub(crate) fn issue(&mut self, handle: RefHandle) -> Completion {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.bindings.insert(ticket, handle);
        Completion {
            ticket,
            inbox: Rc::clone(&self.inbox),
        }
    }

    pub(crate) fn attach_source(&mut self, ticket: Ticket, source: Box<dyn CompletionSource>) {
        self.sources.push((ticket, source));
    }

    /// Drops a binding that never got wired up (adoption failed).
    pub(crate) fn revoke(&mut self, ticket: Ticket) {
        self.bindings.remove(&ticket);
    }

    /// Polls pull-style sources, moving any yielded outcomes into the
    /// inbox (first outcome per ticket wins).
    pub(crate) fn poll_sources(&mut self) {
        let mut remaining = Vec::with_capacity(self.sources.len());
        for (ticket, mut source) in self.sources.drain(..) {
            match source.poll() {
                Some(outcome) => {
                    self.inbox.borrow_mut().settle(ticket, outcome);
                }
                None => remaining.push((ticket, source)),
            }
        }
        self.sources = remaining;
    }

    /// Drains buffered outcomes, resolving each to its bound reference.
    pub(crate) fn take_completed(&mut self) -> Vec<(Ticket, RefHandle, Result<Value, Reason>)> {
        let completed: Vec<_> = self.inbox.borrow_mut().completed.drain(..).collect();
        completed
            .into_iter()
            .filter_map(|(ticket, outcome)| {
                self.bindings
                    .remove(&ticket)
                    .map(|handle| (ticket, handle, outcome))
            })
            .collect()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.sources.is_empty() || !self.inbox.borrow().completed.is_empty()
    }

    pub(crate) fn duplicates_dropped(&self) -> u64 {
        self.inbox.borrow().duplicates_dropped
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn ticket_display() {
        assert_eq!(Ticket(3).to_string(), "ticket(3)");
    }

    #[test]
    fn completion_first_call_wins() {
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(0));
        completion.win(Value::Int(1));
        completion.lose(Reason::message("late"));
        completion.win(Value::Int(2));
        let completed = state.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].2, Ok(Value::Int(1)));
        assert_eq!(state.duplicates_dropped(), 2);
    }

    #[test]
    fn completion_clones_share_the_ticket() {
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(4));
        let other = completion.clone();
        other.lose(Reason::message("boom"));
        completion.win(Value::Int(9));
        let completed = state.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, RefHandle(4));
        assert_eq!(completed[0].2, Err(Reason::message("boom")));
    }

    #[test]
    fn ready_thenable_completes_through_sink() {
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(1));
        Box::new(ReadyThenable(Ok(Value::str("done")))).subscribe(completion);
        let completed = state.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].2, Ok(Value::str("done")));
    }

    #[test]
    fn channel_source_polls_until_yield() {
        let (tx, rx) = mpsc::channel();
        let mut source = ChannelSource::new(rx);
        assert_eq!(source.poll(), None);
        tx.send(Ok(Value::Int(7))).expect("send");
        assert_eq!(source.poll(), Some(Ok(Value::Int(7))));
    }

    #[test]
    fn channel_disconnect_is_a_failure() {
        let (tx, rx) = mpsc::channel::<Result<Value, Reason>>();
        let mut source = ChannelSource::new(rx);
        drop(tx);
        let outcome = source.poll().expect("disconnect yields");
        assert!(outcome.is_err());
    }

    #[test]
    fn poll_sources_moves_outcomes_to_inbox() {
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(2));
        let (tx, rx) = mpsc::channel();
        state.attach_source(completion.ticket(), Box::new(ChannelSource::new(rx)));

        state.poll_sources();
        assert!(state.take_completed().is_empty());
        assert!(state.has_pending());

        tx.send(Err(Reason::message("nope"))).expect("send");
        state.poll_sources();
        let completed = state.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, RefHandle(2));
        assert!(completed[0].2.is_err());
        assert!(!state.has_pending());
    }

    #[test]
    fn registry_recognizes_ready_outcomes() {
        let registry = AdapterRegistry::builtin();
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(0));
        let mut binding = AdoptionBinding::new(completion);
        let mut foreign: Option<Result<Value, Reason>> = Some(Ok(Value::Int(1)));
        assert_eq!(registry.adopt(&mut foreign, &mut binding), Some("ready"));
        assert!(foreign.is_none());
        assert_eq!(state.take_completed().len(), 1);
    }

    #[test]
    fn registry_recognizes_channels() {
        let registry = AdapterRegistry::builtin();
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(0));
        let mut binding = AdoptionBinding::new(completion);
        let (_tx, rx) = mpsc::channel::<Result<Value, Reason>>();
        let mut foreign = Some(rx);
        assert_eq!(
            registry.adopt(&mut foreign, &mut binding),
            Some("mpsc_channel")
        );
        assert!(binding.take_source().is_some());
    }

    #[test]
    fn registry_rejects_unknown_shapes() {
        let registry = AdapterRegistry::builtin();
        let mut state = AssimilationState::new(AdapterRegistry::new());
        let completion = state.issue(RefHandle(0));
        let mut binding = AdoptionBinding::new(completion);
        let mut foreign = String::from("not adoptable");
        assert_eq!(registry.adopt(&mut foreign, &mut binding), None);
    }

    #[test]
    fn serde_ticket_round_trip() {
        let json = serde_json::to_string(&Ticket(9)).expect("serialize");
        let back: Ticket = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Ticket(9));
    }
}
