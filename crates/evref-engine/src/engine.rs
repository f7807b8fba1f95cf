//! The reference engine: record store, resolution, dispatch, combinators.
//!
//! One [`RefEngine`] owns every reference record, the turn scheduler, the
//! closure and observer tables, the join trackers, and the assimilation
//! state. All dispatch is turn-deferred: `send` and the combinators only
//! schedule; outcomes land when the host steps the engine. Resolution is
//! first-call-wins and a resolved record becomes a forwarder, so sends
//! queued while pending replay to the resolution target in FIFO order.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assimilation::{
    AdapterRegistry, AdoptionBinding, AssimilationAdapter, AssimilationState, CompletionSource,
    Thenable,
};
use crate::config::EngineConfig;
use crate::descriptor::{eval_immediate, CustomDescriptor, Descriptor};
use crate::error::RefError;
use crate::failure::Reason;
use crate::join::{CombineFn, JoinTable};
use crate::operation::Op;
use crate::reporter::{FailureReporter, TracingReporter};
use crate::turn_queue::{Continuation, FifoTurnQueue, SendRecord, Turn, TurnScheduler};
use crate::value_model::{ClosureId, ClosureTable, RefHandle, Value};
use crate::witness::{ObserverBranch, WitnessEvent, WitnessLog};

// ---------------------------------------------------------------------------
// RefRecord — lifecycle state of one reference
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum RefState {
    /// Unresolved; sends are recorded in arrival order.
    Pending { queue: VecDeque<SendRecord> },
    /// Resolved; every delivery chases to `target`.
    Forwarded { target: RefHandle },
    /// Settled; the descriptor answers operations.
    Settled { descriptor: Descriptor },
}

#[derive(Debug)]
struct RefRecord {
    state: RefState,
}

// ---------------------------------------------------------------------------
// Deferred — the resolver authority
// ---------------------------------------------------------------------------

/// Resolver authority over one pending reference.
///
/// Deliberately not `Clone`: holding the `Deferred` is what entitles a
/// caller to settle the reference. Consumers get `Value::Ref` via
/// [`Deferred::value`] and can only operate, never resolve.
#[derive(Debug)]
pub struct Deferred {
    handle: RefHandle,
}

impl Deferred {
    pub fn handle(&self) -> RefHandle {
        self.handle
    }

    /// The consumer-side value for this reference.
    pub fn value(&self) -> Value {
        Value::Ref(self.handle)
    }
}

// ---------------------------------------------------------------------------
// Observer cells
// ---------------------------------------------------------------------------

/// Names one registered observer cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer({})", self.0)
    }
}

/// Winning-branch callback: receives the settled value.
pub type WinCallback = Box<dyn FnOnce(Value) -> Result<Value, Reason>>;
/// Losing-branch callback: receives the failure reason.
pub type LoseCallback = Box<dyn FnOnce(Reason) -> Result<Value, Reason>>;

struct ObserverCell {
    fired: bool,
    on_win: Option<WinCallback>,
    on_lose: Option<LoseCallback>,
}

#[derive(Default)]
struct ObserverTable {
    next: u64,
    cells: BTreeMap<ObserverId, ObserverCell>,
}

impl ObserverTable {
    fn insert(&mut self, on_win: Option<WinCallback>, on_lose: Option<LoseCallback>) -> ObserverId {
        let id = ObserverId(self.next);
        self.next += 1;
        self.cells.insert(
            id,
            ObserverCell {
                fired: false,
                on_win,
                on_lose,
            },
        );
        id
    }

    fn fired(&self, id: ObserverId) -> Option<bool> {
        self.cells.get(&id).map(|cell| cell.fired)
    }

    /// Marks the cell fired and takes its callbacks. The emptied cell
    /// stays registered so a duplicate delivery is seen as fired and
    /// suppressed rather than silently dropped.
    fn consume(&mut self, id: ObserverId) -> Option<(Option<WinCallback>, Option<LoseCallback>)> {
        let cell = self.cells.get_mut(&id)?;
        cell.fired = true;
        Some((cell.on_win.take(), cell.on_lose.take()))
    }
}

impl fmt::Debug for ObserverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverTable")
            .field("registered", &self.cells.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Result of [`RefEngine::run_until_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Turns executed.
    pub turns: usize,
    /// True when the turn queue drained; false when the turn budget was
    /// exhausted first.
    pub idle: bool,
}

// ---------------------------------------------------------------------------
// RefEngine
// ---------------------------------------------------------------------------

/// Single-owner eventual-reference engine.
#[derive(Debug)]
pub struct RefEngine {
    config: EngineConfig,
    records: Vec<RefRecord>,
    scheduler: Box<dyn TurnScheduler>,
    next_turn_seq: u64,
    closures: ClosureTable,
    observers: ObserverTable,
    joins: JoinTable,
    assimilation: AssimilationState,
    witness: WitnessLog,
    reporter: Box<dyn FailureReporter>,
}

impl Default for RefEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RefEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_scheduler(config, Box::new(FifoTurnQueue::new()))
    }

    pub fn with_scheduler(config: EngineConfig, scheduler: Box<dyn TurnScheduler>) -> Self {
        Self {
            config,
            records: Vec::new(),
            scheduler,
            next_turn_seq: 0,
            closures: ClosureTable::new(),
            observers: ObserverTable::default(),
            joins: JoinTable::default(),
            assimilation: AssimilationState::new(AdapterRegistry::builtin()),
            witness: WitnessLog::new(),
            reporter: Box::new(TracingReporter),
        }
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn FailureReporter>) {
        self.reporter = reporter;
    }

    pub fn register_adapter(&mut self, adapter: Box<dyn AssimilationAdapter>) {
        self.assimilation.registry.register(adapter);
    }

    /// Registers a native closure for use as a map member or custom
    /// descriptor handler.
    pub fn register_closure<F>(&mut self, f: F) -> ClosureId
    where
        F: Fn(&[Value]) -> Result<Value, Reason> + 'static,
    {
        self.closures.register(f)
    }

    pub fn witness(&self) -> &WitnessLog {
        &self.witness
    }

    /// Removes and returns accumulated witness events.
    pub fn drain_witness(&mut self) -> Vec<WitnessEvent> {
        self.witness.drain()
    }

    // -- record allocation --------------------------------------------------

    fn alloc_record(&mut self, state: RefState) -> RefHandle {
        let handle = RefHandle(self.records.len() as u32);
        self.records.push(RefRecord { state });
        handle
    }

    fn pending_record(&mut self) -> RefHandle {
        self.alloc_record(RefState::Pending {
            queue: VecDeque::new(),
        })
    }

    fn settled_record(&mut self, descriptor: Descriptor) -> RefHandle {
        self.alloc_record(RefState::Settled { descriptor })
    }

    fn check_handle(&self, handle: RefHandle) -> Result<(), RefError> {
        if (handle.0 as usize) < self.records.len() {
            Ok(())
        } else {
            Err(RefError::InvalidHandle { handle })
        }
    }

    // -- creation -----------------------------------------------------------

    /// Creates a pending reference and returns its resolver authority.
    pub fn deferred(&mut self) -> Deferred {
        let handle = self.pending_record();
        self.witness.record(WitnessEvent::DeferredCreated { handle });
        Deferred { handle }
    }

    /// Wraps a terminal value as a settled reference. A `Value::Ref` is
    /// returned as-is: references never nest.
    pub fn immediate(&mut self, value: Value) -> Result<RefHandle, RefError> {
        if let Value::Ref(handle) = value {
            self.check_handle(handle)?;
            return Ok(handle);
        }
        let handle = self.settled_record(Descriptor::Immediate(value));
        self.witness.record(WitnessEvent::ImmediateCreated { handle });
        Ok(handle)
    }

    /// Creates a reference already settled as failed.
    pub fn failed(&mut self, reason: Reason) -> RefHandle {
        let handle = self.settled_record(Descriptor::Failure(reason));
        self.witness.record(WitnessEvent::FailureCreated { handle });
        handle
    }

    /// Creates a reference whose dispatch is the caller-supplied table.
    /// Every closure id in the table must already be registered.
    pub fn custom_ref(&mut self, descriptor: CustomDescriptor) -> Result<RefHandle, RefError> {
        for id in descriptor.table.values().copied().chain(descriptor.fallback) {
            if self.closures.get(id).is_none() {
                return Err(RefError::UnknownClosure { id });
            }
        }
        let handle = self.settled_record(Descriptor::Custom(descriptor));
        self.witness.record(WitnessEvent::CustomCreated { handle });
        Ok(handle)
    }

    /// Wraps a value so it answers the `is_local` probe; every other
    /// operation forwards to the wrapped value.
    pub fn mark_local_only(&mut self, value: Value) -> Result<RefHandle, RefError> {
        let inner = self.immediate(value)?;
        let handle = self.settled_record(Descriptor::LocalOnly { inner });
        self.witness
            .record(WitnessEvent::LocalOnlyCreated { handle, inner });
        Ok(handle)
    }

    // -- resolution ---------------------------------------------------------

    /// Resolves a pending reference. Returns false (and changes nothing)
    /// if it was already resolved.
    pub fn resolve(&mut self, deferred: &Deferred, value: Value) -> Result<bool, RefError> {
        self.check_handle(deferred.handle)?;
        if let Value::Ref(target) = &value {
            self.check_handle(*target)?;
        }
        Ok(self.resolve_internal(deferred.handle, Ok(value)))
    }

    /// Resolves a pending reference as failed.
    pub fn reject(&mut self, deferred: &Deferred, reason: Reason) -> Result<bool, RefError> {
        self.check_handle(deferred.handle)?;
        Ok(self.resolve_internal(deferred.handle, Err(reason)))
    }

    fn resolve_internal(&mut self, handle: RefHandle, outcome: Result<Value, Reason>) -> bool {
        let idx = handle.0 as usize;
        let queue = match &mut self.records[idx].state {
            RefState::Pending { queue } => std::mem::take(queue),
            _ => {
                self.witness
                    .record(WitnessEvent::ResolutionIgnored { handle });
                return false;
            }
        };
        let target = match outcome {
            Ok(Value::Ref(target)) if target == handle => self.settled_record(
                Descriptor::Failure(Reason::message("reference resolved with itself")),
            ),
            Ok(Value::Ref(target)) => target,
            Ok(value) => self.settled_record(Descriptor::Immediate(value)),
            Err(reason) => self.settled_record(Descriptor::Failure(reason)),
        };
        self.records[idx].state = RefState::Forwarded { target };
        self.witness.record(WitnessEvent::Resolved { handle, target });
        tracing::debug!(%handle, %target, replayed = queue.len(), "reference resolved");
        if !queue.is_empty() {
            self.witness.record(WitnessEvent::QueueReplayed {
                handle,
                replayed: queue.len(),
            });
            for send in queue {
                self.schedule_turn(target, send);
            }
        }
        true
    }

    // -- sends --------------------------------------------------------------

    fn schedule_turn(&mut self, target: RefHandle, send: SendRecord) {
        let seq = self.next_turn_seq;
        self.next_turn_seq += 1;
        self.witness.record(WitnessEvent::SendScheduled {
            seq,
            target,
            op: send.op.name().to_string(),
        });
        self.scheduler.schedule(Turn { seq, target, send });
    }

    fn check_capacity(&self) -> Result<(), RefError> {
        if self.scheduler.pending() >= self.config.max_turn_depth {
            Err(RefError::TurnQueueFull {
                max_depth: self.config.max_turn_depth,
            })
        } else {
            Ok(())
        }
    }

    /// Schedules an operation against a reference; the returned reply
    /// reference settles with the outcome in a later turn.
    pub fn send(&mut self, target: RefHandle, op: Op, args: Vec<Value>) -> Result<RefHandle, RefError> {
        self.check_handle(target)?;
        self.check_capacity()?;
        let reply = self.pending_record();
        self.schedule_turn(
            target,
            SendRecord {
                op,
                args,
                continuation: Continuation::Reply(reply),
            },
        );
        Ok(reply)
    }

    /// Reply settles with the target's resolved value or failure.
    pub fn when(&mut self, target: RefHandle) -> Result<RefHandle, RefError> {
        self.send(target, Op::When, vec![])
    }

    /// Reads a named property; missing members settle as `undefined`.
    pub fn get(&mut self, target: RefHandle, name: &str) -> Result<RefHandle, RefError> {
        self.send(target, Op::Get, vec![Value::str(name)])
    }

    /// Writes a named property; settles with the stored value.
    pub fn put(&mut self, target: RefHandle, name: &str, value: Value) -> Result<RefHandle, RefError> {
        self.send(target, Op::Put, vec![Value::str(name), value])
    }

    /// Deletes a named property; settles with `true`.
    pub fn del(&mut self, target: RefHandle, name: &str) -> Result<RefHandle, RefError> {
        self.send(target, Op::Del, vec![Value::str(name)])
    }

    /// Invokes a named member with an argument list.
    pub fn invoke(
        &mut self,
        target: RefHandle,
        name: &str,
        args: Vec<Value>,
    ) -> Result<RefHandle, RefError> {
        self.send(target, Op::Post, vec![Value::str(name), Value::List(args)])
    }

    /// Enumerates own property names, sorted.
    pub fn keys(&mut self, target: RefHandle) -> Result<RefHandle, RefError> {
        self.send(target, Op::Keys, vec![])
    }

    /// Probes the local-only marker; fails against anything else.
    pub fn probe_local(&mut self, target: RefHandle) -> Result<RefHandle, RefError> {
        self.send(target, Op::IsLocal, vec![])
    }

    // -- observers ----------------------------------------------------------

    /// Registers a winning-branch observer; the losing branch propagates
    /// the reason to the derived reference unchanged.
    pub fn observe<F>(&mut self, target: RefHandle, on_win: F) -> Result<RefHandle, RefError>
    where
        F: FnOnce(Value) -> Result<Value, Reason> + 'static,
    {
        self.register_observer(target, Some(Box::new(on_win)), None)
    }

    /// Registers a losing-branch observer; the winning branch passes the
    /// value through to the derived reference unchanged.
    pub fn observe_losing<F>(&mut self, target: RefHandle, on_lose: F) -> Result<RefHandle, RefError>
    where
        F: FnOnce(Reason) -> Result<Value, Reason> + 'static,
    {
        self.register_observer(target, None, Some(Box::new(on_lose)))
    }

    /// Two-callback mirror of [`Self::observe_full`] with the losing
    /// branch first, for callers written around failure handling.
    pub fn observe_losing_full<L, W>(
        &mut self,
        target: RefHandle,
        on_lose: L,
        on_win: W,
    ) -> Result<RefHandle, RefError>
    where
        L: FnOnce(Reason) -> Result<Value, Reason> + 'static,
        W: FnOnce(Value) -> Result<Value, Reason> + 'static,
    {
        self.register_observer(target, Some(Box::new(on_win)), Some(Box::new(on_lose)))
    }

    /// Registers both observer branches.
    pub fn observe_full<W, L>(
        &mut self,
        target: RefHandle,
        on_win: W,
        on_lose: L,
    ) -> Result<RefHandle, RefError>
    where
        W: FnOnce(Value) -> Result<Value, Reason> + 'static,
        L: FnOnce(Reason) -> Result<Value, Reason> + 'static,
    {
        self.register_observer(target, Some(Box::new(on_win)), Some(Box::new(on_lose)))
    }

    fn register_observer(
        &mut self,
        target: RefHandle,
        on_win: Option<WinCallback>,
        on_lose: Option<LoseCallback>,
    ) -> Result<RefHandle, RefError> {
        self.check_handle(target)?;
        self.check_capacity()?;
        let child = self.pending_record();
        let cell = self.observers.insert(on_win, on_lose);
        self.witness
            .record(WitnessEvent::ObserverRegistered { cell, child });
        self.schedule_turn(
            target,
            SendRecord {
                op: Op::When,
                args: vec![],
                continuation: Continuation::Observer { cell, child },
            },
        );
        Ok(child)
    }

    fn fire_observer(&mut self, cell: ObserverId, child: RefHandle, outcome: Result<Value, Reason>) {
        match self.observers.fired(cell) {
            None => return,
            Some(true) => {
                self.witness.record(WitnessEvent::ObserverSuppressed { cell });
                return;
            }
            Some(false) => {}
        }
        // A reference outcome is not a settlement; chase it.
        if let Ok(Value::Ref(inner)) = &outcome {
            let inner = *inner;
            self.schedule_turn(
                inner,
                SendRecord {
                    op: Op::When,
                    args: vec![],
                    continuation: Continuation::Observer { cell, child },
                },
            );
            return;
        }
        let Some((on_win, on_lose)) = self.observers.consume(cell) else {
            return;
        };
        let child_outcome = match outcome {
            Ok(value) => {
                self.witness.record(WitnessEvent::ObserverFired {
                    cell,
                    branch: ObserverBranch::Win,
                });
                match on_win {
                    Some(f) => match f(value) {
                        Ok(derived) => Ok(derived),
                        Err(reason) => {
                            self.reporter.report("observer win callback", &reason);
                            Err(reason)
                        }
                    },
                    None => Ok(value),
                }
            }
            Err(reason) => {
                self.witness.record(WitnessEvent::ObserverFired {
                    cell,
                    branch: ObserverBranch::Lose,
                });
                match on_lose {
                    Some(f) => match f(reason) {
                        Ok(recovered) => Ok(recovered),
                        Err(derived) => {
                            self.reporter.report("observer lose callback", &derived);
                            Err(derived)
                        }
                    },
                    None => Err(reason),
                }
            }
        };
        self.resolve_internal(child, child_outcome);
    }

    // -- join ---------------------------------------------------------------

    /// Waits for every element, then runs `combine` over the settled
    /// values in element order. Any element failure makes the result a
    /// composite failure carrying each failed index's reason; no element
    /// short-circuits the rest.
    pub fn join(&mut self, elements: Vec<Value>, combine: CombineFn) -> Result<RefHandle, RefError> {
        for element in &elements {
            if let Value::Ref(handle) = element {
                self.check_handle(*handle)?;
            }
        }
        self.check_capacity()?;
        let child = self.pending_record();
        let width = elements.len();
        let tracker = self.joins.insert(child, width, combine);
        self.witness
            .record(WitnessEvent::JoinStarted { tracker, width });
        if width == 0 {
            // Still settles through a turn, never synchronously.
            let target = self.settled_record(Descriptor::Immediate(Value::Undefined));
            self.schedule_turn(
                target,
                SendRecord {
                    op: Op::When,
                    args: vec![],
                    continuation: Continuation::JoinFinish { tracker },
                },
            );
        } else {
            for (index, element) in elements.into_iter().enumerate() {
                let target = match element {
                    Value::Ref(handle) => handle,
                    other => self.settled_record(Descriptor::Immediate(other)),
                };
                self.schedule_turn(
                    target,
                    SendRecord {
                        op: Op::When,
                        args: vec![],
                        continuation: Continuation::Join { tracker, index },
                    },
                );
            }
        }
        Ok(child)
    }

    /// Joins elements into a list of their settled values.
    pub fn join_all(&mut self, elements: Vec<Value>) -> Result<RefHandle, RefError> {
        self.join(elements, Box::new(|values| Ok(Value::List(values))))
    }

    fn record_join(&mut self, tracker: crate::join::JoinId, index: usize, outcome: Result<Value, Reason>) {
        if let Ok(Value::Ref(inner)) = &outcome {
            let inner = *inner;
            self.schedule_turn(
                inner,
                SendRecord {
                    op: Op::When,
                    args: vec![],
                    continuation: Continuation::Join { tracker, index },
                },
            );
            return;
        }
        let complete = match self.joins.get_mut(tracker) {
            Some(t) => t.record(index, outcome),
            None => return,
        };
        if complete {
            self.finish_join(tracker);
        }
    }

    fn finish_join(&mut self, tracker: crate::join::JoinId) {
        let Some(mut t) = self.joins.remove(tracker) else {
            return;
        };
        let failures = t.failures();
        let outcome = t.settle();
        if failures == 0 {
            if let Err(reason) = &outcome {
                self.reporter.report("join combine", reason);
            }
        }
        self.witness
            .record(WitnessEvent::JoinSettled { tracker, failures });
        self.resolve_internal(t.child, outcome);
    }

    // -- assimilation -------------------------------------------------------

    /// Adopts a foreign value that can register completion callbacks.
    pub fn adopt<T: Thenable + 'static>(&mut self, thenable: T) -> RefHandle {
        let inner = self.pending_record();
        let completion = self.assimilation.issue(inner);
        let ticket = completion.ticket();
        let handle = self.settled_record(Descriptor::Adopted { inner });
        self.witness
            .record(WitnessEvent::AdoptedCreated { handle, ticket });
        Box::new(thenable).subscribe(completion);
        handle
    }

    /// Adopts a foreign value whose outcome is polled for at turn
    /// boundaries.
    pub fn adopt_source(&mut self, source: Box<dyn CompletionSource>) -> RefHandle {
        let inner = self.pending_record();
        let completion = self.assimilation.issue(inner);
        let ticket = completion.ticket();
        self.assimilation.attach_source(ticket, source);
        let handle = self.settled_record(Descriptor::Adopted { inner });
        self.witness
            .record(WitnessEvent::AdoptedCreated { handle, ticket });
        handle
    }

    /// Adopts an arbitrary foreign value through the adapter registry.
    /// Fails if no registered adapter recognizes its shape.
    pub fn adopt_foreign(&mut self, foreign: &mut dyn Any) -> Result<RefHandle, RefError> {
        let inner = self.pending_record();
        let completion = self.assimilation.issue(inner);
        let ticket = completion.ticket();
        let mut binding = AdoptionBinding::new(completion);
        match self.assimilation.registry.adopt(foreign, &mut binding) {
            None => {
                self.assimilation.revoke(ticket);
                Err(RefError::NoAdapter)
            }
            Some(adapter) => {
                if let Some(source) = binding.take_source() {
                    self.assimilation.attach_source(ticket, source);
                }
                let handle = self.settled_record(Descriptor::Adopted { inner });
                self.witness
                    .record(WitnessEvent::AdoptedCreated { handle, ticket });
                tracing::debug!(adapter, %handle, "foreign value adopted");
                Ok(handle)
            }
        }
    }

    /// Polls foreign completion sources and applies buffered outcomes.
    pub fn pump_completions(&mut self) {
        self.assimilation.poll_sources();
        for (ticket, handle, outcome) in self.assimilation.take_completed() {
            self.witness.record(WitnessEvent::TicketSettled {
                ticket,
                won: outcome.is_ok(),
            });
            self.resolve_internal(handle, outcome);
        }
    }

    // -- turn execution -----------------------------------------------------

    /// Executes one turn. Returns false when nothing was ready.
    pub fn step_turn(&mut self) -> bool {
        self.pump_completions();
        let Some(turn) = self.scheduler.take_next() else {
            return false;
        };
        self.witness.record(WitnessEvent::SendDelivered {
            seq: turn.seq,
            target: turn.target,
            op: turn.send.op.name().to_string(),
        });
        self.deliver(turn.target, turn.send);
        true
    }

    /// Steps turns until the queue drains or the configured turn budget
    /// is spent. Foreign sources that have not yielded yet do not keep
    /// this running; check [`Self::has_pending_work`] and pump again.
    pub fn run_until_idle(&mut self) -> RunReport {
        let mut turns = 0;
        while turns < self.config.turn_budget {
            if !self.step_turn() {
                return RunReport { turns, idle: true };
            }
            turns += 1;
        }
        RunReport {
            turns,
            idle: !self.has_pending_work(),
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.scheduler.pending() > 0 || self.assimilation.has_pending()
    }

    // -- delivery -----------------------------------------------------------

    fn deliver(&mut self, target: RefHandle, send: SendRecord) {
        enum Route {
            Cycle,
            Pending(usize),
            Settled(Descriptor),
        }
        let mut current = target;
        let mut hops = 0usize;
        let route = loop {
            if hops > self.records.len() {
                break Route::Cycle;
            }
            match &self.records[current.0 as usize].state {
                RefState::Forwarded { target: next } => {
                    current = *next;
                    hops += 1;
                }
                RefState::Pending { queue } => break Route::Pending(queue.len()),
                RefState::Settled { descriptor } => break Route::Settled(descriptor.clone()),
            }
        };
        match route {
            Route::Cycle => self.complete(
                send.continuation,
                Err(Reason::message("reference forwarding cycle detected")),
            ),
            Route::Pending(depth) => {
                if depth >= self.config.max_pending_sends {
                    self.complete(
                        send.continuation,
                        Err(Reason::message(
                            "too many sends queued against a pending reference",
                        )),
                    );
                } else {
                    if let RefState::Pending { queue } = &mut self.records[current.0 as usize].state
                    {
                        queue.push_back(send);
                    }
                    self.witness.record(WitnessEvent::SendParked {
                        handle: current,
                        depth: depth + 1,
                    });
                }
            }
            Route::Settled(descriptor) => self.deliver_settled(current, descriptor, send),
        }
    }

    fn deliver_settled(&mut self, target: RefHandle, descriptor: Descriptor, send: SendRecord) {
        match descriptor {
            Descriptor::Failure(reason) => self.complete(send.continuation, Err(reason)),
            Descriptor::Immediate(value) => {
                if send.op == Op::When {
                    self.complete(send.continuation, Ok(value));
                    return;
                }
                // put/del mutate the stored value in place.
                let outcome = {
                    let Self {
                        records, closures, ..
                    } = self;
                    match &mut records[target.0 as usize].state {
                        RefState::Settled {
                            descriptor: Descriptor::Immediate(stored),
                        } => eval_immediate(&send.op, stored, &send.args, closures),
                        _ => Err(Reason::unsupported(send.op.name())),
                    }
                };
                self.complete(send.continuation, outcome);
            }
            Descriptor::Custom(custom) => {
                let outcome = match custom.table.get(&send.op).copied() {
                    Some(id) => self.call_closure(id, &send.args),
                    None => match custom.fallback {
                        Some(id) => {
                            let mut call_args = Vec::with_capacity(send.args.len() + 1);
                            call_args.push(Value::str(send.op.name()));
                            call_args.extend(send.args.iter().cloned());
                            self.call_closure(id, &call_args)
                        }
                        None => Err(Reason::unsupported(send.op.name())),
                    },
                };
                self.complete(send.continuation, outcome);
            }
            Descriptor::Adopted { inner } => {
                if send.op == Op::When {
                    self.deliver(inner, send);
                } else {
                    self.complete(
                        send.continuation,
                        Err(Reason::message(format!(
                            "operation {} not supported by adopted foreign reference",
                            send.op
                        ))),
                    );
                }
            }
            Descriptor::LocalOnly { inner } => {
                if send.op == Op::IsLocal {
                    self.complete(send.continuation, Ok(Value::Undefined));
                } else {
                    self.deliver(inner, send);
                }
            }
        }
    }

    fn call_closure(&mut self, id: ClosureId, args: &[Value]) -> Result<Value, Reason> {
        match self.closures.get(id) {
            Some(f) => f(args),
            None => Err(Reason::message(format!("{id} is not a registered closure"))),
        }
    }

    fn complete(&mut self, continuation: Continuation, outcome: Result<Value, Reason>) {
        match continuation {
            Continuation::Reply(reply) => {
                self.resolve_internal(reply, outcome);
            }
            Continuation::Observer { cell, child } => self.fire_observer(cell, child, outcome),
            Continuation::Join { tracker, index } => self.record_join(tracker, index, outcome),
            Continuation::JoinFinish { tracker } => self.finish_join(tracker),
        }
    }

    // -- classifiers --------------------------------------------------------

    /// Whether the value is an eventual reference rather than a plain
    /// terminal value.
    pub fn is_reference(&self, value: &Value) -> bool {
        value.is_reference()
    }

    /// Whether the value is settled: plain values always are, references
    /// once they have a terminal outcome. A custom reference with no raw
    /// accessor never classifies as settled.
    pub fn is_settled(&self, value: &Value) -> bool {
        self.settlement(value).is_some()
    }

    pub fn is_succeeded(&self, value: &Value) -> bool {
        matches!(self.settlement(value), Some(Ok(_)))
    }

    pub fn is_failed(&self, value: &Value) -> bool {
        matches!(self.settlement(value), Some(Err(_)))
    }

    /// The settled value, when the value classifies as succeeded.
    pub fn settled_value(&self, value: &Value) -> Option<Value> {
        self.settlement(value).and_then(Result::ok)
    }

    /// The failure reason, when the value classifies as failed.
    pub fn failure_reason(&self, value: &Value) -> Option<Reason> {
        self.settlement(value).and_then(|outcome| outcome.err())
    }

    fn settlement(&self, value: &Value) -> Option<Result<Value, Reason>> {
        let mut current = value.clone();
        let mut hops = 0usize;
        loop {
            if hops > self.records.len() {
                return None;
            }
            match current {
                Value::Ref(handle) => match self.terminal_descriptor(handle)? {
                    Descriptor::Immediate(v) => return Some(Ok(v.clone())),
                    Descriptor::Failure(r) => return Some(Err(r.clone())),
                    Descriptor::Custom(custom) => match &custom.raw {
                        None => return None,
                        Some(raw) => {
                            current = raw.clone();
                            hops += 1;
                        }
                    },
                    _ => return None,
                },
                other => return Some(Ok(other)),
            }
        }
    }

    fn terminal_descriptor(&self, handle: RefHandle) -> Option<&Descriptor> {
        let mut current = handle;
        let mut hops = 0usize;
        loop {
            if hops > self.records.len() {
                return None;
            }
            let record = self.records.get(current.0 as usize)?;
            match &record.state {
                RefState::Pending { .. } => return None,
                RefState::Forwarded { target } => {
                    current = *target;
                    hops += 1;
                }
                RefState::Settled { descriptor } => match descriptor {
                    Descriptor::Adopted { inner } | Descriptor::LocalOnly { inner } => {
                        current = *inner;
                        hops += 1;
                    }
                    terminal => return Some(terminal),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
