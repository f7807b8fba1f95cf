//! Reference lifecycle integration: creation, resolution, forwarding,
//! and FIFO replay of sends recorded while pending.

use evref_engine::{Reason, RefEngine, RefHandle, Value};
use std::cell::RefCell;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// 1. Settlement timing
// ---------------------------------------------------------------------------

#[test]
fn settlement_never_happens_in_the_calling_turn() {
    let mut engine = RefEngine::new();
    let target = engine.immediate(Value::Int(1)).expect("immediate");
    let reply = engine.when(target).expect("when");
    // The target was settled before the send, yet the reply is not.
    assert!(!engine.is_settled(&Value::Ref(reply)));
    engine.run_until_idle();
    assert_eq!(
        engine.settled_value(&Value::Ref(reply)),
        Some(Value::Int(1))
    );
}

#[test]
fn observer_never_fires_in_the_registering_turn() {
    let mut engine = RefEngine::new();
    let fired = Rc::new(RefCell::new(false));
    let target = engine.immediate(Value::Int(1)).expect("immediate");
    let flag = Rc::clone(&fired);
    engine
        .observe(target, move |value| {
            *flag.borrow_mut() = true;
            Ok(value)
        })
        .expect("observe");
    assert!(!*fired.borrow());
    engine.run_until_idle();
    assert!(*fired.borrow());
}

// ---------------------------------------------------------------------------
// 2. Resolution
// ---------------------------------------------------------------------------

#[test]
fn first_resolution_wins_and_later_attempts_change_nothing() {
    let mut engine = RefEngine::new();
    let d = engine.deferred();
    assert!(engine.resolve(&d, Value::str("first")).expect("resolve"));
    assert!(!engine.resolve(&d, Value::str("second")).expect("resolve"));
    assert!(!engine.reject(&d, Reason::message("late")).expect("reject"));
    engine.run_until_idle();
    assert_eq!(engine.settled_value(&d.value()), Some(Value::str("first")));
}

#[test]
fn rejection_settles_as_failed_with_the_given_reason() {
    let mut engine = RefEngine::new();
    let d = engine.deferred();
    let reply = engine.when(d.handle()).expect("when");
    engine.reject(&d, Reason::message("no dice")).expect("reject");
    engine.run_until_idle();
    assert!(engine.is_failed(&d.value()));
    assert_eq!(
        engine.failure_reason(&Value::Ref(reply)),
        Some(Reason::message("no dice"))
    );
}

#[test]
fn resolving_with_a_reference_forwards_through_it() {
    let mut engine = RefEngine::new();
    let outer = engine.deferred();
    let middle = engine.deferred();
    let inner = engine.deferred();
    let reply = engine.get(outer.handle(), "x").expect("get");

    engine.resolve(&outer, middle.value()).expect("outer");
    engine.resolve(&middle, inner.value()).expect("middle");
    engine.run_until_idle();
    assert!(!engine.is_settled(&Value::Ref(reply)));

    engine
        .resolve(&inner, Value::map([("x".to_string(), Value::Int(3))]))
        .expect("inner");
    engine.run_until_idle();
    assert_eq!(
        engine.settled_value(&Value::Ref(reply)),
        Some(Value::Int(3))
    );
    // The whole chain classifies off the terminal settlement.
    assert!(engine.is_succeeded(&outer.value()));
}

// ---------------------------------------------------------------------------
// 3. FIFO replay
// ---------------------------------------------------------------------------

#[test]
fn sends_recorded_while_pending_replay_in_arrival_order() {
    let mut engine = RefEngine::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let d = engine.deferred();
    // put, then get: the get must observe the put.
    let put = engine.put(d.handle(), "n", Value::Int(10)).expect("put");
    let get = engine.get(d.handle(), "n").expect("get");
    {
        let order = Rc::clone(&order);
        engine
            .observe(put, move |value| {
                order.borrow_mut().push(("put", value.clone()));
                Ok(value)
            })
            .expect("observe put");
    }
    {
        let order = Rc::clone(&order);
        engine
            .observe(get, move |value| {
                order.borrow_mut().push(("get", value.clone()));
                Ok(value)
            })
            .expect("observe get");
    }
    engine
        .resolve(&d, Value::map([("n".to_string(), Value::Int(0))]))
        .expect("resolve");
    engine.run_until_idle();
    assert_eq!(
        *order.borrow(),
        vec![("put", Value::Int(10)), ("get", Value::Int(10))]
    );
}

// ---------------------------------------------------------------------------
// 4. Deterministic replay
// ---------------------------------------------------------------------------

fn scripted_run() -> RefEngine {
    let mut engine = RefEngine::new();
    let d = engine.deferred();
    let reply = engine.get(d.handle(), "k").expect("get");
    engine
        .observe(reply, |value| Ok(value))
        .expect("observe");
    let failed = engine.failed(Reason::message("boom"));
    engine
        .observe_losing(failed, |_| Ok(Value::str("recovered")))
        .expect("observe_losing");
    engine
        .join_all(vec![d.value(), Value::Int(2)])
        .expect("join");
    engine
        .resolve(&d, Value::map([("k".to_string(), Value::Int(1))]))
        .expect("resolve");
    engine.run_until_idle();
    engine
}

#[test]
fn identical_scripts_produce_identical_witness_logs() {
    let mut first = scripted_run();
    let mut second = scripted_run();
    assert_eq!(first.drain_witness(), second.drain_witness());
}

// ---------------------------------------------------------------------------
// 5. Handles and misuse
// ---------------------------------------------------------------------------

#[test]
fn out_of_range_handles_are_refused() {
    let mut issuer = RefEngine::new();
    let mut other = RefEngine::new();
    let d = issuer.deferred();
    assert!(other.when(RefHandle(5)).is_err());
    // `other` issued no records, so the foreign Deferred is out of range.
    assert!(other.resolve(&d, Value::Int(1)).is_err());
}
