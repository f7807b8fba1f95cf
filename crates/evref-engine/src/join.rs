//! Join trackers: wait for several references, then combine.
//!
//! A tracker owns one slot per joined element. Outcomes arrive through
//! `Join` continuations in any order; the tracker settles only once every
//! slot is filled. All failures are collected — the composite reason
//! names each failed index — rather than short-circuiting on the first.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::failure::Reason;
use crate::value_model::{RefHandle, Value};

/// Names one in-flight join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JoinId(pub u32);

impl fmt::Display for JoinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join({})", self.0)
    }
}

/// Combiner applied to the collected values once every element wins.
pub type CombineFn = Box<dyn FnOnce(Vec<Value>) -> Result<Value, Reason>>;

/// Collects per-index outcomes for one join.
pub(crate) struct JoinTracker {
    pub(crate) child: RefHandle,
    slots: Vec<Option<Value>>,
    reasons: BTreeMap<usize, Reason>,
    remaining: usize,
    combine: Option<CombineFn>,
}

impl fmt::Debug for JoinTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinTracker")
            .field("child", &self.child)
            .field("slots", &self.slots)
            .field("reasons", &self.reasons)
            .field("remaining", &self.remaining)
            .field("combine", &self.combine.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl JoinTracker {
    pub(crate) fn new(child: RefHandle, width: usize, combine: CombineFn) -> Self {
        Self {
            child,
            slots: (0..width).map(|_| None).collect(),
            reasons: BTreeMap::new(),
            remaining: width,
            combine: Some(combine),
        }
    }

    pub(crate) fn failures(&self) -> usize {
        self.reasons.len()
    }

    /// Records one element outcome. Returns true once every slot has an
    /// outcome. A slot settles at most once; repeats are ignored.
    pub(crate) fn record(&mut self, index: usize, outcome: Result<Value, Reason>) -> bool {
        let already = index >= self.slots.len()
            || self.slots[index].is_some()
            || self.reasons.contains_key(&index);
        if !already {
            match outcome {
                Ok(value) => self.slots[index] = Some(value),
                Err(reason) => {
                    self.reasons.insert(index, reason);
                }
            }
            self.remaining -= 1;
        }
        self.remaining == 0
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    /// Produces the join outcome. All wins: the combiner runs over the
    /// values in element order. Any failure: a composite reason naming
    /// every failed index. Consumes the combiner; callable once.
    pub(crate) fn settle(&mut self) -> Result<Value, Reason> {
        if !self.reasons.is_empty() {
            return Err(Reason::joined(std::mem::take(&mut self.reasons)));
        }
        let values: Vec<Value> = self
            .slots
            .iter_mut()
            .map(|slot| slot.take().unwrap_or(Value::Undefined))
            .collect();
        match self.combine.take() {
            Some(combine) => combine(values),
            None => Ok(Value::Undefined),
        }
    }
}

/// Storage for in-flight joins.
#[derive(Debug, Default)]
pub(crate) struct JoinTable {
    trackers: BTreeMap<JoinId, JoinTracker>,
    next: u32,
}

impl JoinTable {
    pub(crate) fn insert(&mut self, child: RefHandle, width: usize, combine: CombineFn) -> JoinId {
        let id = JoinId(self.next);
        self.next += 1;
        self.trackers
            .insert(id, JoinTracker::new(child, width, combine));
        id
    }

    pub(crate) fn get_mut(&mut self, id: JoinId) -> Option<&mut JoinTracker> {
        self.trackers.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: JoinId) -> Option<JoinTracker> {
        self.trackers.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.trackers.len()
    }
}
