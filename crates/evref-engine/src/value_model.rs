//! Message-level value model for eventual-reference traffic.
//!
//! Every operation dispatched against a reference carries [`Value`]
//! arguments and settles to a [`Value`] outcome. References and native
//! closures appear inside values by handle (`Value::Ref`,
//! `Value::Closure`), so the enum stays cheap to clone, structurally
//! comparable, and serde-serializable; the closures themselves live in an
//! engine-owned [`ClosureTable`].

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::failure::Reason;

// ---------------------------------------------------------------------------
// RefHandle — names a reference record inside an engine
// ---------------------------------------------------------------------------

/// Handle to a reference record owned by a `RefEngine`.
///
/// Handles are assigned sequentially and are only meaningful against the
/// engine that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefHandle(pub u32);

impl fmt::Display for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ClosureId — names a registered native closure
// ---------------------------------------------------------------------------

/// Handle to a native closure registered in a [`ClosureTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClosureId(pub u32);

impl fmt::Display for ClosureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "closure({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Value — the self-describing message value
// ---------------------------------------------------------------------------

/// A message value.
///
/// `Undefined` and `Null` are distinct: property access against either
/// fails descriptively, and both classify as settled-succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An eventual reference, by handle.
    Ref(RefHandle),
    /// A native closure, by handle into the engine's closure table.
    Closure(ClosureId),
}

impl Value {
    /// Convenience constructor for string values.
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Builds a map value from key/value pairs.
    pub fn map<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self::Map(entries.into_iter().collect())
    }

    /// Whether this value is an eventual reference rather than a plain
    /// terminal value.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// Coarse type name, used in failure messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Ref(_) => "ref",
            Self::Closure(_) => "closure",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Ref(handle) => write!(f, "{handle}"),
            Self::Closure(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ClosureTable — engine-owned registry of native closures
// ---------------------------------------------------------------------------

/// A registered native closure: pure with respect to the engine, invoked
/// with the operation's argument slice.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, Reason>>;

/// Registry mapping [`ClosureId`]s to native closures.
///
/// Values carry closures by id so they stay comparable and serializable;
/// dispatch clones the `Rc` out of the table before invocation, so a
/// closure never observes the engine mid-borrow.
#[derive(Default)]
pub struct ClosureTable {
    next: u32,
    entries: BTreeMap<u32, NativeFn>,
}

impl ClosureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure and returns its handle.
    pub fn register<F>(&mut self, f: F) -> ClosureId
    where
        F: Fn(&[Value]) -> Result<Value, Reason> + 'static,
    {
        let id = ClosureId(self.next);
        self.next += 1;
        self.entries.insert(id.0, Rc::new(f));
        id
    }

    /// Looks up a closure, cloning the shared pointer.
    pub fn get(&self, id: ClosureId) -> Option<NativeFn> {
        self.entries.get(&id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ClosureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureTable")
            .field("registered", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
