//! Descriptor-backed dispatch: how a settled reference answers operations.
//!
//! A descriptor is the settled half of the reference contract. Built-in
//! kinds cover plain local values, terminal failures, adopted foreign
//! completions, and the local-only marker; `Custom` lets callers supply an
//! operation table with an optional fallback and raw-value accessor, which
//! is enough to make any object behave as a reference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::failure::Reason;
use crate::operation::Op;
use crate::value_model::{ClosureTable, RefHandle, Value};

// ---------------------------------------------------------------------------
// Descriptor — settled dispatch behavior
// ---------------------------------------------------------------------------

/// Caller-supplied operation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDescriptor {
    /// Handlers by operation name. A handler receives the operation's
    /// argument slice and returns the outcome.
    pub table: BTreeMap<Op, crate::value_model::ClosureId>,
    /// Invoked for operations absent from the table, with the operation
    /// name prepended to the arguments. Without a fallback, unknown
    /// operations fail as unsupported.
    pub fallback: Option<crate::value_model::ClosureId>,
    /// Current raw value, exposed to classifiers without deferral. A
    /// custom reference with no raw accessor never classifies as settled.
    pub raw: Option<Value>,
}

/// The settled behavior of a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    /// Terminal settled value; answers the built-in operation set
    /// directly against it.
    Immediate(Value),
    /// Terminal failure; `when` routes the reason to the losing
    /// continuation, every other operation fails with the same reason.
    Failure(Reason),
    /// Caller-supplied operation table.
    Custom(CustomDescriptor),
    /// Adopted foreign completion. Only `when` is supported; it forwards
    /// to the inner reference that the foreign outcome resolves.
    Adopted { inner: RefHandle },
    /// Local-only marker: answers the `is_local` probe without failing
    /// and forwards everything else to the wrapped reference. Annotation
    /// only — it exists so a serialization layer can refuse to transfer
    /// the wrapped object off-process.
    LocalOnly { inner: RefHandle },
}

impl Descriptor {
    /// Raw-accessor: the current terminal value, if this descriptor
    /// exposes one without deferral.
    pub fn raw(&self) -> Option<&Value> {
        match self {
            Self::Immediate(value) => Some(value),
            Self::Custom(custom) => custom.raw.as_ref(),
            Self::Failure(_) | Self::Adopted { .. } | Self::LocalOnly { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Immediate-value operation evaluation
// ---------------------------------------------------------------------------

fn property_name(args: &[Value]) -> Result<String, Reason> {
    match args.first() {
        Some(Value::Str(name)) => Ok(name.clone()),
        Some(other) => Err(Reason::message(format!(
            "property name must be a string, got {other}"
        ))),
        None => Err(Reason::message("property name argument is missing")),
    }
}

/// Evaluates a non-`when` built-in operation against an immediate value.
///
/// `target` is the value wrapped by the settled descriptor; `put` and
/// `del` mutate its properties in place (the settlement itself — which
/// descriptor the reference carries — never changes).
pub(crate) fn eval_immediate(
    op: &Op,
    target: &mut Value,
    args: &[Value],
    closures: &ClosureTable,
) -> Result<Value, Reason> {
    match op {
        Op::Get => {
            let name = property_name(args)?;
            match target {
                Value::Undefined | Value::Null => Err(Reason::message(format!(
                    "cannot access property {name} of {target}"
                ))),
                Value::Map(entries) => Ok(entries.get(&name).cloned().unwrap_or(Value::Undefined)),
                other => Err(Reason::message(format!(
                    "cannot access property {name} of {other}"
                ))),
            }
        }
        Op::Put => {
            let name = property_name(args)?;
            let value = args.get(1).cloned().unwrap_or(Value::Undefined);
            match target {
                Value::Map(entries) => {
                    entries.insert(name, value.clone());
                    Ok(value)
                }
                other => Err(Reason::message(format!(
                    "cannot set property {name} of {other} to {value}"
                ))),
            }
        }
        Op::Del => {
            let name = property_name(args)?;
            match target {
                Value::Map(entries) => {
                    entries.remove(&name);
                    Ok(Value::Bool(true))
                }
                other => Err(Reason::message(format!(
                    "cannot delete property {name} of {other}"
                ))),
            }
        }
        Op::Post => {
            let name = property_name(args)?;
            let call_args = match args.get(1) {
                Some(Value::List(items)) => items.clone(),
                Some(other) => {
                    return Err(Reason::message(format!(
                        "invocation arguments must be a list, got {other}"
                    )));
                }
                None => vec![],
            };
            let member = match target {
                Value::Undefined | Value::Null => {
                    return Err(Reason::message(format!("{target} has no methods")));
                }
                Value::Map(entries) => entries.get(&name).cloned(),
                _ => None,
            };
            match member {
                None => Err(Reason::message(format!(
                    "no such method {name} on {target}"
                ))),
                Some(Value::Closure(id)) => match closures.get(id) {
                    Some(f) => f(&call_args),
                    None => Err(Reason::message(format!("{id} is not a registered closure"))),
                },
                Some(_) => Err(Reason::message(format!(
                    "property {name} of {target} is not a method"
                ))),
            }
        }
        Op::Keys => match target {
            Value::Undefined | Value::Null => Err(Reason::message(format!(
                "cannot enumerate properties of {target}"
            ))),
            Value::Map(entries) => Ok(Value::List(
                entries.keys().cloned().map(Value::Str).collect(),
            )),
            _ => Ok(Value::List(vec![])),
        },
        // `when` is handled by the engine before reaching here.
        Op::When | Op::IsLocal | Op::Custom(_) => Err(Reason::unsupported(op.name())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
