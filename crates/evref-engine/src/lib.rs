//! Eventual references with turn-deferred dispatch.
//!
//! A reference names a value that may not exist yet. Operations against a
//! reference never run in the calling turn: they are recorded and
//! delivered when the host steps the engine, whether the reference is
//! already settled or still pending. Resolution is first-call-wins; sends
//! recorded while pending replay in FIFO order once the resolution target
//! is known.
//!
//! The crate is built around a single-owner [`RefEngine`]: it holds every
//! reference record, the injectable [`TurnScheduler`], the observer and
//! join combinators, and the adapter registry that assimilates foreign
//! asynchronous values. Failures travel as data ([`Reason`]) and only
//! become native errors through the explicit [`raise`] escape hatch.
//!
//! ```
//! use evref_engine::{RefEngine, Value};
//!
//! let mut engine = RefEngine::new();
//! let d = engine.deferred();
//! let reply = engine.get(d.handle(), "answer")?;
//! engine.resolve(&d, Value::map([("answer".to_string(), Value::Int(42))]))?;
//! engine.run_until_idle();
//! assert_eq!(engine.settled_value(&Value::Ref(reply)), Some(Value::Int(42)));
//! # Ok::<(), evref_engine::RefError>(())
//! ```

#![forbid(unsafe_code)]

pub mod assimilation;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod failure;
pub mod join;
pub mod operation;
pub mod reporter;
pub mod turn_queue;
pub mod value_model;
pub mod witness;

pub use assimilation::{
    AdapterRegistry, AdoptionBinding, AssimilationAdapter, ChannelAdapter, ChannelSource,
    Completion, CompletionSource, ReadyAdapter, ReadyThenable, Thenable, Ticket,
};
pub use config::EngineConfig;
pub use descriptor::{CustomDescriptor, Descriptor};
pub use engine::{Deferred, LoseCallback, ObserverId, RefEngine, RunReport, WinCallback};
pub use error::RefError;
pub use failure::{raise, Fault, Reason};
pub use join::{CombineFn, JoinId};
pub use operation::Op;
pub use reporter::{FailureReporter, RecordingReporter, TracingReporter};
pub use turn_queue::{Continuation, FifoTurnQueue, SendRecord, Turn, TurnScheduler};
pub use value_model::{ClosureId, ClosureTable, NativeFn, RefHandle, Value};
pub use witness::{ObserverBranch, WitnessEvent, WitnessLog};
