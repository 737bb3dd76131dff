//! reflow-core: a reactive dataflow runtime.
//!
//! Applications build a DAG of signal, event-stream and observer nodes;
//! input enters through transactions, each of which becomes one *turn*.
//! The propagation engine visits affected nodes in a valid order and
//! guarantees glitch-free, serializable observation of changes, with
//! optional intra-turn parallelism on a worker pool.

pub mod domain;
pub mod engine;
pub mod error;
pub mod graph;
pub mod nodes;
pub mod types;

pub use domain::{Domain, TransactionCtx};
pub use engine::PropagationEngine;
pub use error::{ReflowError, Result};
pub use graph::{TickResult, Turn};
pub use nodes::{EventSource, Events, Observer, ObserverAction, ObserverCtx, Signal, VarSignal};
pub use types::{ConcurrencyMode, DomainConfig, EngineKind, NodeId, TurnFlags, TurnId};
