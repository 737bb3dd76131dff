use thiserror::Error;

use crate::types::{NodeId, TurnId};

#[derive(Debug, Error)]
pub enum ReflowError {
    /// Attaching `child` under `parent` would close a cycle. The graph is
    /// left unchanged.
    #[error("cycle detected: attaching {child} under {parent} would close a cycle")]
    CycleDetected { child: NodeId, parent: NodeId },

    /// A user callback panicked while the turn was propagating. The turn
    /// aborted cleanly: deferred detaches ran and successor turns were
    /// released.
    #[error("turn {turn} failed: {reason}")]
    TurnFailed { turn: TurnId, reason: String },

    /// A structural mutation was attempted from a context that is not
    /// allowed to perform it (e.g. destroying a node while a turn is live).
    #[error("invalid structural operation: {0}")]
    InvalidStructuralOp(String),

    #[error("engine initialization failed: {0}")]
    EngineInit(String),
}

pub type Result<T> = std::result::Result<T, ReflowError>;
