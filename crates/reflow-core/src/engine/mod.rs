//! Engine interface and the shared tick dispatch.
//!
//! The node kernel talks to the engine through a fixed set of hooks fired
//! on structural and propagation events. Everything behind the hooks
//! (ready queues, counters, worker pools) is private to the engine.

mod pulsecount;
mod subtree;
mod toposort;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::trace;

use crate::error::{ReflowError, Result};
use crate::graph::node::{ShiftSink, TickCtx, TickResult};
use crate::graph::registry::NodeRegistry;
use crate::graph::turn::Turn;
use crate::types::{ConcurrencyMode, EngineKind, NodeId};

pub(crate) use pulsecount::PulsecountEngine;
pub(crate) use subtree::SubtreeEngine;
pub(crate) use toposort::ToposortEngine;

/// Hooks the graph invokes on structural and propagation events.
pub trait PropagationEngine: Send + Sync + 'static {
    fn on_node_create(&self, _node: NodeId) {}
    fn on_node_destroy(&self, _node: NodeId) {}
    fn on_node_attach(&self, _node: NodeId, _parent: NodeId) {}
    fn on_node_detach(&self, _node: NodeId, _parent: NodeId) {}
    /// A node re-parented dynamically while a turn was running.
    fn on_node_shift(&self, _node: NodeId, _old_parent: NodeId, _new_parent: NodeId, _turn: &Turn) {
    }

    fn on_turn_admission_start(&self, _turn: &Turn) {}
    fn on_turn_admission_end(&self, _turn: &Turn) {}
    /// An input node accepted new data during admission.
    fn on_turn_input_change(&self, node: NodeId, turn: &Turn);
    /// Runs the propagation loop until fixed point or failure.
    fn on_turn_propagate(&self, turn: &Turn) -> Result<()>;
    fn on_turn_end(&self, _turn: &Turn) {}

    fn on_node_pulse(&self, node: NodeId, turn: &Turn);
    fn on_node_idle_pulse(&self, _node: NodeId, _turn: &Turn) {}
}

pub(crate) fn build_engine(
    kind: EngineKind,
    mode: ConcurrencyMode,
    registry: Arc<NodeRegistry>,
    pool: Option<Arc<rayon::ThreadPool>>,
) -> Arc<dyn PropagationEngine> {
    match kind {
        EngineKind::Toposort => Arc::new(ToposortEngine::new(registry, mode, pool)),
        EngineKind::Pulsecount => Arc::new(PulsecountEngine::new(registry, mode, pool)),
        EngineKind::Subtree => Arc::new(SubtreeEngine::new(registry, mode, pool)),
    }
}

/// Runs one node's tick under the shared structural lock and reports the
/// outcome through the pulse hooks. A panic in user update logic surfaces
/// as a turn failure.
pub(crate) fn run_node_tick(
    registry: &NodeRegistry,
    engine: &dyn PropagationEngine,
    node: NodeId,
    turn: &Turn,
    shifts: &ShiftSink,
) -> Result<TickResult> {
    let guard = registry.read();
    let Some(slot) = guard.slot(node) else {
        // The node went away between scheduling and execution; nothing to do.
        return Ok(TickResult::Idle);
    };
    let behavior = slot.behavior.clone();
    let mut ctx = TickCtx { node, turn, shifts };
    let outcome = catch_unwind(AssertUnwindSafe(|| behavior.tick(&mut ctx)));
    drop(guard);

    match outcome {
        Ok(TickResult::Pulsed) => {
            trace!(node = %node, turn = turn.id(), "pulse");
            engine.on_node_pulse(node, turn);
            Ok(TickResult::Pulsed)
        }
        Ok(TickResult::Idle) => {
            trace!(node = %node, turn = turn.id(), "idle pulse");
            engine.on_node_idle_pulse(node, turn);
            Ok(TickResult::Idle)
        }
        Err(payload) => Err(ReflowError::TurnFailed {
            turn: turn.id(),
            reason: panic_reason(payload),
        }),
    }
}

pub(crate) fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "tick panicked".to_string()
    }
}

/// Batch-ready queue keyed by node level; the toposort and subtree
/// engines drain it lowest level first.
#[derive(Default)]
pub(crate) struct LevelQueue {
    levels: std::collections::BTreeMap<u32, Vec<NodeId>>,
}

impl LevelQueue {
    pub fn push(&mut self, node: NodeId, level: u32) {
        self.levels.entry(level).or_default().push(node);
    }

    /// Removes and returns the entire batch at the minimum level.
    pub fn pop_min(&mut self) -> Option<(u32, Vec<NodeId>)> {
        let level = *self.levels.keys().next()?;
        let nodes = self.levels.remove(&level)?;
        Some((level, nodes))
    }

    pub fn clear(&mut self) -> Vec<NodeId> {
        let mut drained = Vec::new();
        for (_, mut nodes) in std::mem::take(&mut self.levels) {
            drained.append(&mut nodes);
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[cfg(test)]
pub(crate) struct NullEngine;

#[cfg(test)]
impl PropagationEngine for NullEngine {
    fn on_turn_input_change(&self, _node: NodeId, _turn: &Turn) {}

    fn on_turn_propagate(&self, _turn: &Turn) -> Result<()> {
        Ok(())
    }

    fn on_node_pulse(&self, _node: NodeId, _turn: &Turn) {}
}
