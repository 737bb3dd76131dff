//! Node kernel: slots, marker bits and the polymorphic tick dispatch.
//!
//! Every graph node is a slot in the registry arena. The slot carries the
//! adjacency lists and level the engines order by, plus a small set of
//! atomic marker bits the engines flip while a turn is running. The
//! node-specific update logic lives behind `NodeBehavior`.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::turn::Turn;
use crate::types::NodeId;

/// What a tick reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// The node produced a change; successors must be scheduled.
    Pulsed,
    /// No change; successors stay untouched.
    Idle,
}

/// Engine-private marker bits. One byte per node, mutated atomically so
/// parallel batches can flip them under the shared structural lock.
#[derive(Debug, Default)]
pub(crate) struct NodeState(AtomicU8);

pub(crate) const QUEUED: u8 = 1 << 0;
pub(crate) const MARKED: u8 = 1 << 1;
pub(crate) const CHANGED: u8 = 1 << 2;

impl NodeState {
    /// Sets `bit` and returns true if it was previously clear.
    pub fn set(&self, bit: u8) -> bool {
        self.0.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn clear(&self, bit: u8) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_set(&self, bit: u8) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// One arena slot. `preds`/`succs` and `level` are guarded by the
/// registry's structural lock; `state` and `counter` are atomics the
/// engines own during propagation.
pub(crate) struct NodeSlot {
    pub behavior: Arc<dyn NodeBehavior>,
    pub preds: Vec<NodeId>,
    pub succs: Vec<NodeId>,
    pub level: u32,
    pub state: NodeState,
    /// Pending-predecessor counter used by the pulse-count and subtree
    /// engines.
    pub counter: AtomicI64,
    pub input: bool,
    pub observer: bool,
}

impl NodeSlot {
    pub fn new(behavior: Arc<dyn NodeBehavior>, preds: Vec<NodeId>, level: u32) -> Self {
        Self {
            behavior,
            preds,
            succs: Vec::new(),
            level,
            state: NodeState::default(),
            counter: AtomicI64::new(0),
            input: false,
            observer: false,
        }
    }
}

/// A dynamic re-parent requested from inside a tick. Ticks run under the
/// shared structural lock, so the swap itself is deferred to the engine,
/// which applies it under the write lock once the batch has joined.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShiftRequest {
    pub node: NodeId,
    pub old_parent: NodeId,
    pub new_parent: NodeId,
}

/// Collects shift requests emitted by the ticks of one batch.
#[derive(Default)]
pub(crate) struct ShiftSink {
    requests: Mutex<Vec<ShiftRequest>>,
}

impl ShiftSink {
    pub fn push(&self, request: ShiftRequest) {
        self.requests.lock().push(request);
    }

    pub fn drain(&self) -> Vec<ShiftRequest> {
        std::mem::take(&mut *self.requests.lock())
    }
}

/// Per-tick context handed to a node's update logic. The only structural
/// mutations reachable from here are the deferred ones the turn commits
/// later: shifts, observer detaches and continuation inputs.
pub struct TickCtx<'a> {
    pub(crate) node: NodeId,
    pub(crate) turn: &'a Turn,
    pub(crate) shifts: &'a ShiftSink,
}

impl TickCtx<'_> {
    pub fn turn(&self) -> &Turn {
        self.turn
    }

    pub(crate) fn request_shift(&self, old_parent: NodeId, new_parent: NodeId) {
        self.shifts.push(ShiftRequest {
            node: self.node,
            old_parent,
            new_parent,
        });
    }

    /// Queue the ticking node for removal at end of turn.
    pub(crate) fn defer_detach(&self) {
        self.turn.queue_for_detach(self.node);
    }
}

/// Node-specific update logic, dispatched by the engines.
pub(crate) trait NodeBehavior: Send + Sync + 'static {
    /// Runs the node's update and reports whether it produced a change.
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult;

    /// Static fan-in for operator nodes, 0 for inputs.
    fn dependency_count(&self) -> usize {
        0
    }

    /// Input-stage hook: commit pending input for this turn. Returns true
    /// if the node accepted new data and must be announced through
    /// `on_turn_input_change`.
    fn apply_input(&self, turn: &Turn) -> bool {
        let _ = turn;
        false
    }
}
