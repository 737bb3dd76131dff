//! Structural store for the node graph.
//!
//! One engine-wide reader/writer lock guards the arena: ticks and engine
//! traversals take it shared, edge changes and level bumps take it
//! exclusive. Marker bits and counters inside the slots are atomics, so
//! engines flip them while holding the shared lock.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::trace;

use crate::engine::PropagationEngine;
use crate::error::{ReflowError, Result};
use crate::graph::node::{NodeBehavior, NodeSlot, ShiftRequest, CHANGED, MARKED, QUEUED};
use crate::graph::turn::Turn;
use crate::types::NodeId;

pub(crate) struct Topology {
    slots: Vec<Option<NodeSlot>>,
    free: Vec<u32>,
}

impl Topology {
    pub fn slot(&self, node: NodeId) -> Option<&NodeSlot> {
        self.slots.get(node.index()).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, node: NodeId) -> Option<&mut NodeSlot> {
        self.slots.get_mut(node.index()).and_then(|s| s.as_mut())
    }

    /// True if `target` is reachable from `from` over successor edges.
    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut queue = VecDeque::from([from]);
        let mut seen = vec![false; self.slots.len()];
        while let Some(n) = queue.pop_front() {
            if n == target {
                return true;
            }
            if std::mem::replace(&mut seen[n.index()], true) {
                continue;
            }
            if let Some(slot) = self.slot(n) {
                queue.extend(slot.succs.iter().copied());
            }
        }
        false
    }

    /// Raises `start` to at least `to` and propagates the rise
    /// breadth-first so that level dominance holds for every edge.
    fn raise_level(&mut self, start: NodeId, to: u32) {
        let mut queue = VecDeque::from([(start, to)]);
        while let Some((n, level)) = queue.pop_front() {
            let Some(slot) = self.slot_mut(n) else { continue };
            if slot.level >= level {
                continue;
            }
            slot.level = level;
            let succs = slot.succs.clone();
            for s in succs {
                queue.push_back((s, level + 1));
            }
        }
    }

    fn add_edge(&mut self, child: NodeId, parent: NodeId) {
        if let Some(slot) = self.slot_mut(child) {
            slot.preds.push(parent);
        }
        if let Some(slot) = self.slot_mut(parent) {
            slot.succs.push(child);
        }
    }

    fn remove_edge(&mut self, child: NodeId, parent: NodeId) {
        if let Some(slot) = self.slot_mut(child) {
            slot.preds.retain(|&p| p != parent);
        }
        if let Some(slot) = self.slot_mut(parent) {
            slot.succs.retain(|&s| s != child);
        }
    }
}

pub(crate) struct NodeRegistry {
    inner: RwLock<Topology>,
}

pub(crate) struct NodeOpts {
    pub input: bool,
    pub observer: bool,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Topology {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.inner.read()
    }

    /// Allocates a slot wired to `preds` and announces it to the engine.
    /// New nodes sit one level above their highest predecessor.
    pub fn insert(
        &self,
        behavior: Arc<dyn NodeBehavior>,
        preds: Vec<NodeId>,
        opts: NodeOpts,
        engine: &dyn PropagationEngine,
    ) -> NodeId {
        let id = {
            let mut g = self.inner.write();
            let level = preds
                .iter()
                .filter_map(|&p| g.slot(p).map(|s| s.level + 1))
                .max()
                .unwrap_or(0);
            let mut slot = NodeSlot::new(behavior, preds.clone(), level);
            slot.input = opts.input;
            slot.observer = opts.observer;

            let id = match g.free.pop() {
                Some(idx) => {
                    g.slots[idx as usize] = Some(slot);
                    NodeId(idx)
                }
                None => {
                    g.slots.push(Some(slot));
                    NodeId((g.slots.len() - 1) as u32)
                }
            };
            for &p in &preds {
                if let Some(parent) = g.slot_mut(p) {
                    parent.succs.push(id);
                }
            }
            id
        };
        engine.on_node_create(id);
        for p in self.preds_of(id) {
            engine.on_node_attach(id, p);
        }
        trace!(node = %id, "node created");
        id
    }

    /// Adds the edge `parent -> child`. Rejects edges that would close a
    /// cycle, leaving the graph untouched; duplicate edges are a no-op.
    pub fn attach(
        &self,
        child: NodeId,
        parent: NodeId,
        engine: &dyn PropagationEngine,
    ) -> Result<()> {
        {
            let mut g = self.inner.write();
            if g.slot(child).is_none() || g.slot(parent).is_none() {
                return Err(ReflowError::InvalidStructuralOp(format!(
                    "attach on unknown node ({child} under {parent})"
                )));
            }
            if g.slot(child).map(|s| s.preds.contains(&parent)) == Some(true) {
                return Ok(());
            }
            if child == parent || g.reaches(child, parent) {
                return Err(ReflowError::CycleDetected { child, parent });
            }
            g.add_edge(child, parent);
            let parent_level = g.slot(parent).map(|s| s.level).unwrap_or(0);
            let child_level = g.slot(child).map(|s| s.level).unwrap_or(0);
            if parent_level >= child_level {
                g.raise_level(child, parent_level + 1);
            }
        }
        engine.on_node_attach(child, parent);
        Ok(())
    }

    pub fn detach(
        &self,
        child: NodeId,
        parent: NodeId,
        engine: &dyn PropagationEngine,
    ) -> Result<()> {
        {
            let mut g = self.inner.write();
            if g.slot(child).is_none() || g.slot(parent).is_none() {
                return Err(ReflowError::InvalidStructuralOp(format!(
                    "detach on unknown node ({child} from {parent})"
                )));
            }
            g.remove_edge(child, parent);
        }
        engine.on_node_detach(child, parent);
        Ok(())
    }

    /// Removes a node outside any turn. Predecessor edges are strong, so
    /// a node with live successors cannot go away.
    pub fn destroy(&self, node: NodeId, engine: &dyn PropagationEngine) -> Result<()> {
        {
            let g = self.inner.read();
            let Some(slot) = g.slot(node) else {
                return Err(ReflowError::InvalidStructuralOp(format!(
                    "destroy on unknown node {node}"
                )));
            };
            if !slot.succs.is_empty() {
                return Err(ReflowError::InvalidStructuralOp(format!(
                    "destroy on {node} which still has successors"
                )));
            }
        }
        engine.on_node_destroy(node);
        let mut g = self.inner.write();
        let preds = g.slot(node).map(|s| s.preds.clone()).unwrap_or_default();
        for p in preds {
            g.remove_edge(node, p);
        }
        g.slots[node.index()] = None;
        g.free.push(node.0);
        trace!(node = %node, "node destroyed");
        Ok(())
    }

    /// Applies a dynamic re-parent requested during a tick. Called by the
    /// engine between batches, with no ticks in flight. Returns the
    /// node's level after the swap.
    pub fn apply_shift(&self, request: ShiftRequest) -> Result<u32> {
        let ShiftRequest {
            node,
            old_parent,
            new_parent,
        } = request;
        let mut g = self.inner.write();
        if node == new_parent || g.reaches(node, new_parent) {
            return Err(ReflowError::CycleDetected {
                child: node,
                parent: new_parent,
            });
        }
        g.remove_edge(node, old_parent);
        g.add_edge(node, new_parent);
        let parent_level = g.slot(new_parent).map(|s| s.level).unwrap_or(0);
        let node_level = g.slot(node).map(|s| s.level).unwrap_or(0);
        if parent_level >= node_level {
            g.raise_level(node, parent_level + 1);
        }
        Ok(g.slot(node).map(|s| s.level).unwrap_or(0))
    }

    /// Commits the turn's deferred observer detaches under the write
    /// lock, once no ticks are in flight (I5).
    pub fn commit_detaches(&self, turn: &Turn, engine: &dyn PropagationEngine) {
        let mut pending = turn.take_detached();
        if pending.is_empty() {
            return;
        }
        pending.sort_unstable();
        pending.dedup();
        {
            let mut g = self.inner.write();
            for &node in &pending {
                let Some(slot) = g.slot(node) else { continue };
                debug_assert!(slot.observer, "only observers defer detach");
                let preds = slot.preds.clone();
                for p in preds {
                    g.remove_edge(node, p);
                }
                g.slots[node.index()] = None;
                g.free.push(node.0);
            }
        }
        for node in pending {
            engine.on_node_destroy(node);
            trace!(node = %node, turn = turn.id(), "deferred detach committed");
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.read().slot(node).is_some()
    }

    /// True if `node` still holds exactly this behavior. Guards handle
    /// operations against slot reuse after the node was reclaimed.
    pub fn is_same_behavior(&self, node: NodeId, behavior: &Arc<dyn NodeBehavior>) -> bool {
        self.inner
            .read()
            .slot(node)
            .map(|s| Arc::ptr_eq(&s.behavior, behavior))
            .unwrap_or(false)
    }

    pub fn level_of(&self, node: NodeId) -> Option<u32> {
        self.inner.read().slot(node).map(|s| s.level)
    }

    pub fn succs_of(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .slot(node)
            .map(|s| s.succs.clone())
            .unwrap_or_default()
    }

    pub fn preds_of(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .read()
            .slot(node)
            .map(|s| s.preds.clone())
            .unwrap_or_default()
    }

    pub fn dependency_count_of(&self, node: NodeId) -> usize {
        self.inner
            .read()
            .slot(node)
            .map(|s| s.behavior.dependency_count())
            .unwrap_or(0)
    }

    pub fn is_input(&self, node: NodeId) -> bool {
        self.inner
            .read()
            .slot(node)
            .map(|s| s.input)
            .unwrap_or(false)
    }

    fn with_slot<R>(&self, node: NodeId, f: impl FnOnce(&NodeSlot) -> R) -> Option<R> {
        self.inner.read().slot(node).map(f)
    }

    /// Sets QUEUED; true if the node was not queued before.
    pub fn mark_queued(&self, node: NodeId) -> bool {
        self.with_slot(node, |s| s.state.set(QUEUED)).unwrap_or(false)
    }

    pub fn clear_queued(&self, node: NodeId) {
        self.with_slot(node, |s| s.state.clear(QUEUED));
    }

    /// Sets MARKED; true if newly marked.
    pub fn set_marked(&self, node: NodeId) -> bool {
        self.with_slot(node, |s| s.state.set(MARKED)).unwrap_or(false)
    }

    pub fn is_marked(&self, node: NodeId) -> bool {
        self.with_slot(node, |s| s.state.is_set(MARKED)).unwrap_or(false)
    }

    pub fn clear_marked(&self, node: NodeId) {
        self.with_slot(node, |s| s.state.clear(MARKED));
    }

    pub fn set_changed(&self, node: NodeId) {
        self.with_slot(node, |s| s.state.set(CHANGED));
    }

    pub fn is_changed(&self, node: NodeId) -> bool {
        self.with_slot(node, |s| s.state.is_set(CHANGED)).unwrap_or(false)
    }

    pub fn clear_changed(&self, node: NodeId) {
        self.with_slot(node, |s| s.state.clear(CHANGED));
    }

    /// Adjusts the pending-predecessor counter, returning the new value.
    pub fn counter_add(&self, node: NodeId, delta: i64) -> i64 {
        self.with_slot(node, |s| s.counter.fetch_add(delta, Ordering::AcqRel) + delta)
            .unwrap_or(0)
    }

    /// Clears every marker bit and counter. Used when a turn aborts.
    pub fn reset_markers(&self) {
        let g = self.inner.read();
        for slot in g.slots.iter().flatten() {
            slot.state.reset();
            slot.counter.store(0, Ordering::Release);
        }
    }

    /// Checks the structural invariants: the predecessor relation is
    /// acyclic and every edge satisfies level dominance.
    pub fn validate(&self) -> Result<()> {
        let g = self.inner.read();
        for (idx, slot) in g.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let id = NodeId(idx as u32);
            for &p in &slot.preds {
                let parent_level = g.slot(p).map(|s| s.level).unwrap_or(0);
                if slot.level <= parent_level {
                    return Err(ReflowError::InvalidStructuralOp(format!(
                        "level dominance violated on edge {p} -> {id}"
                    )));
                }
            }
        }
        // Level dominance over an edge relation implies acyclicity, but a
        // full reachability sweep keeps the check independent of it.
        for (idx, slot) in g.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let id = NodeId(idx as u32);
            for &s in &slot.succs {
                if g.reaches(s, id) {
                    return Err(ReflowError::CycleDetected {
                        child: s,
                        parent: id,
                    });
                }
            }
        }
        Ok(())
    }
}
