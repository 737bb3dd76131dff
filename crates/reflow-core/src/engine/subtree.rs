//! Subtree propagation.
//!
//! Confines each turn to the subgraph reachable from its changed inputs:
//! a mark pass fences off that region, then a level-ordered drain runs
//! inside it. Nothing outside the marked region is ever enqueued or
//! ticked, which keeps localized updates localized even on huge graphs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::engine::{run_node_tick, LevelQueue, PropagationEngine};
use crate::error::Result;
use crate::graph::node::ShiftSink;
use crate::graph::registry::NodeRegistry;
use crate::graph::turn::Turn;
use crate::types::{ConcurrencyMode, NodeId};

pub(crate) struct SubtreeEngine {
    registry: Arc<NodeRegistry>,
    mode: ConcurrencyMode,
    pool: Option<Arc<rayon::ThreadPool>>,
    inputs: Mutex<Vec<NodeId>>,
    ready: Mutex<LevelQueue>,
    pulsed: Mutex<Vec<NodeId>>,
    /// Every node fenced into the current turn's region; swept at the end
    /// so marks from branches a pulse never reached do not leak.
    region: Mutex<Vec<NodeId>>,
    shifts: ShiftSink,
}

impl SubtreeEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        mode: ConcurrencyMode,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Self {
        Self {
            registry,
            mode,
            pool,
            inputs: Mutex::new(Vec::new()),
            ready: Mutex::new(LevelQueue::default()),
            pulsed: Mutex::new(Vec::new()),
            region: Mutex::new(Vec::new()),
            shifts: ShiftSink::default(),
        }
    }

    fn mark_region(&self, roots: &[NodeId]) {
        let mut region = self.region.lock();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for &root in roots {
            if self.registry.set_marked(root) {
                region.push(root);
                queue.push_back(root);
            }
        }
        while let Some(node) = queue.pop_front() {
            for succ in self.registry.succs_of(node) {
                if self.registry.set_marked(succ) {
                    region.push(succ);
                    queue.push_back(succ);
                }
            }
        }
        trace!(region = region.len(), "subtree fenced");
    }

    fn execute_batch(&self, batch: &[NodeId], turn: &Turn) -> Result<()> {
        match (self.mode, self.pool.as_ref()) {
            (ConcurrencyMode::ParallelConcurrent, Some(pool)) if batch.len() > 1 => {
                pool.install(|| {
                    batch
                        .par_iter()
                        .map(|&node| {
                            run_node_tick(&self.registry, self, node, turn, &self.shifts)
                                .map(|_| ())
                        })
                        .collect::<Result<()>>()
                })
            }
            _ => {
                for &node in batch {
                    run_node_tick(&self.registry, self, node, turn, &self.shifts)?;
                }
                Ok(())
            }
        }
    }

    fn sweep_region(&self) {
        for node in self.region.lock().drain(..) {
            self.registry.clear_marked(node);
        }
    }

    fn abort(&self) {
        let leftovers = self.ready.lock().clear();
        for node in leftovers {
            self.registry.clear_queued(node);
        }
        self.inputs.lock().clear();
        self.pulsed.lock().clear();
        self.shifts.drain();
        self.sweep_region();
    }
}

impl PropagationEngine for SubtreeEngine {
    fn on_turn_input_change(&self, node: NodeId, _turn: &Turn) {
        self.inputs.lock().push(node);
        if let Some(level) = self.registry.level_of(node) {
            if self.registry.mark_queued(node) {
                self.ready.lock().push(node, level);
            }
        }
    }

    fn on_node_pulse(&self, node: NodeId, _turn: &Turn) {
        self.pulsed.lock().push(node);
    }

    fn on_turn_propagate(&self, turn: &Turn) -> Result<()> {
        let roots = std::mem::take(&mut *self.inputs.lock());
        if roots.is_empty() {
            return Ok(());
        }
        debug!(turn = turn.id(), inputs = roots.len(), "subtree propagation start");
        self.mark_region(&roots);

        loop {
            let Some((level, nodes)) = self.ready.lock().pop_min() else {
                break;
            };
            let mut batch = Vec::with_capacity(nodes.len());
            for node in nodes {
                let Some(current) = self.registry.level_of(node) else {
                    continue;
                };
                if current > level {
                    self.ready.lock().push(node, current);
                    continue;
                }
                self.registry.clear_queued(node);
                if self.registry.is_input(node) {
                    self.pulsed.lock().push(node);
                } else {
                    batch.push(node);
                }
            }
            trace!(turn = turn.id(), level, batch = batch.len(), "subtree batch");

            if let Err(err) = self.execute_batch(&batch, turn) {
                self.abort();
                return Err(err);
            }

            for request in self.shifts.drain() {
                let node = request.node;
                match self.registry.apply_shift(request) {
                    Ok(new_level) => {
                        self.on_node_shift(node, request.old_parent, request.new_parent, turn);
                        self.pulsed.lock().retain(|&n| n != node);
                        // The node stays inside the region and re-ticks at
                        // its new level; level order keeps it behind any
                        // still-pending new parent.
                        if self.registry.set_marked(node) {
                            self.region.lock().push(node);
                        }
                        if self.registry.mark_queued(node) {
                            self.ready.lock().push(node, new_level);
                        }
                    }
                    Err(err) => {
                        self.abort();
                        return Err(err);
                    }
                }
            }

            let pulsed = std::mem::take(&mut *self.pulsed.lock());
            for node in pulsed {
                for succ in self.registry.succs_of(node) {
                    if !self.registry.is_marked(succ) {
                        continue;
                    }
                    if self.registry.mark_queued(succ) {
                        if let Some(succ_level) = self.registry.level_of(succ) {
                            self.ready.lock().push(succ, succ_level);
                        }
                    }
                }
            }
        }

        self.sweep_region();
        debug!(turn = turn.id(), "subtree propagation done");
        Ok(())
    }

    fn on_turn_end(&self, _turn: &Turn) {
        debug_assert!(self.ready.lock().is_empty());
        debug_assert!(self.region.lock().is_empty());
    }
}
