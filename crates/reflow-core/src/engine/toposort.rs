//! Level-ordered propagation.
//!
//! The ready set is partitioned by node level. Each iteration drains the
//! whole minimum level into a batch; by level dominance no member of the
//! batch reads another, so the batch can run sequentially or fan out to
//! the worker pool. Successor enqueuing and dynamic re-parents are
//! deferred until the batch has joined, which is what makes same-level
//! ticks observe predecessor pulses atomically.

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

pub(crate) struct ToposortEngine {
    registry: Arc<NodeRegistry>,
    mode: ConcurrencyMode,
    pool: Option<Arc<rayon::ThreadPool>>,
    ready: Mutex<LevelQueue>,
    /// Pulses reported by the current batch; consumed after the join.
    pulsed: Mutex<Vec<NodeId>>,
    shifts: ShiftSink,
}

impl ToposortEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        mode: ConcurrencyMode,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Self {
        Self {
            registry,
            mode,
            pool,
            ready: Mutex::new(LevelQueue::default()),
            pulsed: Mutex::new(Vec::new()),
            shifts: ShiftSink::default(),
        }
    }

    fn execute_batch(&self, batch: &[NodeId], turn: &Turn) -> Result<()> {
        match (self.mode, self.pool.as_ref()) {
            (ConcurrencyMode::ParallelConcurrent, Some(pool)) if batch.len() > 1 => pool
                .install(|| {
                    batch
                        .par_iter()
                        .map(|&node| {
                            run_node_tick(&self.registry, self, node, turn, &self.shifts)
                                .map(|_| ())
                        })
                        .collect::<Result<()>>()
                }),
            _ => {
                for &node in batch {
                    run_node_tick(&self.registry, self, node, turn, &self.shifts)?;
                }
                Ok(())
            }
        }
    }

    /// Discards all remaining work after a failed tick so the next turn
    /// starts from a clean engine.
    fn abort(&self) {
        let leftovers = self.ready.lock().clear();
        for node in leftovers {
            self.registry.clear_queued(node);
        }
        self.pulsed.lock().clear();
        self.shifts.drain();
    }
}

impl PropagationEngine for ToposortEngine {
    fn on_turn_input_change(&self, node: NodeId, _turn: &Turn) {
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
        debug!(turn = turn.id(), "toposort propagation start");
        loop {
            let Some((level, nodes)) = self.ready.lock().pop_min() else {
                break;
            };

            // Split the drained level into the batch to run and nodes whose
            // level rose since they were queued; the latter just move
            // within the ready set.
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
                    // Inputs already committed their change during
                    // admission; their pulse just fans out here.
                    self.pulsed.lock().push(node);
                } else {
                    batch.push(node);
                }
            }
            trace!(turn = turn.id(), level, batch = batch.len(), "tick batch");

            if let Err(err) = self.execute_batch(&batch, turn) {
                self.abort();
                return Err(err);
            }

            // Dynamic re-parents requested by this batch, applied under the
            // write lock now that no ticks are in flight. A shifted node
            // was already drained this turn, so its changed state is
            // discarded and it re-queues at its new level.
            for request in self.shifts.drain() {
                let node = request.node;
                match self.registry.apply_shift(request) {
                    Ok(new_level) => {
                        self.on_node_shift(node, request.old_parent, request.new_parent, turn);
                        self.pulsed.lock().retain(|&n| n != node);
                        if self.registry.mark_queued(node) {
                            self.ready.lock().push(node, new_level);
                        }
                        trace!(node = %node, new_level, "dynamic shift re-queued");
                    }
                    Err(err) => {
                        self.abort();
                        return Err(err);
                    }
                }
            }

            // Deferred successor enqueue: only pulsed nodes wake their
            // successors, and only once per turn and level.
            let pulsed = std::mem::take(&mut *self.pulsed.lock());
            for node in pulsed {
                for succ in self.registry.succs_of(node) {
                    if self.registry.mark_queued(succ) {
                        if let Some(succ_level) = self.registry.level_of(succ) {
                            self.ready.lock().push(succ, succ_level);
                        }
                    }
                }
            }
        }
        debug!(turn = turn.id(), "toposort propagation done");
        Ok(())
    }

    fn on_turn_end(&self, _turn: &Turn) {
        debug_assert!(self.ready.lock().is_empty());
    }
}
