//! Pulse-count propagation.
//!
//! No levels: a mark pass counts, for every node reachable from the
//! changed inputs, how many of its predecessors sit inside the reached
//! region. A node becomes ready once all of those predecessors have
//! completed; it ticks only if at least one of them actually pulsed.
//! Ready nodes of one wave are mutually independent, so a wave can fan
//! out to the worker pool.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::engine::{run_node_tick, PropagationEngine};
use crate::error::Result;
use crate::graph::node::ShiftSink;
use crate::graph::registry::NodeRegistry;
use crate::graph::turn::Turn;
use crate::types::{ConcurrencyMode, NodeId};

pub(crate) struct PulsecountEngine {
    registry: Arc<NodeRegistry>,
    mode: ConcurrencyMode,
    pool: Option<Arc<rayon::ThreadPool>>,
    /// Inputs that accepted data during the current admission stage.
    inputs: Mutex<Vec<NodeId>>,
    /// Pulses reported by the current wave; consumed after the join.
    pulsed: Mutex<Vec<NodeId>>,
    shifts: ShiftSink,
}

impl PulsecountEngine {
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
            pulsed: Mutex::new(Vec::new()),
            shifts: ShiftSink::default(),
        }
    }

    /// Mark pass: walk successors breadth-first from the inputs, counting
    /// each in-region edge into its target node.
    fn mark(&self, roots: &[NodeId]) {
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for &root in roots {
            self.registry.set_marked(root);
            queue.push_back(root);
        }
        while let Some(node) = queue.pop_front() {
            for succ in self.registry.succs_of(node) {
                self.registry.counter_add(succ, 1);
                if self.registry.set_marked(succ) {
                    queue.push_back(succ);
                }
            }
        }
    }

    fn execute_wave(&self, wave: &[NodeId], turn: &Turn) -> Result<()> {
        match (self.mode, self.pool.as_ref()) {
            (ConcurrencyMode::ParallelConcurrent, Some(pool)) if wave.len() > 1 => {
                pool.install(|| {
                    wave.par_iter()
                        .map(|&node| {
                            run_node_tick(&self.registry, self, node, turn, &self.shifts)
                                .map(|_| ())
                        })
                        .collect::<Result<()>>()
                })
            }
            _ => {
                for &node in wave {
                    run_node_tick(&self.registry, self, node, turn, &self.shifts)?;
                }
                Ok(())
            }
        }
    }

    fn abort(&self) {
        self.inputs.lock().clear();
        self.pulsed.lock().clear();
        self.shifts.drain();
        self.registry.reset_markers();
    }

    /// Publishes a node's completion: changed-bit fan-out for pulses,
    /// then counter decrements that may ready successors.
    fn complete(&self, node: NodeId, pulsed: bool, next: &mut Vec<NodeId>) {
        let succs = self.registry.succs_of(node);
        if pulsed {
            for &succ in &succs {
                if self.registry.is_marked(succ) {
                    self.registry.set_changed(succ);
                }
            }
        }
        for &succ in &succs {
            if self.registry.is_marked(succ) && self.registry.counter_add(succ, -1) == 0 {
                next.push(succ);
            }
        }
        self.registry.clear_marked(node);
        self.registry.clear_changed(node);
    }
}

impl PropagationEngine for PulsecountEngine {
    fn on_turn_input_change(&self, node: NodeId, _turn: &Turn) {
        self.inputs.lock().push(node);
    }

    fn on_node_pulse(&self, node: NodeId, _turn: &Turn) {
        self.pulsed.lock().push(node);
    }

    fn on_turn_propagate(&self, turn: &Turn) -> Result<()> {
        let roots = std::mem::take(&mut *self.inputs.lock());
        if roots.is_empty() {
            return Ok(());
        }
        debug!(turn = turn.id(), inputs = roots.len(), "pulsecount propagation start");
        self.mark(&roots);

        let mut wave = roots;
        while !wave.is_empty() {
            // Ticks first: inputs pulse implicitly, untouched nodes skip.
            let mut implicit: Vec<(NodeId, bool)> = Vec::new();
            let mut ticks: Vec<NodeId> = Vec::new();
            for &node in &wave {
                if self.registry.is_input(node) {
                    implicit.push((node, true));
                } else if self.registry.is_changed(node) {
                    ticks.push(node);
                } else {
                    // All in-region predecessors completed idle.
                    implicit.push((node, false));
                }
            }
            trace!(turn = turn.id(), wave = wave.len(), ticks = ticks.len(), "wave");

            if let Err(err) = self.execute_wave(&ticks, turn) {
                self.abort();
                return Err(err);
            }

            let mut next = Vec::new();
            let wave_pulses = std::mem::take(&mut *self.pulsed.lock());

            // Dynamic re-parents: the shifted node has not completed, so
            // its successors keep waiting. If the new parent is still
            // pending inside the region, the fresh edge joins the count;
            // otherwise the node re-ticks in the next wave.
            let mut shifted: Vec<NodeId> = Vec::new();
            for request in self.shifts.drain() {
                let node = request.node;
                match self.registry.apply_shift(request) {
                    Ok(_) => {
                        self.on_node_shift(node, request.old_parent, request.new_parent, turn);
                        shifted.push(node);
                        if self.registry.is_marked(request.new_parent) {
                            self.registry.counter_add(node, 1);
                        } else {
                            next.push(node);
                        }
                    }
                    Err(err) => {
                        self.abort();
                        return Err(err);
                    }
                }
            }

            for (node, pulsed) in implicit {
                self.complete(node, pulsed, &mut next);
            }
            for node in wave_pulses {
                if !shifted.contains(&node) {
                    self.complete(node, true, &mut next);
                }
            }
            for &node in &wave {
                let ticked_idle = ticks.contains(&node)
                    && !shifted.contains(&node)
                    && self.registry.is_marked(node);
                if ticked_idle {
                    self.complete(node, false, &mut next);
                }
            }

            wave = next;
        }
        debug!(turn = turn.id(), "pulsecount propagation done");
        Ok(())
    }
}
