//! Domain: the user-facing assembly of registry, engine and turn manager.
//!
//! A domain owns one graph and one engine. All input enters through
//! transactions; each transaction becomes exactly one turn (or merges
//! into a queued one), and turns run strictly one at a time.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::engine::{build_engine, PropagationEngine};
use crate::error::{ReflowError, Result};
use crate::graph::node::NodeBehavior;
use crate::graph::registry::{NodeOpts, NodeRegistry};
use crate::graph::turn::{InputFn, Turn, TurnHandle, TurnManager};
use crate::nodes::events::{
    EventData, EventSource, EventSourceBehavior, Events, FilterBehavior, MapBehavior,
    MergeBehavior,
};
use crate::nodes::observer::{
    EventObserverBehavior, Observer, ObserverAction, ObserverCtx, SignalObserverBehavior,
};
use crate::nodes::signal::{
    ComputedBehavior, FlattenBehavior, Signal, SignalData, VarBehavior, VarSignal,
};
use crate::types::{ConcurrencyMode, DomainConfig, NodeId, TurnFlags};

thread_local! {
    /// Set while this thread is driving a turn. Submitting a nested
    /// transaction from inside a turn would deadlock on the manager, so
    /// it is rejected eagerly; continuations exist for that purpose.
    static IN_TURN: Cell<bool> = const { Cell::new(false) };
}

struct InTurnGuard;

impl InTurnGuard {
    fn enter() -> Self {
        IN_TURN.with(|flag| flag.set(true));
        InTurnGuard
    }
}

impl Drop for InTurnGuard {
    fn drop(&mut self) {
        IN_TURN.with(|flag| flag.set(false));
    }
}

pub(crate) struct DomainInner {
    config: DomainConfig,
    registry: Arc<NodeRegistry>,
    engine: Arc<dyn PropagationEngine>,
    turns: TurnManager,
    next_turn: AtomicU64,
    turn_active: AtomicBool,
}

impl DomainInner {
    pub(crate) fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    fn ensure_outside_turn(&self, what: &str) -> Result<()> {
        if self.turn_active.load(Ordering::Acquire) {
            Err(ReflowError::InvalidStructuralOp(format!(
                "{what} while a turn is live"
            )))
        } else {
            Ok(())
        }
    }

    pub(crate) fn detach_observer(
        &self,
        id: NodeId,
        behavior: &Arc<dyn NodeBehavior>,
    ) -> Result<()> {
        self.ensure_outside_turn("observer detach")?;
        if !self.registry.is_same_behavior(id, behavior) {
            return Ok(()); // already removed by a deferred detach
        }
        self.registry.destroy(id, self.engine.as_ref())
    }

    /// Runs admission and propagation for one turn. Returns the turn
    /// outcome plus any continuation inputs ticks enqueued.
    fn run_turn<F>(
        &self,
        handle: &Arc<TurnHandle>,
        flags: TurnFlags,
        input: F,
    ) -> (Result<()>, Vec<InputFn>)
    where
        F: for<'a> FnOnce(&mut TransactionCtx<'a>),
    {
        let turn = Turn::new(self.next_turn.fetch_add(1, Ordering::Relaxed), flags);
        let span = debug_span!("turn", id = turn.id());
        let _entered = span.enter();
        let _guard = InTurnGuard::enter();

        self.turn_active.store(true, Ordering::Release);
        self.engine.on_turn_admission_start(&turn);
        debug!(turn = turn.id(), "admission start");

        let mut ctx = TransactionCtx {
            turn: &turn,
            changed: Vec::new(),
        };
        let admission = catch_unwind(AssertUnwindSafe(|| {
            input(&mut ctx);
            handle.run_merged_inputs(&mut ctx);
        }));

        let result = match admission {
            Err(payload) => Err(ReflowError::TurnFailed {
                turn: turn.id(),
                reason: crate::engine::panic_reason(payload),
            }),
            Ok(()) => {
                ctx.commit(self.engine.as_ref());
                self.engine.on_turn_admission_end(&turn);
                debug!(turn = turn.id(), "admission end, propagating");
                self.engine.on_turn_propagate(&turn)
            }
        };

        self.engine.on_turn_end(&turn);
        self.registry.commit_detaches(&turn, self.engine.as_ref());
        self.turn_active.store(false, Ordering::Release);
        (result, turn.take_continuations())
    }
}

/// Handle to a reactive domain. Cheap to clone; all clones share the same
/// graph and turn queue.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    pub fn new(config: DomainConfig) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new());
        let pool = match config.mode {
            ConcurrencyMode::ParallelConcurrent => {
                let mut builder = rayon::ThreadPoolBuilder::new()
                    .thread_name(|i| format!("reflow-worker-{i}"));
                if let Some(threads) = config.worker_threads {
                    builder = builder.num_threads(threads);
                }
                let pool = builder
                    .build()
                    .map_err(|e| ReflowError::EngineInit(e.to_string()))?;
                Some(Arc::new(pool))
            }
            ConcurrencyMode::SequentialConcurrent => None,
        };
        let engine = build_engine(config.engine, config.mode, registry.clone(), pool);
        Ok(Self {
            inner: Arc::new(DomainInner {
                config,
                registry,
                engine,
                turns: TurnManager::new(),
                next_turn: AtomicU64::new(0),
                turn_active: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &DomainConfig {
        &self.inner.config
    }

    // --- graph construction -------------------------------------------------

    /// Creates an input signal holding `init`.
    pub fn var<V>(&self, init: V) -> VarSignal<V>
    where
        V: PartialEq + Send + Sync + 'static,
    {
        debug_assert!(
            !self.inner.turn_active.load(Ordering::Acquire),
            "nodes are created outside turns"
        );
        let data = Arc::new(SignalData::new(init));
        let behavior = Arc::new(VarBehavior::new(data.clone()));
        let id = self.inner.registry.insert(
            behavior.clone(),
            vec![],
            NodeOpts {
                input: true,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        VarSignal::new(id, data, behavior)
    }

    /// Creates a derived signal. `deps` are the nodes the closure reads;
    /// the closure is evaluated once up front for the initial value.
    pub fn computed<V, F>(&self, deps: &[NodeId], func: F) -> Signal<V>
    where
        V: PartialEq + Send + Sync + 'static,
        F: Fn() -> V + Send + Sync + 'static,
    {
        debug_assert!(
            !self.inner.turn_active.load(Ordering::Acquire),
            "nodes are created outside turns"
        );
        let data = Arc::new(SignalData::new(func()));
        let behavior = Arc::new(ComputedBehavior::new(
            data.clone(),
            Box::new(func),
            deps.len(),
        ));
        let id = self.inner.registry.insert(
            behavior,
            deps.to_vec(),
            NodeOpts {
                input: false,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        Signal::new(id, data)
    }

    /// Flattens a signal of signals. The result follows whichever inner
    /// signal `outer` currently selects, re-parenting dynamically when the
    /// selection changes mid-turn.
    pub fn flatten<V>(&self, outer: &Signal<Signal<V>>) -> Signal<V>
    where
        V: PartialEq + Clone + Send + Sync + 'static,
    {
        let inner = outer.get();
        let data = Arc::new(SignalData::new(inner.get()));
        let behavior = Arc::new(FlattenBehavior::new(data.clone(), outer.clone(), inner.clone()));
        let id = self.inner.registry.insert(
            behavior,
            vec![outer.id(), inner.id()],
            NodeOpts {
                input: false,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        Signal::new(id, data)
    }

    /// Creates an input event stream.
    pub fn event_source<E>(&self) -> EventSource<E>
    where
        E: Send + Sync + 'static,
    {
        let data = Arc::new(EventData::new());
        let behavior = Arc::new(EventSourceBehavior::new(data.clone()));
        let id = self.inner.registry.insert(
            behavior.clone(),
            vec![],
            NodeOpts {
                input: true,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        EventSource::new(id, data, behavior)
    }

    /// Merges two streams; per turn, `a`'s occurrences come first.
    pub fn merge<E>(&self, a: &Events<E>, b: &Events<E>) -> Events<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let data = Arc::new(EventData::new());
        let behavior = Arc::new(MergeBehavior::new(
            data.clone(),
            vec![a.data().clone(), b.data().clone()],
        ));
        let id = self.inner.registry.insert(
            behavior,
            vec![a.id(), b.id()],
            NodeOpts {
                input: false,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        Events::new(id, data)
    }

    /// Keeps the occurrences of `source` that satisfy `func`.
    pub fn filter_events<E, F>(&self, source: &Events<E>, func: F) -> Events<E>
    where
        E: Clone + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let data = Arc::new(EventData::new());
        let behavior = Arc::new(FilterBehavior::new(
            data.clone(),
            source.data().clone(),
            Box::new(func),
        ));
        let id = self.inner.registry.insert(
            behavior,
            vec![source.id()],
            NodeOpts {
                input: false,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        Events::new(id, data)
    }

    /// Transforms every occurrence of `source`.
    pub fn map_events<E, T, F>(&self, source: &Events<E>, func: F) -> Events<T>
    where
        E: Clone + Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&E) -> T + Send + Sync + 'static,
    {
        let data = Arc::new(EventData::new());
        let behavior = Arc::new(MapBehavior::new(
            data.clone(),
            source.data().clone(),
            Box::new(func),
        ));
        let id = self.inner.registry.insert(
            behavior,
            vec![source.id()],
            NodeOpts {
                input: false,
                observer: false,
            },
            self.inner.engine.as_ref(),
        );
        Events::new(id, data)
    }

    /// Registers a callback on a signal; it fires with the freshly
    /// committed value whenever the signal pulses.
    pub fn observe<V, F>(&self, signal: &Signal<V>, func: F) -> Observer
    where
        V: Clone + Send + Sync + 'static,
        F: FnMut(&V, &mut ObserverCtx<'_>) -> ObserverAction + Send + 'static,
    {
        let behavior: Arc<dyn NodeBehavior> = Arc::new(SignalObserverBehavior::new(
            signal.data().clone(),
            Box::new(func),
        ));
        let id = self.inner.registry.insert(
            behavior.clone(),
            vec![signal.id()],
            NodeOpts {
                input: false,
                observer: true,
            },
            self.inner.engine.as_ref(),
        );
        Observer::new(id, Arc::downgrade(&behavior), Arc::downgrade(&self.inner))
    }

    /// Registers a callback on an event stream; it fires once per
    /// occurrence, in order, for every turn that touches the stream.
    pub fn observe_events<E, F>(&self, events: &Events<E>, func: F) -> Observer
    where
        E: Clone + Send + Sync + 'static,
        F: FnMut(&E, &mut ObserverCtx<'_>) -> ObserverAction + Send + 'static,
    {
        let behavior: Arc<dyn NodeBehavior> = Arc::new(EventObserverBehavior::new(
            events.data().clone(),
            Box::new(func),
        ));
        let id = self.inner.registry.insert(
            behavior.clone(),
            vec![events.id()],
            NodeOpts {
                input: false,
                observer: true,
            },
            self.inner.engine.as_ref(),
        );
        Observer::new(id, Arc::downgrade(&behavior), Arc::downgrade(&self.inner))
    }

    // --- structural operations ----------------------------------------------

    /// Adds a scheduling edge `parent -> child`. Fails with
    /// [`ReflowError::CycleDetected`] if it would close a cycle; the
    /// graph is untouched on failure.
    pub fn attach(&self, child: NodeId, parent: NodeId) -> Result<()> {
        self.inner.ensure_outside_turn("attach")?;
        self.inner
            .registry
            .attach(child, parent, self.inner.engine.as_ref())
    }

    pub fn detach(&self, child: NodeId, parent: NodeId) -> Result<()> {
        self.inner.ensure_outside_turn("detach")?;
        self.inner
            .registry
            .detach(child, parent, self.inner.engine.as_ref())
    }

    /// Removes a node with no successors from the graph.
    pub fn destroy(&self, node: NodeId) -> Result<()> {
        self.inner.ensure_outside_turn("destroy")?;
        self.inner.registry.destroy(node, self.inner.engine.as_ref())
    }

    /// Longest-predecessor-path distance of `node`, if it exists.
    pub fn node_level(&self, node: NodeId) -> Option<u32> {
        self.inner.registry.level_of(node)
    }

    /// Static fan-in of `node` (0 for inputs).
    pub fn dependency_count(&self, node: NodeId) -> usize {
        self.inner.registry.dependency_count_of(node)
    }

    /// Checks acyclicity and level dominance over the whole graph.
    pub fn validate(&self) -> Result<()> {
        self.inner.registry.validate()
    }

    // --- transactions -------------------------------------------------------

    /// Runs `func` as the admission stage of a new turn and returns once
    /// the turn has ended. Side effects of earlier turns are fully
    /// visible, later turns see this one completed.
    pub fn do_transaction<F>(&self, flags: TurnFlags, func: F) -> Result<()>
    where
        F: for<'a> FnOnce(&mut TransactionCtx<'a>),
    {
        self.transact(flags, func)
    }

    /// Attempts to merge `func` into the currently queued turn (the turn
    /// must carry [`TurnFlags::ALLOW_INPUT_MERGING`]); returns after that
    /// turn has run the input. Falls back to a regular transaction.
    pub fn async_merge<F>(&self, flags: TurnFlags, func: F) -> Result<()>
    where
        F: for<'a> FnOnce(&mut TransactionCtx<'a>) + Send + 'static,
    {
        match self.inner.turns.try_merge(Box::new(func)) {
            Ok(()) => Ok(()),
            Err(func) => self.transact(flags, func),
        }
    }

    fn transact<F>(&self, flags: TurnFlags, input: F) -> Result<()>
    where
        F: for<'a> FnOnce(&mut TransactionCtx<'a>),
    {
        if IN_TURN.with(|flag| flag.get()) {
            return Err(ReflowError::InvalidStructuralOp(
                "transaction submitted from inside a turn; enqueue a continuation instead".into(),
            ));
        }
        let handle = Arc::new(TurnHandle::new(flags));
        self.inner.turns.start_turn(&handle);
        let (result, continuations) = self.inner.run_turn(&handle, flags, input);
        self.inner.turns.end_turn(&handle);

        // Continuations become a fresh turn appended after end-of-turn
        // cleanup. A failed turn drops the continuations it collected.
        if result.is_ok() && !continuations.is_empty() {
            debug!(count = continuations.len(), "running continuation turn");
            let follow: InputFn = Box::new(move |ctx: &mut TransactionCtx<'_>| {
                for input in continuations {
                    input(ctx);
                }
            });
            self.transact(flags, follow)?;
        }
        result
    }
}

/// Admission-stage handle: the only way to feed input into the graph.
pub struct TransactionCtx<'a> {
    turn: &'a Turn,
    changed: Vec<(NodeId, Arc<dyn NodeBehavior>)>,
}

impl TransactionCtx<'_> {
    pub fn turn_id(&self) -> crate::types::TurnId {
        self.turn.id()
    }

    /// Sets an input signal. Several sets of the same signal within one
    /// admission coalesce; the last value wins.
    pub fn set<V>(&mut self, var: &VarSignal<V>, value: V)
    where
        V: PartialEq + Send + Sync + 'static,
    {
        var.behavior.add_input(value);
        let behavior: Arc<dyn NodeBehavior> = var.behavior.clone();
        self.changed.push((var.id(), behavior));
    }

    /// Appends an occurrence to an input event stream. All pushes within
    /// one admission arrive in the same turn, in order.
    pub fn push<E>(&mut self, source: &EventSource<E>, event: E)
    where
        E: Send + Sync + 'static,
    {
        source.behavior.add_input(event);
        let behavior: Arc<dyn NodeBehavior> = source.behavior.clone();
        self.changed.push((source.id(), behavior));
    }

    /// Commits pending inputs: every node that accepted data is announced
    /// to the engine exactly once.
    fn commit(&mut self, engine: &dyn PropagationEngine) {
        let mut seen: Vec<NodeId> = Vec::new();
        for (id, behavior) in self.changed.drain(..) {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if behavior.apply_input(self.turn) {
                engine.on_turn_input_change(id, self.turn);
            }
        }
    }
}
