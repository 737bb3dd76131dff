//! Signal nodes: time-varying values recomputed on predecessor pulses.
//!
//! The engine only ever sees pulse / idle pulse; the value itself lives in
//! a data block the node's behavior and downstream readers share. Handles
//! hold the data block alive, which is what makes predecessor edges
//! strong.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::graph::node::{NodeBehavior, TickCtx, TickResult};
use crate::graph::turn::Turn;
use crate::types::NodeId;

/// Shared value cell of one signal node.
pub(crate) struct SignalData<V> {
    value: RwLock<V>,
}

impl<V> SignalData<V> {
    pub fn new(value: V) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.value.read())
    }

    /// Installs `value` if it differs from the current one. Returns true
    /// on change.
    pub fn replace_if_changed(&self, value: V) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.value.write();
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    }
}

/// Read handle to a signal node. Cloning shares the same node; equality
/// is node identity, which is what signal-of-signal selection compares.
pub struct Signal<V> {
    id: NodeId,
    data: Arc<SignalData<V>>,
}

impl<V> Signal<V> {
    pub(crate) fn new(id: NodeId, data: Arc<SignalData<V>>) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn data(&self) -> &Arc<SignalData<V>> {
        &self.data
    }

    /// Current value. Outside a turn this is the last committed value;
    /// inside a tick it reflects every predecessor that ticked at a lower
    /// level this turn.
    pub fn get(&self) -> V
    where
        V: Clone,
    {
        self.data.with(|v| v.clone())
    }

    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        self.data.with(f)
    }
}

impl<V> Clone for Signal<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            data: self.data.clone(),
        }
    }
}

impl<V> PartialEq for Signal<V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<V> Eq for Signal<V> {}

/// Input signal: holds the externally supplied value.
pub struct VarSignal<V: Send + Sync + 'static> {
    signal: Signal<V>,
    pub(crate) behavior: Arc<VarBehavior<V>>,
}

impl<V: Send + Sync + 'static> VarSignal<V> {
    pub(crate) fn new(id: NodeId, data: Arc<SignalData<V>>, behavior: Arc<VarBehavior<V>>) -> Self {
        Self {
            signal: Signal::new(id, data),
            behavior,
        }
    }

    pub fn id(&self) -> NodeId {
        self.signal.id()
    }

    pub fn signal(&self) -> &Signal<V> {
        &self.signal
    }

    pub fn get(&self) -> V
    where
        V: Clone,
    {
        self.signal.get()
    }
}

impl<V: Send + Sync + 'static> Clone for VarSignal<V> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

/// Behavior of an input signal node. Admission writes land in `pending`;
/// `apply_input` commits the last one per turn (sets within one admission
/// coalesce, last write wins).
pub(crate) struct VarBehavior<V> {
    data: Arc<SignalData<V>>,
    pending: Mutex<Option<V>>,
}

impl<V> VarBehavior<V> {
    pub fn new(data: Arc<SignalData<V>>) -> Self {
        Self {
            data,
            pending: Mutex::new(None),
        }
    }

    pub fn add_input(&self, value: V) {
        *self.pending.lock() = Some(value);
    }
}

impl<V: PartialEq + Send + Sync + 'static> NodeBehavior for VarBehavior<V> {
    fn tick(&self, _ctx: &mut TickCtx<'_>) -> TickResult {
        debug_assert!(false, "input signal nodes are never ticked");
        TickResult::Idle
    }

    fn apply_input(&self, _turn: &Turn) -> bool {
        match self.pending.lock().take() {
            Some(value) => self.data.replace_if_changed(value),
            None => false,
        }
    }
}

/// Derived signal: recomputes from predecessor values and pulses when the
/// result differs.
pub(crate) struct ComputedBehavior<V> {
    data: Arc<SignalData<V>>,
    func: Box<dyn Fn() -> V + Send + Sync>,
    deps: usize,
}

impl<V> ComputedBehavior<V> {
    pub fn new(data: Arc<SignalData<V>>, func: Box<dyn Fn() -> V + Send + Sync>, deps: usize) -> Self {
        Self { data, func, deps }
    }
}

impl<V: PartialEq + Send + Sync + 'static> NodeBehavior for ComputedBehavior<V> {
    fn tick(&self, _ctx: &mut TickCtx<'_>) -> TickResult {
        if self.data.replace_if_changed((self.func)()) {
            TickResult::Pulsed
        } else {
            TickResult::Idle
        }
    }

    fn dependency_count(&self) -> usize {
        self.deps
    }
}

/// Signal-of-signal flattening; the node that re-parents dynamically.
///
/// While the selected inner signal is stable, a tick just mirrors its
/// value. When the selection changes, the tick requests a shift from the
/// old inner to the new one and publishes nothing yet: the engine applies
/// the swap, raises the level if needed and re-ticks this node at its new
/// level within the same turn.
pub(crate) struct FlattenBehavior<V: Send + Sync + 'static> {
    data: Arc<SignalData<V>>,
    outer: Signal<Signal<V>>,
    inner: Mutex<Signal<V>>,
}

impl<V: Send + Sync + 'static> FlattenBehavior<V> {
    pub fn new(data: Arc<SignalData<V>>, outer: Signal<Signal<V>>, inner: Signal<V>) -> Self {
        Self {
            data,
            outer,
            inner: Mutex::new(inner),
        }
    }
}

impl<V: PartialEq + Clone + Send + Sync + 'static> NodeBehavior for FlattenBehavior<V> {
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        let selected = self.outer.get();
        let mut inner = self.inner.lock();
        if selected != *inner {
            ctx.request_shift(inner.id(), selected.id());
            *inner = selected;
            return TickResult::Idle;
        }
        if self.data.replace_if_changed(inner.get()) {
            TickResult::Pulsed
        } else {
            TickResult::Idle
        }
    }

    fn dependency_count(&self) -> usize {
        2
    }
}
