//! Observer nodes: user callbacks at the edge of the graph.
//!
//! Observers are sinks; they never pulse and have no successors. A
//! callback can ask for its own removal, which is recorded on the turn
//! and committed once no ticks are in flight (so the observer still sees
//! the turn that triggered the request).

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::domain::{DomainInner, TransactionCtx};
use crate::error::Result;
use crate::graph::node::{NodeBehavior, TickCtx, TickResult};
use crate::graph::turn::Turn;
use crate::nodes::events::EventData;
use crate::nodes::signal::SignalData;
use crate::types::{NodeId, TurnId};

/// What an observer callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    Continue,
    /// Stop observing. The edge is removed at end of turn.
    Detach,
}

/// Turn-scoped context handed to observer callbacks.
pub struct ObserverCtx<'a> {
    turn: &'a Turn,
}

impl ObserverCtx<'_> {
    pub fn turn_id(&self) -> TurnId {
        self.turn.id()
    }

    /// Queues inputs to run as a fresh turn right after this one has
    /// fully ended. This is the only way to feed new input from inside a
    /// turn without deadlocking on the turn manager.
    pub fn enqueue_continuation(
        &self,
        input: impl for<'x> FnOnce(&mut TransactionCtx<'x>) + Send + 'static,
    ) {
        self.turn.push_continuation(Box::new(input));
    }
}

type SignalCallback<V> = Box<dyn FnMut(&V, &mut ObserverCtx<'_>) -> ObserverAction + Send>;
type EventCallback<E> = Box<dyn FnMut(&E, &mut ObserverCtx<'_>) -> ObserverAction + Send>;

pub(crate) struct SignalObserverBehavior<V> {
    source: Arc<SignalData<V>>,
    func: Mutex<SignalCallback<V>>,
}

impl<V> SignalObserverBehavior<V> {
    pub fn new(source: Arc<SignalData<V>>, func: SignalCallback<V>) -> Self {
        Self {
            source,
            func: Mutex::new(func),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> NodeBehavior for SignalObserverBehavior<V> {
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        let value = self.source.with(|v| v.clone());
        let mut obs_ctx = ObserverCtx { turn: ctx.turn() };
        let mut func = self.func.lock();
        if (*func)(&value, &mut obs_ctx) == ObserverAction::Detach {
            ctx.defer_detach();
        }
        TickResult::Idle
    }

    fn dependency_count(&self) -> usize {
        1
    }
}

pub(crate) struct EventObserverBehavior<E> {
    source: Arc<EventData<E>>,
    func: Mutex<EventCallback<E>>,
}

impl<E> EventObserverBehavior<E> {
    pub fn new(source: Arc<EventData<E>>, func: EventCallback<E>) -> Self {
        Self {
            source,
            func: Mutex::new(func),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> NodeBehavior for EventObserverBehavior<E> {
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        self.source.set_current_turn(ctx.turn(), false, false);
        let events = self.source.snapshot();
        let mut obs_ctx = ObserverCtx { turn: ctx.turn() };
        let mut func = self.func.lock();
        for event in &events {
            if (*func)(event, &mut obs_ctx) == ObserverAction::Detach {
                ctx.defer_detach();
                break;
            }
        }
        TickResult::Idle
    }

    fn dependency_count(&self) -> usize {
        1
    }
}

/// Handle to a registered observer.
pub struct Observer {
    id: NodeId,
    /// Identity proof against slot reuse once the node was reclaimed.
    behavior: Weak<dyn NodeBehavior>,
    domain: Weak<DomainInner>,
}

impl Observer {
    pub(crate) fn new(
        id: NodeId,
        behavior: Weak<dyn NodeBehavior>,
        domain: Weak<DomainInner>,
    ) -> Self {
        Self {
            id,
            behavior,
            domain,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// True while the observer is still wired into the graph.
    pub fn is_attached(&self) -> bool {
        let Some(domain) = self.domain.upgrade() else {
            return false;
        };
        let Some(behavior) = self.behavior.upgrade() else {
            return false;
        };
        domain.registry().is_same_behavior(self.id, &behavior)
    }

    /// Removes the observer immediately. Only legal outside a turn; from
    /// inside the callback, return [`ObserverAction::Detach`] instead.
    pub fn detach(&self) -> Result<()> {
        let Some(domain) = self.domain.upgrade() else {
            return Ok(());
        };
        let Some(behavior) = self.behavior.upgrade() else {
            return Ok(()); // already detached during a turn
        };
        domain.detach_observer(self.id, &behavior)
    }
}
