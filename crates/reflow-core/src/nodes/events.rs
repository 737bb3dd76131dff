//! Event-stream nodes: per-turn buffers of discrete occurrences.
//!
//! A buffer is only meaningful within the turn whose id it carries; stale
//! buffers are cleared lazily the first time a new turn touches the node.
//! The local lock guards the buffer/turn-id pair and is never held while
//! user code runs, and never nested with the structural lock's writer
//! side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::node::{NodeBehavior, TickCtx, TickResult};
use crate::graph::turn::Turn;
use crate::types::{NodeId, TurnId};

const NO_TURN: TurnId = TurnId::MAX;

struct EventBuffer<E> {
    turn_id: TurnId,
    events: Vec<E>,
}

/// Shared buffer block of one event-stream node.
pub(crate) struct EventData<E> {
    inner: Mutex<EventBuffer<E>>,
}

impl<E> EventData<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventBuffer {
                turn_id: NO_TURN,
                events: Vec::new(),
            }),
        }
    }

    /// Stamps the buffer with the turn, clearing stale contents. Safe to
    /// call repeatedly within one turn: it clears at most once per id
    /// change, so combinators that collect a source several times see a
    /// consistent buffer.
    pub fn set_current_turn(&self, turn: &Turn, force: bool, no_clear: bool) {
        let mut buffer = self.inner.lock();
        if buffer.turn_id != turn.id() || force {
            buffer.turn_id = turn.id();
            if !no_clear {
                buffer.events.clear();
            }
        }
    }

    pub fn push(&self, event: E) {
        self.inner.lock().events.push(event);
    }

    /// Clears the buffer if the pending-input flag survived from a
    /// previous turn (input path only).
    fn clear_for_reuse(&self) {
        self.inner.lock().events.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Copies the turn's events out so no lock is held across callbacks.
    pub fn snapshot(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.inner.lock().events.clone()
    }

    pub fn with_events<R>(&self, f: impl FnOnce(&[E]) -> R) -> R {
        f(&self.inner.lock().events)
    }
}

/// Read handle to an event-stream node.
pub struct Events<E> {
    id: NodeId,
    data: Arc<EventData<E>>,
}

impl<E> Events<E> {
    pub(crate) fn new(id: NodeId, data: Arc<EventData<E>>) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn data(&self) -> &Arc<EventData<E>> {
        &self.data
    }

    /// Reads the buffer of the most recent turn that touched this node.
    pub fn with_events<R>(&self, f: impl FnOnce(&[E]) -> R) -> R {
        self.data.with_events(f)
    }

    /// Copies out the buffer of the most recent turn that touched this
    /// node.
    pub fn snapshot(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.data.snapshot()
    }
}

impl<E> Clone for Events<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            data: self.data.clone(),
        }
    }
}

/// Input event stream.
pub struct EventSource<E: Send + Sync + 'static> {
    events: Events<E>,
    pub(crate) behavior: Arc<EventSourceBehavior<E>>,
}

impl<E: Send + Sync + 'static> EventSource<E> {
    pub(crate) fn new(
        id: NodeId,
        data: Arc<EventData<E>>,
        behavior: Arc<EventSourceBehavior<E>>,
    ) -> Self {
        Self {
            events: Events::new(id, data),
            behavior,
        }
    }

    pub fn id(&self) -> NodeId {
        self.events.id()
    }

    pub fn events(&self) -> &Events<E> {
        &self.events
    }
}

impl<E: Send + Sync + 'static> Clone for EventSource<E> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            behavior: self.behavior.clone(),
        }
    }
}

/// Behavior of an input event node. `pending` is the flag that lets
/// several `add_input` calls within one admission coalesce into a single
/// pulse, and that marks the buffer as consumed once a turn took it.
pub(crate) struct EventSourceBehavior<E> {
    data: Arc<EventData<E>>,
    pending: AtomicBool,
}

impl<E> EventSourceBehavior<E> {
    pub fn new(data: Arc<EventData<E>>) -> Self {
        Self {
            data,
            pending: AtomicBool::new(false),
        }
    }

    pub fn add_input(&self, event: E) {
        // Leftover buffer from the previous turn; drop it before the
        // first append of this admission.
        if self.pending.swap(false, Ordering::AcqRel) {
            self.data.clear_for_reuse();
        }
        self.data.push(event);
    }
}

impl<E: Send + Sync + 'static> NodeBehavior for EventSourceBehavior<E> {
    fn tick(&self, _ctx: &mut TickCtx<'_>) -> TickResult {
        debug_assert!(false, "input event nodes are never ticked");
        TickResult::Idle
    }

    fn apply_input(&self, turn: &Turn) -> bool {
        if self.data.len() > 0 && !self.pending.load(Ordering::Acquire) {
            self.data.set_current_turn(turn, true, true);
            self.pending.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// Merges the occurrences of two streams in source order.
pub(crate) struct MergeBehavior<E> {
    data: Arc<EventData<E>>,
    sources: Vec<Arc<EventData<E>>>,
    deps: usize,
}

impl<E> MergeBehavior<E> {
    pub fn new(data: Arc<EventData<E>>, sources: Vec<Arc<EventData<E>>>) -> Self {
        let deps = sources.len();
        Self {
            data,
            sources,
            deps,
        }
    }
}

impl<E: Clone + Send + Sync + 'static> NodeBehavior for MergeBehavior<E> {
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        self.data.set_current_turn(ctx.turn(), true, false);
        for source in &self.sources {
            source.set_current_turn(ctx.turn(), false, false);
            let events = source.snapshot();
            for event in events {
                self.data.push(event);
            }
        }
        if self.data.len() > 0 {
            TickResult::Pulsed
        } else {
            TickResult::Idle
        }
    }

    fn dependency_count(&self) -> usize {
        self.deps
    }
}

/// Keeps only the occurrences of one stream that pass a predicate.
pub(crate) struct FilterBehavior<E> {
    data: Arc<EventData<E>>,
    source: Arc<EventData<E>>,
    func: Box<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> FilterBehavior<E> {
    pub fn new(
        data: Arc<EventData<E>>,
        source: Arc<EventData<E>>,
        func: Box<dyn Fn(&E) -> bool + Send + Sync>,
    ) -> Self {
        Self { data, source, func }
    }
}

impl<E: Clone + Send + Sync + 'static> NodeBehavior for FilterBehavior<E> {
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        self.data.set_current_turn(ctx.turn(), true, false);
        self.source.set_current_turn(ctx.turn(), false, false);
        let events = self.source.snapshot();
        for event in events {
            if (self.func)(&event) {
                self.data.push(event);
            }
        }
        if self.data.len() > 0 {
            TickResult::Pulsed
        } else {
            TickResult::Idle
        }
    }

    fn dependency_count(&self) -> usize {
        1
    }
}

/// Applies a function to every occurrence of one stream.
pub(crate) struct MapBehavior<E, T> {
    data: Arc<EventData<T>>,
    source: Arc<EventData<E>>,
    func: Box<dyn Fn(&E) -> T + Send + Sync>,
}

impl<E, T> MapBehavior<E, T> {
    pub fn new(
        data: Arc<EventData<T>>,
        source: Arc<EventData<E>>,
        func: Box<dyn Fn(&E) -> T + Send + Sync>,
    ) -> Self {
        Self { data, source, func }
    }
}

impl<E: Clone + Send + Sync + 'static, T: Send + Sync + 'static> NodeBehavior
    for MapBehavior<E, T>
{
    fn tick(&self, ctx: &mut TickCtx<'_>) -> TickResult {
        self.data.set_current_turn(ctx.turn(), true, false);
        self.source.set_current_turn(ctx.turn(), false, false);
        let events = self.source.snapshot();
        for event in &events {
            self.data.push((self.func)(event));
        }
        if self.data.len() > 0 {
            TickResult::Pulsed
        } else {
            TickResult::Idle
        }
    }

    fn dependency_count(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnFlags;

    #[test]
    fn set_current_turn_clears_at_most_once() {
        let data: EventData<u32> = EventData::new();
        let turn = Turn::new(5, TurnFlags::NONE);

        data.push(1);
        data.set_current_turn(&turn, false, false);
        assert_eq!(data.len(), 0); // stale buffer cleared on entry

        data.push(2);
        data.set_current_turn(&turn, false, false);
        assert_eq!(data.len(), 1); // idempotent under the same id
    }

    #[test]
    fn force_with_no_clear_keeps_the_buffer() {
        let data: EventData<u32> = EventData::new();
        let turn = Turn::new(9, TurnFlags::NONE);
        data.push(1);
        data.push(2);
        data.set_current_turn(&turn, true, true);
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn source_inputs_coalesce_into_one_pulse() {
        let data = Arc::new(EventData::new());
        let source = EventSourceBehavior::new(data.clone());
        let turn = Turn::new(1, TurnFlags::NONE);

        source.add_input(1);
        source.add_input(2);
        assert!(source.apply_input(&turn));
        assert!(!source.apply_input(&turn)); // flag already raised
        assert_eq!(data.snapshot(), vec![1, 2]);

        // Next admission clears the consumed buffer first.
        source.add_input(3);
        let next = Turn::new(2, TurnFlags::NONE);
        assert!(source.apply_input(&next));
        assert_eq!(data.snapshot(), vec![3]);
    }
}
