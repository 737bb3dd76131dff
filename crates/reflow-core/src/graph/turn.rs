//! Turn objects and the exclusive turn manager.
//!
//! A turn is a passive token: id, admission flags and the lists that
//! accumulate during propagation (deferred observer detaches, continuation
//! inputs). The manager serializes turns end-to-end in submission order
//! and lets compatible pending inputs merge into the queued tail turn.

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::TransactionCtx;
use crate::types::{NodeId, TurnFlags, TurnId};

/// An input mutation to run during a turn's admission stage.
pub type InputFn = Box<dyn for<'a> FnOnce(&mut TransactionCtx<'a>) + Send>;

/// Per-propagation token. Carries no behavior beyond accumulation.
pub struct Turn {
    id: TurnId,
    flags: TurnFlags,
    detached: OnceCell<SegQueue<NodeId>>,
    continuations: Mutex<Vec<InputFn>>,
}

impl Turn {
    pub(crate) fn new(id: TurnId, flags: TurnFlags) -> Self {
        Self {
            id,
            flags,
            detached: OnceCell::new(),
            continuations: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn flags(&self) -> TurnFlags {
        self.flags
    }

    /// Records an observer for removal at end of turn. Appended
    /// concurrently by ticks; the list is created on first use.
    pub(crate) fn queue_for_detach(&self, observer: NodeId) {
        self.detached.get_or_init(SegQueue::new).push(observer);
    }

    pub(crate) fn take_detached(&self) -> Vec<NodeId> {
        let Some(queue) = self.detached.get() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(node) = queue.pop() {
            out.push(node);
        }
        out
    }

    /// Queues inputs to be admitted as a fresh turn once this one has
    /// fully ended.
    pub(crate) fn push_continuation(&self, input: InputFn) {
        self.continuations.lock().push(input);
    }

    pub(crate) fn take_continuations(&self) -> Vec<InputFn> {
        std::mem::take(&mut *self.continuations.lock())
    }
}

/// One-shot gate a thread can park on until another thread opens it.
pub(crate) struct BlockingCondition {
    blocked: Mutex<bool>,
    cond: Condvar,
}

impl BlockingCondition {
    pub fn new() -> Self {
        Self {
            blocked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn block(&self) {
        *self.blocked.lock() = true;
    }

    pub fn unblock(&self) {
        *self.blocked.lock() = false;
        self.cond.notify_all();
    }

    pub fn wait_for_unblock(&self) {
        let mut blocked = self.blocked.lock();
        while *blocked {
            self.cond.wait(&mut blocked);
        }
    }

    /// Runs `f` under the condition's lock, but only while still blocked.
    /// Returns whether `f` ran. This is what makes merging race-free: once
    /// a turn unblocks, its admission window is closed and no further
    /// input can slip in.
    pub fn run_if_blocked(&self, f: impl FnOnce()) -> bool {
        let blocked = self.blocked.lock();
        if *blocked {
            f();
            true
        } else {
            false
        }
    }
}

/// Sequencing state of one queued turn.
pub(crate) struct TurnHandle {
    mergeable: bool,
    block: BlockingCondition,
    successor: Mutex<Option<Arc<TurnHandle>>>,
    merged: Mutex<Vec<(Option<InputFn>, Arc<BlockingCondition>)>>,
}

impl TurnHandle {
    pub fn new(flags: TurnFlags) -> Self {
        Self {
            mergeable: flags.contains(TurnFlags::ALLOW_INPUT_MERGING),
            block: BlockingCondition::new(),
            successor: Mutex::new(None),
            merged: Mutex::new(Vec::new()),
        }
    }

    /// Chains `next` behind this turn; `next` stays blocked until this
    /// turn releases it.
    fn append(&self, next: &Arc<TurnHandle>) {
        *self.successor.lock() = Some(next.clone());
        next.block.block();
    }

    fn try_merge(
        &self,
        input: InputFn,
        caller: &Arc<BlockingCondition>,
    ) -> std::result::Result<(), InputFn> {
        if !self.mergeable {
            return Err(input);
        }
        let mut slot = Some(input);
        self.block.run_if_blocked(|| {
            caller.block();
            self.merged.lock().push((slot.take(), caller.clone()));
        });
        match slot {
            None => Ok(()),
            Some(input) => Err(input),
        }
    }

    /// Runs every merged input as part of this turn's admission stage.
    pub fn run_merged_inputs(&self, ctx: &mut TransactionCtx<'_>) {
        let mut merged = self.merged.lock();
        for entry in merged.iter_mut() {
            if let Some(input) = entry.0.take() {
                input(ctx);
            }
        }
    }

    fn unblock_successors(&self) {
        for (_, caller) in self.merged.lock().drain(..) {
            caller.unblock();
        }
        if let Some(successor) = self.successor.lock().take() {
            successor.block.unblock();
        }
    }

    fn wait_for_unblock(&self) {
        self.block.wait_for_unblock();
    }
}

/// Serializes turns in submission order (exclusive turn mode). The tail
/// pointer is the only shared state; a FIFO mutex over it keeps
/// submission order fair.
pub(crate) struct TurnManager {
    tail: Mutex<Option<Arc<TurnHandle>>>,
}

impl TurnManager {
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(None),
        }
    }

    /// Attempts to attach `input` to the queued tail turn. On success the
    /// caller has already waited until the tail turn executed the input;
    /// on failure the input is handed back for a regular turn.
    pub fn try_merge(&self, input: InputFn) -> std::result::Result<(), InputFn> {
        let caller = Arc::new(BlockingCondition::new());
        let merged = {
            let tail = self.tail.lock();
            match tail.as_ref() {
                Some(turn) => turn.try_merge(input, &caller),
                None => Err(input),
            }
        };
        match merged {
            Ok(()) => {
                trace!("input merged into queued turn");
                caller.wait_for_unblock();
                Ok(())
            }
            Err(input) => Err(input),
        }
    }

    /// Appends `turn` to the queue and waits until every predecessor has
    /// ended.
    pub fn start_turn(&self, turn: &Arc<TurnHandle>) {
        {
            let mut tail = self.tail.lock();
            if let Some(prev) = tail.as_ref() {
                prev.append(turn);
            }
            *tail = Some(turn.clone());
        }
        turn.wait_for_unblock();
    }

    /// Releases merged callers and the designated successor, then drops
    /// the tail pointer if this turn was still the tail.
    pub fn end_turn(&self, turn: &Arc<TurnHandle>) {
        let mut tail = self.tail.lock();
        turn.unblock_successors();
        if tail.as_ref().map(|t| Arc::ptr_eq(t, turn)) == Some(true) {
            *tail = None;
        }
        debug!("turn released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn blocking_condition_gates_threads() {
        let cond = Arc::new(BlockingCondition::new());
        cond.block();
        let passed = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            let waiter_cond = cond.clone();
            let waiter_passed = passed.clone();
            scope.spawn(move || {
                waiter_cond.wait_for_unblock();
                waiter_passed.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(passed.load(Ordering::SeqCst), 0);
            cond.unblock();
        });
        assert_eq!(passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_if_blocked_only_runs_while_blocked() {
        let cond = BlockingCondition::new();
        assert!(!cond.run_if_blocked(|| unreachable!("not blocked")));
        cond.block();
        let mut ran = false;
        assert!(cond.run_if_blocked(|| ran = true));
        assert!(ran);
    }

    #[test]
    fn merge_is_rejected_without_the_flag_and_without_a_tail() {
        let manager = TurnManager::new();
        // No queued turn: the input comes back.
        assert!(manager.try_merge(Box::new(|_| {})).is_err());

        let plain = Arc::new(TurnHandle::new(TurnFlags::NONE));
        plain.block.block();
        *manager.tail.lock() = Some(plain.clone());
        assert!(manager.try_merge(Box::new(|_| {})).is_err());
        plain.block.unblock();
    }

    #[test]
    fn turns_run_in_submission_order() {
        let manager = Arc::new(TurnManager::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::new(TurnHandle::new(TurnFlags::NONE));
        manager.start_turn(&first);

        std::thread::scope(|scope| {
            for i in 0..3u32 {
                let manager = manager.clone();
                let order = order.clone();
                scope.spawn(move || {
                    // Stagger submissions so the queue order is deterministic.
                    std::thread::sleep(Duration::from_millis(30 * (i as u64 + 1)));
                    let turn = Arc::new(TurnHandle::new(TurnFlags::NONE));
                    manager.start_turn(&turn);
                    order.lock().push(i);
                    manager.end_turn(&turn);
                });
            }
            std::thread::sleep(Duration::from_millis(150));
            manager.end_turn(&first);
        });

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
