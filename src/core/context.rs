// ============================================================================
// pulse-signals - Engine Context
// Thread-local state for the reactive engine
// ============================================================================
//
// One logical engine per thread: the current evaluation context, batch
// bookkeeping, and the deferred-effect queue live in a thread_local
// ReactiveContext. Contexts on different threads are fully disjoint, which
// is what makes per-request isolation work without locking.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::types::AnyConsumer;

// =============================================================================
// REACTIVE CONTEXT
// =============================================================================

/// Thread-local engine state.
pub struct ReactiveContext {
    /// The consumer whose reads currently establish dependencies.
    eval_context: RefCell<Option<Weak<dyn AnyConsumer>>>,

    /// Current batch nesting depth.
    batch_depth: Cell<u32>,

    /// Number of drain iterations performed by the current outermost batch.
    batch_iteration: Cell<u32>,

    /// Current untracked-scope nesting depth.
    untracked_depth: Cell<u32>,

    /// Effects notified this epoch, awaiting the batch drain.
    pending_effects: RefCell<Vec<Weak<dyn AnyConsumer>>>,
}

impl ReactiveContext {
    fn new() -> Self {
        Self {
            eval_context: RefCell::new(None),
            batch_depth: Cell::new(0),
            batch_iteration: Cell::new(0),
            untracked_depth: Cell::new(0),
            pending_effects: RefCell::new(Vec::new()),
        }
    }

    // =========================================================================
    // EVALUATION CONTEXT
    // =========================================================================

    /// Replace the evaluation context, returning the previous one.
    pub fn set_eval_context(
        &self,
        consumer: Option<Weak<dyn AnyConsumer>>,
    ) -> Option<Weak<dyn AnyConsumer>> {
        self.eval_context.replace(consumer)
    }

    /// The consumer currently evaluating, if it is still alive.
    pub fn active_consumer(&self) -> Option<Rc<dyn AnyConsumer>> {
        self.eval_context.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Whether any consumer is currently evaluating.
    pub fn has_active_consumer(&self) -> bool {
        self.eval_context.borrow().is_some()
    }

    // =========================================================================
    // BATCHING
    // =========================================================================

    /// Increment batch depth, returning the new depth.
    pub fn enter_batch(&self) -> u32 {
        let depth = self.batch_depth.get() + 1;
        self.batch_depth.set(depth);
        depth
    }

    /// Decrement batch depth, returning the new depth.
    pub fn exit_batch(&self) -> u32 {
        let depth = self.batch_depth.get().saturating_sub(1);
        self.batch_depth.set(depth);
        depth
    }

    /// Current batch depth.
    pub fn batch_depth(&self) -> u32 {
        self.batch_depth.get()
    }

    /// Whether a batch is open.
    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0
    }

    /// Increment the drain iteration counter, returning the new count.
    pub fn bump_batch_iteration(&self) -> u32 {
        let n = self.batch_iteration.get() + 1;
        self.batch_iteration.set(n);
        n
    }

    /// Drain iterations performed by the current outermost batch.
    pub fn batch_iteration(&self) -> u32 {
        self.batch_iteration.get()
    }

    /// Reset the drain iteration counter when the outermost batch closes.
    pub fn reset_batch_iteration(&self) {
        self.batch_iteration.set(0);
    }

    // =========================================================================
    // UNTRACKED SCOPES
    // =========================================================================

    /// Enter an untracked scope.
    pub fn enter_untracked(&self) {
        self.untracked_depth.set(self.untracked_depth.get() + 1);
    }

    /// Leave an untracked scope.
    pub fn exit_untracked(&self) {
        self.untracked_depth
            .set(self.untracked_depth.get().saturating_sub(1));
    }

    /// Current untracked nesting depth.
    pub fn untracked_depth(&self) -> u32 {
        self.untracked_depth.get()
    }

    /// Whether reads currently bypass dependency discovery.
    pub fn is_untracked(&self) -> bool {
        self.untracked_depth.get() > 0
    }

    // =========================================================================
    // PENDING EFFECTS
    // =========================================================================

    /// Enqueue a notified effect for the batch drain.
    pub fn push_pending_effect(&self, effect: Weak<dyn AnyConsumer>) {
        self.pending_effects.borrow_mut().push(effect);
    }

    /// Detach the whole pending queue; further notifications start a new one.
    pub fn take_pending_effects(&self) -> Vec<Weak<dyn AnyConsumer>> {
        self.pending_effects.replace(Vec::new())
    }

    /// Whether any effects await the drain.
    pub fn has_pending_effects(&self) -> bool {
        !self.pending_effects.borrow().is_empty()
    }
}

// =============================================================================
// THREAD-LOCAL ACCESS
// =============================================================================

thread_local! {
    static CONTEXT: ReactiveContext = ReactiveContext::new();
}

/// Access this thread's engine context.
pub fn with_context<R>(f: impl FnOnce(&ReactiveContext) -> R) -> R {
    CONTEXT.with(f)
}

// =============================================================================
// CONVENIENCE FUNCTIONS
// =============================================================================

/// Whether reads currently establish dependencies (a consumer is evaluating
/// and no untracked scope is open).
pub fn is_tracking() -> bool {
    with_context(|ctx| ctx.has_active_consumer() && !ctx.is_untracked())
}

/// Whether a batch is currently open.
pub fn is_batching() -> bool {
    with_context(|ctx| ctx.is_batching())
}

/// Whether an untracked scope is currently open.
pub fn is_untracked() -> bool {
    with_context(|ctx| ctx.is_untracked())
}

// =============================================================================
// TESTS
// =============================================================================
