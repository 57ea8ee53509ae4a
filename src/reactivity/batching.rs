// ============================================================================
// pulse-signals - Batching
// Group multiple updates into a single reaction cycle
// ============================================================================

use std::rc::Weak;

use crate::core::context::with_context;
use crate::core::types::AnyConsumer;
use crate::reactivity::scheduling::{end_batch_from_guard, start_batch};

// =============================================================================
// BATCH
// =============================================================================

/// Batch multiple signal updates into a single effect flush.
///
/// Without batching, each signal write flushes affected effects before the
/// write returns. Inside `batch`, notifications are deferred until the
/// outermost batch exits, so effects observe all the writes at once and run
/// at most once.
///
/// Returns the closure's result. Nested calls are flattened: only the
/// outermost batch flushes.
///
/// # Example
///
/// ```
/// use pulse_signals::{batch, effect, signal};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let a = signal(1);
/// let b = signal(2);
/// let runs = Rc::new(Cell::new(0));
///
/// let a2 = a.clone();
/// let b2 = b.clone();
/// let runs2 = runs.clone();
/// let _e = effect(move || {
///     let _ = a2.get() + b2.get();
///     runs2.set(runs2.get() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// batch(|| {
///     a.set(10);
///     b.set(20);
/// });
///
/// // One flush for both writes.
/// assert_eq!(runs.get(), 2);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    if with_context(|ctx| ctx.is_batching()) {
        return f();
    }

    start_batch();

    // Guard so the batch closes and flushes on every exit path.
    struct BatchGuard;

    impl Drop for BatchGuard {
        fn drop(&mut self) {
            end_batch_from_guard();
        }
    }

    let _guard = BatchGuard;
    f()
}

// =============================================================================
// UNTRACKED
// =============================================================================

/// Read signals without creating dependencies.
///
/// Inside an effect or computed, reads under `untracked` do not subscribe
/// the consumer to the cells it touches.
///
/// # Example
///
/// ```
/// use pulse_signals::{effect, signal, untracked};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let tracked = signal(1);
/// let ignored = signal(2);
/// let runs = Rc::new(Cell::new(0));
///
/// let tracked2 = tracked.clone();
/// let ignored2 = ignored.clone();
/// let runs2 = runs.clone();
/// let _e = effect(move || {
///     let _ = tracked2.get();
///     let _ = untracked(|| ignored2.get());
///     runs2.set(runs2.get() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// tracked.set(10); // re-runs the effect
/// assert_eq!(runs.get(), 2);
///
/// ignored.set(20); // does not
/// assert_eq!(runs.get(), 2);
/// ```
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    if with_context(|ctx| ctx.is_untracked()) {
        return f();
    }

    let prev = with_context(|ctx| {
        ctx.enter_untracked();
        ctx.set_eval_context(None)
    });

    // Guard so context and depth are restored on every exit path.
    struct UntrackGuard {
        prev: Option<Weak<dyn AnyConsumer>>,
    }

    impl Drop for UntrackGuard {
        fn drop(&mut self) {
            let prev = self.prev.clone();
            with_context(|ctx| {
                ctx.set_eval_context(prev);
                ctx.exit_untracked();
            });
        }
    }

    let _guard = UntrackGuard { prev };
    f()
}

// =============================================================================
// TESTS
// =============================================================================
