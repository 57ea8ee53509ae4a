// ============================================================================
// pulse-signals - Batch Scheduling
// Deferred effect execution and the batch drain
// ============================================================================
//
// Writes never run effects inline. Each write opens a batch, notifies
// subscribers (which enqueue affected effects exactly once via the NOTIFIED
// flag), and closes the batch; only the outermost close drains the queue.
// The drain detaches the whole queue per iteration so callbacks that write
// enqueue into a fresh one, and keeps iterating until no work remains.
//
// A panic in one callback must not starve the rest: the drain captures the
// first payload, finishes every remaining effect, and resumes the panic
// after the queue is empty.
// ============================================================================

use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::types::AnyConsumer;
use crate::reactivity::tracking::needs_to_recompute;

// =============================================================================
// BATCH OPEN / CLOSE
// =============================================================================

/// Open a batch. Every `start_batch` must be paired with an `end_batch`.
pub(crate) fn start_batch() {
    with_context(|ctx| {
        ctx.enter_batch();
    });
}

/// Close a batch; the outermost close drains pending effects and re-raises
/// the first panic captured during the drain.
pub(crate) fn end_batch() {
    if let Some(payload) = end_batch_collecting() {
        resume_unwind(payload);
    }
}

/// Close a batch from a Drop guard. A captured drain panic is re-raised
/// only when no unwind is already in progress; otherwise the original
/// panic wins and the drain payload is dropped.
pub(crate) fn end_batch_from_guard() {
    if let Some(payload) = end_batch_collecting() {
        if !std::thread::panicking() {
            resume_unwind(payload);
        }
    }
}

/// Close a batch, returning the first panic payload raised by a drained
/// effect instead of resuming it.
fn end_batch_collecting() -> Option<Box<dyn Any + Send>> {
    if with_context(|ctx| ctx.batch_depth()) > 1 {
        with_context(|ctx| {
            ctx.exit_batch();
        });
        return None;
    }

    let mut first_panic: Option<Box<dyn Any + Send>> = None;

    loop {
        let pending = with_context(|ctx| ctx.take_pending_effects());
        if pending.is_empty() {
            break;
        }
        let iteration = with_context(|ctx| ctx.bump_batch_iteration());
        log::trace!(
            "draining {} pending effect(s), iteration {}",
            pending.len(),
            iteration
        );

        for weak in pending {
            let Some(consumer) = weak.upgrade() else {
                continue;
            };
            consumer.set_flags(consumer.flags() & !NOTIFIED);

            if consumer.flags() & DISPOSED == 0 && needs_to_recompute(&*consumer) {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| consumer.run())) {
                    if first_panic.is_none() {
                        first_panic = Some(payload);
                    }
                }
            }
        }
    }

    with_context(|ctx| {
        ctx.reset_batch_iteration();
        ctx.exit_batch();
    });

    first_panic
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::effect::effect;
    use crate::primitives::signal::signal;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn drain_runs_each_notified_effect_once() {
        let a = signal(0);
        let runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let runs2 = runs.clone();
        let _e = effect(move || {
            let _ = a2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        start_batch();
        a.set(1);
        a.set(2);
        assert_eq!(runs.get(), 1);
        end_batch();

        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn drain_skips_disposed_effects() {
        let a = signal(0);
        let runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let runs2 = runs.clone();
        let e = effect(move || {
            let _ = a2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        start_batch();
        a.set(1);
        e.dispose();
        end_batch();

        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn drain_continues_past_a_panicking_effect() {
        let a = signal(0);
        let survivor_runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let survivor = survivor_runs.clone();
        let _ok = effect(move || {
            let _ = a2.get();
            survivor.set(survivor.get() + 1);
        });

        let a3 = a.clone();
        // Created second, so it sits at the head of the subscriber list and
        // drains first.
        let _bad = effect(move || {
            if a3.get() == 1 {
                panic!("intentional panic");
            }
        });

        assert_eq!(survivor_runs.get(), 1);

        let result = catch_unwind(AssertUnwindSafe(|| a.set(1)));
        assert!(result.is_err());

        // The panicking effect did not prevent the other one from running.
        assert_eq!(survivor_runs.get(), 2);

        // The engine is back in its idle state.
        with_context(|ctx| {
            assert_eq!(ctx.batch_depth(), 0);
            assert_eq!(ctx.batch_iteration(), 0);
            assert!(!ctx.has_pending_effects());
        });
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn runaway_feedback_is_cut_off() {
        let count = signal(0);
        let count2 = count.clone();

        // Reads and writes the same signal: every run re-triggers itself.
        let _e = effect(move || {
            let current = count2.get();
            count2.set(current + 1);
        });
    }
}
