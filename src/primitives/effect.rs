// ============================================================================
// pulse-signals - Effect System
// Side effects that re-run when observed cells change
// ============================================================================
//
// An effect runs its closure once on creation and again whenever one of the
// cells it read has changed, at most once per batch drain. The closure may
// return a cleanup that runs before the next execution and on disposal.
//
// Every run is bracketed by a Drop guard: the evaluation context is
// restored, the source bracket is closed, and the surrounding batch ends on
// every exit path, including an unwind out of the closure.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::SignalError;
use crate::core::node::Node;
use crate::core::types::{AnyConsumer, AnySource};
use crate::reactivity::scheduling::{end_batch, end_batch_from_guard, start_batch};
use crate::reactivity::tracking::{cleanup_sources, prepare_sources};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Cleanup returned by an effect closure; runs before the next execution
/// and on disposal.
pub type CleanupFn = Box<dyn FnOnce()>;

/// Effect closure signature.
pub type EffectFn = Box<dyn FnMut() -> Option<CleanupFn>>;

// =============================================================================
// EFFECT INNER
// =============================================================================

/// The graph-side data of an effect.
///
/// Implements `AnyConsumer` only: effects observe cells but have no
/// subscribers of their own.
pub struct EffectInner {
    /// Consumer state machine. Starts `TRACKING`: effect reads subscribe.
    flags: Cell<u32>,

    /// The effect closure; dropped on disposal so it can never re-run
    func: RefCell<Option<EffectFn>>,

    /// Cleanup returned by the previous run
    cleanup: RefCell<Option<CleanupFn>>,

    /// Dependency list, in first-read order
    sources: RefCell<Option<Rc<Node>>>,
    sources_tail: RefCell<Option<Weak<Node>>>,

    /// Weak self-reference for enqueueing into the pending queue
    self_weak: RefCell<Weak<EffectInner>>,
}

impl EffectInner {
    /// Create a new effect record. Does not run the closure.
    pub(crate) fn new(func: EffectFn) -> Rc<Self> {
        let effect = Rc::new(Self {
            flags: Cell::new(TRACKING),
            func: RefCell::new(Some(func)),
            cleanup: RefCell::new(None),
            sources: RefCell::new(None),
            sources_tail: RefCell::new(None),
            self_weak: RefCell::new(Weak::new()),
        });
        *effect.self_weak.borrow_mut() = Rc::downgrade(&effect);
        effect
    }

    fn self_rc(&self) -> Option<Rc<EffectInner>> {
        self.self_weak.borrow().upgrade()
    }
}

impl AnyConsumer for EffectInner {
    fn flags(&self) -> u32 {
        self.flags.get()
    }

    fn set_flags(&self, flags: u32) {
        self.flags.set(flags);
    }

    fn sources_head(&self) -> Option<Rc<Node>> {
        self.sources.borrow().clone()
    }

    fn set_sources_head(&self, head: Option<Rc<Node>>) {
        *self.sources.borrow_mut() = head;
    }

    fn sources_tail(&self) -> Option<Rc<Node>> {
        self.sources_tail.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn set_sources_tail(&self, tail: Option<Weak<Node>>) {
        *self.sources_tail.borrow_mut() = tail;
    }

    fn notify(&self) {
        if self.flags.get() & NOTIFIED == 0 {
            self.flags.set(self.flags.get() | NOTIFIED);
            if let Some(rc) = self.self_rc() {
                with_context(|ctx| {
                    ctx.push_pending_effect(Rc::downgrade(&(rc as Rc<dyn AnyConsumer>)));
                });
            }
        }
    }

    fn run(&self) {
        if let Some(rc) = self.self_rc() {
            run_effect(&rc);
        }
    }

    fn as_source(&self) -> Option<Rc<dyn AnySource>> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// =============================================================================
// RUN PROTOCOL
// =============================================================================

/// Execute an effect's closure with dependency tracking.
pub(crate) fn run_effect(effect: &Rc<EffectInner>) {
    if effect.flags.get() & RUNNING != 0 {
        panic!("{}", SignalError::Cycle);
    }
    effect.flags.set((effect.flags.get() | RUNNING) & !DISPOSED);

    run_cleanup(effect);
    prepare_sources(&**effect);
    start_batch();

    let consumer: Rc<dyn AnyConsumer> = effect.clone();
    let prev = with_context(|ctx| ctx.set_eval_context(Some(Rc::downgrade(&consumer))));
    let _scope = RunScope {
        effect: effect.clone(),
        prev,
    };

    let cleanup = {
        let mut func = effect.func.borrow_mut();
        match func.as_mut() {
            Some(f) => f(),
            None => None,
        }
    };
    if cleanup.is_some() {
        *effect.cleanup.borrow_mut() = cleanup;
    }
}

/// Finalizer for one effect run. Dropping it closes the run on every exit
/// path: sources bracket, evaluation context, RUNNING flag, a disposal
/// requested mid-run, and the surrounding batch.
struct RunScope {
    effect: Rc<EffectInner>,
    prev: Option<Weak<dyn AnyConsumer>>,
}

impl Drop for RunScope {
    fn drop(&mut self) {
        debug_assert!(
            with_context(|ctx| ctx.active_consumer()).is_some_and(|c| {
                Rc::as_ptr(&c) as *const ()
                    == Rc::as_ptr(&(self.effect.clone() as Rc<dyn AnyConsumer>)) as *const ()
            }),
            "effect finalizer ran outside its own evaluation context"
        );

        cleanup_sources(&*self.effect);
        let prev = self.prev.clone();
        with_context(|ctx| ctx.set_eval_context(prev));

        self.effect
            .flags
            .set(self.effect.flags.get() & !RUNNING);
        if self.effect.flags.get() & DISPOSED != 0 {
            dispose_effect(&self.effect);
        }

        end_batch_from_guard();
    }
}

/// Run the stored cleanup, outside any evaluation context and inside a
/// batch. A panicking cleanup disposes the effect before propagating.
fn run_cleanup(effect: &Rc<EffectInner>) {
    let Some(cleanup) = effect.cleanup.borrow_mut().take() else {
        return;
    };

    start_batch();
    let prev = with_context(|ctx| ctx.set_eval_context(None));
    let outcome = catch_unwind(AssertUnwindSafe(cleanup));
    with_context(|ctx| ctx.set_eval_context(prev));

    match outcome {
        Ok(()) => end_batch(),
        Err(payload) => {
            log::debug!("effect cleanup panicked, disposing effect");
            effect
                .flags
                .set((effect.flags.get() & !RUNNING) | DISPOSED);
            dispose_effect(effect);
            end_batch();
            resume_unwind(payload);
        }
    }
}

/// Tear an effect down: release every dependency, drop the closure, and run
/// any stored cleanup. Idempotent.
pub(crate) fn dispose_effect(effect: &Rc<EffectInner>) {
    let mut node = effect.sources.borrow().clone();
    while let Some(n) = node {
        n.source.unsubscribe_node(&n);
        node = n.next_source.borrow().clone();
    }

    *effect.func.borrow_mut() = None;
    *effect.sources.borrow_mut() = None;
    *effect.sources_tail.borrow_mut() = None;

    run_cleanup(effect);
}

// =============================================================================
// EFFECT - The public handle
// =============================================================================

/// Handle to a running effect.
///
/// Disposing (or dropping the last handle) unsubscribes every dependency,
/// runs the stored cleanup, and guarantees the closure never runs again.
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Stop the effect. Safe to call more than once.
    pub fn dispose(&self) {
        self.inner.flags.set(self.inner.flags.get() | DISPOSED);
        if self.inner.flags.get() & RUNNING == 0 {
            dispose_effect(&self.inner);
        }
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.flags.get() & DISPOSED != 0
    }

    /// Access the inner record (for graph-level operations).
    pub fn inner(&self) -> &Rc<EffectInner> {
        &self.inner
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        // Last handle gone: nothing can dispose the effect anymore, so do it
        // now rather than leave a zombie subscription behind.
        if Rc::strong_count(&self.inner) == 1 {
            self.dispose();
        }
    }
}

// =============================================================================
// CONSTRUCTION FUNCTIONS
// =============================================================================

/// Create an effect that re-runs whenever the cells it reads change.
///
/// The closure runs once immediately. A panic during this first run
/// disposes the effect and propagates.
///
/// # Example
///
/// ```
/// use pulse_signals::{effect, signal};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let count = signal(0);
/// let seen = Rc::new(Cell::new(0));
///
/// let count2 = count.clone();
/// let seen2 = seen.clone();
/// let e = effect(move || {
///     seen2.set(count2.get());
/// });
///
/// count.set(42);
/// assert_eq!(seen.get(), 42);
///
/// e.dispose();
/// count.set(7);
/// assert_eq!(seen.get(), 42);
/// ```
pub fn effect<F>(mut f: F) -> Effect
where
    F: FnMut() + 'static,
{
    effect_with_cleanup(move || {
        f();
        None
    })
}

/// Create an effect whose closure may return a cleanup.
///
/// The cleanup runs before each re-execution and when the effect is
/// disposed.
///
/// # Example
///
/// ```
/// use pulse_signals::{effect_with_cleanup, signal, CleanupFn};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let count = signal(0);
/// let cleanups = Rc::new(Cell::new(0));
///
/// let count2 = count.clone();
/// let cleanups2 = cleanups.clone();
/// let e = effect_with_cleanup(move || {
///     let _ = count2.get();
///     let c = cleanups2.clone();
///     Some(Box::new(move || c.set(c.get() + 1)) as CleanupFn)
/// });
///
/// count.set(1);
/// assert_eq!(cleanups.get(), 1);
///
/// e.dispose();
/// assert_eq!(cleanups.get(), 2);
/// ```
pub fn effect_with_cleanup<F>(f: F) -> Effect
where
    F: FnMut() -> Option<CleanupFn> + 'static,
{
    let inner = EffectInner::new(Box::new(f));

    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| run_effect(&inner))) {
        inner.flags.set(inner.flags.get() | DISPOSED);
        if inner.flags.get() & RUNNING == 0 {
            dispose_effect(&inner);
        }
        resume_unwind(payload);
    }

    Effect { inner }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::signal::signal;
    use crate::reactivity::batching::batch;
    use std::cell::{Cell, RefCell};

    #[test]
    fn effect_runs_immediately_and_on_change() {
        let count = signal(0);
        let runs = Rc::new(Cell::new(0));

        let count2 = count.clone();
        let runs2 = runs.clone();
        let _e = effect(move || {
            let _ = count2.get();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        count.set(1);
        assert_eq!(runs.get(), 2);

        count.set(1); // unchanged
        assert_eq!(runs.get(), 2);

        count.set(2);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn cleanup_runs_before_each_rerun() {
        let count = signal(0);
        let cleanups = Rc::new(Cell::new(0));

        let count2 = count.clone();
        let cleanups2 = cleanups.clone();
        let _e = effect_with_cleanup(move || {
            let _ = count2.get();
            let c = cleanups2.clone();
            Some(Box::new(move || c.set(c.get() + 1)) as CleanupFn)
        });
        assert_eq!(cleanups.get(), 0);

        count.set(1);
        assert_eq!(cleanups.get(), 1);

        count.set(2);
        assert_eq!(cleanups.get(), 2);
    }

    #[test]
    fn dispose_runs_cleanup_and_stops_reruns() {
        let count = signal(0);
        let runs = Rc::new(Cell::new(0));
        let cleaned = Rc::new(Cell::new(false));

        let count2 = count.clone();
        let runs2 = runs.clone();
        let cleaned2 = cleaned.clone();
        let e = effect_with_cleanup(move || {
            let _ = count2.get();
            runs2.set(runs2.get() + 1);
            let c = cleaned2.clone();
            Some(Box::new(move || c.set(true)) as CleanupFn)
        });
        assert_eq!(runs.get(), 1);
        assert!(!cleaned.get());

        e.dispose();
        assert!(cleaned.get());
        assert!(e.is_disposed());

        count.set(1);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn dispose_twice_is_noop() {
        let cleanups = Rc::new(Cell::new(0));

        let cleanups2 = cleanups.clone();
        let e = effect_with_cleanup(move || {
            let c = cleanups2.clone();
            Some(Box::new(move || c.set(c.get() + 1)) as CleanupFn)
        });

        e.dispose();
        e.dispose();
        assert_eq!(cleanups.get(), 1);
    }

    #[test]
    fn dropping_last_handle_disposes() {
        let count = signal(0);
        let runs = Rc::new(Cell::new(0));

        {
            let count2 = count.clone();
            let runs2 = runs.clone();
            let _e = effect(move || {
                let _ = count2.get();
                runs2.set(runs2.get() + 1);
            });
            count.set(1);
            assert_eq!(runs.get(), 2);
        }

        count.set(2);
        assert_eq!(runs.get(), 2);
        assert_eq!(count.subscriber_count(), 0);
    }

    #[test]
    fn dispose_from_inside_the_effect() {
        let count = signal(0);
        let runs = Rc::new(Cell::new(0));

        let handle: Rc<RefCell<Option<Effect>>> = Rc::new(RefCell::new(None));

        let count2 = count.clone();
        let runs2 = runs.clone();
        let handle2 = handle.clone();
        let e = effect(move || {
            let v = count2.get();
            runs2.set(runs2.get() + 1);
            if v >= 1 {
                if let Some(h) = handle2.borrow().as_ref() {
                    h.dispose();
                }
            }
        });
        *handle.borrow_mut() = Some(e);
        assert_eq!(runs.get(), 1);

        count.set(1);
        assert_eq!(runs.get(), 2);

        // The mid-run disposal completed when the run ended.
        count.set(2);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    #[should_panic(expected = "first run failure")]
    fn first_run_panic_disposes_and_propagates() {
        let _e = effect(|| panic!("first run failure"));
    }

    #[test]
    fn first_run_panic_leaves_no_subscription() {
        let count = signal(0);

        let count2 = count.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            effect(move || {
                let _ = count2.get();
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert_eq!(count.subscriber_count(), 0);
    }

    #[test]
    #[should_panic(expected = "cleanup failure")]
    fn cleanup_panic_disposes_and_propagates() {
        let count = signal(0);

        let count2 = count.clone();
        let _e = effect_with_cleanup(move || {
            let _ = count2.get();
            Some(Box::new(|| panic!("cleanup failure")) as CleanupFn)
        });

        // The rerun executes the stored cleanup, which panics.
        count.set(1);
    }

    #[test]
    fn effect_in_batch_sees_final_values() {
        let a = signal(1);
        let b = signal(10);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let a2 = a.clone();
        let b2 = b.clone();
        let seen2 = seen.clone();
        let _e = effect(move || {
            seen2.borrow_mut().push(a2.get() + b2.get());
        });
        assert_eq!(*seen.borrow(), vec![11]);

        batch(|| {
            a.set(2);
            b.set(20);
        });
        assert_eq!(*seen.borrow(), vec![11, 22]);
    }
}
