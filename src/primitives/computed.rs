// ============================================================================
// pulse-signals - Computed Cells
// Lazily-memoized values derived from other cells
// ============================================================================
//
// A Computed is BOTH a source (it can be read and has subscribers) AND a
// consumer (it has dependencies and reacts to their changes). Subscription
// to its own sources is lazy: it attaches on gaining its first subscriber
// and detaches on losing the last, so unobserved derived sub-graphs cost
// nothing on writes and can be collected.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::{SignalError, SignalResult};
use crate::core::node::{attach_subscriber, collect_live_subscribers, detach_subscriber, Node};
use crate::core::types::{default_equals, AnyConsumer, AnySource, EqualsFn};
use crate::primitives::effect::{effect, Effect};
use crate::reactivity::tracking::{
    add_dependency, cleanup_sources, needs_to_recompute, prepare_sources, with_tracking_paused,
};

// =============================================================================
// COMPUTED INNER
// =============================================================================

/// The graph-side data of a derived cell.
///
/// Implements both `AnySource` (read side) and `AnyConsumer` (dependency
/// side).
pub struct ComputedInner<T> {
    /// Consumer state machine (see `core::constants`). Starts `OUTDATED`.
    flags: Cell<u32>,

    /// The computation
    compute: Box<dyn Fn() -> SignalResult<T>>,

    /// Cached outcome; `None` until the first evaluation
    value: RefCell<Option<SignalResult<T>>>,

    /// Bumped whenever the cached outcome changes
    version: Cell<u64>,

    /// Equality function deciding whether a recompute changed the value
    equals: EqualsFn<T>,

    /// Head of the subscriber list (source side)
    subscribers: RefCell<Option<Rc<Node>>>,

    /// Scratch slot used while one of this cell's consumers re-evaluates
    current_node: RefCell<Option<Weak<Node>>>,

    /// Dependency list (consumer side), in first-read order
    sources: RefCell<Option<Rc<Node>>>,
    sources_tail: RefCell<Option<Weak<Node>>>,

    /// Weak self-reference for handing out trait-object views of this cell
    self_ref: RefCell<Option<Weak<ComputedInner<T>>>>,
}

impl<T: 'static> ComputedInner<T> {
    /// Create a new derived cell from a fallible computation.
    pub fn new<F>(compute: F, equals: EqualsFn<T>) -> Rc<Self>
    where
        F: Fn() -> SignalResult<T> + 'static,
    {
        let inner = Rc::new(Self {
            flags: Cell::new(OUTDATED),
            compute: Box::new(compute),
            value: RefCell::new(None),
            version: Cell::new(0),
            equals,
            subscribers: RefCell::new(None),
            current_node: RefCell::new(None),
            sources: RefCell::new(None),
            sources_tail: RefCell::new(None),
            self_ref: RefCell::new(None),
        });
        *inner.self_ref.borrow_mut() = Some(Rc::downgrade(&inner));
        inner
    }

    fn consumer_rc(&self) -> Option<Rc<dyn AnyConsumer>> {
        self.self_ref
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|rc| rc as Rc<dyn AnyConsumer>)
    }

    fn source_rc(&self) -> Option<Rc<dyn AnySource>> {
        self.self_ref
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|rc| rc as Rc<dyn AnySource>)
    }

    /// Clone of the cached outcome, if any evaluation has completed.
    fn cached(&self) -> Option<SignalResult<T>>
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        // Break the remaining source links so abandoned sub-graphs collapse
        // through normal Rc drops.
        let mut node = self.sources.borrow().clone();
        while let Some(n) = node {
            n.source.unsubscribe_node(&n);
            node = n.next_source.borrow().clone();
        }
    }
}

// =============================================================================
// AnySource - the read side
// =============================================================================

impl<T: 'static> AnySource for ComputedInner<T> {
    fn version(&self) -> u64 {
        self.version.get()
    }

    /// Bring the cached value up to date. Returns `false` when the cell is
    /// already evaluating, which means the caller reached it through a
    /// dependency cycle.
    fn refresh(&self) -> bool {
        self.flags.set(self.flags.get() & !NOTIFIED);

        if self.flags.get() & RUNNING != 0 {
            return false;
        }

        let flags = self.flags.get();
        // With an active subscription, OUTDATED is the only way the cache
        // can have gone stale.
        if flags & (OUTDATED | TRACKING) == TRACKING {
            return true;
        }
        self.flags.set((flags & !OUTDATED) | RUNNING);

        let Some(consumer) = self.consumer_rc() else {
            self.flags.set(self.flags.get() & !RUNNING);
            return true;
        };

        struct RunningClear {
            consumer: Rc<dyn AnyConsumer>,
        }
        impl Drop for RunningClear {
            fn drop(&mut self) {
                self.consumer.set_flags(self.consumer.flags() & !RUNNING);
            }
        }
        let _running = RunningClear {
            consumer: consumer.clone(),
        };

        if self.version.get() > 0 && !needs_to_recompute(&*consumer) {
            return true;
        }

        prepare_sources(&*consumer);
        let prev = with_context(|ctx| ctx.set_eval_context(Some(Rc::downgrade(&consumer))));

        // Restores the evaluation context and closes the source bracket on
        // every exit path, including an unwind out of the closure.
        struct EvalScope {
            consumer: Rc<dyn AnyConsumer>,
            prev: Option<Weak<dyn AnyConsumer>>,
        }
        impl Drop for EvalScope {
            fn drop(&mut self) {
                let prev = self.prev.clone();
                with_context(|ctx| ctx.set_eval_context(prev));
                cleanup_sources(&*self.consumer);
            }
        }
        let _scope = EvalScope {
            consumer: consumer.clone(),
            prev,
        };

        match (self.compute)() {
            Ok(new_value) => {
                let changed = match &*self.value.borrow() {
                    Some(Ok(old)) => !(self.equals)(old, &new_value),
                    _ => true,
                };
                if self.flags.get() & HAS_ERROR != 0 || changed || self.version.get() == 0 {
                    *self.value.borrow_mut() = Some(Ok(new_value));
                    self.flags.set(self.flags.get() & !HAS_ERROR);
                    self.version.set(self.version.get() + 1);
                }
            }
            Err(err) => {
                log::debug!("computed closure failed, caching error: {err}");
                *self.value.borrow_mut() = Some(Err(err));
                self.flags.set(self.flags.get() | HAS_ERROR);
                self.version.set(self.version.get() + 1);
            }
        }

        true
    }

    fn subscribe_node(&self, node: &Rc<Node>) {
        if self.subscribers.borrow().is_none() {
            // First subscriber: activate, and subscribe to our own sources
            // so their writes reach us.
            self.flags.set(self.flags.get() | OUTDATED | TRACKING);
            let mut dep = self.sources.borrow().clone();
            while let Some(n) = dep {
                n.source.subscribe_node(&n);
                dep = n.next_source.borrow().clone();
            }
        }
        attach_subscriber(&self.subscribers, node);
    }

    fn unsubscribe_node(&self, node: &Rc<Node>) {
        if self.subscribers.borrow().is_some() {
            detach_subscriber(&self.subscribers, node);

            if self.subscribers.borrow().is_none() {
                // Last subscriber gone: deactivate and release our sources.
                self.flags.set(self.flags.get() & !TRACKING);
                let mut dep = self.sources.borrow().clone();
                while let Some(n) = dep {
                    n.source.unsubscribe_node(&n);
                    dep = n.next_source.borrow().clone();
                }
            }
        }
    }

    fn current_node(&self) -> Option<Rc<Node>> {
        self.current_node.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn replace_current_node(&self, node: Option<Weak<Node>>) -> Option<Weak<Node>> {
        self.current_node.replace(node)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// =============================================================================
// AnyConsumer - the dependency side
// =============================================================================

impl<T: 'static> AnyConsumer for ComputedInner<T> {
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
            self.flags.set(self.flags.get() | OUTDATED | NOTIFIED);
            for node in collect_live_subscribers(&self.subscribers) {
                if let Some(target) = node.target() {
                    target.notify();
                }
            }
        }
    }

    fn run(&self) {
        let _ = self.refresh();
    }

    fn as_source(&self) -> Option<Rc<dyn AnySource>> {
        self.source_rc()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// =============================================================================
// COMPUTED<T> - The public handle
// =============================================================================

/// A derived reactive cell: a memoized function of other cells.
///
/// Computed cells are lazy. The closure runs on first read and again only
/// when a read observes that a transitive dependency actually changed
/// value.
///
/// # Example
///
/// ```
/// use pulse_signals::{computed, signal};
///
/// let count = signal(1);
/// let count2 = count.clone();
/// let doubled = computed(move || count2.get() * 2);
///
/// assert_eq!(doubled.get(), 2);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
#[derive(Clone)]
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T: Clone + 'static> Computed<T> {
    pub(crate) fn from_inner(inner: Rc<ComputedInner<T>>) -> Self {
        Self { inner }
    }

    /// Get the cell's value, recomputing first if a dependency changed.
    ///
    /// Inside an effect or computed this registers the cell as a
    /// dependency.
    ///
    /// # Panics
    ///
    /// Panics on a dependency cycle, or when the closure's failure is
    /// cached (see [`Computed::try_get`] for the non-panicking form).
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("{}", err),
        }
    }

    /// Fallible form of [`Computed::get`].
    pub fn try_get(&self) -> SignalResult<T> {
        if self.inner.flags.get() & RUNNING != 0 {
            return Err(SignalError::Cycle);
        }

        let node = add_dependency(&(self.inner.clone() as Rc<dyn AnySource>));
        self.inner.refresh();
        if let Some(node) = node {
            node.version.set(Some(self.inner.version.get()));
        }

        match self.inner.cached() {
            Some(result) => result,
            None => Err(SignalError::Cycle),
        }
    }

    /// Get the cell's value without registering a dependency.
    ///
    /// # Panics
    ///
    /// As [`Computed::get`].
    pub fn peek(&self) -> T {
        match self.try_peek() {
            Ok(value) => value,
            Err(err) => panic!("{}", err),
        }
    }

    /// Fallible form of [`Computed::peek`].
    pub fn try_peek(&self) -> SignalResult<T> {
        if !self.inner.refresh() {
            return Err(SignalError::Cycle);
        }
        match self.inner.cached() {
            Some(result) => result,
            None => Err(SignalError::Cycle),
        }
    }

    /// Access the current value with a closure (avoids cloning).
    ///
    /// # Panics
    ///
    /// As [`Computed::get`].
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if self.inner.flags.get() & RUNNING != 0 {
            panic!("{}", SignalError::Cycle);
        }

        let node = add_dependency(&(self.inner.clone() as Rc<dyn AnySource>));
        self.inner.refresh();
        if let Some(node) = node {
            node.version.set(Some(self.inner.version.get()));
        }

        let value = self.inner.value.borrow();
        match value.as_ref() {
            Some(Ok(v)) => f(v),
            Some(Err(err)) => panic!("{}", err),
            None => panic!("{}", SignalError::Cycle),
        }
    }

    /// Run `f` with the current value now and again after every change.
    ///
    /// The returned [`Effect`] unsubscribes when disposed or dropped. Reads
    /// performed by `f` itself do not create further subscriptions.
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Effect {
        let this = self.clone();
        effect(move || {
            let value = this.get();
            with_tracking_paused(|| f(value));
        })
    }

    /// Access the inner cell (for graph-level operations).
    pub fn inner(&self) -> &Rc<ComputedInner<T>> {
        &self.inner
    }

    /// The inner cell as a type-erased `AnySource`.
    pub fn as_any_source(&self) -> Rc<dyn AnySource> {
        self.inner.clone()
    }
}

impl<T: Clone + fmt::Display + 'static> fmt::Display for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_peek() {
            Ok(value) => value.fmt(f),
            Err(err) => err.fmt(f),
        }
    }
}

// =============================================================================
// CONSTRUCTION FUNCTIONS
// =============================================================================

/// Create a derived cell from a pure closure.
///
/// # Example
///
/// ```
/// use pulse_signals::{computed, signal};
///
/// let base = signal(10);
/// let base2 = base.clone();
/// let squared = computed(move || base2.get() * base2.get());
/// assert_eq!(squared.get(), 100);
/// ```
pub fn computed<T, F>(f: F) -> Computed<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn() -> T + 'static,
{
    Computed::from_inner(ComputedInner::new(move || Ok(f()), default_equals))
}

/// Create a derived cell with a custom equality function.
pub fn computed_with_equals<T, F>(f: F, equals: EqualsFn<T>) -> Computed<T>
where
    T: Clone + 'static,
    F: Fn() -> T + 'static,
{
    Computed::from_inner(ComputedInner::new(move || Ok(f()), equals))
}

/// Create a derived cell from a fallible closure.
///
/// A returned `Err` is cached just like a value: every read observes it
/// until a dependency change makes the closure succeed again.
///
/// # Example
///
/// ```
/// use pulse_signals::{signal, try_computed, SignalError};
///
/// let n = signal(0);
/// let n2 = n.clone();
/// let checked = try_computed(move || {
///     let v = n2.get();
///     if v < 0 {
///         Err(SignalError::msg("negative"))
///     } else {
///         Ok(v)
///     }
/// });
///
/// assert_eq!(checked.try_get().unwrap(), 0);
/// n.set(-1);
/// assert!(checked.try_get().is_err());
/// n.set(3);
/// assert_eq!(checked.try_get().unwrap(), 3);
/// ```
pub fn try_computed<T, F>(f: F) -> Computed<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn() -> SignalResult<T> + 'static,
{
    Computed::from_inner(ComputedInner::new(f, default_equals))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::effect::effect;
    use crate::primitives::signal::signal;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn computed_basic() {
        let c = computed(|| 42);
        assert_eq!(c.get(), 42);
        assert_eq!(c.peek(), 42);
    }

    #[test]
    fn computed_tracks_signal() {
        let n = signal(0);
        let n2 = n.clone();
        let c = computed(move || n2.get() + 1);

        assert_eq!(c.get(), 1);
        n.set(5);
        assert_eq!(c.get(), 6);
    }

    #[test]
    fn computed_caches_between_reads() {
        let runs = Rc::new(Cell::new(0));

        let runs2 = runs.clone();
        let c = computed(move || {
            runs2.set(runs2.get() + 1);
            42
        });

        assert_eq!(c.get(), 42);
        assert_eq!(c.get(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn version_bumps_only_on_value_change() {
        let a = signal(0);

        let a2 = a.clone();
        let clamped = computed(move || a2.get().clamp(0, 10));

        assert_eq!(clamped.get(), 0);
        let v1 = clamped.inner().version.get();

        a.set(-5); // still clamps to 0
        assert_eq!(clamped.get(), 0);
        assert_eq!(clamped.inner().version.get(), v1);

        a.set(7);
        assert_eq!(clamped.get(), 7);
        assert!(clamped.inner().version.get() > v1);
    }

    #[test]
    fn chain_bails_out_when_intermediate_is_unchanged() {
        let a = signal("a".to_string());
        let runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let b = computed(move || {
            let _ = a2.get();
            "foo".to_string()
        });

        let b2 = b.clone();
        let runs2 = runs.clone();
        let c = computed(move || {
            runs2.set(runs2.get() + 1);
            b2.get()
        });

        assert_eq!(c.get(), "foo");
        assert_eq!(runs.get(), 1);

        a.set("aa".to_string());
        assert_eq!(c.get(), "foo");
        // b recomputed but produced an equal value, so c did not.
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn diamond_computes_once_per_read() {
        let a = signal("a".to_string());
        let runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let b = computed(move || a2.get());
        let a3 = a.clone();
        let c = computed(move || a3.get());

        let b2 = b.clone();
        let c2 = c.clone();
        let runs2 = runs.clone();
        let d = computed(move || {
            runs2.set(runs2.get() + 1);
            format!("{} {}", b2.get(), c2.get())
        });

        assert_eq!(d.get(), "a a");
        assert_eq!(runs.get(), 1);

        a.set("aa".to_string());
        assert_eq!(d.get(), "aa aa");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn peek_equals_get_and_leaves_no_edge() {
        let n = signal(3);
        let n2 = n.clone();
        let c = computed(move || n2.get() * 2);

        assert_eq!(c.peek(), c.get());

        let runs = Rc::new(Cell::new(0));
        let c2 = c.clone();
        let runs2 = runs.clone();
        let _e = effect(move || {
            let _ = c2.peek();
            runs2.set(runs2.get() + 1);
        });
        assert_eq!(runs.get(), 1);

        n.set(4);
        // peek created no subscription, so the effect never re-ran.
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn lazy_subscription_activates_with_first_subscriber() {
        let a = signal(0);
        let runs = Rc::new(Cell::new(0));

        let a2 = a.clone();
        let runs2 = runs.clone();
        let b = computed(move || {
            runs2.set(runs2.get() + 1);
            a2.get()
        });

        assert_eq!(b.get(), 0);
        assert_eq!(runs.get(), 1);
        assert_eq!(a.subscriber_count(), 0);

        // Without subscribers, writes do not run the closure.
        a.set(1);
        a.set(2);
        assert_eq!(runs.get(), 1);

        // Subscribing an effect activates the whole chain.
        let b2 = b.clone();
        let e = effect(move || {
            let _ = b2.get();
        });
        assert_eq!(a.subscriber_count(), 1);
        assert_eq!(runs.get(), 2);

        a.set(3);
        assert_eq!(runs.get(), 3);

        // Disposing the last subscriber deactivates it again.
        e.dispose();
        assert_eq!(a.subscriber_count(), 0);
        a.set(4);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn error_capture_and_recovery() {
        let a = signal(0);

        let a2 = a.clone();
        let b = try_computed(move || {
            let v = a2.get();
            if v == 1 {
                Err(SignalError::msg("bad value"))
            } else {
                Ok(v)
            }
        });

        let b2 = b.clone();
        let c = computed(move || match b2.try_get() {
            Ok(v) => v.to_string(),
            Err(_) => "ok".to_string(),
        });

        assert_eq!(c.get(), "0");

        a.set(1);
        assert_eq!(c.get(), "ok");
        // The error is cached and returned on every read.
        assert!(matches!(b.try_get(), Err(SignalError::User(_))));

        a.set(2);
        assert_eq!(c.get(), "2");
        assert_eq!(b.try_get().unwrap(), 2);
    }

    #[test]
    fn self_cycle_is_reported() {
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));

        let slot2 = slot.clone();
        let c = try_computed(move || match slot2.borrow().as_ref() {
            Some(this) => this.try_peek(),
            None => Ok(0),
        });
        *slot.borrow_mut() = Some(c.clone());

        assert!(matches!(c.try_peek(), Err(SignalError::Cycle)));
        assert!(matches!(c.try_get(), Err(SignalError::Cycle)));
    }

    #[test]
    fn mutual_cycle_is_reported() {
        type Slot = Rc<RefCell<Option<Computed<i32>>>>;
        let slots: Vec<Slot> = (0..4).map(|_| Rc::new(RefCell::new(None))).collect();

        // Each cell reads the next, and the last reads the first.
        let cells: Vec<Computed<i32>> = (0..4)
            .map(|i| {
                let next = slots[(i + 1) % 4].clone();
                try_computed(move || match next.borrow().as_ref() {
                    Some(cell) => cell.try_get(),
                    None => Ok(i as i32),
                })
            })
            .collect();
        for (slot, cell) in slots.iter().zip(&cells) {
            *slot.borrow_mut() = Some(cell.clone());
        }

        assert!(matches!(cells[0].try_get(), Err(SignalError::Cycle)));
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn get_panics_on_cycle() {
        let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::new(RefCell::new(None));

        let slot2 = slot.clone();
        let c = computed(move || match slot2.borrow().as_ref() {
            Some(this) => this.get(),
            None => 0,
        });
        *slot.borrow_mut() = Some(c.clone());

        let _ = c.get();
    }

    #[test]
    fn computed_of_computed() {
        let a = signal(1);
        let a2 = a.clone();
        let b = computed(move || a2.get() * 2);
        let b2 = b.clone();
        let c = computed(move || b2.get() + 10);

        assert_eq!(c.get(), 12);
        a.set(5);
        assert_eq!(c.get(), 20);
    }

    #[test]
    fn subscribe_on_computed() {
        let a = signal(1);
        let a2 = a.clone();
        let doubled = computed(move || a2.get() * 2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = doubled.subscribe(move |v| seen2.borrow_mut().push(v));

        a.set(2);
        a.set(3);
        assert_eq!(*seen.borrow(), vec![2, 4, 6]);

        sub.dispose();
        a.set(4);
        assert_eq!(*seen.borrow(), vec![2, 4, 6]);
    }

    #[test]
    fn display_uses_payload() {
        let c = computed(|| 7);
        assert_eq!(format!("{}", c), "7");
    }
}
