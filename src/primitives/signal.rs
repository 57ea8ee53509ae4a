// ============================================================================
// pulse-signals - Signal Primitive
// The core writable reactive cell
// ============================================================================

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::error::SignalError;
use crate::core::node::{attach_subscriber, collect_live_subscribers, detach_subscriber, Node};
use crate::core::types::{default_equals, AnyConsumer, AnySource, EqualsFn};
use crate::primitives::effect::{effect, Effect};
use crate::reactivity::scheduling::{end_batch, start_batch};
use crate::reactivity::tracking::{add_dependency, with_tracking_paused};

// =============================================================================
// SIGNAL INNER
// =============================================================================

/// The graph-side data of a writable cell.
///
/// Separate from `Signal<T>` so it can live behind `Rc<dyn AnySource>` in
/// dependency nodes regardless of `T`.
pub struct SignalInner<T> {
    /// The current value
    value: RefCell<T>,

    /// Bumped on every accepted write
    version: Cell<u64>,

    /// Equality function deciding whether a write changed the value
    equals: EqualsFn<T>,

    /// Head of the subscriber list
    subscribers: RefCell<Option<Rc<Node>>>,

    /// Scratch slot used while one consumer re-evaluates
    current_node: RefCell<Option<Weak<Node>>>,
}

impl<T> SignalInner<T> {
    /// Create a new cell with the given value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equals(value, default_equals)
    }

    /// Create a new cell with a custom equality function.
    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self {
        Self {
            value: RefCell::new(value),
            version: Cell::new(0),
            equals,
            subscribers: RefCell::new(None),
            current_node: RefCell::new(None),
        }
    }
}

impl<T: 'static> AnySource for SignalInner<T> {
    fn version(&self) -> u64 {
        self.version.get()
    }

    fn refresh(&self) -> bool {
        // Plain cells are always up to date.
        true
    }

    fn subscribe_node(&self, node: &Rc<Node>) {
        attach_subscriber(&self.subscribers, node);
    }

    fn unsubscribe_node(&self, node: &Rc<Node>) {
        detach_subscriber(&self.subscribers, node);
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
// SIGNAL<T> - The public handle
// =============================================================================

/// A writable reactive cell holding a value of type `T`.
///
/// Reading a signal from inside an effect or computed subscribes the reader;
/// writing a different value notifies everything downstream.
///
/// # Example
///
/// ```
/// use pulse_signals::signal;
///
/// let count = signal(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
#[derive(Clone)]
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T> Signal<T> {
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self
    where
        T: PartialEq + 'static,
    {
        Self {
            inner: Rc::new(SignalInner::new(value)),
        }
    }

    /// Create a new signal with a custom equality function.
    pub fn new_with_equals(value: T, equals: EqualsFn<T>) -> Self
    where
        T: 'static,
    {
        Self {
            inner: Rc::new(SignalInner::new_with_equals(value, equals)),
        }
    }

    /// Get the current value (cloning).
    ///
    /// Inside an effect or computed this registers the signal as a
    /// dependency.
    pub fn get(&self) -> T
    where
        T: Clone + 'static,
    {
        if let Some(node) = add_dependency(&(self.inner.clone() as Rc<dyn AnySource>)) {
            node.version.set(Some(self.inner.version.get()));
        }
        self.inner.value.borrow().clone()
    }

    /// Access the current value with a closure (avoids cloning).
    ///
    /// # Example
    ///
    /// ```
    /// use pulse_signals::signal;
    ///
    /// let items = signal(vec![1, 2, 3]);
    /// let sum = items.with(|v| v.iter().sum::<i32>());
    /// assert_eq!(sum, 6);
    /// ```
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R
    where
        T: 'static,
    {
        if let Some(node) = add_dependency(&(self.inner.clone() as Rc<dyn AnySource>)) {
            node.version.set(Some(self.inner.version.get()));
        }
        f(&self.inner.value.borrow())
    }

    /// Get the current value without registering a dependency.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Set the signal's value.
    ///
    /// Returns `true` if the value changed under the signal's equality
    /// function. Unchanged writes notify nobody.
    ///
    /// # Panics
    ///
    /// Panics when called while a computed cell is evaluating (computed
    /// closures must be pure), or when writes inside one batch keep
    /// re-triggering effects past the runaway limit.
    pub fn set(&self, value: T) -> bool
    where
        T: 'static,
    {
        let writing_from_computed = with_context(|ctx| ctx.active_consumer())
            .is_some_and(|consumer| consumer.as_source().is_some());
        if writing_from_computed {
            panic!("{}", SignalError::MutationInComputed);
        }

        let changed = {
            let current = self.inner.value.borrow();
            !(self.inner.equals)(&current, &value)
        };
        if !changed {
            return false;
        }

        if with_context(|ctx| ctx.batch_iteration()) > MAX_BATCH_ITERATIONS {
            log::warn!("runaway feedback: effects kept re-triggering within one batch");
            panic!("{}", SignalError::Cycle);
        }

        *self.inner.value.borrow_mut() = value;
        self.inner.version.set(self.inner.version.get() + 1);

        start_batch();
        for node in collect_live_subscribers(&self.inner.subscribers) {
            if let Some(target) = node.target() {
                target.notify();
            }
        }
        end_batch();

        true
    }

    /// Update the value in place using a closure.
    ///
    /// # Example
    ///
    /// ```
    /// use pulse_signals::signal;
    ///
    /// let count = signal(0);
    /// count.update(|n| *n += 1);
    /// assert_eq!(count.get(), 1);
    /// ```
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: Clone + 'static,
    {
        let mut value = self.peek();
        f(&mut value);
        self.set(value);
    }

    /// Run `f` with the current value now and again after every change.
    ///
    /// The returned [`Effect`] unsubscribes when disposed or dropped. Reads
    /// performed by `f` itself do not create further subscriptions.
    ///
    /// # Example
    ///
    /// ```
    /// use pulse_signals::signal;
    /// use std::cell::RefCell;
    /// use std::rc::Rc;
    ///
    /// let name = signal(String::from("a"));
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    ///
    /// let seen2 = seen.clone();
    /// let sub = name.subscribe(move |v| seen2.borrow_mut().push(v));
    ///
    /// name.set(String::from("b"));
    /// sub.dispose();
    /// name.set(String::from("c"));
    ///
    /// assert_eq!(*seen.borrow(), vec!["a".to_string(), "b".to_string()]);
    /// ```
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Effect
    where
        T: Clone + 'static,
    {
        let this = self.clone();
        effect(move || {
            let value = this.get();
            with_tracking_paused(|| f(value));
        })
    }

    /// Number of consumers currently subscribed to this signal.
    pub fn subscriber_count(&self) -> usize {
        let mut count = 0;
        let mut node = self.inner.subscribers.borrow().clone();
        while let Some(n) = node {
            if n.target().is_some() {
                count += 1;
            }
            node = n.next_target.borrow().clone();
        }
        count
    }

    /// Access the inner source (for graph-level operations).
    pub fn inner(&self) -> &Rc<SignalInner<T>> {
        &self.inner
    }

    /// The inner source as a type-erased `AnySource`.
    pub fn as_any_source(&self) -> Rc<dyn AnySource>
    where
        T: 'static,
    {
        self.inner.clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("value", &self.inner.value.borrow())
            .finish()
    }
}

impl<T: fmt::Display> fmt::Display for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.value.borrow().fmt(f)
    }
}

// =============================================================================
// CONSTRUCTION FUNCTIONS
// =============================================================================

/// Create a new reactive signal.
///
/// # Example
///
/// ```
/// use pulse_signals::signal;
///
/// let count = signal(0);
/// count.set(42);
/// assert_eq!(count.get(), 42);
/// ```
pub fn signal<T>(value: T) -> Signal<T>
where
    T: PartialEq + 'static,
{
    Signal::new(value)
}

/// Create a signal with a custom equality function.
///
/// # Example
///
/// ```
/// use pulse_signals::{never_equals, signal_with_equals};
///
/// // Every write counts as a change.
/// let cell = signal_with_equals(0, never_equals);
/// assert!(cell.set(0));
/// ```
pub fn signal_with_equals<T>(value: T, equals: EqualsFn<T>) -> Signal<T>
where
    T: 'static,
{
    Signal::new_with_equals(value, equals)
}

// =============================================================================
// TESTS
// =============================================================================
