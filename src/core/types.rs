// ============================================================================
// pulse-signals - Type Definitions
// Type-erased traits for the reactive graph
// ============================================================================
//
// These traits enable heterogeneous storage in the reactive graph: edge
// records and the engine context hold `Rc<dyn AnySource>` /
// `Weak<dyn AnyConsumer>` without knowing the value type T.
//
// The source-side capability set is closed: version read, refresh,
// subscribe/unsubscribe of an edge, and the transient current-node slot
// used while one consumer re-evaluates. Everything else (reading and
// writing actual values) lives on the concrete Signal<T> / Computed<T>.
// ============================================================================

use std::any::Any;
use std::rc::{Rc, Weak};

use crate::core::node::Node;

// =============================================================================
// SOURCE SIDE
// =============================================================================

/// Type-erased source interface: what a consumer needs from the cells it
/// observes.
///
/// Implemented by `SignalInner<T>` and `ComputedInner<T>`.
pub trait AnySource: Any {
    /// Monotonic version counter, bumped on every value change.
    fn version(&self) -> u64;

    /// Bring the cached value up to date. Trivially `true` for signals;
    /// for computeds, `false` reports a cycle.
    fn refresh(&self) -> bool;

    /// Insert an edge into this source's subscriber list.
    fn subscribe_node(&self, node: &Rc<Node>);

    /// Remove an edge from this source's subscriber list.
    fn unsubscribe_node(&self, node: &Rc<Node>);

    /// The scratch slot consulted by dependency discovery while a consumer
    /// is re-evaluating.
    fn current_node(&self) -> Option<Rc<Node>>;

    /// Swap the scratch slot, returning the previous occupant so it can be
    /// restored when the evaluation pass ends.
    fn replace_current_node(&self, node: Option<Weak<Node>>) -> Option<Weak<Node>>;

    /// Upcast for downcasting to the concrete cell type.
    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// CONSUMER SIDE
// =============================================================================

/// Type-erased consumer interface: what the engine needs from anything that
/// observes sources.
///
/// Implemented by `ComputedInner<T>` (which is also a source) and
/// `EffectInner`.
pub trait AnyConsumer: Any {
    /// The consumer's flag word (see `core::constants`).
    fn flags(&self) -> u32;

    /// Replace the flag word.
    fn set_flags(&self, flags: u32);

    /// Head of the dependency list, in first-read order.
    fn sources_head(&self) -> Option<Rc<Node>>;

    /// Replace the dependency list head.
    fn set_sources_head(&self, head: Option<Rc<Node>>);

    /// Tail of the dependency list.
    fn sources_tail(&self) -> Option<Rc<Node>>;

    /// Replace the dependency list tail.
    fn set_sources_tail(&self, tail: Option<Weak<Node>>);

    /// A transitive input changed this epoch: mark stale and propagate or
    /// enqueue as appropriate.
    fn notify(&self);

    /// Re-run in response to drained notifications: refresh a computed,
    /// invoke an effect's callback.
    fn run(&self);

    /// The source side of this consumer, when it has one (computeds do,
    /// effects do not).
    fn as_source(&self) -> Option<Rc<dyn AnySource>>;

    /// Upcast for downcasting to the concrete consumer type.
    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// EQUALITY
// =============================================================================

/// Equality function used to decide whether a write actually changed a value.
pub type EqualsFn<T> = fn(&T, &T) -> bool;

/// Default structural equality via `PartialEq`.
pub fn default_equals<T: PartialEq>(a: &T, b: &T) -> bool {
    a == b
}

// =============================================================================
// TESTS
// =============================================================================
