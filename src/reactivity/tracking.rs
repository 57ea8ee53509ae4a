// ============================================================================
// pulse-signals - Dependency Tracking
// The core of the reactivity system - discovering edges through reads
// ============================================================================
//
// Every tracked read funnels through add_dependency, which creates or
// refreshes the Node linking the read source to the evaluating consumer.
// prepare_sources / cleanup_sources bracket each evaluation pass: prepare
// primes the existing dependency list for reuse, cleanup discards edges
// that were not read this pass and restores every source's scratch slot.
//
// Borrow discipline: link cells are borrowed one at a time and never across
// a call into user code; list walks clone the next pointer before touching
// neighbors (the collect-then-mutate pattern).
// ============================================================================

use std::rc::Rc;

use crate::core::constants::*;
use crate::core::context::with_context;
use crate::core::node::Node;
use crate::core::types::{AnyConsumer, AnySource};

// =============================================================================
// ADD DEPENDENCY - Register an edge on every tracked read
// =============================================================================

/// Record that the active consumer read `source`.
///
/// Returns the edge so the caller can stamp the observed version, or `None`
/// when no consumer is evaluating or the edge is already confirmed for this
/// pass.
pub(crate) fn add_dependency(source: &Rc<dyn AnySource>) -> Option<Rc<Node>> {
    let consumer = with_context(|ctx| ctx.active_consumer())?;

    match source.current_node() {
        Some(node) if node_targets(&node, &consumer) => {
            if node.version.get().is_some() {
                // Already confirmed during this pass.
                return None;
            }
            // Reused from the previous run: confirm it and restore
            // first-read ordering.
            node.version.set(Some(0));
            move_node_to_tail(&*consumer, &node);
            Some(node)
        }
        _ => {
            // Fresh edge.
            let node = Node::new(source.clone(), Rc::downgrade(&consumer));

            match consumer.sources_tail() {
                Some(tail) => {
                    *node.prev_source.borrow_mut() = Some(Rc::downgrade(&tail));
                    *tail.next_source.borrow_mut() = Some(node.clone());
                }
                None => consumer.set_sources_head(Some(node.clone())),
            }
            consumer.set_sources_tail(Some(Rc::downgrade(&node)));

            let prior = source.replace_current_node(Some(Rc::downgrade(&node)));
            *node.rollback.borrow_mut() = prior;

            if consumer.flags() & TRACKING != 0 {
                source.subscribe_node(&node);
            }
            Some(node)
        }
    }
}

/// Whether `node`'s consumer is the same allocation as `consumer`.
fn node_targets(node: &Node, consumer: &Rc<dyn AnyConsumer>) -> bool {
    node.target().is_some_and(|target| {
        Rc::as_ptr(&target) as *const () == Rc::as_ptr(consumer) as *const ()
    })
}

/// Splice `node` out of the dependency list and re-append it at the tail so
/// the list reflects actual first-read order for this pass.
fn move_node_to_tail(consumer: &dyn AnyConsumer, node: &Rc<Node>) {
    let next = node.next_source.borrow().clone();
    let Some(next) = next else {
        // Already the tail.
        return;
    };

    let prev = node.prev_source.borrow().clone().and_then(|w| w.upgrade());
    *next.prev_source.borrow_mut() = prev.as_ref().map(Rc::downgrade);
    match &prev {
        Some(prev_rc) => *prev_rc.next_source.borrow_mut() = Some(next),
        None => consumer.set_sources_head(Some(next)),
    }

    *node.next_source.borrow_mut() = None;
    if let Some(tail) = consumer.sources_tail() {
        *node.prev_source.borrow_mut() = Some(Rc::downgrade(&tail));
        *tail.next_source.borrow_mut() = Some(node.clone());
    }
    consumer.set_sources_tail(Some(Rc::downgrade(node)));
}

// =============================================================================
// EVALUATION BRACKETS
// =============================================================================

/// Prime the consumer's dependency list before an evaluation pass: park each
/// node in its source's scratch slot (saving the previous occupant) and mark
/// it unconfirmed.
pub(crate) fn prepare_sources(consumer: &dyn AnyConsumer) {
    let mut node = consumer.sources_head();
    let mut tail = None;
    while let Some(n) = node {
        let prior = n.source.replace_current_node(Some(Rc::downgrade(&n)));
        *n.rollback.borrow_mut() = prior;
        n.version.set(None);
        node = n.next_source.borrow().clone();
        tail = Some(n);
    }
    consumer.set_sources_tail(tail.as_ref().map(Rc::downgrade));
}

/// Close an evaluation pass: walking backwards from the tail, drop edges
/// that were not confirmed, keep the rest, and restore every source's
/// scratch slot from its rollback.
pub(crate) fn cleanup_sources(consumer: &dyn AnyConsumer) {
    let mut node = consumer.sources_tail();
    let mut head = None;
    let mut tail: Option<Rc<Node>> = None;

    while let Some(n) = node {
        let prev = n.prev_source.borrow().clone().and_then(|w| w.upgrade());

        if n.version.get().is_none() {
            // Source was not read during this pass: drop the edge.
            n.source.unsubscribe_node(&n);

            let next = n.next_source.borrow_mut().take();
            if let Some(next_rc) = &next {
                *next_rc.prev_source.borrow_mut() = prev.as_ref().map(Rc::downgrade);
            }
            if let Some(prev_rc) = &prev {
                *prev_rc.next_source.borrow_mut() = next;
            }
            *n.prev_source.borrow_mut() = None;
        } else {
            head = Some(n.clone());
            if tail.is_none() {
                tail = Some(n.clone());
            }
        }

        let restored = n.rollback.borrow_mut().take();
        n.source.replace_current_node(restored);

        node = prev;
    }

    consumer.set_sources_head(head);
    consumer.set_sources_tail(tail.as_ref().map(Rc::downgrade));
}

// =============================================================================
// CHANGE DETECTION
// =============================================================================

/// Whether any dependency of `consumer` changed value since it last ran.
///
/// A dependency counts as changed when its version differs from the edge's
/// snapshot either before or after refreshing it, or when its refresh
/// reports a cycle. The walk stops at the first change, in first-read
/// order, which is what keeps updates glitch-free.
pub(crate) fn needs_to_recompute(consumer: &dyn AnyConsumer) -> bool {
    let mut node = consumer.sources_head();
    while let Some(n) = node {
        let seen = n.version.get();
        if seen != Some(n.source.version())
            || !n.source.refresh()
            || seen != Some(n.source.version())
        {
            return true;
        }
        node = n.next_source.borrow().clone();
    }
    false
}

// =============================================================================
// TRACKING PAUSE
// =============================================================================

/// Run `f` with the active consumer's TRACKING flag cleared, so reads inside
/// `f` do not grow its subscription set. Used by subscriber callbacks.
pub(crate) fn with_tracking_paused<R>(f: impl FnOnce() -> R) -> R {
    struct RestoreTracking {
        consumer: Option<Rc<dyn AnyConsumer>>,
    }

    impl Drop for RestoreTracking {
        fn drop(&mut self) {
            if let Some(consumer) = &self.consumer {
                consumer.set_flags(consumer.flags() | TRACKING);
            }
        }
    }

    let consumer = with_context(|ctx| ctx.active_consumer())
        .filter(|c| c.flags() & TRACKING != 0);
    if let Some(c) = &consumer {
        c.set_flags(c.flags() & !TRACKING);
    }
    let _guard = RestoreTracking { consumer };
    f()
}

// =============================================================================
// TESTS
// =============================================================================
