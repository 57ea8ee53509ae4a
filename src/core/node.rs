// ============================================================================
// pulse-signals - Dependency Nodes
// The intrusive edge records of the reactive graph
// ============================================================================
//
// A Node represents one (consumer, source) edge and is an element of two
// doubly-linked lists at once: the consumer's dependency list (ordered by
// first read) and, while subscribed, the source's subscriber list.
//
// Ownership: dependency lists own their nodes through strong forward links
// from the consumer's head; subscriber lists chain strong forward links from
// a strong head on the source. All back links, the target reference, and the
// scratch/rollback slots are weak, so dropping a consumer collapses its
// edges through normal Rc drops.
// ============================================================================

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::core::types::{AnyConsumer, AnySource};

// =============================================================================
// NODE
// =============================================================================

/// One edge from a source cell to a consumer (computed or effect).
pub struct Node {
    /// Version of the source observed at the last confirmed read.
    /// `None` marks a node primed for reuse by `prepare_sources` that has
    /// not been confirmed during the current evaluation pass.
    pub(crate) version: Cell<Option<u64>>,

    /// The observed cell. Strong: a consumer keeps its dependencies alive.
    pub(crate) source: Rc<dyn AnySource>,

    /// The observing consumer. Weak: a source never keeps consumers alive.
    pub(crate) target: Weak<dyn AnyConsumer>,

    /// Links within the target's dependency list (first-read order).
    pub(crate) prev_source: RefCell<Option<Weak<Node>>>,
    pub(crate) next_source: RefCell<Option<Rc<Node>>>,

    /// Links within the source's subscriber list.
    pub(crate) prev_target: RefCell<Option<Weak<Node>>>,
    pub(crate) next_target: RefCell<Option<Rc<Node>>>,

    /// Previous value of the source's scratch `current_node` slot, held for
    /// the duration of one consumer's evaluation pass.
    pub(crate) rollback: RefCell<Option<Weak<Node>>>,
}

impl Node {
    /// Create a fresh, unlinked edge between `source` and `target`.
    pub(crate) fn new(source: Rc<dyn AnySource>, target: Weak<dyn AnyConsumer>) -> Rc<Self> {
        Rc::new(Self {
            version: Cell::new(Some(0)),
            source,
            target,
            prev_source: RefCell::new(None),
            next_source: RefCell::new(None),
            prev_target: RefCell::new(None),
            next_target: RefCell::new(None),
            rollback: RefCell::new(None),
        })
    }

    /// Upgrade the target if the consumer is still alive.
    pub(crate) fn target(&self) -> Option<Rc<dyn AnyConsumer>> {
        self.target.upgrade()
    }
}

// =============================================================================
// SUBSCRIBER LIST SURGERY
// =============================================================================

/// Insert `node` at the head of a source's subscriber list.
///
/// Guard: a node already present (it is the head, or has a back link) must
/// not be inserted twice.
pub(crate) fn attach_subscriber(head: &RefCell<Option<Rc<Node>>>, node: &Rc<Node>) {
    let current = head.borrow().clone();
    let is_head = current.as_ref().is_some_and(|h| Rc::ptr_eq(h, node));
    if is_head || node.prev_target.borrow().is_some() {
        return;
    }

    *node.next_target.borrow_mut() = current.clone();
    if let Some(old_head) = current {
        *old_head.prev_target.borrow_mut() = Some(Rc::downgrade(node));
    }
    *head.borrow_mut() = Some(node.clone());
}

/// Remove `node` from a source's subscriber list. No-op when the node is
/// not linked.
pub(crate) fn detach_subscriber(head: &RefCell<Option<Rc<Node>>>, node: &Rc<Node>) {
    let prev = node.prev_target.borrow_mut().take().and_then(|w| w.upgrade());
    let next = node.next_target.borrow_mut().take();

    if let Some(next_rc) = &next {
        *next_rc.prev_target.borrow_mut() = prev.as_ref().map(Rc::downgrade);
    }

    match &prev {
        Some(prev_rc) => {
            *prev_rc.next_target.borrow_mut() = next;
        }
        None => {
            let is_head = head.borrow().as_ref().is_some_and(|h| Rc::ptr_eq(h, node));
            if is_head {
                *head.borrow_mut() = next;
            }
        }
    }
}

/// Collect the live subscribers of a source, pruning edges whose consumer
/// has been dropped without unsubscribing.
pub(crate) fn collect_live_subscribers(head: &RefCell<Option<Rc<Node>>>) -> Vec<Rc<Node>> {
    let mut live = Vec::new();
    let mut node = head.borrow().clone();
    while let Some(n) = node {
        node = n.next_target.borrow().clone();
        if n.target.strong_count() > 0 {
            live.push(n);
        } else {
            detach_subscriber(head, &n);
        }
    }
    live
}

// =============================================================================
// TESTS
// =============================================================================
