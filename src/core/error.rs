// ============================================================================
// pulse-signals - Error Types
// Failure kinds surfaced by the reactive graph
// ============================================================================

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// Result alias for fallible reads of the reactive graph.
pub type SignalResult<T> = std::result::Result<T, SignalError>;

/// Errors produced by the reactive graph.
///
/// `SignalError` is cheap to clone so a computed cell can cache a failure
/// and return it on every read until its next successful recompute.
#[derive(Debug, Clone, Error)]
pub enum SignalError {
    /// A computed cell depends on itself (directly or transitively), or a
    /// batch kept re-triggering effects past the runaway limit.
    #[error("cycle detected in reactive dependency graph")]
    Cycle,

    /// A signal write was attempted while a computed cell was evaluating.
    /// Computed closures must be pure.
    #[error("cannot write to a signal while a computed value is evaluating")]
    MutationInComputed,

    /// A failure raised by a user closure, captured by the cell that ran it.
    #[error("{0}")]
    User(Rc<dyn std::error::Error + 'static>),
}

impl SignalError {
    /// Wrap an arbitrary error raised by a user closure.
    pub fn user(err: impl std::error::Error + 'static) -> Self {
        Self::User(Rc::new(err))
    }

    /// Build a [`SignalError::User`] from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::User(Rc::new(Message(message.into())))
    }
}

/// Minimal string-backed error for [`SignalError::msg`].
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

// =============================================================================
// TESTS
// =============================================================================
