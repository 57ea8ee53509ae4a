// ============================================================================
// pulse-signals - A Reactive Value Graph for Rust
// ============================================================================
//
// Writable signals, lazily-memoized computed cells, and auto-rerunning
// effects over an intrusive dependency graph. Dependencies are discovered
// through reads; a derived cell recomputes only when a transitive input
// actually changed value, and an effect runs at most once per change epoch
// no matter how many of its inputs moved.
//
// All engine state is thread-local: contexts on different threads are
// fully independent.
// ============================================================================

pub mod core;
pub mod primitives;
pub mod reactivity;

// Re-export core items at crate root for ergonomic access
pub use self::core::constants;
pub use self::core::context::{is_batching, is_tracking, is_untracked, with_context, ReactiveContext};
pub use self::core::error::{SignalError, SignalResult};
pub use self::core::node::Node;
pub use self::core::types::{default_equals, AnyConsumer, AnySource, EqualsFn};

// Re-export the primitives
pub use self::primitives::computed::{
    computed, computed_with_equals, try_computed, Computed, ComputedInner,
};
pub use self::primitives::effect::{
    effect, effect_with_cleanup, CleanupFn, Effect, EffectFn, EffectInner,
};
pub use self::primitives::signal::{signal, signal_with_equals, Signal, SignalInner};

// Re-export reactivity functions
pub use self::reactivity::batching::{batch, untracked};
pub use self::reactivity::equality::{
    always_equals, equals, never_equals, safe_equals_f32, safe_equals_f64,
};

// =============================================================================
// TESTS
// =============================================================================
