// ============================================================================
// pulse-signals - Primitives Module
// The reactive cells: signal, computed, effect
// ============================================================================

pub mod computed;
pub mod effect;
pub mod signal;

// Re-export for convenience
pub use computed::{computed, computed_with_equals, try_computed, Computed, ComputedInner};
pub use effect::{effect, effect_with_cleanup, CleanupFn, Effect, EffectFn, EffectInner};
pub use signal::{signal, signal_with_equals, Signal, SignalInner};
