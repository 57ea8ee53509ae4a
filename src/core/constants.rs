// ============================================================================
// pulse-signals - Constants
// Flag constants for the consumer state machine
// ============================================================================

// =============================================================================
// CONSUMER STATE FLAGS
// =============================================================================

/// Consumer is currently executing its closure
pub const RUNNING: u32 = 1 << 0;

/// Enqueued in the pending-effects queue, or (for a computed) already
/// propagated a dirty signal this epoch
pub const NOTIFIED: u32 = 1 << 1;

/// Cached value may be stale; a refresh is required before the next read
pub const OUTDATED: u32 = 1 << 2;

/// Permanently torn down; no further work
pub const DISPOSED: u32 = 1 << 3;

/// Cached "value" is an error that must be returned on every read
pub const HAS_ERROR: u32 = 1 << 4;

/// Reads by this consumer establish subscriptions on their sources
pub const TRACKING: u32 = 1 << 5;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum pending-effect drain iterations within a single batch before a
/// write is treated as runaway feedback.
pub const MAX_BATCH_ITERATIONS: u32 = 100;

// =============================================================================
// TESTS
// =============================================================================
