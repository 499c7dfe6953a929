//! Centralized protocol and tuning constants.
//!
//! Consolidating these in one module keeps protocol constraints visible and
//! lets related values be updated together.

// =============================================================================
// Coordination-store constants
// =============================================================================

/// Maximum compares or operations per underlying coordination-store
/// transaction. Checkpoints are concatenated into one transaction until
/// either side would exceed this, at which point the batch is flushed.
pub const MAX_TXN_OPS: usize = 128;

/// Capacity of the keyspace update signal channel. The watch loop delivers
/// signals non-blockingly; a full channel means a signal is already pending
/// and the extra tick is dropped.
pub const KEYSPACE_SIGNAL_DEPTH: usize = 1;

// =============================================================================
// Replication pipeline constants
// =============================================================================

/// Depth of the per-peer replication send channel. Bounded so a stalled
/// peer exerts backpressure on the appender instead of buffering without
/// limit.
pub const PIPELINE_SEND_DEPTH: usize = 8;

/// Upper bound on a single Append content message, in bytes.
pub const MAX_APPEND_CHUNK: usize = 1 << 20;

// =============================================================================
// Fragment constants
// =============================================================================

/// Default target length at which an open fragment is rolled, in bytes.
pub const DEFAULT_FRAGMENT_LENGTH: i64 = 1 << 29; // 512 MiB

/// Byte length of a fragment content digest (SHA-1).
pub const SUM_LENGTH: usize = 20;

/// Delay before re-queueing a fragment whose persist attempt failed.
pub const PERSIST_RETRY_DELAY_MS: u64 = 1_000;

// =============================================================================
// Read constants
// =============================================================================

/// Maximum bytes per ReadResponse content chunk.
pub const MAX_READ_CHUNK: usize = 1 << 17; // 128 KiB
