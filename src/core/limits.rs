/*!
 * Runtime Limits and Constants
 *
 * Centralized location for defaults, thresholds and sizes.
 * Organized by domain; performance-sensitive values are marked with [PERF].
 */

use std::time::Duration;

// =============================================================================
// WORKERS
// =============================================================================

/// Worker count used when none is configured
pub const DEFAULT_WORKERS: usize = 1;

/// Upper bound on workers per run
/// Forking or spawning more than this is almost certainly a configuration mistake
pub const MAX_WORKERS: usize = 4096;

/// Stack size for MultiThread / ThreadPool workers (2MB, Rust default)
pub const WORKER_STACK_SIZE: usize = 2 * 1024 * 1024;

// =============================================================================
// QUEUES
// =============================================================================

/// Hard cap for in-memory queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Slot count of a shared-memory queue when none is requested
/// [PERF] Pages are touched lazily, so unused slots cost address space only
pub const DEFAULT_SHARED_QUEUE_SLOTS: usize = 256;

/// Bytes available to one encoded item in a shared-memory queue slot
pub const SHARED_QUEUE_SLOT_BYTES: usize = 4096;

/// Default capacity of a `Shared<T>` value handle
pub const DEFAULT_SHARED_VALUE_BYTES: usize = 4096;

// =============================================================================
// BACKOFF (process-family primitives)
// =============================================================================

/// Retries spent on CPU spin hints before yielding
/// [PERF] Most uncontended acquisitions resolve here
pub const BACKOFF_SPIN_LIMIT: u32 = 15;

/// Retries spent yielding before sleeping
pub const BACKOFF_YIELD_LIMIT: u32 = 99;

/// Sleep used once spinning and yielding are exhausted
pub const BACKOFF_SLEEP: Duration = Duration::from_micros(50);
