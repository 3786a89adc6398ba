/*!
 * IPC Module
 * Task queues and shared memory visible across workers of one run
 */

pub mod queue;
pub mod shm;

// Re-export for convenience
pub use queue::{QueueAdapter, QueueError, QueueResult, QueueType, TaskQueue};
pub use shm::{Shared, SharedCounter, SharedMemory, ShmError, ShmResult};
