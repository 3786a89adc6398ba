/*!
 * Error Types
 * Centralized error handling with thiserror and miette diagnostics
 */

use miette::Diagnostic;
use thiserror::Error;

use crate::registry::PrimitiveKind;
use crate::strategy::LifecycleState;
use crate::sync::LoopId;

// Re-export sub-module errors so callers can match on one path
pub use crate::ipc::queue::QueueError;
pub use crate::ipc::shm::ShmError;
pub use crate::persistence::PersistenceError;
pub use crate::sync::SyncError;

/// Common result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Infrastructure errors. Any of these aborts the whole run; task-level
/// failures are captured into results instead (see `TaskError`).
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(runtime::configuration),
        help("Check the running mode, worker count and pool size settings.")
    )]
    Configuration(String),

    #[error("Cannot {operation} while strategy is {state}")]
    #[diagnostic(
        code(runtime::illegal_state),
        help("Lifecycle order is initialize -> build -> activate -> await -> collect.")
    )]
    IllegalState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("No workers have been built for this run")]
    #[diagnostic(
        code(runtime::empty_worker_set),
        help("Call build_workers (or run/map) before activating or joining.")
    )]
    EmptyWorkerSet,

    #[error("Primitive bound to event loop {found} used on event loop {expected}")]
    #[diagnostic(
        code(runtime::incompatible_loop),
        help("Create async primitives from the executor's own event loop.")
    )]
    IncompatibleLoop { expected: LoopId, found: LoopId },

    #[error("Unsupported primitive: {0}")]
    #[diagnostic(
        code(runtime::unsupported_primitive),
        help("This backend has no such primitive; pick another mode or primitive.")
    )]
    UnsupportedPrimitive(String),

    #[error("Cannot register an absent {0} instance")]
    #[diagnostic(
        code(runtime::globalize_object),
        help("Registry slots only accept a present instance of the matching kind.")
    )]
    GlobalizeObject(PrimitiveKind),

    #[error("No {0} registered for this run")]
    #[diagnostic(
        code(runtime::feature_not_registered),
        help("Request the feature through `Features` when starting the run.")
    )]
    FeatureNotRegistered(PrimitiveKind),

    #[error("Results are not available yet: {0}")]
    #[diagnostic(
        code(runtime::not_yet_completed),
        help("Close the open batch or wait for the run to finish before reading results.")
    )]
    NotYetCompleted(String),

    #[error("Failed to spawn worker: {0}")]
    #[diagnostic(
        code(runtime::spawn_failed),
        help("Check system resources (threads, processes, file descriptors).")
    )]
    Spawn(String),

    #[error("Synchronization error: {0}")]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),

    #[error("Queue error: {0}")]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error("Shared memory error: {0}")]
    #[diagnostic(transparent)]
    Shm(#[from] ShmError),

    #[error("Persistence error: {0}")]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RuntimeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        RuntimeError::Configuration(message.into())
    }

    pub fn illegal_state(operation: &'static str, state: LifecycleState) -> Self {
        RuntimeError::IllegalState { operation, state }
    }

    /// Whether the error is a caller bug (lifecycle misuse) rather than an environment failure
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::Configuration(_)
                | RuntimeError::IllegalState { .. }
                | RuntimeError::EmptyWorkerSet
                | RuntimeError::GlobalizeObject(_)
                | RuntimeError::FeatureNotRegistered(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_state_message() {
        let err = RuntimeError::illegal_state("collect results", LifecycleState::Activated);
        assert_eq!(
            err.to_string(),
            "Cannot collect results while strategy is activated"
        );
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_sync_error_converts() {
        let err: RuntimeError = SyncError::NotHeld.into();
        assert!(matches!(err, RuntimeError::Sync(SyncError::NotHeld)));
        assert!(!err.is_usage_error());
    }
}
