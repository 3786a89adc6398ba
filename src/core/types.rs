/*!
 * Core Types
 * Common types used across the runtime
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// OS process ID type
pub type Pid = u32;

/// Index of a job within one run (unique per run)
pub type WorkerId = usize;

/// Bound shared by task arguments and task return values.
///
/// Values must be serializable because the process backends ship them
/// across the fork boundary.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Concurrency model requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningMode {
    /// Fixed pool of forked processes draining the job list
    ProcessPool,
    /// Fixed pool of OS threads draining a job channel
    ThreadPool,
    /// Green threads on a single-threaded cooperative runtime
    GreenThreadPool,
    /// One task per job on a single-threaded event loop
    AsyncCooperative,
    /// One forked process per job
    MultiProcess,
    /// One OS thread per job
    MultiThread,
}

impl RunningMode {
    pub const ALL: [RunningMode; 6] = [
        RunningMode::ProcessPool,
        RunningMode::ThreadPool,
        RunningMode::GreenThreadPool,
        RunningMode::AsyncCooperative,
        RunningMode::MultiProcess,
        RunningMode::MultiThread,
    ];

    /// Primitive family used by this mode
    pub const fn family(self) -> Family {
        match self {
            RunningMode::ProcessPool | RunningMode::MultiProcess => Family::Process,
            RunningMode::ThreadPool | RunningMode::MultiThread => Family::Thread,
            RunningMode::GreenThreadPool => Family::Green,
            RunningMode::AsyncCooperative => Family::Async,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RunningMode::ProcessPool => "process_pool",
            RunningMode::ThreadPool => "thread_pool",
            RunningMode::GreenThreadPool => "green_thread_pool",
            RunningMode::AsyncCooperative => "async_cooperative",
            RunningMode::MultiProcess => "multi_process",
            RunningMode::MultiThread => "multi_thread",
        }
    }
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        RunningMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| format!("unknown running mode '{}'", s))
    }
}

/// Implementation set for synchronization primitives and queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Atomics in shared anonymous mappings, visible across fork
    Process,
    /// parking_lot based, shared memory between threads
    Thread,
    /// tokio based, no loop binding
    Green,
    /// tokio based, bound to one event loop
    Async,
}

impl Family {
    /// Whether primitives of this family suspend at await points instead of blocking
    pub const fn is_cooperative(self) -> bool {
        matches!(self, Family::Green | Family::Async)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Process => "process",
            Family::Thread => "thread",
            Family::Green => "green",
            Family::Async => "async",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trips_through_str() {
        for mode in RunningMode::ALL {
            assert_eq!(mode.as_str().parse::<RunningMode>(), Ok(mode));
        }
        assert_eq!("Thread-Pool".parse::<RunningMode>(), Ok(RunningMode::ThreadPool));
        assert!("fibers".parse::<RunningMode>().is_err());
    }

    #[test]
    fn test_mode_family() {
        assert_eq!(RunningMode::ProcessPool.family(), Family::Process);
        assert_eq!(RunningMode::MultiThread.family(), Family::Thread);
        assert!(RunningMode::GreenThreadPool.family().is_cooperative());
        assert!(!RunningMode::MultiProcess.family().is_cooperative());
    }
}
