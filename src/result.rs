/*!
 * Result Normalizer
 *
 * Every backend reports a `RawOutcome` per job; `normalize` turns it into
 * the one `WorkerResult` shape callers see, regardless of backend.
 */

use crate::core::types::{Pid, WorkerId};
use crate::strategy::task::{TaskError, TaskResult};
use crate::strategy::worker::WorkerIdentity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a worker reported, as shipped back from its execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + DeserializeOwned")]
pub struct RawOutcome<T> {
    pub identity: WorkerIdentity,
    pub successful: bool,
    pub value: Option<T>,
    pub error: Option<TaskError>,
}

impl<T> RawOutcome<T> {
    pub fn new(identity: WorkerIdentity, result: TaskResult<T>) -> Self {
        match result {
            Ok(value) => Self {
                identity,
                successful: true,
                value: Some(value),
                error: None,
            },
            Err(error) => Self::failure(identity, error),
        }
    }

    pub fn failure(identity: WorkerIdentity, error: TaskError) -> Self {
        Self {
            identity,
            successful: false,
            value: None,
            error: Some(error),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.identity.worker_id
    }
}

/// Final state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Successful,
    Fail,
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultState::Successful => f.write_str("successful"),
            ResultState::Fail => f.write_str("fail"),
        }
    }
}

/// Backend-independent result of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + DeserializeOwned")]
pub struct WorkerResult<T> {
    pub worker_id: WorkerId,
    pub pid: Pid,
    pub worker_name: String,
    /// OS thread id; `None` for green threads and async tasks
    pub native_id: Option<u64>,
    pub state: ResultState,
    pub data: Option<T>,
    pub exception: Option<TaskError>,
}

impl<T> WorkerResult<T> {
    pub fn is_successful(&self) -> bool {
        self.state == ResultState::Successful
    }

    pub fn into_result(self) -> TaskResult<T> {
        match (self.state, self.data, self.exception) {
            (ResultState::Successful, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            _ => Err(TaskError::Failed("worker produced no value".into())),
        }
    }
}

/// Convert a raw outcome; a success flag without a value, or with an error, is a failure
pub fn normalize<T>(raw: RawOutcome<T>) -> WorkerResult<T> {
    let RawOutcome {
        identity,
        successful,
        value,
        error,
    } = raw;

    let (state, data, exception) = match (successful, value, error) {
        (true, Some(value), None) => (ResultState::Successful, Some(value), None),
        (_, _, Some(error)) => (ResultState::Fail, None, Some(error)),
        _ => (
            ResultState::Fail,
            None,
            Some(TaskError::Failed(
                "worker reported success without a value".into(),
            )),
        ),
    };

    WorkerResult {
        worker_id: identity.worker_id,
        pid: identity.pid,
        worker_name: identity.worker_name,
        native_id: identity.native_id,
        state,
        data,
        exception,
    }
}

pub fn normalize_all<T>(raw: Vec<RawOutcome<T>>) -> Vec<WorkerResult<T>> {
    raw.into_iter().map(normalize).collect()
}

/// Partition helpers over a result list
pub trait ResultsExt<T> {
    fn successes(&self) -> Vec<&WorkerResult<T>>;
    fn failures(&self) -> Vec<&WorkerResult<T>>;
    fn all_successful(&self) -> bool;
    /// Values of the successful workers, in result order
    fn data(&self) -> Vec<&T>;
}

impl<T> ResultsExt<T> for [WorkerResult<T>] {
    fn successes(&self) -> Vec<&WorkerResult<T>> {
        self.iter().filter(|r| r.is_successful()).collect()
    }

    fn failures(&self) -> Vec<&WorkerResult<T>> {
        self.iter().filter(|r| !r.is_successful()).collect()
    }

    fn all_successful(&self) -> bool {
        self.iter().all(WorkerResult::is_successful)
    }

    fn data(&self) -> Vec<&T> {
        self.iter().filter_map(|r| r.data.as_ref()).collect()
    }
}
