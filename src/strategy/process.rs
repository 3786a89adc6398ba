/*!
 * Process Strategies
 *
 * MultiProcess forks one child per job; ProcessPool forks `workers` children
 * that claim job indexes from a shared-memory counter. Children inherit the
 * job list and the run registry at fork time, report over a `UnixStream`
 * pair with bincode frames, and leave with `_exit` so no parent state is torn
 * down twice. Forked children do not log.
 *
 * A child that dies before reporting is reaped with `waitpid`: SIGTERM during
 * `terminal()` maps to `Terminated`, anything else to `WorkerLost`.
 */

use super::task::{Job, TaskError};
use super::worker::{IndexedJob, RunEnv, WorkerHandle, WorkerIdentity};
use super::{RunControl, RunState, Strategy};
use crate::core::config::RuntimeConfig;
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Payload, Pid, RunningMode, WorkerId};
use crate::ipc::shm::SharedCounter;
use crate::result::RawOutcome;
use ahash::RandomState;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid as NixPid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Fork and run `body` in the child with its end of a fresh stream pair.
///
/// Returns the child pid and the parent's end. The child never returns.
fn fork_worker<F>(control: &RunControl, body: F) -> RuntimeResult<(Pid, UnixStream)>
where
    F: FnOnce(&mut UnixStream),
{
    let (parent_end, child_end) =
        UnixStream::pair().map_err(|e| RuntimeError::Spawn(format!("socket pair: {}", e)))?;

    // SAFETY: the child only runs the job body, writes to its stream and `_exit`s
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(parent_end);
            let mut stream = child_end;
            let status = match catch_unwind(AssertUnwindSafe(|| body(&mut stream))) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            let _ = stream.flush();
            drop(stream);
            unsafe { nix::libc::_exit(status) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(child_end);
            let pid = child.as_raw() as Pid;
            control.track_child(pid);
            Ok((pid, parent_end))
        }
        Err(e) => Err(RuntimeError::Spawn(format!("fork: {}", e))),
    }
}

/// Wait for `pid` and describe why it produced no outcome
fn reap(pid: Pid, control: &RunControl) -> TaskError {
    let status = waitpid(NixPid::from_raw(pid as i32), None);
    control.untrack_child(pid);
    match status {
        Ok(WaitStatus::Signaled(_, Signal::SIGTERM, _)) if control.is_stopping() => {
            TaskError::Terminated
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            TaskError::WorkerLost(format!("process {} killed by {:?}", pid, signal))
        }
        Ok(WaitStatus::Exited(_, code)) => TaskError::WorkerLost(format!(
            "process {} exited with status {} before reporting",
            pid, code
        )),
        Ok(other) => TaskError::WorkerLost(format!("process {}: {:?}", pid, other)),
        Err(e) => TaskError::WorkerLost(format!("waitpid({}) failed: {}", pid, e)),
    }
}

fn lost_identity(worker_id: WorkerId, pid: Pid, worker_name: String) -> WorkerIdentity {
    WorkerIdentity {
        worker_id,
        pid,
        worker_name,
        native_id: None,
    }
}

/// A forked child running exactly one job
struct ChildWorker {
    worker_id: WorkerId,
    pid: Pid,
    stream: UnixStream,
}

impl ChildWorker {
    fn spawn<A: Payload, T: Payload>(env: &RunEnv, indexed: &IndexedJob<A, T>) -> RuntimeResult<Self> {
        let worker_id = indexed.worker_id;
        let (pid, stream) = fork_worker(&env.control, |stream| {
            let identity = WorkerIdentity::current_thread(worker_id, format!("worker-{}", worker_id));
            let outcome = env.run_job(&indexed.job, identity);
            let _ = bincode::serialize_into(BufWriter::new(stream), &outcome);
        })?;
        debug!(worker_id, pid, "Worker process forked");
        Ok(Self {
            worker_id,
            pid,
            stream,
        })
    }

    fn join<T: Payload>(mut self, control: &RunControl) -> RawOutcome<T> {
        let mut bytes = Vec::new();
        let read = self.stream.read_to_end(&mut bytes);
        let decoded = match read {
            Ok(_) if !bytes.is_empty() => bincode::deserialize::<RawOutcome<T>>(&bytes).ok(),
            _ => None,
        };
        match decoded {
            Some(outcome) => {
                // Reap the zombie; the outcome already says everything
                let _ = waitpid(NixPid::from_raw(self.pid as i32), None);
                control.untrack_child(self.pid);
                outcome
            }
            None => {
                let error = reap(self.pid, control);
                warn!(worker_id = self.worker_id, pid = self.pid, error = %error, "Worker process lost");
                RawOutcome::failure(
                    lost_identity(self.worker_id, self.pid, format!("worker-{}", self.worker_id)),
                    error,
                )
            }
        }
    }
}

/// One forked process per job
pub struct MultiProcessStrategy<A, T> {
    run: RunState<A, T>,
    running: Vec<ChildWorker>,
    started: HashMap<WorkerId, ChildWorker, RandomState>,
}

impl<A: Payload, T: Payload> MultiProcessStrategy<A, T> {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            run: RunState::new(RuntimeConfig { mode: RunningMode::MultiProcess, ..config }, None)?,
            running: Vec::new(),
            started: HashMap::default(),
        })
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for MultiProcessStrategy<A, T> {
    fn run_state(&self) -> &RunState<A, T> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<A, T> {
        &mut self.run
    }

    fn activate_all(&mut self) -> RuntimeResult<()> {
        let jobs = self.run.begin_activation()?;
        let env = self.run.env();
        for indexed in &jobs {
            self.running.push(ChildWorker::spawn(&env, indexed)?);
        }
        Ok(())
    }

    /// Outcomes come back in worker-index order
    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let control = self.run.control().clone();
        let outcomes = self
            .running
            .drain(..)
            .map(|child| child.join(&control))
            .collect();
        self.run.finish_await(outcomes);
        Ok(())
    }

    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let child = ChildWorker::spawn(&self.run.env(), &indexed)?;
        self.started.insert(indexed.worker_id, child);
        Ok(WorkerHandle::new(indexed.worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let control = self.run.control().clone();
        handles
            .iter()
            .map(|handle| {
                let child = self.started.remove(&handle.worker_id()).ok_or_else(|| {
                    RuntimeError::configuration(format!("unknown worker handle {}", handle))
                })?;
                Ok(child.join(&control))
            })
            .collect()
    }

    fn batch_limit(&self) -> Option<usize> {
        Some(self.run.workers())
    }

    fn reset(&mut self) {
        let control = self.run.control().clone();
        for child in self.running.drain(..).chain(self.started.drain().map(|(_, c)| c)) {
            let _: RawOutcome<T> = child.join(&control);
        }
        self.run.reset();
    }
}

/// Frames a pool child sends for each job it takes
#[derive(Serialize, Deserialize)]
#[serde(bound = "T: Serialize + DeserializeOwned")]
enum PoolFrame<T> {
    Claimed(WorkerId),
    Finished(RawOutcome<T>),
}

/// Children and readers of one activated pool batch
struct PoolRun<T> {
    expected: Vec<WorkerId>,
    outcomes: flume::Receiver<RawOutcome<T>>,
    readers: Vec<JoinHandle<()>>,
}

/// Fixed set of forked processes draining the job list
pub struct ProcessPoolStrategy<A, T> {
    run: RunState<A, T>,
    active: Option<PoolRun<T>>,
    started: HashMap<WorkerId, ChildWorker, RandomState>,
}

impl<A: Payload, T: Payload> ProcessPoolStrategy<A, T> {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        Ok(Self {
            run: RunState::new(RuntimeConfig { mode: RunningMode::ProcessPool, ..config }, None)?,
            active: None,
            started: HashMap::default(),
        })
    }

    fn launch(&self, jobs: Vec<IndexedJob<A, T>>) -> RuntimeResult<PoolRun<T>> {
        let env = self.run.env();
        let claims = SharedCounter::new(0)?;
        let jobs = Arc::new(jobs);
        let size = self.run.workers().min(jobs.len());
        let (tx, rx) = flume::unbounded();
        let mut readers = Vec::with_capacity(size);

        for slot in 0..size {
            let worker_name = format!("pool-worker-{}", slot);
            let (pid, stream) = fork_worker(&env.control, |stream| {
                let mut writer = BufWriter::new(stream);
                loop {
                    let index = (claims.increment() - 1) as usize;
                    let Some(indexed) = jobs.get(index) else {
                        break;
                    };
                    let claimed: PoolFrame<T> = PoolFrame::Claimed(indexed.worker_id);
                    if bincode::serialize_into(&mut writer, &claimed).is_err() || writer.flush().is_err() {
                        break;
                    }
                    let identity = WorkerIdentity::current_thread(indexed.worker_id, worker_name.as_str());
                    let outcome = env.run_job(&indexed.job, identity);
                    if bincode::serialize_into(&mut writer, &PoolFrame::Finished(outcome)).is_err()
                        || writer.flush().is_err()
                    {
                        break;
                    }
                }
            })?;

            let tx = tx.clone();
            let control = env.control.clone();
            let reader = thread::Builder::new()
                .name(format!("pool-reader-{}", slot))
                .spawn(move || read_frames::<T>(stream, pid, worker_name, tx, control))
                .map_err(|e| RuntimeError::Spawn(format!("pool reader: {}", e)))?;
            readers.push(reader);
        }

        info!(processes = size, jobs = jobs.len(), "Process pool started");
        Ok(PoolRun {
            expected: jobs.iter().map(|indexed| indexed.worker_id).collect(),
            outcomes: rx,
            readers,
        })
    }
}

/// Forward a pool child's outcomes; a job claimed but never finished is lost with the child
fn read_frames<T: Payload>(
    stream: UnixStream,
    pid: Pid,
    worker_name: String,
    outcomes: flume::Sender<RawOutcome<T>>,
    control: RunControl,
) {
    let mut reader = BufReader::new(stream);
    let mut in_flight = None;
    while let Ok(frame) = bincode::deserialize_from::<_, PoolFrame<T>>(&mut reader) {
        match frame {
            PoolFrame::Claimed(worker_id) => in_flight = Some(worker_id),
            PoolFrame::Finished(outcome) => {
                in_flight = None;
                if outcomes.send(outcome).is_err() {
                    break;
                }
            }
        }
    }

    let error = reap(pid, &control);
    if let Some(worker_id) = in_flight {
        warn!(worker_id, pid, error = %error, "Pool process lost while running a job");
        let _ = outcomes.send(RawOutcome::failure(
            lost_identity(worker_id, pid, worker_name),
            error,
        ));
    }
}

impl<A: Payload, T: Payload> Strategy<A, T> for ProcessPoolStrategy<A, T> {
    fn run_state(&self) -> &RunState<A, T> {
        &self.run
    }

    fn run_state_mut(&mut self) -> &mut RunState<A, T> {
        &mut self.run
    }

    fn activate_all(&mut self) -> RuntimeResult<()> {
        let jobs = self.run.begin_activation()?;
        self.active = Some(self.launch(jobs)?);
        Ok(())
    }

    /// Outcomes come back in completion order
    fn await_completion(&mut self) -> RuntimeResult<()> {
        self.run.check_awaitable()?;
        let Some(pool) = self.active.take() else {
            return Err(RuntimeError::EmptyWorkerSet);
        };

        let mut outcomes: Vec<RawOutcome<T>> = pool.outcomes.iter().collect();
        for reader in pool.readers {
            if reader.join().is_err() {
                warn!("Pool reader thread panicked");
            }
        }

        // Jobs no child ever claimed
        let reported: HashSet<WorkerId, RandomState> =
            outcomes.iter().map(RawOutcome::worker_id).collect();
        let stopping = self.run.control().is_stopping();
        for worker_id in pool.expected {
            if !reported.contains(&worker_id) {
                let error = if stopping {
                    TaskError::Terminated
                } else {
                    TaskError::WorkerLost("no pool process took the job".into())
                };
                outcomes.push(RawOutcome::failure(
                    lost_identity(worker_id, std::process::id(), "unclaimed".into()),
                    error,
                ));
            }
        }

        self.run.finish_await(outcomes);
        Ok(())
    }

    /// Incremental workers each get their own child process
    fn start_worker(&mut self, job: Job<A, T>) -> RuntimeResult<WorkerHandle> {
        let indexed = self.run.incremental_job(job)?;
        let child = ChildWorker::spawn(&self.run.env(), &indexed)?;
        self.started.insert(indexed.worker_id, child);
        Ok(WorkerHandle::new(indexed.worker_id))
    }

    fn join_workers(&mut self, handles: &[WorkerHandle]) -> RuntimeResult<Vec<RawOutcome<T>>> {
        let control = self.run.control().clone();
        handles
            .iter()
            .map(|handle| {
                let child = self.started.remove(&handle.worker_id()).ok_or_else(|| {
                    RuntimeError::configuration(format!("unknown worker handle {}", handle))
                })?;
                Ok(child.join(&control))
            })
            .collect()
    }

    fn batch_limit(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) {
        let control = self.run.control().clone();
        if let Some(pool) = self.active.take() {
            drop(pool.outcomes);
            for reader in pool.readers {
                let _ = reader.join();
            }
        }
        for (_, child) in self.started.drain() {
            let _: RawOutcome<T> = child.join(&control);
        }
        self.run.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::task::{Callable, Features};
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_multi_process_outcomes_cross_fork() {
        let mut strategy =
            MultiProcessStrategy::new(RuntimeConfig::new(RunningMode::MultiProcess, 3)).unwrap();
        strategy.initialize(None, Features::none()).unwrap();
        strategy
            .build_workers(Callable::<String, String>::blocking(|ctx, s| Ok(format!("{}-{}", s, ctx.worker_id()))), "job".into())
            .unwrap();
        strategy.activate_all().unwrap();
        strategy.await_completion().unwrap();
        let outcomes = strategy.collect_raw_outcomes().unwrap();

        let values: Vec<_> = outcomes.iter().filter_map(|o| o.value.clone()).collect();
        assert_eq!(values, vec!["job-0", "job-1", "job-2"]);
        assert!(outcomes.iter().all(|o| o.identity.pid != std::process::id()));
    }

    #[test]
    #[serial]
    fn test_child_that_exits_is_lost() {
        let mut strategy =
            MultiProcessStrategy::new(RuntimeConfig::new(RunningMode::MultiProcess, 1)).unwrap();
        strategy.initialize(None, Features::none()).unwrap();
        strategy
            .build_workers(
                Callable::<u32, u32>::blocking(|_, code| unsafe { nix::libc::_exit(code as i32) }),
                3,
            )
            .unwrap();
        strategy.activate_all().unwrap();
        strategy.await_completion().unwrap();
        let outcomes = strategy.collect_raw_outcomes().unwrap();
        assert!(matches!(
            outcomes[0].error,
            Some(TaskError::WorkerLost(ref message)) if message.contains("status 3")
        ));
    }

    #[test]
    #[serial]
    fn test_pool_shares_counter_and_isolates_failures() {
        let mut strategy =
            ProcessPoolStrategy::new(RuntimeConfig::new(RunningMode::ProcessPool, 2)).unwrap();
        let counter = SharedCounter::new(0).unwrap();
        let callable = {
            let counter = counter.clone();
            Callable::<u32, u32>::blocking(move |_, x| {
                counter.increment();
                if x == 2 {
                    panic!("bad input");
                }
                Ok(x * 10)
            })
        };

        strategy.initialize(None, Features::none()).unwrap();
        strategy
            .build_jobs((0..5).map(|x| Job::new(callable.clone(), x)).collect())
            .unwrap();
        strategy.activate_all().unwrap();
        strategy.await_completion().unwrap();
        let outcomes = strategy.collect_raw_outcomes().unwrap();

        assert_eq!(outcomes.len(), 5);
        assert_eq!(counter.get(), 5);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.successful).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, Some(TaskError::Panicked("bad input".into())));
        assert!(outcomes
            .iter()
            .all(|o| o.identity.worker_name.starts_with("pool-worker-")));
    }
}
