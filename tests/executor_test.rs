/*!
 * Executor Integration Tests
 * Runs, maps and incremental batches across the in-process backends
 */

use multirunnable::{
    with_lock, Callable, Executor, Features, ResultState, ResultsExt, RunningMode, RuntimeConfig,
    RuntimeError, TaskError, WorkerResult,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const IN_PROCESS: [RunningMode; 4] = [
    RunningMode::MultiThread,
    RunningMode::ThreadPool,
    RunningMode::GreenThreadPool,
    RunningMode::AsyncCooperative,
];

fn double() -> Callable<u64, u64> {
    Callable::blocking(|_, x| Ok(x * 2))
}

fn ids(results: &[WorkerResult<u64>]) -> Vec<usize> {
    let mut ids: Vec<_> = results.iter().map(|r| r.worker_id).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_run_produces_one_result_per_worker_in_every_mode() {
    for mode in IN_PROCESS {
        let mut executor = Executor::new(mode, 3).unwrap();
        executor.run(double(), 21, Features::none()).unwrap();

        let results = executor.result().unwrap();
        assert_eq!(results.len(), 3, "{}", mode);
        assert_eq!(ids(&results), vec![0, 1, 2], "{}", mode);
        assert!(results.all_successful(), "{}", mode);
        assert!(results.iter().all(|r| r.data == Some(42)), "{}", mode);
    }
}

#[test]
fn test_thread_pool_shared_counter_under_lock() {
    let counter = Arc::new(AtomicUsize::new(0));
    let bump = {
        let counter = Arc::clone(&counter);
        with_lock(Callable::<u64, u64>::blocking(move |_, _| {
            let seen = counter.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            counter.store(seen + 1, Ordering::SeqCst);
            Ok(seen as u64)
        }))
    };

    let mut executor = Executor::new(RunningMode::ThreadPool, 3).unwrap();
    executor.run(bump, 0, Features::new().lock()).unwrap();

    let results = executor.result().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    let mut seen: Vec<u64> = results.data().into_iter().copied().collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn test_thread_pool_counter_from_registry_lock() {
    let counter = Arc::new(AtomicUsize::new(0));
    let increment = {
        let counter = Arc::clone(&counter);
        Callable::<u64, u64>::blocking(move |ctx, _| {
            let lock = ctx.registry().lock()?;
            let _guard = lock.guard()?;
            let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(Duration::from_millis(100));
            Ok(value as u64)
        })
    };

    let mut executor = Executor::new(RunningMode::ThreadPool, 3).unwrap();
    executor.run(increment, 0, Features::new().lock()).unwrap();

    let results = executor.result().unwrap();
    assert!(results.all_successful());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    let returned: HashSet<u64> = results.data().into_iter().copied().collect();
    assert_eq!(returned, HashSet::from([1, 2, 3]));
}

#[test]
fn test_map_corresponds_to_arguments() {
    for mode in IN_PROCESS {
        let mut executor = Executor::new(mode, 2).unwrap();
        executor.map(double(), 0..7u64, Features::none()).unwrap();

        let results = executor.result().unwrap();
        assert_eq!(results.len(), 7, "{}", mode);
        for result in &results {
            assert_eq!(result.data, Some(result.worker_id as u64 * 2), "{}", mode);
        }
    }
}

#[test]
fn test_map_with_function_one_argument_many_functions() {
    let functions = vec![
        Callable::<u64, u64>::blocking(|_, x| Ok(x + 1)),
        Callable::<u64, u64>::blocking(|_, x| Ok(x * 10)),
        Callable::<u64, u64>::cooperative(|_, x| async move { Ok(x * x) }),
    ];
    let mut executor = Executor::new(RunningMode::GreenThreadPool, 2).unwrap();
    executor
        .map_with_function(functions, [5], Features::none())
        .unwrap();

    let results = executor.result().unwrap();
    let data: Vec<u64> = results.data().into_iter().copied().collect();
    assert_eq!(data, vec![6, 50, 25]);
}

#[test]
fn test_map_with_function_length_mismatch() {
    let mut executor = Executor::<u64, u64>::new(RunningMode::MultiThread, 2).unwrap();
    let err = executor
        .map_with_function(vec![double(), double()], [1, 2, 3], Features::none())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Configuration(_)));
}

#[test]
fn test_failures_are_isolated() {
    let flaky = Callable::<u64, u64>::blocking(|ctx, x| match ctx.worker_id() {
        0 => Err(TaskError::failed("refused")),
        1 => panic!("worker blew up"),
        _ => Ok(x),
    });

    for mode in [RunningMode::MultiThread, RunningMode::ThreadPool] {
        let mut executor = Executor::new(mode, 3).unwrap();
        executor.run(flaky.clone(), 9, Features::none()).unwrap();

        let results = executor.result().unwrap();
        let by_id = |id: usize| results.iter().find(|r| r.worker_id == id).unwrap();
        assert_eq!(by_id(0).state, ResultState::Fail);
        assert_eq!(by_id(0).exception, Some(TaskError::failed("refused")));
        assert!(matches!(by_id(1).exception, Some(TaskError::Panicked(ref m)) if m.contains("blew up")));
        assert_eq!(by_id(1).data, None);
        assert_eq!(by_id(2).data, Some(9));
    }
}

#[test]
fn test_result_is_idempotent() {
    let mut executor = Executor::new(RunningMode::MultiThread, 2).unwrap();
    assert!(matches!(
        executor.result(),
        Err(RuntimeError::NotYetCompleted(_))
    ));

    executor.run(double(), 1, Features::none()).unwrap();
    let first = executor.result().unwrap();
    let second = executor.result().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_run_from_queue_consumes_every_task() {
    for mode in IN_PROCESS {
        let mut executor = Executor::new(mode, 4).unwrap();
        executor
            .run_from_queue(double(), vec![1, 2, 3], Features::none())
            .unwrap();

        let results = executor.result().unwrap();
        assert_eq!(results.len(), 4, "{}", mode);
        let mut data: Vec<u64> = results.data().into_iter().copied().collect();
        data.sort_unstable();
        assert_eq!(data, vec![2, 4, 6], "{}", mode);

        let drained: Vec<_> = results
            .failures()
            .iter()
            .map(|r| r.exception.clone())
            .collect();
        assert_eq!(drained, vec![Some(TaskError::QueueDrained)], "{}", mode);
    }
}

#[test]
fn test_incremental_workers() {
    let mut executor = Executor::new(RunningMode::ThreadPool, 2).unwrap();
    let handles: Vec<_> = (1..=4)
        .map(|x| executor.start_new_worker(double(), x).unwrap())
        .collect();
    assert!(matches!(
        executor.result(),
        Err(RuntimeError::NotYetCompleted(_))
    ));

    executor.close(&handles).unwrap();
    let results = executor.result().unwrap();
    let mut data: Vec<u64> = results.data().into_iter().copied().collect();
    data.sort_unstable();
    assert_eq!(data, vec![2, 4, 6, 8]);

    executor.run(double(), 5, Features::none()).unwrap();
    assert_eq!(executor.result().unwrap().len(), 2);
}

#[test]
fn test_async_results_in_completion_order() {
    let sleepy = Callable::<u64, u64>::cooperative(|_, ms| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    });
    let mut executor = Executor::new(RunningMode::AsyncCooperative, 3).unwrap();
    executor.map(sleepy, [50, 0, 20], Features::none()).unwrap();

    let results = executor.result().unwrap();
    let data: Vec<u64> = results.data().into_iter().copied().collect();
    assert_eq!(data, vec![0, 20, 50]);
    assert!(results.iter().all(|r| r.native_id.is_none()));
}

#[test]
fn test_terminal_from_another_thread() {
    let mut executor = Executor::new(RunningMode::ThreadPool, 1).unwrap();
    let controller = executor.controller();
    let slow = Callable::<u64, u64>::blocking(|_, x| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(x)
    });

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        controller.terminal();
    });
    executor.map(slow, 0..5u64, Features::none()).unwrap();
    stopper.join().unwrap();

    let results = executor.result().unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.successes().len() >= 1);
    assert!(results
        .failures()
        .iter()
        .all(|r| r.exception == Some(TaskError::Terminated)));
    assert!(!results.failures().is_empty());
}

#[test]
fn test_registry_is_run_scoped() {
    let mut executor = Executor::<u64, u64>::new(RunningMode::MultiThread, 1).unwrap();
    let lookup = Callable::<u64, u64>::blocking(|ctx, _| {
        ctx.registry().semaphore()?;
        Ok(1)
    });

    executor
        .run(lookup.clone(), 0, Features::new().semaphore(2))
        .unwrap();
    assert!(executor.result().unwrap().all_successful());

    executor.run(lookup, 0, Features::none()).unwrap();
    let results = executor.result().unwrap();
    assert!(matches!(results[0].exception, Some(TaskError::Failed(_))));
}

#[test]
fn test_from_config_validates() {
    let config = RuntimeConfig::new(RunningMode::ThreadPool, 0);
    assert!(matches!(
        Executor::<u64, u64>::from_config(config),
        Err(RuntimeError::Configuration(_))
    ));
}

#[test]
fn test_identity_names_per_backend() {
    let expectations = [
        (RunningMode::MultiThread, "worker-"),
        (RunningMode::ThreadPool, "pool-worker-"),
        (RunningMode::GreenThreadPool, "greenlet-"),
        (RunningMode::AsyncCooperative, "task-"),
    ];
    for (mode, prefix) in expectations {
        let mut executor = Executor::new(mode, 2).unwrap();
        executor.run(double(), 1, Features::none()).unwrap();
        let names: HashSet<_> = executor
            .result()
            .unwrap()
            .into_iter()
            .map(|r| r.worker_name)
            .collect();
        assert!(names.iter().all(|n| n.starts_with(prefix)), "{} {:?}", mode, names);
    }
}

#[test]
fn test_cancelled_task_releases_registered_lock() {
    let mut executor = Executor::new(RunningMode::AsyncCooperative, 2).unwrap();
    let controller = executor.controller();
    let hold = with_lock(Callable::<u64, u64>::cooperative(|ctx, x| async move {
        if ctx.worker_id() == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(x)
    }));

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        controller.cancel(0)
    });
    executor.run(hold, 7, Features::new().lock()).unwrap();
    assert!(canceller.join().unwrap());

    let results = executor.result().unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        match result.worker_id {
            0 => assert_eq!(result.exception, Some(TaskError::Cancelled)),
            _ => assert_eq!(result.data, Some(7)),
        }
    }
}
