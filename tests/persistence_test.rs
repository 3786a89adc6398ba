/*!
 * Persistence Integration Tests
 * Per-worker sessions opened and closed by the strategies under the sharing gate
 */

use multirunnable::persistence::{Connection, Cursor, PersistenceResult, PersistenceSettings};
use multirunnable::{
    Callable, ConnectionSharingMode, Executor, Features, Persistence, ResultsExt, RunningMode,
    TaskError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory "database": connections are numbered, cursors collect statements
#[derive(Default)]
struct Ledger {
    settings: Mutex<Vec<PersistenceSettings>>,
    opened: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicUsize,
}

impl Persistence for Ledger {
    fn initialize(&self, _: RunningMode, settings: &PersistenceSettings) -> PersistenceResult<()> {
        self.settings.lock().push(*settings);
        Ok(())
    }

    fn connect(&self) -> PersistenceResult<Connection> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(id))
    }

    fn build_cursor(&self, _: &Connection) -> PersistenceResult<Cursor> {
        Ok(Box::new(Vec::<String>::new()))
    }

    fn close_instance(&self, _: Connection, _: Cursor) -> PersistenceResult<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn query() -> Callable<u32, usize> {
    Callable::blocking(|ctx, x| {
        let session = ctx
            .session()
            .ok_or_else(|| TaskError::failed("no session"))?;
        std::thread::sleep(Duration::from_millis(10));
        let id = session.with(|connection: &mut usize, cursor: &mut Vec<String>| {
            cursor.push(format!("SELECT {}", x));
            *connection
        })?;
        Ok(id)
    })
}

#[test]
fn test_exclusive_sharing_serializes_sessions() {
    let ledger = Arc::new(Ledger::default());
    let mut executor = Executor::<u32, usize>::builder()
        .with_mode(RunningMode::MultiThread)
        .with_workers(4)
        .with_connection_sharing(ConnectionSharingMode::Exclusive)
        .with_persistence(ledger.clone())
        .build::<u32, usize>()
        .unwrap();

    executor.run(query(), 1, Features::none()).unwrap();

    let results = executor.result().unwrap();
    assert!(results.all_successful());
    assert_eq!(ledger.opened.load(Ordering::SeqCst), 4);
    assert_eq!(ledger.closed.load(Ordering::SeqCst), 4);
    assert_eq!(ledger.peak.load(Ordering::SeqCst), 1);

    let settings = ledger.settings.lock();
    assert_eq!(settings.len(), 1);
    assert_eq!(settings[0].sharing, ConnectionSharingMode::Exclusive);
}

#[test]
fn test_pooled_sharing_caps_open_sessions() {
    let ledger = Arc::new(Ledger::default());
    let mut executor = Executor::<u32, usize>::builder()
        .with_mode(RunningMode::ThreadPool)
        .with_workers(4)
        .with_db_pool_size(2)
        .with_persistence(ledger.clone())
        .build::<u32, usize>()
        .unwrap();

    executor.map(query(), 0..8, Features::none()).unwrap();

    let results = executor.result().unwrap();
    assert_eq!(results.successes().len(), 8);
    assert!(ledger.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(ledger.live.load(Ordering::SeqCst), 0);
    assert_eq!(ledger.settings.lock()[0].connection_count, 2);
}

#[test]
fn test_sessions_on_cooperative_backend() {
    let ledger = Arc::new(Ledger::default());
    let mut executor = Executor::<u32, usize>::builder()
        .with_mode(RunningMode::AsyncCooperative)
        .with_workers(3)
        .with_connection_sharing(ConnectionSharingMode::Exclusive)
        .with_persistence(ledger.clone())
        .build::<u32, usize>()
        .unwrap();

    let task = Callable::<u32, usize>::cooperative(|ctx, _| async move {
        tokio::task::yield_now().await;
        let open = ctx.session().map(|s| s.is_open()).unwrap_or(false);
        Ok(usize::from(open))
    });
    executor.run(task, 0, Features::none()).unwrap();

    let results = executor.result().unwrap();
    assert_eq!(results.data(), vec![&1, &1, &1]);
    assert_eq!(ledger.peak.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.closed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_no_backend_means_no_session() {
    let mut executor = Executor::new(RunningMode::MultiThread, 1).unwrap();
    executor.run(query(), 1, Features::none()).unwrap();

    let results = executor.result().unwrap();
    assert_eq!(results[0].exception, Some(TaskError::failed("no session")));
}

#[test]
fn test_cancelled_task_returns_exclusive_session() {
    let ledger = Arc::new(Ledger::default());
    let mut executor = Executor::<u32, usize>::builder()
        .with_mode(RunningMode::AsyncCooperative)
        .with_workers(2)
        .with_connection_sharing(ConnectionSharingMode::Exclusive)
        .with_persistence(ledger.clone())
        .build::<u32, usize>()
        .unwrap();
    let controller = executor.controller();

    let task = Callable::<u32, usize>::cooperative(|ctx, _| async move {
        if ctx.worker_id() == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(ctx.worker_id())
    });
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        controller.cancel(0)
    });
    executor.run(task, 0, Features::none()).unwrap();
    assert!(canceller.join().unwrap());

    let results = executor.result().unwrap();
    assert_eq!(results.successes().len(), 1);
    assert_eq!(results.failures()[0].exception, Some(TaskError::Cancelled));
    assert_eq!(ledger.opened.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.closed.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.live.load(Ordering::SeqCst), 0);
}
