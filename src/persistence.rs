/*!
 * Persistence Collaborator
 *
 * Database adapters live outside this crate; strategies only drive them at
 * fixed lifecycle points:
 * - strategy initialize: `Persistence::initialize` with the connection count
 * - worker start: gate acquire, `get_one_connection`, `build_cursor`
 * - worker end: `close_instance`, gate release
 *
 * The gate is a primitive of the run's family: a lock when connections are
 * `Exclusive`, a bounded semaphore of `connection_count` permits when
 * `Pooled`. Process workers connect in the child after fork.
 */

use crate::core::errors::RuntimeResult;
use crate::core::types::RunningMode;
use crate::sync::{BoundedSemaphore, Lock, SyncAdapter, SyncError, SyncGuard, SyncResult};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum PersistenceError {
    #[error("Initialization failed: {0}")]
    #[diagnostic(code(persistence::initialize))]
    Initialize(String),

    #[error("Connection failed: {0}")]
    #[diagnostic(
        code(persistence::connection),
        help("Check the database address and the connection pool size.")
    )]
    Connection(String),

    #[error("Cursor creation failed: {0}")]
    #[diagnostic(code(persistence::cursor))]
    Cursor(String),

    #[error("Closing connection failed: {0}")]
    #[diagnostic(code(persistence::close))]
    Close(String),

    #[error("Session is closed")]
    #[diagnostic(code(persistence::session_closed))]
    SessionClosed,

    #[error("Session resource is not a {0}")]
    #[diagnostic(
        code(persistence::type_mismatch),
        help("Downcast to the connection and cursor types the adapter creates.")
    )]
    TypeMismatch(&'static str),

    #[error("Connection gate failed: {0}")]
    #[diagnostic(transparent)]
    Gate(#[from] SyncError),
}

/// How workers share database connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSharingMode {
    /// One session open at a time across the run
    Exclusive,
    /// Up to `connection_count` sessions open at once
    #[default]
    Pooled,
}

impl ConnectionSharingMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionSharingMode::Exclusive => "exclusive",
            ConnectionSharingMode::Pooled => "pooled",
        }
    }
}

impl fmt::Display for ConnectionSharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionSharingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" | "single" => Ok(ConnectionSharingMode::Exclusive),
            "pooled" | "pool" => Ok(ConnectionSharingMode::Pooled),
            other => Err(format!("unknown connection sharing mode '{}'", other)),
        }
    }
}

/// What `Persistence::initialize` is told about the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceSettings {
    pub connection_count: usize,
    pub sharing: ConnectionSharingMode,
}

pub type Connection = Box<dyn Any + Send + Sync>;
pub type Cursor = Box<dyn Any + Send + Sync>;

/// Database adapter driven by the strategies
pub trait Persistence: Send + Sync {
    fn initialize(&self, mode: RunningMode, settings: &PersistenceSettings) -> PersistenceResult<()>;

    fn connect(&self) -> PersistenceResult<Connection>;

    /// Connection for one worker; pooled adapters hand out an idle one
    fn get_one_connection(&self) -> PersistenceResult<Connection> {
        self.connect()
    }

    fn build_cursor(&self, connection: &Connection) -> PersistenceResult<Cursor>;

    fn close_instance(&self, connection: Connection, cursor: Cursor) -> PersistenceResult<()>;
}

/// Resources of an open session; the permit holds the sharing gate
struct Held {
    connection: Connection,
    cursor: Cursor,
    permit: SyncGuard,
}

/// Connection and cursor of one running task.
///
/// Dropping an open session closes it, so a task aborted mid-run still
/// returns its connection and releases the gate.
pub struct Session {
    backend: Arc<dyn Persistence>,
    held: Mutex<Option<Held>>,
}

impl Session {
    fn new(backend: Arc<dyn Persistence>, connection: Connection, cursor: Cursor, permit: SyncGuard) -> Self {
        Self {
            backend,
            held: Mutex::new(Some(Held {
                connection,
                cursor,
                permit,
            })),
        }
    }

    /// Borrow the connection and cursor as the adapter's concrete types
    pub fn with<C, K, R>(&self, f: impl FnOnce(&mut C, &mut K) -> R) -> PersistenceResult<R>
    where
        C: 'static,
        K: 'static,
    {
        let mut held = self.held.lock();
        let Some(Held { connection, cursor, .. }) = held.as_mut() else {
            return Err(PersistenceError::SessionClosed);
        };
        let connection = (**connection)
            .downcast_mut::<C>()
            .ok_or(PersistenceError::TypeMismatch(type_name::<C>()))?;
        let cursor = (**cursor)
            .downcast_mut::<K>()
            .ok_or(PersistenceError::TypeMismatch(type_name::<K>()))?;
        Ok(f(connection, cursor))
    }

    pub fn connection<C, R>(&self, f: impl FnOnce(&mut C) -> R) -> PersistenceResult<R>
    where
        C: 'static,
    {
        let mut held = self.held.lock();
        let Some(Held { connection, .. }) = held.as_mut() else {
            return Err(PersistenceError::SessionClosed);
        };
        (**connection)
            .downcast_mut::<C>()
            .map(f)
            .ok_or(PersistenceError::TypeMismatch(type_name::<C>()))
    }

    pub fn is_open(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Hand the connection back to the adapter, then release the gate; closing twice is a no-op
    pub fn close(&self) -> PersistenceResult<()> {
        let Some(Held {
            connection,
            cursor,
            permit,
        }) = self.held.lock().take()
        else {
            return Ok(());
        };
        let closed = self.backend.close_instance(connection, cursor);
        drop(permit);
        closed
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_open() {
            debug!("Session dropped while open, closing");
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to close dropped session");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("open", &self.is_open()).finish()
    }
}

#[derive(Clone)]
enum Gate {
    Exclusive(Lock),
    Pooled(BoundedSemaphore),
}

/// Opens and closes sessions under the run's connection-sharing gate
#[derive(Clone)]
pub struct PersistenceGate {
    backend: Arc<dyn Persistence>,
    gate: Gate,
}

impl PersistenceGate {
    pub fn new(
        backend: Arc<dyn Persistence>,
        settings: &PersistenceSettings,
        adapter: &SyncAdapter,
    ) -> RuntimeResult<Self> {
        let gate = match settings.sharing {
            ConnectionSharingMode::Exclusive => Gate::Exclusive(adapter.get_lock()?),
            ConnectionSharingMode::Pooled => {
                Gate::Pooled(adapter.get_bounded_semaphore(settings.connection_count.max(1))?)
            }
        };
        Ok(Self { backend, gate })
    }

    pub fn sharing(&self) -> ConnectionSharingMode {
        match self.gate {
            Gate::Exclusive(_) => ConnectionSharingMode::Exclusive,
            Gate::Pooled(_) => ConnectionSharingMode::Pooled,
        }
    }

    fn permit(&self) -> SyncResult<SyncGuard> {
        match &self.gate {
            Gate::Exclusive(lock) => lock.guard(),
            Gate::Pooled(semaphore) => semaphore.guard(),
        }
    }

    async fn permit_async(&self) -> SyncResult<SyncGuard> {
        match &self.gate {
            Gate::Exclusive(lock) => lock.guard_async().await,
            Gate::Pooled(semaphore) => semaphore.guard_async().await,
        }
    }

    /// The permit is released again if connecting fails
    fn connect(&self, permit: SyncGuard) -> PersistenceResult<Session> {
        let connection = self.backend.get_one_connection()?;
        let cursor = self.backend.build_cursor(&connection)?;
        Ok(Session::new(Arc::clone(&self.backend), connection, cursor, permit))
    }

    /// Wait for the gate, then connect
    pub fn open(&self) -> PersistenceResult<Session> {
        let permit = self.permit()?;
        self.connect(permit)
    }

    pub async fn open_async(&self) -> PersistenceResult<Session> {
        let permit = self.permit_async().await?;
        self.connect(permit)
    }

    pub fn close(&self, session: &Session) -> PersistenceResult<()> {
        session.close()
    }
}

impl fmt::Debug for PersistenceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceGate")
            .field("sharing", &self.sharing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Memory {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Persistence for Memory {
        fn initialize(&self, _: RunningMode, _: &PersistenceSettings) -> PersistenceResult<()> {
            Ok(())
        }

        fn connect(&self) -> PersistenceResult<Connection> {
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(id))
        }

        fn build_cursor(&self, connection: &Connection) -> PersistenceResult<Cursor> {
            let id = connection
                .downcast_ref::<usize>()
                .ok_or(PersistenceError::TypeMismatch("usize"))?;
            Ok(Box::new(Vec::<String>::from([format!("cursor-{}", id)])))
        }

        fn close_instance(&self, _: Connection, _: Cursor) -> PersistenceResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn memory() -> Arc<Memory> {
        Arc::new(Memory {
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    fn adapter() -> SyncAdapter {
        SyncAdapter::new(RunningMode::MultiThread, None).unwrap()
    }

    #[test]
    fn test_session_downcasts() {
        let backend = memory();
        let settings = PersistenceSettings {
            connection_count: 2,
            sharing: ConnectionSharingMode::Pooled,
        };
        let gate = PersistenceGate::new(backend.clone(), &settings, &adapter()).unwrap();
        let session = gate.open().unwrap();

        let row = session
            .with(|id: &mut usize, cursor: &mut Vec<String>| format!("{}:{}", id, cursor[0]))
            .unwrap();
        assert_eq!(row, "0:cursor-0");
        assert_eq!(
            session.connection(|_: &mut String| ()),
            Err(PersistenceError::TypeMismatch(type_name::<String>()))
        );

        gate.close(&session).unwrap();
        gate.close(&session).unwrap();
        assert!(!session.is_open());
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
        assert_eq!(session.connection(|_: &mut usize| ()), Err(PersistenceError::SessionClosed));
    }

    #[test]
    fn test_exclusive_gate_allows_one_session() {
        let settings = PersistenceSettings {
            connection_count: 4,
            sharing: ConnectionSharingMode::Exclusive,
        };
        let gate = PersistenceGate::new(memory(), &settings, &adapter()).unwrap();
        let first = gate.open().unwrap();

        let Gate::Exclusive(lock) = &gate.gate else {
            panic!("expected an exclusive gate");
        };
        assert!(!lock.try_acquire().unwrap());
        gate.close(&first).unwrap();
        assert!(lock.try_acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_dropped_session_releases_gate() {
        let backend = memory();
        let settings = PersistenceSettings {
            connection_count: 1,
            sharing: ConnectionSharingMode::Exclusive,
        };
        let gate = PersistenceGate::new(backend.clone(), &settings, &adapter()).unwrap();
        let Gate::Exclusive(lock) = gate.gate.clone() else {
            panic!("expected an exclusive gate");
        };

        let session = gate.open().unwrap();
        assert!(!lock.try_acquire().unwrap());
        drop(session);

        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
        assert!(lock.try_acquire().unwrap());
        lock.release().unwrap();
    }

    #[test]
    fn test_aborted_task_returns_pooled_permit() {
        let event_loop = crate::sync::EventLoop::new().unwrap();
        let adapter = SyncAdapter::new(RunningMode::AsyncCooperative, Some(&event_loop)).unwrap();
        let backend = memory();
        let settings = PersistenceSettings {
            connection_count: 1,
            sharing: ConnectionSharingMode::Pooled,
        };
        let gate = PersistenceGate::new(backend.clone(), &settings, &adapter).unwrap();

        let reopened = event_loop.block_on(async {
            let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();
            let holder = {
                let gate = gate.clone();
                tokio::task::spawn(async move {
                    let _session = gate.open_async().await?;
                    let _ = opened_tx.send(());
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok::<_, PersistenceError>(())
                })
            };
            opened_rx.await.unwrap();
            holder.abort();
            assert!(holder.await.unwrap_err().is_cancelled());

            let session = gate.open_async().await?;
            session.close()
        });

        assert_eq!(reopened, Ok(()));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sharing_mode_parsing() {
        assert_eq!("Exclusive".parse(), Ok(ConnectionSharingMode::Exclusive));
        assert_eq!("pooled".parse(), Ok(ConnectionSharingMode::Pooled));
        assert!("shared".parse::<ConnectionSharingMode>().is_err());
        assert_eq!(ConnectionSharingMode::default(), ConnectionSharingMode::Pooled);
    }
}
