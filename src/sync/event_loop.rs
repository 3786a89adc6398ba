/*!
 * Event Loop
 *
 * A current-thread tokio runtime with a process-unique identity. Async
 * primitives remember the loop they were created against; the loop installs
 * its id as the thread's current loop while it is being driven.
 */

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<Option<LoopId>> = const { Cell::new(None) };
}

/// Identity of one event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// Loop currently driving this thread, if any
pub fn current_loop() -> Option<LoopId> {
    CURRENT_LOOP.with(|current| current.get())
}

/// Restores the previous current loop on drop (loops may nest across executors)
struct LoopScope {
    previous: Option<LoopId>,
}

impl LoopScope {
    fn enter(id: LoopId) -> Self {
        let previous = CURRENT_LOOP.with(|current| current.replace(Some(id)));
        Self { previous }
    }
}

impl Drop for LoopScope {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| current.set(self.previous));
    }
}

/// Single-threaded cooperative scheduler
#[derive(Clone)]
pub struct EventLoop {
    id: LoopId,
    runtime: Arc<Runtime>,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        Ok(Self {
            id: LoopId::next(),
            runtime: Arc::new(runtime),
        })
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Drive the loop until `future` resolves
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _scope = LoopScope::enter(self.id);
        self.runtime.block_on(future)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("id", &self.id).finish()
    }
}
