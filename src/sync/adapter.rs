/*!
 * Sync Adapter
 * Picks the primitive family for a running mode and hands out handles
 */

use super::blocking::{BlockingCondition, BlockingEvent, BlockingLock, BlockingRLock, BlockingSemaphore};
use super::cooperative::{CoopCondition, CoopEvent, CoopRLock, CoopSemaphore};
use super::shared::{SharedCondition, SharedEvent, SharedLock, SharedRLock, SharedSemaphore};
use super::{
    Acquire, Binding, BoundedSemaphore, Condition, Event, EventLoop, Lock, LoopId, Notifier, RLock,
    Semaphore, Signal,
};
use crate::core::errors::{RuntimeError, RuntimeResult};
use crate::core::types::{Family, RunningMode};
use std::sync::Arc;

/// Factory for the primitives of one family
#[derive(Debug, Clone, Copy)]
pub struct SyncAdapter {
    family: Family,
    event_loop: Option<LoopId>,
}

impl SyncAdapter {
    pub fn new(mode: RunningMode, event_loop: Option<&EventLoop>) -> RuntimeResult<Self> {
        Self::for_family(mode.family(), event_loop.map(EventLoop::id))
    }

    /// Async primitives must be bound to a loop; other families ignore `event_loop`
    pub fn for_family(family: Family, event_loop: Option<LoopId>) -> RuntimeResult<Self> {
        let event_loop = match family {
            Family::Async => Some(event_loop.ok_or_else(|| {
                RuntimeError::configuration("async primitives require an event loop")
            })?),
            _ => None,
        };
        Ok(Self { family, event_loop })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn event_loop(&self) -> Option<LoopId> {
        self.event_loop
    }

    pub fn binding(&self) -> Binding {
        Binding::new(self.family, self.event_loop)
    }

    pub fn get_lock(&self) -> RuntimeResult<Lock> {
        let inner: Arc<dyn Acquire> = match self.family {
            Family::Thread => Arc::new(BlockingLock::new()),
            Family::Process => Arc::new(SharedLock::new()?),
            Family::Green | Family::Async => Arc::new(CoopSemaphore::lock(self.event_loop)),
        };
        Ok(Lock::from_parts(inner, self.binding()))
    }

    pub fn get_rlock(&self) -> RuntimeResult<RLock> {
        let inner: Arc<dyn Acquire> = match self.family {
            Family::Thread => Arc::new(BlockingRLock::new()),
            Family::Process => Arc::new(SharedRLock::new()?),
            Family::Green | Family::Async => Arc::new(CoopRLock::new(self.event_loop)),
        };
        Ok(RLock::from_parts(inner, self.binding()))
    }

    pub fn get_semaphore(&self, value: usize) -> RuntimeResult<Semaphore> {
        let inner: Arc<dyn Acquire> = match self.family {
            Family::Thread => Arc::new(BlockingSemaphore::new(value)),
            Family::Process => Arc::new(SharedSemaphore::new(value)?),
            Family::Green | Family::Async => Arc::new(CoopSemaphore::new(value, self.event_loop)),
        };
        Ok(Semaphore::from_parts(inner, self.binding()))
    }

    pub fn get_bounded_semaphore(&self, value: usize) -> RuntimeResult<BoundedSemaphore> {
        let inner: Arc<dyn Acquire> = match self.family {
            Family::Thread => Arc::new(BlockingSemaphore::bounded(value)),
            Family::Process => Arc::new(SharedSemaphore::bounded(value)?),
            Family::Green | Family::Async => {
                Arc::new(CoopSemaphore::bounded(value, self.event_loop))
            }
        };
        Ok(BoundedSemaphore::from_parts(inner, self.binding()))
    }

    pub fn get_event(&self) -> RuntimeResult<Event> {
        let inner: Arc<dyn Signal> = match self.family {
            Family::Thread => Arc::new(BlockingEvent::new()),
            Family::Process => Arc::new(SharedEvent::new()?),
            Family::Green | Family::Async => Arc::new(CoopEvent::new(self.event_loop)),
        };
        Ok(Event::from_parts(inner, self.binding()))
    }

    /// Condition over `lock`, or over a fresh lock of this family
    pub fn get_condition(&self, lock: Option<Lock>) -> RuntimeResult<Condition> {
        if self.family == Family::Green {
            return Err(no_green_condition());
        }

        let lock = match lock {
            Some(lock) => {
                self.check_binding(lock.binding())?;
                lock
            }
            None => self.get_lock()?,
        };

        let inner: Arc<dyn Notifier> = match self.family {
            Family::Thread => Arc::new(BlockingCondition::new(lock.inner())),
            Family::Process => Arc::new(SharedCondition::new(lock.inner())?),
            Family::Async => Arc::new(CoopCondition::new(lock.inner(), self.event_loop)),
            Family::Green => return Err(no_green_condition()),
        };
        Ok(Condition::from_parts(lock, inner))
    }

    /// Reject primitives made by another family or for another loop
    pub fn check_binding(&self, binding: Binding) -> RuntimeResult<()> {
        if binding.family != self.family {
            return Err(RuntimeError::configuration(format!(
                "{} primitive cannot be used with {} workers",
                binding.family, self.family
            )));
        }
        match (self.event_loop, binding.event_loop) {
            (Some(expected), Some(found)) if expected != found => {
                Err(RuntimeError::IncompatibleLoop { expected, found })
            }
            _ => Ok(()),
        }
    }
}

fn no_green_condition() -> RuntimeError {
    RuntimeError::UnsupportedPrimitive("green threads have no condition variable".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_adapter_requires_loop() {
        let result = SyncAdapter::new(RunningMode::AsyncCooperative, None);
        assert!(matches!(result, Err(RuntimeError::Configuration(_))));
    }

    #[test]
    fn test_green_condition_unsupported() {
        let adapter = SyncAdapter::new(RunningMode::GreenThreadPool, None).unwrap();
        assert!(matches!(
            adapter.get_condition(None),
            Err(RuntimeError::UnsupportedPrimitive(_))
        ));
        // Every other green primitive is available
        assert!(adapter.get_lock().is_ok());
        assert!(adapter.get_event().is_ok());
    }

    #[test]
    fn test_condition_rejects_foreign_lock() {
        let threads = SyncAdapter::new(RunningMode::ThreadPool, None).unwrap();
        let processes = SyncAdapter::new(RunningMode::MultiProcess, None).unwrap();
        let foreign = processes.get_lock().unwrap();
        assert!(matches!(
            threads.get_condition(Some(foreign)),
            Err(RuntimeError::Configuration(_))
        ));
    }

    #[test]
    fn test_condition_rejects_other_loop() {
        let home = EventLoop::new().unwrap();
        let other = EventLoop::new().unwrap();
        let adapter = SyncAdapter::new(RunningMode::AsyncCooperative, Some(&home)).unwrap();
        let stranger = SyncAdapter::new(RunningMode::AsyncCooperative, Some(&other))
            .unwrap()
            .get_lock()
            .unwrap();
        assert!(matches!(
            adapter.get_condition(Some(stranger)),
            Err(RuntimeError::IncompatibleLoop { .. })
        ));
    }

    #[test]
    fn test_handles_carry_family() {
        for mode in RunningMode::ALL {
            let event_loop = EventLoop::new().unwrap();
            let adapter = SyncAdapter::new(mode, Some(&event_loop)).unwrap();
            let lock = adapter.get_lock().unwrap();
            assert_eq!(lock.binding().family, mode.family());
            lock.acquire().unwrap();
            lock.release().unwrap();
        }
    }
}
