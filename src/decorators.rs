/*!
 * Task Decorators
 *
 * Wrappers that return a callable with the same signature as the one they
 * wrap, so decorated and plain callables are interchangeable everywhere.
 *
 * - `Retry`: bounded re-invocation with lifecycle hooks
 * - `with_lock` and friends: run while holding the run's registered primitive
 */

use crate::core::types::Payload;
use crate::strategy::task::{Callable, TaskError, TaskResult, WorkerContext};
use crate::strategy::worker::panic_message;
use crate::sync::SyncGuard;
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

type InitHook = Arc<dyn Fn(&WorkerContext) + Send + Sync>;
type DoneHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&TaskError) + Send + Sync>;
type FinalHook = Arc<dyn Fn() + Send + Sync>;

/// Bounded retry.
///
/// Each attempt calls `on_initialize`, then the callable, then `on_done` or
/// `on_error` depending on the outcome, then `on_final`. A panicking attempt
/// counts as a failure with `TaskError::Panicked`. The first success is
/// returned; after `max_attempts` failures the last error is.
pub struct Retry<T> {
    max_attempts: usize,
    on_initialize: Option<InitHook>,
    on_done: Option<DoneHook<T>>,
    on_error: Option<ErrorHook>,
    on_final: Option<FinalHook>,
}

impl<T> Clone for Retry<T> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            on_initialize: self.on_initialize.clone(),
            on_done: self.on_done.clone(),
            on_error: self.on_error.clone(),
            on_final: self.on_final.clone(),
        }
    }
}

impl<T: Payload> Retry<T> {
    /// At least one attempt is always made
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            on_initialize: None,
            on_done: None,
            on_error: None,
            on_final: None,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn on_initialize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        self.on_initialize = Some(Arc::new(hook));
        self
    }

    pub fn on_done<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_done = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_final<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_final = Some(Arc::new(hook));
        self
    }

    fn before(&self, ctx: &WorkerContext) {
        if let Some(hook) = &self.on_initialize {
            hook(ctx);
        }
    }

    /// Run the outcome hooks; true when the attempt succeeded
    fn after(&self, ctx: &WorkerContext, attempt: usize, result: &TaskResult<T>) -> bool {
        let succeeded = match result {
            Ok(value) => {
                if let Some(hook) = &self.on_done {
                    hook(value);
                }
                true
            }
            Err(error) => {
                debug!(
                    worker_id = ctx.worker_id(),
                    attempt,
                    max_attempts = self.max_attempts,
                    error = %error,
                    "Attempt failed"
                );
                if let Some(hook) = &self.on_error {
                    hook(error);
                }
                false
            }
        };
        if let Some(hook) = &self.on_final {
            hook();
        }
        succeeded
    }

    /// Wrap `callable`; the result keeps its flavour
    pub fn wrap<A: Payload>(&self, callable: Callable<A, T>) -> Callable<A, T> {
        let retry = self.clone();
        match callable {
            Callable::Blocking(f) => Callable::blocking(move |ctx: WorkerContext, arg: A| {
                let mut attempt = 1;
                loop {
                    retry.before(&ctx);
                    let result = catch_unwind(AssertUnwindSafe(|| f(ctx.clone(), arg.clone())))
                        .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                    if retry.after(&ctx, attempt, &result) || attempt >= retry.max_attempts {
                        return result;
                    }
                    attempt += 1;
                }
            }),
            Callable::Cooperative(f) => Callable::cooperative(move |ctx: WorkerContext, arg: A| {
                let (retry, f) = (retry.clone(), Arc::clone(&f));
                async move {
                    let mut attempt = 1;
                    loop {
                        retry.before(&ctx);
                        let result = AssertUnwindSafe(f(ctx.clone(), arg.clone()))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|payload| {
                                Err(TaskError::Panicked(panic_message(payload.as_ref())))
                            });
                        if retry.after(&ctx, attempt, &result) || attempt >= retry.max_attempts {
                            return result;
                        }
                        attempt += 1;
                    }
                }
            }),
        }
    }
}

/// How a guard decorator obtains its guard from the worker's registry
#[derive(Debug, Clone, Copy)]
enum Guarded {
    Lock,
    RLock,
    Semaphore,
    BoundedSemaphore,
}

impl Guarded {
    fn guard(self, ctx: &WorkerContext) -> TaskResult<SyncGuard> {
        let registry = ctx.registry();
        let guard = match self {
            Guarded::Lock => registry.lock()?.guard()?,
            Guarded::RLock => registry.rlock()?.guard()?,
            Guarded::Semaphore => registry.semaphore()?.guard()?,
            Guarded::BoundedSemaphore => registry.bounded_semaphore()?.guard()?,
        };
        Ok(guard)
    }

    async fn guard_async(self, ctx: &WorkerContext) -> TaskResult<SyncGuard> {
        let registry = ctx.registry();
        let guard = match self {
            Guarded::Lock => registry.lock()?.guard_async().await?,
            Guarded::RLock => registry.rlock()?.guard_async().await?,
            Guarded::Semaphore => registry.semaphore()?.guard_async().await?,
            Guarded::BoundedSemaphore => registry.bounded_semaphore()?.guard_async().await?,
        };
        Ok(guard)
    }

    fn wrap<A: Payload, T: Payload>(self, callable: Callable<A, T>) -> Callable<A, T> {
        match callable {
            Callable::Blocking(f) => Callable::blocking(move |ctx: WorkerContext, arg: A| {
                let _guard = self.guard(&ctx)?;
                f(ctx, arg)
            }),
            Callable::Cooperative(f) => Callable::cooperative(move |ctx: WorkerContext, arg: A| {
                let f = Arc::clone(&f);
                async move {
                    let _guard = self.guard_async(&ctx).await?;
                    f(ctx, arg).await
                }
            }),
        }
    }
}

/// Run `callable` while holding the run's lock
pub fn with_lock<A: Payload, T: Payload>(callable: Callable<A, T>) -> Callable<A, T> {
    Guarded::Lock.wrap(callable)
}

/// Run `callable` while holding the run's re-entrant lock
pub fn with_rlock<A: Payload, T: Payload>(callable: Callable<A, T>) -> Callable<A, T> {
    Guarded::RLock.wrap(callable)
}

/// Run `callable` while holding one permit of the run's semaphore
pub fn with_semaphore<A: Payload, T: Payload>(callable: Callable<A, T>) -> Callable<A, T> {
    Guarded::Semaphore.wrap(callable)
}

/// Run `callable` while holding one permit of the run's bounded semaphore
pub fn with_bounded_semaphore<A: Payload, T: Payload>(callable: Callable<A, T>) -> Callable<A, T> {
    Guarded::BoundedSemaphore.wrap(callable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RuntimeError;
    use crate::core::types::RunningMode;
    use crate::registry::{FeatureRegistry, PrimitiveKind};
    use crate::strategy::WorkerIdentity;
    use crate::sync::{EventLoop, Primitive, SyncAdapter};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(registry: Arc<FeatureRegistry>) -> WorkerContext {
        WorkerContext::new(WorkerIdentity::current_thread(0, "worker-0"), registry, None)
    }

    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> Callable<u32, u32> {
        Callable::blocking(move |_, x| {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(TaskError::failed("not yet"))
            } else {
                Ok(x + 1)
            }
        })
    }

    #[test]
    fn test_retry_until_success_fires_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (inits, dones, errors, finals) = (
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicUsize::new(0)),
        );
        let retry = {
            let (inits, dones, errors, finals) =
                (inits.clone(), dones.clone(), errors.clone(), finals.clone());
            Retry::new(5)
                .on_initialize(move |_| {
                    inits.fetch_add(1, Ordering::SeqCst);
                })
                .on_done(move |value: &u32| {
                    assert_eq!(*value, 8);
                    dones.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                })
                .on_final(move || {
                    finals.fetch_add(1, Ordering::SeqCst);
                })
        };

        let wrapped = retry.wrap(flaky(2, calls.clone()));
        let result = wrapped.call_blocking(context(Arc::new(FeatureRegistry::new())), 7);

        assert_eq!(result, Ok(8));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(inits.load(Ordering::SeqCst), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 2);
        assert_eq!(dones.load(Ordering::SeqCst), 1);
        assert_eq!(finals.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_with_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let wrapped = Retry::new(3).wrap(flaky(10, calls.clone()));
        let result = wrapped.call_blocking(context(Arc::new(FeatureRegistry::new())), 1);

        assert_eq!(result, Err(TaskError::failed("not yet")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_attempt_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let inner = {
            let calls = calls.clone();
            Callable::<u32, u32>::blocking(move |_, x| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first attempt exploded");
                }
                Ok(x)
            })
        };
        let retry = {
            let errors = errors.clone();
            Retry::new(2).on_error(move |error| {
                assert_eq!(error, &TaskError::Panicked("first attempt exploded".into()));
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };

        let result = retry
            .wrap(inner)
            .call_blocking(context(Arc::new(FeatureRegistry::new())), 4);
        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_keeps_cooperative_flavour() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = {
            let calls = calls.clone();
            Callable::<u32, u32>::cooperative(move |_, x| {
                let calls = calls.clone();
                async move {
                    tokio::task::yield_now().await;
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TaskError::failed("first"))
                    } else {
                        Ok(x * 10)
                    }
                }
            })
        };
        let wrapped = Retry::new(2).wrap(inner);
        assert!(wrapped.is_cooperative());

        let event_loop = EventLoop::new().unwrap();
        let ctx = context(Arc::new(FeatureRegistry::new()));
        let result = event_loop.block_on(wrapped.call_async(ctx, 4));
        assert_eq!(result, Ok(40));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_with_lock_requires_registration() {
        let wrapped = with_lock(Callable::<u32, u32>::blocking(|_, x| Ok(x)));
        let result = wrapped.call_blocking(context(Arc::new(FeatureRegistry::new())), 1);
        assert_eq!(
            result,
            Err(TaskError::from(RuntimeError::FeatureNotRegistered(
                PrimitiveKind::Lock
            )))
        );
    }

    #[test]
    fn test_with_lock_holds_lock_during_call() {
        let adapter = SyncAdapter::new(RunningMode::MultiThread, None).unwrap();
        let lock = adapter.get_lock().unwrap();
        let registry = Arc::new(FeatureRegistry::new());
        registry
            .register(PrimitiveKind::Lock, Some(Primitive::Lock(lock.clone())))
            .unwrap();

        let held_check = lock.clone();
        let wrapped = with_lock(Callable::<u32, bool>::blocking(move |_, _| {
            Ok(held_check.try_acquire()?)
        }));
        let held_elsewhere = wrapped.call_blocking(context(registry), 0);
        assert_eq!(held_elsewhere, Ok(false));
        assert!(lock.try_acquire().unwrap());
        lock.release().unwrap();
    }
}
