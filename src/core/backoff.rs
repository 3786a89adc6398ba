/*!
 * Adaptive Backoff
 *
 * Retry-loop pacing for primitives that cannot park on a kernel object
 * (the process family polls atomics in shared memory). Starts with CPU spin
 * hints, escalates to yielding, then to short sleeps.
 */

use super::limits::{BACKOFF_SLEEP, BACKOFF_SPIN_LIMIT, BACKOFF_YIELD_LIMIT};
use std::time::{Duration, Instant};

#[inline(always)]
pub fn adaptive_backoff(retry_count: u32) {
    match retry_count {
        // Phase 1: spin hint, operations that complete quickly
        0..=BACKOFF_SPIN_LIMIT => std::hint::spin_loop(),
        // Phase 2: let other threads/processes run
        n if n <= BACKOFF_YIELD_LIMIT => std::thread::yield_now(),
        // Phase 3: stop burning CPU on long waits
        _ => std::thread::sleep(BACKOFF_SLEEP),
    }
}

/// Poll `ready` with adaptive backoff until it returns true or `timeout` elapses.
///
/// Returns `false` on timeout.
pub fn spin_until<F>(timeout: Option<Duration>, mut ready: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let mut retries = 0u32;

    loop {
        if ready() {
            return true;
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return false;
            }
        }
        adaptive_backoff(retries);
        retries = retries.saturating_add(1);
    }
}
