//! Lock helpers.
//!
//! A poisoned mutex means some thread panicked while mutating shared miner
//! state. Nothing downstream can trust that state, so these helpers log and
//! abort instead of handing out a possibly half-written guard.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[cold]
pub fn fatal(what: &str) -> ! {
    tracing::error!("{what}, terminating");
    std::process::abort()
}

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(_) => fatal("mutex poisoned on lock"),
    }
}

/// Waits on `cv` for at most `timeout`; returns the guard and whether the
/// wait timed out.
pub fn wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, res)) => (guard, res.timed_out()),
        Err(_) => fatal("mutex poisoned on condvar wait"),
    }
}
