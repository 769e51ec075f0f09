//! A mutex-guarded value paired with a condition variable.
//!
//! Waiters block until a predicate over the guarded value holds. Mutations are
//! announced with a broadcast: every waiter wakes and re-checks its predicate.
//! That is coarser than a targeted wake but fine for values that hold a few
//! dozen entries.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNotify {
    /// Read-only access; nobody needs waking on release.
    None,
    /// The value may have changed; wake every waiter on release.
    All,
}

#[derive(Debug, Default)]
pub struct Monitor<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    pub fn acquire(&self, notify: ReleaseNotify) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.value.lock(),
            changed: &self.changed,
            notify,
        }
    }

    /// Blocks until `ready` returns `true` for the guarded value, then hands
    /// back the lock. The returned guard broadcasts on release, since callers
    /// waiting for a state usually go on to change it.
    pub fn acquire_when<F>(&self, mut ready: F) -> MonitorGuard<'_, T>
    where
        F: FnMut(&T) -> bool,
    {
        let (guard, ()) = self.acquire_map(|value| ready(value).then_some(()));
        guard
    }

    /// Like [`Monitor::acquire_when`], but the predicate also extracts a value
    /// from the state it accepted.
    pub fn acquire_map<R, F>(&self, mut extract: F) -> (MonitorGuard<'_, T>, R)
    where
        F: FnMut(&T) -> Option<R>,
    {
        let mut guard = self.value.lock();
        loop {
            if let Some(out) = extract(&guard) {
                let guard = MonitorGuard {
                    guard,
                    changed: &self.changed,
                    notify: ReleaseNotify::All,
                };
                return (guard, out);
            }
            self.changed.wait(&mut guard);
        }
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    changed: &'a Condvar,
    notify: ReleaseNotify,
}

impl<T> MonitorGuard<'_, T> {
    pub fn set_notify(&mut self, notify: ReleaseNotify) {
        self.notify = notify;
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        if self.notify == ReleaseNotify::All {
            self.changed.notify_all();
        }
    }
}
