//! Idempotent close primitive shared by every handle type.

use std::sync::{Mutex, MutexGuard};

struct GuardState<T> {
    closed: bool,
    value: Option<T>,
}

/// A `closed` flag and the value it protects, behind a single lock.
///
/// The flag only ever moves from open to closed. Exactly one caller of
/// [`LifecycleGuard::close`] (or [`LifecycleGuard::try_close`]) observes the
/// transition, no matter how many threads race on it.
pub struct LifecycleGuard<T = ()> {
    state: Mutex<GuardState<T>>,
}

impl LifecycleGuard<()> {
    /// Guard that protects nothing but the flag itself.
    pub fn unit() -> Self {
        Self::new(())
    }
}

impl<T> LifecycleGuard<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(GuardState {
                closed: false,
                value: Some(value),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState<T>> {
        // A poisoned guard still holds a consistent flag.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flip to closed. Returns true only for the call that did it.
    pub fn try_close(&self) -> bool {
        self.close().is_some()
    }

    /// Flip to closed and hand the protected value to the caller that did it.
    pub fn close(&self) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.value.take()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Run `f` against the value while holding the lock, if still open.
    ///
    /// Close cannot complete while `f` runs, so `f` must not block.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = self.lock();
        if state.closed {
            return None;
        }
        state.value.as_ref().map(f)
    }
}

impl<T: Clone> LifecycleGuard<T> {
    /// Copy out the value if still open. The lock is released on return.
    pub fn snapshot(&self) -> Option<T> {
        self.with(T::clone)
    }
}
