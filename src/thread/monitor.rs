use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Small per-OS-thread identity, never 0.
#[inline]
fn current_token() -> u64 {
    TOKEN.with(|t| *t)
}

/// Non-reentrant mutex that remembers which thread holds it.
///
/// Acquiring it twice from the same thread is a bug and trips a debug
/// assertion instead of deadlocking silently. Waiting is only possible
/// through a [`StateGuard`], so a condition can never be awaited without the
/// lock held.
pub(crate) struct StateLock<T> {
    data: Mutex<T>,
    owner: AtomicU64,
}

impl<T> StateLock<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            data: Mutex::new(data),
            owner: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> StateGuard<'_, T> {
        debug_assert!(
            !self.held_by_current(),
            "state lock acquired recursively by the thread that holds it"
        );
        let guard = self.data.lock();
        self.owner.store(current_token(), Ordering::Relaxed);
        StateGuard { lock: self, guard }
    }

    #[inline]
    pub(crate) fn held_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_token()
    }
}

pub(crate) struct StateGuard<'a, T> {
    lock: &'a StateLock<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> StateGuard<'_, T> {
    #[inline]
    fn release_owner(&self) {
        self.lock.owner.store(0, Ordering::Relaxed);
    }

    #[inline]
    fn claim_owner(&self) {
        self.lock.owner.store(current_token(), Ordering::Relaxed);
    }

    /// Waits on `cond`, releasing the lock while parked.
    pub(crate) fn wait(&mut self, cond: &Condvar) {
        self.release_owner();
        cond.wait(&mut self.guard);
        self.claim_owner();
    }

    /// Waits on `cond` until `deadline`; `None` waits forever.
    /// Returns `true` if the deadline passed without a notification.
    pub(crate) fn wait_deadline(&mut self, cond: &Condvar, deadline: Option<Instant>) -> bool {
        match deadline {
            None => {
                self.wait(cond);
                false
            }
            Some(deadline) => {
                self.release_owner();
                let res = cond.wait_until(&mut self.guard, deadline);
                self.claim_owner();
                res.timed_out()
            }
        }
    }

    /// Runs `f` with the lock temporarily released.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.release_owner();
        let out = MutexGuard::unlocked(&mut self.guard, f);
        self.claim_owner();
        out
    }
}

impl<T> Deref for StateGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for StateGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for StateGuard<'_, T> {
    fn drop(&mut self) {
        self.release_owner();
    }
}
