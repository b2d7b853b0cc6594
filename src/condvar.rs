/*!
 * Condvar Backend (portable)
 *
 * Cross-platform fallback: the lock word is a `parking_lot::RawRwLock` and
 * each conditional waiter parks on its own condition variable behind a tiny
 * relay mutex. Unlike the futex backend there is no lock handoff: a
 * signaled waiter re-acquires the lock and re-checks its predicate, which
 * may have turned false again in between. Liveness still holds because
 * every exclusive release re-scans the remaining waiters, so a waiter that
 * goes back to sleep first passes the baton along.
 */

use std::panic::resume_unwind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Mutex, RawRwLock};
use scopeguard::ScopeGuard;

use crate::error::{WaitError, WaitResult};
use crate::waiter::{check_predicate, Waiter, WaiterList};

pub(crate) struct RwMutex {
    raw: RawRwLock,
    waiters: WaiterList,
}

impl RwMutex {
    pub(crate) const fn new() -> RwMutex {
        RwMutex {
            raw: <RawRwLock as RawRwLockApi>::INIT,
            waiters: WaiterList::new(),
        }
    }

    pub(crate) fn lock_exclusive(&self) {
        self.raw.lock_exclusive();
    }

    pub(crate) fn lock_shared(&self) {
        self.raw.lock_shared();
    }

    /// # Safety: the caller must hold the lock in shared mode.
    pub(crate) unsafe fn unlock_shared(&self) {
        // An exclusive probe succeeding proves nobody held the lock at all.
        #[cfg(debug_assertions)]
        if self.raw.try_lock_exclusive() {
            self.raw.unlock_exclusive();
            log::error!("unshared a mutex that was not shared");
            panic!("unshared a mutex that was not shared");
        }
        self.raw.unlock_shared();
    }

    /// # Safety: the caller must hold the lock exclusively.
    pub(crate) unsafe fn unlock_exclusive(&self) {
        // A shared probe succeeding proves no writer held the lock.
        #[cfg(debug_assertions)]
        if self.raw.try_lock_shared() {
            self.raw.unlock_shared();
            log::error!("unlocked a mutex that was not locked");
            panic!("unlocked a mutex that was not locked");
        }
        // Scan while the lock is still held; only an exclusive unlock can
        // have changed what predicates observe. Waking one waiter is enough:
        // if its predicate has gone false again by the time it runs, its own
        // next release repeats this scan for the others.
        let mut next = self.waiters.head();
        while !next.is_null() {
            let waiter = next;
            next = (*waiter).next;

            if check_predicate(waiter) {
                // Holding the relay mutex pins the waiter inside its condvar
                // wait, so the notification cannot fall into the gap between
                // releasing the lock and parking.
                let relay = (*waiter).relay.lock();
                (*waiter).condvar.notify_one();
                drop(relay);
                break;
            }
        }

        self.raw.unlock_exclusive();
    }

    pub(crate) fn assert_exclusive_held(&self) {
        // A successful shared probe proves no writer holds the lock. With a
        // writer queued the probe can fail spuriously, so this check errs on
        // the quiet side, as a debug assertion should.
        if self.raw.try_lock_shared() {
            unsafe { self.raw.unlock_shared() };
            log::error!("lock is not held");
            panic!("lock is not held");
        }
    }

    pub(crate) fn assert_shared_held(&self) {
        if self.raw.try_lock_exclusive() {
            unsafe { self.raw.unlock_exclusive() };
            log::error!("lock is not held");
            panic!("lock is not held");
        }
    }

    pub(crate) fn lock_when<F>(&self, mut predicate: F, timeout: Option<Duration>) -> WaitResult<()>
    where
        F: FnMut() -> bool + Send,
    {
        self.lock_exclusive();

        // The entry check runs in our own frame; if it panics the lock must
        // not leak.
        let armed = scopeguard::guard_on_unwind((), |()| unsafe { self.unlock_exclusive() });
        let ready = predicate();
        ScopeGuard::into_inner(armed);
        if ready {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut waiter = Waiter::new(&mut predicate, timeout.is_some());
        let waiter_ptr: *mut Waiter = &mut waiter;

        unsafe {
            self.waiters.push(waiter_ptr);

            // The predicate re-check below may panic; unwinding must leave
            // the list consistent before the lock is released.
            let cleanup = scopeguard::guard_on_unwind((), |()| unsafe {
                self.waiters.remove(waiter_ptr);
                self.unlock_exclusive();
            });

            loop {
                // Take the relay before releasing the main lock so a signal
                // sent in between waits for us to park.
                let mut relay = (*waiter_ptr).relay.lock();
                self.unlock_exclusive();

                let timed_out = match deadline {
                    Some(at) => (*waiter_ptr).condvar.wait_until(&mut relay, at).timed_out(),
                    None => {
                        (*waiter_ptr).condvar.wait(&mut relay);
                        false
                    }
                };

                // Release the relay before re-taking the main lock; a
                // signaler holding the main lock may be queued on the relay.
                drop(relay);
                self.lock_exclusive();

                if let Some(payload) = (*waiter_ptr).panic.take() {
                    ScopeGuard::into_inner(cleanup);
                    self.waiters.remove(waiter_ptr);
                    self.unlock_exclusive();
                    resume_unwind(payload);
                }

                if timed_out {
                    ScopeGuard::into_inner(cleanup);
                    self.waiters.remove(waiter_ptr);
                    // The deadline elapsed; the lock is still delivered and
                    // the predicate's value is whatever it last was.
                    return Err(WaitError::Timeout);
                }

                // No handoff on this backend: the predicate must be
                // re-checked now that the lock is held again. Condvar
                // wakeups with the predicate still false (including induced
                // spurious ones) simply loop back to waiting.
                if Waiter::evaluate(waiter_ptr) {
                    ScopeGuard::into_inner(cleanup);
                    self.waiters.remove(waiter_ptr);
                    return Ok(());
                }
            }
        }
    }

    /// Wake every conditional waiter without making any predicate true.
    /// Waiters re-check, find nothing, and go back to sleep.
    pub(crate) fn induce_spurious_wakeup(&self) {
        self.lock_exclusive();
        unsafe {
            let mut waiter = self.waiters.head();
            while !waiter.is_null() {
                let relay = (*waiter).relay.lock();
                (*waiter).condvar.notify_one();
                drop(relay);
                waiter = (*waiter).next;
            }
            // Release without the waiter scan so the wakeups stay spurious.
            self.raw.unlock_exclusive();
        }
    }

    pub(crate) fn assert_idle(&self) {
        if self.raw.is_locked() || !self.waiters.is_empty() {
            log::error!("mutex destroyed while in use");
            panic!("mutex destroyed while locked or awaited");
        }
    }
}

// ============================================================================
// One-shot initialization latch
// ============================================================================

const UNINITIALIZED: u32 = 0;
const INITIALIZED: u32 = 1;

/// Latecomers block on the initializer mutex rather than a state futex;
/// the atomic state word exists for the lock-free fast paths and `reset`.
pub(crate) struct Once {
    state: AtomicU32,
    init_lock: Mutex<()>,
}

impl Once {
    pub(crate) const fn new(initialized: bool) -> Once {
        Once {
            state: AtomicU32::new(if initialized { INITIALIZED } else { UNINITIALIZED }),
            init_lock: Mutex::new(()),
        }
    }

    pub(crate) fn run_once<F: FnOnce()>(&self, init: F) {
        let _guard = self.init_lock.lock();
        if self.state.load(Ordering::Acquire) == INITIALIZED {
            return;
        }

        // A panic unwinds with the state still uninitialized; whoever is
        // queued on the mutex re-races for the job.
        let warn = scopeguard::guard_on_unwind((), |()| {
            log::warn!("initializer panicked; reverting to uninitialized");
        });
        init();
        ScopeGuard::into_inner(warn);

        self.state.store(INITIALIZED, Ordering::Release);
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Acquire) == INITIALIZED
    }

    pub(crate) fn reset(&self) {
        if self
            .state
            .compare_exchange(INITIALIZED, UNINITIALIZED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            log::error!("reset() called while not initialized");
            panic!("reset() called while not initialized");
        }
    }
}
