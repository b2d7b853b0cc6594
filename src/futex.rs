/*!
 * Futex Backend (Linux)
 *
 * The whole lock lives in one 32-bit word driven by raw futex syscalls:
 * bit 31 marks an exclusive holder, bit 30 marks a pending exclusive
 * request, and the low 30 bits count shared holders. Timed waits use
 * `FUTEX_WAIT_BITSET` so deadlines are absolute `CLOCK_MONOTONIC` times and
 * never need recomputing across spurious wakeups.
 *
 * This backend supports lock handoff: a thread releasing the exclusive lock
 * can pass ownership directly to a conditional waiter whose predicate just
 * turned true, so the predicate is still true when that waiter resumes.
 */

use std::panic::resume_unwind;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use scopeguard::ScopeGuard;

use crate::error::{WaitError, WaitResult};
use crate::waiter::{check_predicate, Waiter, WaiterList};

const EXCLUSIVE_HELD: u32 = 1 << 31;
const EXCLUSIVE_REQUESTED: u32 = 1 << 30;
const SHARED_COUNT_MASK: u32 = EXCLUSIVE_REQUESTED - 1;

// ============================================================================
// Platform wait facility
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken by a signal, or interrupted; the caller re-verifies its
    /// condition either way.
    Woke,
    /// The absolute deadline elapsed.
    TimedOut,
    /// The kernel saw `word != expected` at entry and never blocked.
    Stale,
}

// Not exported by libc.
const FUTEX_BITSET_MATCH_ANY: u32 = !0;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn fatal_futex_error(op: &str, errno: i32) -> ! {
    log::error!("futex({}) failed unexpectedly: errno {}", op, errno);
    panic!("futex({}) failed unexpectedly: errno {}", op, errno);
}

/// Block until `word` is signaled, without a deadline. Returns on wakeup,
/// interrupt, or when the kernel observed `word != expected`; the caller
/// must re-check its condition and re-enter if it has not been met.
fn futex_wait(word: &AtomicU32, expected: u32) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        match last_errno() {
            libc::EAGAIN | libc::EINTR => {}
            errno => fatal_futex_error("FUTEX_WAIT", errno),
        }
    }
}

/// Block until `word` is signaled or the absolute monotonic `deadline`
/// passes. Spurious wakeups surface as `Woke`; callers re-verify.
fn futex_wait_until(word: &AtomicU32, expected: u32, deadline: libc::timespec) -> WaitOutcome {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT_BITSET | libc::FUTEX_PRIVATE_FLAG,
            expected,
            &deadline as *const libc::timespec,
            ptr::null::<u32>(),
            FUTEX_BITSET_MATCH_ANY,
        )
    };
    if rc == -1 {
        match last_errno() {
            libc::EAGAIN => WaitOutcome::Stale,
            libc::ETIMEDOUT => WaitOutcome::TimedOut,
            libc::EINTR => WaitOutcome::Woke,
            errno => fatal_futex_error("FUTEX_WAIT_BITSET", errno),
        }
    } else {
        WaitOutcome::Woke
    }
}

fn futex_wake(word: &AtomicU32, count: i32, op: &str) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == -1 {
        fatal_futex_error(op, last_errno());
    }
}

fn futex_wake_all(word: &AtomicU32) {
    futex_wake(word, i32::MAX, "FUTEX_WAKE all");
}

// The lock protocols only ever wake in bulk (acquirers re-race and losers
// re-park), but targeted wakes belong to the facility's surface.
#[allow(dead_code)]
fn futex_wake_one(word: &AtomicU32) {
    futex_wake(word, 1, "FUTEX_WAKE one");
}

/// Absolute `CLOCK_MONOTONIC` deadline `timeout` from now. Deadline
/// arithmetic never touches the wall clock.
fn monotonic_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    if rc != 0 {
        let errno = last_errno();
        log::error!("clock_gettime(CLOCK_MONOTONIC) failed: errno {}", errno);
        panic!("clock_gettime(CLOCK_MONOTONIC) failed: errno {}", errno);
    }

    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    let mut sec = now
        .tv_sec
        .saturating_add(timeout.as_secs().min(i64::MAX as u64) as libc::time_t);
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= NANOS_PER_SEC {
        sec = sec.saturating_add(1);
        nsec -= NANOS_PER_SEC;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

// ============================================================================
// Reader/writer mutex
// ============================================================================

pub(crate) struct RwMutex {
    state: AtomicU32,
    waiters: WaiterList,
}

impl RwMutex {
    pub(crate) const fn new() -> RwMutex {
        RwMutex {
            state: AtomicU32::new(0),
            waiters: WaiterList::new(),
        }
    }

    pub(crate) fn lock_exclusive(&self) {
        loop {
            let mut state = match self.state.compare_exchange(
                0,
                EXCLUSIVE_HELD,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => observed,
            };

            // Contended. Publish the request bit before sleeping; it is only
            // ever cleared by the exclusive unlocker, so losers re-establish
            // it after every wakeup. The eventual winning CAS above supplies
            // the acquire fence.
            if state & EXCLUSIVE_REQUESTED == 0 {
                match self.state.compare_exchange(
                    state,
                    state | EXCLUSIVE_REQUESTED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => state |= EXCLUSIVE_REQUESTED,
                    // State moved under us before the bit was set; start over.
                    Err(_) => continue,
                }
            }

            futex_wait(&self.state, state);
        }
    }

    pub(crate) fn lock_shared(&self) {
        // Register unconditionally; if a writer holds the lock we are
        // over-registered and simply wait in place for the held bit to clear.
        let mut state = self.state.fetch_add(1, Ordering::Acquire) + 1;
        while state & EXCLUSIVE_HELD != 0 {
            futex_wait(&self.state, state);
            state = self.state.load(Ordering::Acquire);
        }
    }

    /// # Safety: the caller must hold the lock in shared mode.
    pub(crate) unsafe fn unlock_shared(&self) {
        #[cfg(debug_assertions)]
        if self.state.load(Ordering::Relaxed) & SHARED_COUNT_MASK == 0 {
            log::error!("unshared a mutex that was not shared");
            panic!("unshared a mutex that was not shared");
        }
        let state = self.state.fetch_sub(1, Ordering::Release) - 1;

        // Anyone waiting can only make progress once the shared count hits
        // zero with an exclusive request pending. Wake all: one acquirer
        // wins, the rest re-establish the request bit.
        if state == EXCLUSIVE_REQUESTED
            && self
                .state
                .compare_exchange(EXCLUSIVE_REQUESTED, 0, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            futex_wake_all(&self.state);
        }
    }

    /// # Safety: the caller must hold the lock exclusively.
    pub(crate) unsafe fn unlock_exclusive(&self) {
        #[cfg(debug_assertions)]
        if self.state.load(Ordering::Relaxed) & EXCLUSIVE_HELD == 0 {
            log::error!("unlocked a mutex that was not locked");
            panic!("unlocked a mutex that was not locked");
        }

        // Drain conditional waiters before touching the state word. Only an
        // exclusive unlock can have changed what predicates observe.
        let mut next = self.waiters.head();
        while !next.is_null() {
            let waiter = next;
            next = (*waiter).next;

            if check_predicate(waiter) {
                if (*waiter).has_timeout {
                    // The waiter may be timing out right now; whoever flips
                    // the signal word owns the wakeup.
                    if (*waiter)
                        .signal
                        .compare_exchange(0, 1, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        futex_wake_all(&(*waiter).signal);
                        // Ownership transferred; the lock stays held.
                        return;
                    }
                    // Lost the race: the waiter timed out and will take the
                    // lock itself. Keep scanning for another ready waiter.
                } else {
                    (*waiter).signal.store(1, Ordering::Release);
                    futex_wake_all(&(*waiter).signal);
                    return;
                }
            }
        }

        let old = self
            .state
            .fetch_and(!(EXCLUSIVE_HELD | EXCLUSIVE_REQUESTED), Ordering::Release);
        if old & !EXCLUSIVE_HELD != 0 {
            // Shared waiters now collectively hold the lock; exclusive
            // waiters must wake even alongside them, if only to re-establish
            // the request bit just cleared.
            futex_wake_all(&self.state);
        }
    }

    pub(crate) fn assert_exclusive_held(&self) {
        if self.state.load(Ordering::Relaxed) & EXCLUSIVE_HELD == 0 {
            log::error!("lock is not held");
            panic!("lock is not held");
        }
    }

    pub(crate) fn assert_shared_held(&self) {
        if self.state.load(Ordering::Relaxed) & SHARED_COUNT_MASK == 0 {
            log::error!("lock is not held");
            panic!("lock is not held");
        }
    }

    pub(crate) fn lock_when<F>(&self, mut predicate: F, timeout: Option<Duration>) -> WaitResult<()>
    where
        F: FnMut() -> bool + Send,
    {
        self.lock_exclusive();

        // The first check runs in our own frame; if it panics the lock must
        // not leak.
        let armed = scopeguard::guard_on_unwind((), |()| unsafe { self.unlock_exclusive() });
        let ready = predicate();
        ScopeGuard::into_inner(armed);
        if ready {
            return Ok(());
        }

        let mut waiter = Waiter::new(&mut predicate, timeout.is_some());
        let waiter_ptr: *mut Waiter = &mut waiter;

        unsafe {
            self.waiters.push(waiter_ptr);
            // Note this release re-scans the list we just joined; with the
            // lock held throughout, a predicate that was just false is still
            // false, so the scan moves on to other waiters.
            self.unlock_exclusive();

            let deadline = timeout.map(monotonic_deadline);

            loop {
                let outcome = match deadline {
                    Some(ts) => futex_wait_until(&(*waiter_ptr).signal, 0, ts),
                    None => {
                        futex_wait(&(*waiter_ptr).signal, 0);
                        WaitOutcome::Woke
                    }
                };

                if outcome == WaitOutcome::TimedOut {
                    // No transfer arrived in time, but one may be in flight:
                    // take control of our own destiny first.
                    if (*waiter_ptr)
                        .signal
                        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Acquire)
                        .is_ok()
                    {
                        self.lock_exclusive();
                        self.waiters.remove(waiter_ptr);
                        return Err(WaitError::Timeout);
                    }
                    // A signaler beat the timeout; accept the handoff below.
                }

                if (*waiter_ptr).signal.load(Ordering::Acquire) != 0 {
                    // Lock ownership was transferred to us. The signaler
                    // already verified the predicate; do not re-check it.
                    debug_assert!(self.state.load(Ordering::Relaxed) & EXCLUSIVE_HELD != 0);

                    if let Some(payload) = (*waiter_ptr).panic.take() {
                        self.waiters.remove(waiter_ptr);
                        self.unlock_exclusive();
                        resume_unwind(payload);
                    }

                    self.waiters.remove(waiter_ptr);
                    return Ok(());
                }

                // Spurious wakeup with the signal word still clear; re-enter.
            }
        }
    }

    /// Wake every conditional waiter without signaling any of them. Waiters
    /// must treat such wakeups as spurious and re-enter their wait.
    pub(crate) fn induce_spurious_wakeup(&self) {
        self.lock_exclusive();
        unsafe {
            let mut waiter = self.waiters.head();
            while !waiter.is_null() {
                futex_wake_all(&(*waiter).signal);
                waiter = (*waiter).next;
            }
        }
        // Release without draining, so the wakeups stay spurious.
        let old = self
            .state
            .fetch_and(!(EXCLUSIVE_HELD | EXCLUSIVE_REQUESTED), Ordering::Release);
        if old & !EXCLUSIVE_HELD != 0 {
            futex_wake_all(&self.state);
        }
    }

    pub(crate) fn assert_idle(&self) {
        let state = self.state.load(Ordering::Relaxed);
        if state != 0 || !self.waiters.is_empty() {
            log::error!("mutex destroyed while in use (state = {:#010x})", state);
            panic!("mutex destroyed while locked or awaited");
        }
    }
}

// ============================================================================
// One-shot initialization latch
// ============================================================================

const UNINITIALIZED: u32 = 0;
const INITIALIZING: u32 = 1;
const INITIALIZING_WITH_WAITERS: u32 = 2;
const INITIALIZED: u32 = 3;

pub(crate) struct Once {
    state: AtomicU32,
}

impl Once {
    pub(crate) const fn new(initialized: bool) -> Once {
        Once {
            state: AtomicU32::new(if initialized { INITIALIZED } else { UNINITIALIZED }),
        }
    }

    pub(crate) fn run_once<F: FnOnce()>(&self, init: F) {
        if !self.try_begin() {
            return;
        }

        // A panicking initializer reverts the latch and releases anyone
        // queued behind it; they re-race for the job.
        let revert = scopeguard::guard_on_unwind((), |()| {
            log::warn!("initializer panicked; reverting to uninitialized");
            if self.state.swap(UNINITIALIZED, Ordering::Release) == INITIALIZING_WITH_WAITERS {
                futex_wake_all(&self.state);
            }
        });

        init();

        ScopeGuard::into_inner(revert);
        if self.state.swap(INITIALIZED, Ordering::Release) == INITIALIZING_WITH_WAITERS {
            futex_wake_all(&self.state);
        }
    }

    /// Win the right to initialize, or wait out someone else's attempt.
    /// Returns true when the calling thread must run the initializer.
    fn try_begin(&self) -> bool {
        'start_over: loop {
            let first = match self.state.compare_exchange(
                UNINITIALIZED,
                INITIALIZING,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => observed,
            };

            let mut state = first;
            loop {
                match state {
                    INITIALIZED => return false,
                    INITIALIZING => {
                        // Flag that someone is waiting before sleeping.
                        if let Err(observed) = self.state.compare_exchange(
                            INITIALIZING,
                            INITIALIZING_WITH_WAITERS,
                            Ordering::Acquire,
                            Ordering::Acquire,
                        ) {
                            state = observed;
                            continue;
                        }
                    }
                    INITIALIZING_WITH_WAITERS => {}
                    _ => {
                        debug_assert_eq!(state, UNINITIALIZED);
                        // The initializer gave up; re-race from the top.
                        continue 'start_over;
                    }
                }

                futex_wait(&self.state, INITIALIZING_WITH_WAITERS);
                state = self.state.load(Ordering::Acquire);
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_futex_wait_stale() {
        let word = AtomicU32::new(1);
        let start = Instant::now();
        // Kernel sees word != expected and returns immediately.
        futex_wait(&word, 0);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_futex_wait_until_timeout() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let deadline = monotonic_deadline(Duration::from_millis(50));
        let outcome = futex_wait_until(&word, 0, deadline);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_futex_wait_until_stale() {
        let word = AtomicU32::new(1);
        let deadline = monotonic_deadline(Duration::from_secs(1));
        assert_eq!(futex_wait_until(&word, 0, deadline), WaitOutcome::Stale);
    }

    #[test]
    fn test_futex_wake_unblocks_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let word_clone = word.clone();

        let handle = thread::spawn(move || {
            while word_clone.load(Ordering::Acquire) == 0 {
                futex_wait(&word_clone, 0);
            }
        });

        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        futex_wake_all(&word);

        handle.join().unwrap();
    }

    #[test]
    fn test_wake_one_wakes_a_single_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let woken = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let word = word.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    while word.load(Ordering::Acquire) == 0 {
                        futex_wait(&word, 0);
                    }
                    woken.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        // A targeted wake with the word still zero sends the thread straight
        // back to sleep; only the final store lets anyone through.
        futex_wake_one(&word);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::Relaxed), 0);

        word.store(1, Ordering::Release);
        futex_wake_all(&word);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_monotonic_deadline_is_in_the_future() {
        let a = monotonic_deadline(Duration::from_secs(1));
        let b = monotonic_deadline(Duration::from_secs(2));
        assert!(b.tv_sec > a.tv_sec || (b.tv_sec == a.tv_sec && b.tv_nsec > a.tv_nsec));
    }

    #[test]
    fn test_state_word_partition() {
        // The three subfields must not overlap.
        assert_eq!(EXCLUSIVE_HELD & EXCLUSIVE_REQUESTED, 0);
        assert_eq!((EXCLUSIVE_HELD | EXCLUSIVE_REQUESTED) & SHARED_COUNT_MASK, 0);
    }
}
