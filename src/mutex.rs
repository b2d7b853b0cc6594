/*!
 * Reader/Writer Mutex
 *
 * Low-level lock with two acquisition modes and predicate-gated exclusive
 * acquisition. Most callers want the RAII [`Guarded`](crate::Guarded)
 * container instead; this surface exists for code that manages its own
 * critical sections.
 */

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WaitResult;
use crate::imp;

/// The two acquisition modes: exclusive excludes all other holders, shared
/// admits any number of other shared holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusivity {
    Shared,
    Exclusive,
}

/// A non-recursive reader/writer mutex.
///
/// Beyond plain `lock`/`unlock`, exclusive acquisition can be gated on a
/// predicate via [`lock_when`](RwMutex::lock_when): the caller blocks until
/// the predicate (evaluated only under the exclusive lock, possibly by
/// whichever thread releases it) returns true.
///
/// Locks are non-recursive and upgrades are not supported. Destroying a
/// mutex that is still locked, or that still has conditional waiters, is a
/// programming error and aborts via panic.
pub struct RwMutex {
    imp: imp::RwMutex,
}

impl RwMutex {
    /// Create an unlocked mutex with no waiters.
    pub const fn new() -> RwMutex {
        RwMutex {
            imp: imp::RwMutex::new(),
        }
    }

    /// Block until the lock is held in the given mode.
    ///
    /// Acquisition is uncancellable and provides acquire ordering; all
    /// writes made under previous exclusive holds are visible.
    pub fn lock(&self, exclusivity: Exclusivity) {
        match exclusivity {
            Exclusivity::Exclusive => self.imp.lock_exclusive(),
            Exclusivity::Shared => self.imp.lock_shared(),
        }
    }

    /// Release a hold previously acquired with the matching mode.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock in exactly the given mode.
    /// Unlocking a mutex that is not so held is a programming error; debug
    /// builds detect it where the platform allows.
    pub unsafe fn unlock(&self, exclusivity: Exclusivity) {
        match exclusivity {
            Exclusivity::Exclusive => self.imp.unlock_exclusive(),
            Exclusivity::Shared => self.imp.unlock_shared(),
        }
    }

    /// Panic unless the lock is currently held in the given mode.
    ///
    /// The state word does not record ownership, so this checks that *some*
    /// thread holds the lock appropriately; it is a debugging aid, not a
    /// capability check.
    pub fn assert_locked_by_caller(&self, exclusivity: Exclusivity) {
        match exclusivity {
            Exclusivity::Exclusive => self.imp.assert_exclusive_held(),
            Exclusivity::Shared => self.imp.assert_shared_held(),
        }
    }

    /// Acquire the lock exclusively once `predicate` holds.
    ///
    /// The predicate is evaluated only while some thread holds the exclusive
    /// lock: first by the caller, then by each thread that releases the
    /// lock while the caller waits (hence the `Send` bound). It must not
    /// touch this mutex itself, and should be a pure function of state the
    /// lock protects.
    ///
    /// Returns `Ok(())` with the lock held once the predicate was observed
    /// true. With a timeout, returns `Err(WaitError::Timeout)` once the
    /// deadline, measured against a monotonic clock from the moment of the
    /// call, has elapsed; **the lock is held on return in both cases**, but
    /// after a timeout the predicate's value is unspecified. The predicate
    /// is always evaluated at least once, even if the deadline has already
    /// passed.
    ///
    /// If the predicate panics (on whatever thread was evaluating it), the
    /// panic is re-raised here exactly once, with the lock released.
    pub fn lock_when<F>(&self, predicate: F, timeout: Option<Duration>) -> WaitResult<()>
    where
        F: FnMut() -> bool + Send,
    {
        self.imp.lock_when(predicate, timeout)
    }

    /// Wake every conditional waiter without satisfying any predicate.
    ///
    /// Exists to exercise spurious-wakeup handling in tests; `lock_when`
    /// callers must never observe a spurious return.
    pub fn induce_spurious_wakeup_for_test(&self) {
        self.imp.induce_spurious_wakeup();
    }
}

impl Default for RwMutex {
    fn default() -> RwMutex {
        RwMutex::new()
    }
}

impl Drop for RwMutex {
    fn drop(&mut self) {
        self.imp.assert_idle();
    }
}
