/*!
 * whenlock
 *
 * Reader/writer mutex with predicate-gated acquisition, plus a one-shot
 * initialization latch.
 *
 * # Architecture
 *
 * Two build-time backends implement the same observable API:
 * - **futex** (Linux): the whole lock is one 32-bit word driven by raw
 *   futex syscalls. A thread releasing the exclusive lock can hand
 *   ownership directly to a conditional waiter whose predicate just turned
 *   true, so the predicate is guaranteed still true when the waiter resumes.
 * - **condvar** (everywhere else, or with the `force-condvar` feature): the
 *   lock delegates to `parking_lot` and each waiter parks on its own
 *   condition variable. No handoff: a woken waiter re-checks its predicate
 *   under the lock and may go back to sleep.
 *
 * # Use Cases
 *
 * - Guarding state that readers vastly outnumber writers
 * - Blocking a thread until shared state satisfies a condition, without
 *   hand-rolling a condvar loop
 * - Process-wide lazy initialization that must survive a panicking
 *   initializer
 */

mod error;
mod guarded;
mod mutex;
mod once;
mod waiter;

#[cfg(all(target_os = "linux", not(feature = "force-condvar")))]
mod futex;
#[cfg(all(target_os = "linux", not(feature = "force-condvar")))]
pub(crate) use futex as imp;

#[cfg(any(not(target_os = "linux"), feature = "force-condvar"))]
mod condvar;
#[cfg(any(not(target_os = "linux"), feature = "force-condvar"))]
pub(crate) use condvar as imp;

pub use error::{WaitError, WaitResult};
pub use guarded::{Guarded, ReadGuard, WriteGuard};
pub use mutex::{Exclusivity, RwMutex};
pub use once::Once;
