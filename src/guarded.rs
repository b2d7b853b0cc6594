/*!
 * Guarded Container
 *
 * RAII wrapper pairing a value with its [`RwMutex`]: read/write guards for
 * plain access, and `when` for predicate-gated access that blocks until the
 * protected value satisfies a condition.
 */

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::error::WaitResult;
use crate::mutex::{Exclusivity, RwMutex};

/// A value protected by a reader/writer mutex.
///
/// # Examples
///
/// ```
/// use whenlock::Guarded;
///
/// let counter = Guarded::new(0u32);
/// *counter.write() += 1;
/// assert_eq!(*counter.read(), 1);
/// ```
///
/// Predicate-gated access blocks until another thread makes the condition
/// true:
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use whenlock::Guarded;
///
/// let queue = Arc::new(Guarded::new(Vec::new()));
/// let consumer = {
///     let queue = queue.clone();
///     thread::spawn(move || queue.when(|v| !v.is_empty(), |v| v.pop().unwrap()))
/// };
/// queue.write().push(7);
/// assert_eq!(consumer.join().unwrap(), 7);
/// ```
pub struct Guarded<T> {
    mutex: RwMutex,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Guarded<T> {}
unsafe impl<T: Send + Sync> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    /// Wrap `value` behind an unlocked mutex.
    pub const fn new(value: T) -> Guarded<T> {
        Guarded {
            mutex: RwMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Block until a shared hold is acquired.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.mutex.lock(Exclusivity::Shared);
        ReadGuard {
            owner: self,
            marker: PhantomData,
        }
    }

    /// Block until the exclusive hold is acquired.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.mutex.lock(Exclusivity::Exclusive);
        WriteGuard {
            owner: self,
            marker: PhantomData,
        }
    }

    /// Block until `predicate` holds, then run `body` under the exclusive
    /// lock and return its result.
    ///
    /// The predicate may be evaluated on whichever thread releases the lock
    /// while this one waits, so it must be `Send` and should depend only on
    /// the protected value it is handed.
    pub fn when<P, B, R>(&self, mut predicate: P, body: B) -> R
    where
        T: Send + Sync,
        P: FnMut(&T) -> bool + Send,
        B: FnOnce(&mut T) -> R,
    {
        let outcome = self
            .mutex
            .lock_when(|| predicate(unsafe { &*self.value.get() }), None);
        debug_assert!(outcome.is_ok());
        let mut guard = WriteGuard {
            owner: self,
            marker: PhantomData,
        };
        body(&mut *guard)
    }

    /// Like [`when`](Guarded::when), but give up once `timeout` has elapsed.
    ///
    /// On timeout the body is not run, the lock is released, and
    /// `Err(WaitError::Timeout)` is returned.
    pub fn when_timeout<P, B, R>(&self, mut predicate: P, timeout: Duration, body: B) -> WaitResult<R>
    where
        T: Send + Sync,
        P: FnMut(&T) -> bool + Send,
        B: FnOnce(&mut T) -> R,
    {
        let outcome = self.mutex.lock_when(
            || predicate(unsafe { &*self.value.get() }),
            Some(timeout),
        );
        match outcome {
            Ok(()) => {
                let mut guard = WriteGuard {
                    owner: self,
                    marker: PhantomData,
                };
                Ok(body(&mut *guard))
            }
            Err(err) => {
                // Timeouts still deliver the lock; hand it straight back.
                unsafe { self.mutex.unlock(Exclusivity::Exclusive) };
                Err(err)
            }
        }
    }

    /// Access the value without locking; exclusive borrow makes it safe.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }

    /// Consume the container, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Guarded<T> {
    fn default() -> Guarded<T> {
        Guarded::new(T::default())
    }
}

/// Shared-mode access to a [`Guarded`] value. Released on drop.
pub struct ReadGuard<'a, T> {
    owner: &'a Guarded<T>,
    marker: PhantomData<*const ()>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.owner.mutex.unlock(Exclusivity::Shared) };
    }
}

/// Exclusive-mode access to a [`Guarded`] value. Released on drop; the
/// release re-scans any conditional waiters, so making a predicate true
/// inside a write guard wakes its waiter.
pub struct WriteGuard<'a, T> {
    owner: &'a Guarded<T>,
    marker: PhantomData<*const ()>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.owner.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.owner.value.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.owner.mutex.unlock(Exclusivity::Exclusive) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let cell = Guarded::new(41u32);
        *cell.write() += 1;
        assert_eq!(*cell.read(), 42);

        // Shared holds coexist.
        let a = cell.read();
        let b = cell.read();
        assert_eq!(*a + *b, 84);
    }

    #[test]
    fn test_when_with_satisfied_predicate() {
        let slot = Guarded::new(Some(5));
        let got = slot.when(|v| v.is_some(), |v| v.take().unwrap());
        assert_eq!(got, 5);
        assert!(slot.read().is_none());
    }

    #[test]
    fn test_when_timeout_releases_lock() {
        let cell = Guarded::new(0u32);
        let result = cell.when_timeout(|v| *v == 1, Duration::from_millis(20), |_| ());
        assert!(result.is_err());
        // The lock came back; plain access works.
        *cell.write() = 1;
        let result = cell.when_timeout(|v| *v == 1, Duration::from_millis(20), |v| *v);
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut cell = Guarded::new(vec![1, 2]);
        cell.get_mut().push(3);
        assert_eq!(cell.into_inner(), vec![1, 2, 3]);
    }
}
