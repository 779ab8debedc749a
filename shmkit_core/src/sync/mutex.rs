// Spin mutex for short critical sections in shared memory

use super::thread::{OsThreadIdentity, ThreadIdentity};
use std::sync::atomic::{AtomicU32, Ordering};

/// Mutex whose entire state is one ticket word
///
/// `try_lock` only takes the lock when the word is observed at zero and the
/// caller's `fetch_add` is the one that moved it off zero; a losing caller
/// undoes its increment.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    ticket: AtomicU32,
}

impl ShmMutex {
    pub const fn new() -> Self {
        Self {
            ticket: AtomicU32::new(0),
        }
    }

    /// Try to acquire without spinning
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        if self.try_acquire() {
            Some(ShmMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquire, yielding to the OS scheduler until it succeeds
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        self.lock_with(&OsThreadIdentity)
    }

    /// Acquire, giving up the time slice through `threads` between attempts
    pub fn lock_with(&self, threads: &dyn ThreadIdentity) -> ShmMutexGuard<'_> {
        while !self.try_acquire() {
            threads.yield_now();
        }
        ShmMutexGuard { mutex: self }
    }

    /// Check if mutex is locked
    pub fn is_locked(&self) -> bool {
        self.ticket.load(Ordering::Relaxed) != 0
    }

    fn try_acquire(&self) -> bool {
        if self.ticket.load(Ordering::Relaxed) != 0 {
            return false;
        }
        let ticket = self.ticket.fetch_add(1, Ordering::Acquire);
        if ticket != 0 {
            self.ticket.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn release(&self) {
        self.ticket.fetch_sub(1, Ordering::Release);
    }
}

/// Releases the mutex when dropped
#[derive(Debug)]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ThreadId;
    use std::cell::UnsafeCell;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        lock: ShmMutex,
        value: UnsafeCell<u64>,
    }

    unsafe impl Sync for Counter {}

    #[test]
    fn test_try_lock_is_exclusive() {
        let mutex = ShmMutex::new();
        let guard = mutex.try_lock().expect("first try_lock");
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[derive(Default)]
    struct CountingYields {
        yields: AtomicUsize,
    }

    impl ThreadIdentity for CountingYields {
        fn tid(&self) -> ThreadId {
            0
        }

        fn yield_now(&self) {
            self.yields.fetch_add(1, Ordering::Relaxed);
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_contended_lock_yields_through_identity() {
        let mutex = ShmMutex::new();
        let threads = CountingYields::default();
        let guard = mutex.lock();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let _guard = mutex.lock_with(&threads);
            });
            while threads.yields.load(Ordering::Relaxed) == 0 {
                std::thread::yield_now();
            }
            drop(guard);
            waiter.join().unwrap();
        });
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_zeroed_memory_is_unlocked() {
        let mutex: ShmMutex = unsafe { std::mem::zeroed() };
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_lock_under_contention() {
        let counter = Counter {
            lock: ShmMutex::new(),
            value: UnsafeCell::new(0),
        };

        std::thread::scope(|s| {
            for _ in 0..8 {
                let counter = &counter;
                s.spawn(move || {
                    for _ in 0..1000 {
                        let _guard = counter.lock.lock();
                        unsafe { *counter.value.get() += 1 };
                    }
                });
            }
        });

        assert_eq!(unsafe { *counter.value.get() }, 8000);
        assert!(!counter.lock.is_locked());
    }
}
