// Read-Write lock packed into a single 64-bit word

use super::thread::{OsThreadIdentity, ThreadIdentity};
use std::sync::atomic::{AtomicU64, Ordering};

const READER_MASK: u64 = 0xFFFF_FFFF;
const WRITER_ONE: u64 = 1 << 32;

/// Reader/writer lock for shared memory
///
/// Low 32 bits count readers, high 32 bits count writers. Writers wait for
/// both counts to reach zero; readers wait only for the writer count.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmRwLock {
    payload: AtomicU64,
}

impl ShmRwLock {
    pub const fn new() -> Self {
        Self {
            payload: AtomicU64::new(0),
        }
    }

    /// Acquire read lock
    pub fn read(&self) -> ShmReadGuard<'_> {
        self.read_with(&OsThreadIdentity)
    }

    /// Acquire read lock, yielding through `threads` while a writer holds it
    pub fn read_with(&self, threads: &dyn ThreadIdentity) -> ShmReadGuard<'_> {
        loop {
            let expected = self.payload.load(Ordering::Relaxed);
            if expected >= WRITER_ONE {
                threads.yield_now();
                continue;
            }
            if self
                .payload
                .compare_exchange_weak(expected, expected + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ShmReadGuard { lock: self };
            }
        }
    }

    /// Acquire write lock
    pub fn write(&self) -> ShmWriteGuard<'_> {
        self.write_with(&OsThreadIdentity)
    }

    /// Acquire write lock, yielding through `threads` until readers and writers drain
    pub fn write_with(&self, threads: &dyn ThreadIdentity) -> ShmWriteGuard<'_> {
        loop {
            let expected = self.payload.load(Ordering::Relaxed);
            if expected != 0 {
                threads.yield_now();
                continue;
            }
            if self
                .payload
                .compare_exchange_weak(0, WRITER_ONE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ShmWriteGuard { lock: self };
            }
        }
    }

    /// Try to acquire read lock
    pub fn try_read(&self) -> Option<ShmReadGuard<'_>> {
        let expected = self.payload.load(Ordering::Relaxed);
        if expected >= WRITER_ONE {
            return None;
        }
        self.payload
            .compare_exchange(expected, expected + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmReadGuard { lock: self })
    }

    /// Try to acquire write lock
    pub fn try_write(&self) -> Option<ShmWriteGuard<'_>> {
        self.payload
            .compare_exchange(0, WRITER_ONE, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmWriteGuard { lock: self })
    }

    /// Get number of readers
    pub fn reader_count(&self) -> u32 {
        (self.payload.load(Ordering::Relaxed) & READER_MASK) as u32
    }

    /// Check if write locked
    pub fn is_write_locked(&self) -> bool {
        self.payload.load(Ordering::Relaxed) >= WRITER_ONE
    }

    fn read_unlock(&self) {
        self.payload.fetch_sub(1, Ordering::Release);
    }

    fn write_unlock(&self) {
        self.payload.fetch_sub(WRITER_ONE, Ordering::Release);
    }
}

/// Shared access; released on drop
#[derive(Debug)]
pub struct ShmReadGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive access; released on drop
#[derive(Debug)]
pub struct ShmWriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
