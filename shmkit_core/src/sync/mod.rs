//! # Synchronization primitives that live in shared memory
//!
//! - **ShmMutex**: ticket-word spin mutex, yields to the OS on contention
//! - **ShmRwLock**: reader/writer lock packed into one 64-bit atomic
//! - **ThreadIdentity**: the thread-id / yield service allocators consume
//!
//! Both locks are `repr(C)`, contain nothing but atomics, and are valid when
//! zero-initialized, so they can be placed anywhere inside a mapped segment
//! and used from every process that maps it.
//!
//! ## Limitations
//!
//! There is no timeout, backoff or fairness anywhere. A contended acquire
//! spins (yielding between attempts) until it succeeds, and a steady stream of
//! readers can starve a writer indefinitely.

pub mod mutex;
pub mod rwlock;
pub mod thread;

pub use mutex::{ShmMutex, ShmMutexGuard};
pub use rwlock::{ShmReadGuard, ShmRwLock, ShmWriteGuard};
pub use thread::{OsThreadIdentity, ThreadId, ThreadIdentity};
