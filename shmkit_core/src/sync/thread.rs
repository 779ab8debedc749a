// Thread identity service consumed by the allocators

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dense thread id handed out by a [`ThreadIdentity`]
pub type ThreadId = u64;

/// Provides the calling thread's id and a cooperative yield
///
/// The page allocator uses `tid()` to pick a home shard, so ids should be
/// small and dense rather than OS thread ids.
pub trait ThreadIdentity: Send + Sync {
    /// Id of the calling thread
    fn tid(&self) -> ThreadId;

    /// Give up the rest of the time slice
    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static LOCAL_TID: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

/// Plain OS threads, numbered in the order they first ask for an id
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadIdentity;

impl ThreadIdentity for OsThreadIdentity {
    fn tid(&self) -> ThreadId {
        LOCAL_TID.with(|cell| match cell.get() {
            Some(tid) => tid,
            None => {
                let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
                cell.set(Some(tid));
                tid
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tid_stable_per_thread() {
        let ids = OsThreadIdentity;
        assert_eq!(ids.tid(), ids.tid());
    }

    #[test]
    fn test_tids_distinct_across_threads() {
        let tids: HashSet<ThreadId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| OsThreadIdentity.tid())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(tids.len(), 8);
    }
}
