// Reference-counted box

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::ShmResult;
use crate::memory::{AllocRef, MemoryManager, Pointer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
#[derive(Debug)]
pub struct SharedPtrHeader<S: Copy> {
    refs: AtomicU64,
    value: S,
}

/// A single element shared by several owners
///
/// Every owning handle holds one reference in the header's counter, which
/// lives in shared memory, so owners may sit in different threads or
/// processes. The element and header are destroyed when the last owner goes.
/// Views ([`ShmContainer::deserialize`]) do not count.
pub struct ShmSharedPtr<T: ShmElement> {
    handle: ShmHandle<Self>,
}

impl<T: ShmElement> ShmContainer for ShmSharedPtr<T> {
    type Header = SharedPtrHeader<T::Stored>;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut Self::Header, alloc: &AllocRef) -> ShmResult<()> {
        T::destroy_stored(&mut header.value, alloc)
    }

    /// A copy starts a new, independent family of owners
    fn copy_payload(src: &Self::Header, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Header> {
        Ok(SharedPtrHeader {
            refs: AtomicU64::new(1),
            value: T::copy_stored(&src.value, from, to)?,
        })
    }

    /// Give up this handle's reference, tearing down only on the last one
    fn destroy(&mut self) -> ShmResult<()> {
        if self.release() {
            self.handle.destroy(true)
        } else {
            self.handle.take();
            Ok(())
        }
    }
}

impl<T: ShmElement> ShmSharedPtr<T> {
    pub fn new(alloc: &AllocRef, value: T) -> ShmResult<Self> {
        let mut stored = value.store(alloc)?;
        let header = SharedPtrHeader {
            refs: AtomicU64::new(1),
            value: stored,
        };
        match ShmHandle::init(None, alloc, header) {
            Ok(handle) => Ok(Self::from_handle(handle)),
            Err(e) => {
                T::destroy_stored(&mut stored, alloc)?;
                Err(e)
            }
        }
    }

    /// Another owner of the same element
    pub fn share(&self) -> Self {
        if self.handle.is_null() {
            return Self::from_handle(ShmHandle::null());
        }
        self.handle.header().refs.fetch_add(1, Ordering::Relaxed);
        Self::from_handle(ShmHandle::owned(self.handle.pointer(), self.handle.alloc().clone()))
    }

    /// Become an owner of the element at `p`, e.g. one published by another process
    ///
    /// The publisher must keep its own reference until this returns.
    pub fn acquire(manager: &MemoryManager, p: Pointer) -> ShmResult<Self> {
        let view = Self::deserialize(manager, p)?;
        Ok(view.share())
    }

    pub fn get(&self) -> T {
        T::load(&self.handle.header().value, self.handle.alloc())
    }

    /// Number of owners across all processes
    pub fn ref_count(&self) -> u64 {
        if self.handle.is_null() {
            return 0;
        }
        self.handle.header().refs.load(Ordering::Acquire)
    }

    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    /// Drop this handle's reference; true if it was the last one
    ///
    /// When other owners remain the handle is disowned so that dropping it
    /// leaves the header alone.
    fn release(&mut self) -> bool {
        if self.handle.is_null() || !self.handle.is_destructable() {
            return false;
        }
        let last = self.handle.header().refs.fetch_sub(1, Ordering::AcqRel) == 1;
        if !last {
            self.handle.disown();
        }
        last
    }
}

impl<T: ShmElement> Drop for ShmSharedPtr<T> {
    fn drop(&mut self) {
        // On the last reference the handle's own drop frees everything
        self.release();
    }
}

impl<T: ShmElement + fmt::Debug> fmt::Debug for ShmSharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmSharedPtr(null)");
        }
        f.debug_struct("ShmSharedPtr")
            .field("refs", &self.ref_count())
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::test_support::{page_allocator, stack_allocator};
    use crate::containers::{ShmString, ShmVec};

    #[test]
    fn test_last_owner_frees() {
        let alloc = stack_allocator();
        let a = ShmSharedPtr::new(&alloc, ShmString::from_str(&alloc, "shared").unwrap()).unwrap();
        let b = a.share();
        assert_eq!(a.ref_count(), 2);
        assert_eq!(a.serialize(), b.serialize());

        drop(a);
        assert_eq!(b.ref_count(), 1);
        assert!(b.is_unique());
        assert_eq!(b.get(), "shared");

        drop(b);
        assert_eq!(alloc.currently_allocated_size(), 0);
    }

    #[test]
    fn test_destroy_releases_one_reference() {
        let alloc = page_allocator();
        let mut a = ShmSharedPtr::new(&alloc, 7u64).unwrap();
        let b = a.share();
        a.destroy().unwrap();
        assert!(a.is_null());
        assert_eq!(b.get(), 7);
        assert_eq!(b.ref_count(), 1);
        drop(b);
        assert_eq!(alloc.currently_allocated_size(), 0);
    }

    #[test]
    fn test_views_do_not_count() {
        let alloc = stack_allocator();
        let owner = ShmSharedPtr::new(&alloc, 3u32).unwrap();
        let view = ShmSharedPtr::<u32>::deserialize_in(&alloc, owner.serialize());
        assert_eq!(view.get(), 3);
        drop(view);
        assert_eq!(owner.ref_count(), 1);
    }

    #[test]
    fn test_containers_hold_a_reference() {
        let alloc = stack_allocator();
        {
            let ptr = ShmSharedPtr::new(&alloc, 11u16).unwrap();
            let mut owners = ShmVec::<ShmSharedPtr<u16>>::new(&alloc).unwrap();
            for _ in 0..3 {
                owners.push(ptr.share()).unwrap();
            }
            assert_eq!(ptr.ref_count(), 4);
            assert_eq!(owners.get(2).unwrap().get(), 11);

            drop(owners.pop());
            assert_eq!(ptr.ref_count(), 3);
            drop(owners);
            assert!(ptr.is_unique());
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
    }

    #[test]
    fn test_copy_is_independent() {
        let alloc = stack_allocator();
        let a = ShmSharedPtr::new(&alloc, 5i64).unwrap();
        let _b = a.share();
        let copy = a.try_clone().unwrap();
        assert_ne!(copy.serialize(), a.serialize());
        assert_eq!(copy.ref_count(), 1);
        assert_eq!(a.ref_count(), 2);
        assert_eq!(copy.get(), 5);
    }

    #[test]
    fn test_owners_on_many_threads() {
        let alloc = stack_allocator();
        {
            let root = ShmSharedPtr::new(&alloc, 99u64).unwrap();
            std::thread::scope(|s| {
                for _ in 0..4 {
                    let root = &root;
                    s.spawn(move || {
                        for _ in 0..200 {
                            let mine = root.share();
                            assert_eq!(mine.get(), 99);
                        }
                    });
                }
            });
            assert!(root.is_unique());
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
    }
}
