// Two values stored side by side

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::ShmResult;
use crate::memory::AllocRef;
use std::fmt;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PairHeader<A: Copy, B: Copy> {
    first: A,
    second: B,
}

/// Pair of shared-memory elements, the entry type of [`ShmHashMap`](super::ShmHashMap)
pub struct ShmPair<A: ShmElement, B: ShmElement> {
    handle: ShmHandle<Self>,
}

impl<A: ShmElement, B: ShmElement> ShmContainer for ShmPair<A, B> {
    type Header = PairHeader<A::Stored, B::Stored>;

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
        A::destroy_stored(&mut header.first, alloc)?;
        B::destroy_stored(&mut header.second, alloc)
    }

    fn copy_payload(src: &Self::Header, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Header> {
        let mut first = A::copy_stored(&src.first, from, to)?;
        match B::copy_stored(&src.second, from, to) {
            Ok(second) => Ok(PairHeader { first, second }),
            Err(e) => {
                A::destroy_stored(&mut first, to)?;
                Err(e)
            }
        }
    }
}

impl<A: ShmElement, B: ShmElement> ShmPair<A, B> {
    pub fn new(alloc: &AllocRef, first: A, second: B) -> ShmResult<Self> {
        let mut first = first.store(alloc)?;
        let second = match second.store(alloc) {
            Ok(second) => second,
            Err(e) => {
                A::destroy_stored(&mut first, alloc)?;
                return Err(e);
            }
        };
        Ok(Self::from_handle(ShmHandle::init(
            None,
            alloc,
            PairHeader { first, second },
        )?))
    }

    pub fn first(&self) -> A {
        A::load(&self.handle.header().first, self.handle.alloc())
    }

    pub fn second(&self) -> B {
        B::load(&self.handle.header().second, self.handle.alloc())
    }

    pub fn set_first(&mut self, value: A) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        let header = self.handle.header_mut();
        A::destroy_stored(&mut header.first, &alloc)?;
        header.first = stored;
        Ok(())
    }

    pub fn set_second(&mut self, value: B) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        let header = self.handle.header_mut();
        B::destroy_stored(&mut header.second, &alloc)?;
        header.second = stored;
        Ok(())
    }

    /// Split an owned pair into its members, freeing the pair header
    pub fn into_parts(mut self) -> ShmResult<(A, B)> {
        let alloc = self.handle.alloc().clone();
        let (first, second) = {
            let header = self.handle.header();
            (header.first, header.second)
        };
        let owned = self.handle.is_owned();
        if owned {
            alloc.free(self.handle.pointer())?;
            self.handle.disown();
            Ok((A::take(first, &alloc), B::take(second, &alloc)))
        } else {
            // Not ours to take apart; hand out copies
            Ok((
                A::take(A::copy_stored(&first, &alloc, &alloc)?, &alloc),
                B::take(B::copy_stored(&second, &alloc, &alloc)?, &alloc),
            ))
        }
    }
}

impl<A: ShmElement + fmt::Debug, B: ShmElement + fmt::Debug> fmt::Debug for ShmPair<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmPair(null)");
        }
        f.debug_tuple("ShmPair")
            .field(&self.first())
            .field(&self.second())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::test_support::stack_allocator;
    use crate::containers::ShmString;

    #[test]
    fn test_members() {
        let alloc = stack_allocator();
        let mut pair = ShmPair::new(&alloc, 7u32, 1.5f64).unwrap();
        assert_eq!(pair.first(), 7);
        assert_eq!(pair.second(), 1.5);
        pair.set_second(2.5).unwrap();
        assert_eq!(pair.second(), 2.5);
    }

    #[test]
    fn test_container_members_and_parts() {
        let alloc = stack_allocator();
        {
            let key = ShmString::from_str(&alloc, "alpha").unwrap();
            let mut pair = ShmPair::new(&alloc, key, 1u64).unwrap();
            assert_eq!(pair.first(), "alpha");
            pair.set_first(ShmString::from_str(&alloc, "beta").unwrap()).unwrap();

            let copy = pair.try_clone().unwrap();
            let (name, n) = pair.into_parts().unwrap();
            assert_eq!(name, "beta");
            assert_eq!(n, 1);
            assert_eq!(copy.first(), "beta");
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
    }
}
