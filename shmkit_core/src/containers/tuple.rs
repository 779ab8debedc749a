// Fixed-arity tuples of shared-memory elements

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::ShmResult;
use crate::memory::AllocRef;
use std::fmt;

/// Rust tuples whose members can all be stored in shared memory
pub trait ShmTupleElements: Sized {
    /// `#[repr(C)]` record of the members' stored forms
    type Stored: Copy + 'static;

    fn store_all(self, alloc: &AllocRef) -> ShmResult<Self::Stored>;

    fn load_all(stored: &Self::Stored, alloc: &AllocRef) -> Self;

    fn destroy_all(stored: &mut Self::Stored, alloc: &AllocRef) -> ShmResult<()>;

    fn copy_all(stored: &Self::Stored, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Stored>;
}

macro_rules! tuple_elements {
    ($record:ident; $($T:ident $idx:tt),+) => {
        #[repr(C)]
        #[derive(Debug, Clone, Copy)]
        pub struct $record<$($T),+>($(pub $T),+);

        impl<$($T: ShmElement),+> ShmTupleElements for ($($T,)+) {
            type Stored = $record<$(<$T as ShmElement>::Stored),+>;

            fn store_all(self, alloc: &AllocRef) -> ShmResult<Self::Stored> {
                Ok($record($(self.$idx.store(alloc)?),+))
            }

            fn load_all(stored: &Self::Stored, alloc: &AllocRef) -> Self {
                ($(<$T as ShmElement>::load(&stored.$idx, alloc),)+)
            }

            fn destroy_all(stored: &mut Self::Stored, alloc: &AllocRef) -> ShmResult<()> {
                $(<$T as ShmElement>::destroy_stored(&mut stored.$idx, alloc)?;)+
                Ok(())
            }

            fn copy_all(stored: &Self::Stored, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Stored> {
                Ok($record($(<$T as ShmElement>::copy_stored(&stored.$idx, from, to)?),+))
            }
        }
    };
}

tuple_elements!(Stored2; A 0, B 1);
tuple_elements!(Stored3; A 0, B 1, C 2);
tuple_elements!(Stored4; A 0, B 1, C 2, D 3);

/// Tuple of two to four elements under one header
pub struct ShmTuple<T: ShmTupleElements> {
    handle: ShmHandle<Self>,
}

impl<T: ShmTupleElements> ShmContainer for ShmTuple<T> {
    type Header = T::Stored;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut T::Stored, alloc: &AllocRef) -> ShmResult<()> {
        T::destroy_all(header, alloc)
    }

    fn copy_payload(src: &T::Stored, from: &AllocRef, to: &AllocRef) -> ShmResult<T::Stored> {
        T::copy_all(src, from, to)
    }
}

impl<T: ShmTupleElements> ShmTuple<T> {
    pub fn new(alloc: &AllocRef, values: T) -> ShmResult<Self> {
        let stored = values.store_all(alloc)?;
        Ok(Self::from_handle(ShmHandle::init(None, alloc, stored)?))
    }

    /// Copies of plain members, views of container members
    pub fn get(&self) -> T {
        T::load_all(self.handle.header(), self.handle.alloc())
    }

    /// Replace every member, destroying the old ones
    pub fn set(&mut self, values: T) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = values.store_all(&alloc)?;
        let header = self.handle.header_mut();
        T::destroy_all(header, &alloc)?;
        *header = stored;
        Ok(())
    }
}

impl<T: ShmTupleElements + fmt::Debug> fmt::Debug for ShmTuple<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmTuple(null)");
        }
        f.debug_tuple("ShmTuple").field(&self.get()).finish()
    }
}
