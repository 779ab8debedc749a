// Unique owning box

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::ShmResult;
use crate::memory::AllocRef;
use std::fmt;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader<S: Copy> {
    value: S,
}

/// A single element behind its own header
///
/// Moving the box moves one pointer; copying it deep-copies the element.
pub struct ShmBox<T: ShmElement> {
    handle: ShmHandle<Self>,
}

impl<T: ShmElement> ShmContainer for ShmBox<T> {
    type Header = BoxHeader<T::Stored>;

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

    fn copy_payload(src: &Self::Header, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Header> {
        Ok(BoxHeader {
            value: T::copy_stored(&src.value, from, to)?,
        })
    }
}

impl<T: ShmElement> ShmBox<T> {
    pub fn new(alloc: &AllocRef, value: T) -> ShmResult<Self> {
        let mut stored = value.store(alloc)?;
        match ShmHandle::init(None, alloc, BoxHeader { value: stored }) {
            Ok(handle) => Ok(Self::from_handle(handle)),
            Err(e) => {
                T::destroy_stored(&mut stored, alloc)?;
                Err(e)
            }
        }
    }

    pub fn get(&self) -> T {
        T::load(&self.handle.header().value, self.handle.alloc())
    }

    /// Replace the boxed value, destroying the old one
    pub fn set(&mut self, value: T) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        let header = self.handle.header_mut();
        T::destroy_stored(&mut header.value, &alloc)?;
        header.value = stored;
        Ok(())
    }
}

impl<T: ShmElement + fmt::Debug> fmt::Debug for ShmBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmBox(null)");
        }
        f.debug_tuple("ShmBox").field(&self.get()).finish()
    }
}
