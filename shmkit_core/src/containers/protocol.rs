//! Ownership protocol shared by every shared-memory container
//!
//! A container is a small process-local value (an [`ShmHandle`]) pointing at
//! a `#[repr(C)]` header inside an allocator slot. The header in turn refers
//! to its payload (buffers, nodes, nested headers) by [`Pointer`] only, so any
//! process that can resolve the pointers can read the container.
//!
//! Handles come in three flavours, told apart by [`ContainerFlags`]:
//!
//! | flavour  | flags                                             | on drop                    |
//! |----------|---------------------------------------------------|----------------------------|
//! | owned    | VALID, DESTRUCTABLE, DATA_VALID, HEADER_DESTRUCTABLE | payload and header freed |
//! | in place | VALID, DESTRUCTABLE, DATA_VALID                   | payload freed              |
//! | view     | VALID, DATA_VALID                                 | nothing                    |
//!
//! At most one live handle carries DESTRUCTABLE for a given header, except
//! for [`ShmSharedPtr`](super::ShmSharedPtr) owners, which count themselves in
//! the header and only tear down on the last release.

use crate::error::{ShmError, ShmResult};
use crate::memory::{AllocRef, AllocatorId, MemoryManager, Pointer};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;

bitflags::bitflags! {
    /// Ownership state of a container handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContainerFlags: u32 {
        /// The handle points at a header
        const VALID = 0b0001;
        /// Dropping the handle tears the container down
        const DESTRUCTABLE = 0b0010;
        /// The header holds a live payload
        const DATA_VALID = 0b0100;
        /// The header was allocated by this handle and may be freed by it
        const HEADER_DESTRUCTABLE = 0b1000;
    }
}

impl ContainerFlags {
    pub const OWNED: ContainerFlags = ContainerFlags::VALID
        .union(ContainerFlags::DESTRUCTABLE)
        .union(ContainerFlags::DATA_VALID)
        .union(ContainerFlags::HEADER_DESTRUCTABLE);

    pub const IN_PLACE: ContainerFlags = ContainerFlags::VALID
        .union(ContainerFlags::DESTRUCTABLE)
        .union(ContainerFlags::DATA_VALID);

    pub const VIEW: ContainerFlags = ContainerFlags::VALID.union(ContainerFlags::DATA_VALID);
}

/// Process-local handle to a container header in shared memory
pub struct ShmHandle<C: ShmContainer> {
    pointer: Pointer,
    header: *mut C::Header,
    alloc: Option<AllocRef>,
    flags: ContainerFlags,
    _marker: PhantomData<fn() -> C>,
}

// The header lives in shared memory; containers synchronize access themselves
unsafe impl<C: ShmContainer> Send for ShmHandle<C> {}
unsafe impl<C: ShmContainer> Sync for ShmHandle<C> {}

impl<C: ShmContainer> ShmHandle<C> {
    /// A handle pointing nowhere
    pub fn null() -> Self {
        Self {
            pointer: Pointer::NULL,
            header: ptr::null_mut(),
            alloc: None,
            flags: ContainerFlags::empty(),
            _marker: PhantomData,
        }
    }

    /// Write `value` as a new header
    ///
    /// With `at == None` the header is allocated from `alloc` and owned by the
    /// handle; otherwise it is constructed in place at `at`, which must belong
    /// to `alloc`, and only its payload is owned.
    pub fn init(at: Option<Pointer>, alloc: &AllocRef, value: C::Header) -> ShmResult<Self> {
        match at {
            None => {
                let (pointer, header) = alloc.allocate_ptr::<C::Header>(1)?;
                unsafe { header.write(value) };
                Ok(Self::with_flags(pointer, alloc.clone(), ContainerFlags::OWNED))
            }
            Some(pointer) => {
                if !alloc.owns(pointer) {
                    return Err(ShmError::invalid_pointer(
                        "ShmHandle::init",
                        format!("{:?} is not inside allocator {}", pointer, alloc.id()),
                    ));
                }
                let header: *mut C::Header = alloc.convert(pointer);
                unsafe { header.write(value) };
                Ok(Self::with_flags(pointer, alloc.clone(), ContainerFlags::IN_PLACE))
            }
        }
    }

    /// Non-owning handle to an existing header
    pub fn view(pointer: Pointer, alloc: AllocRef) -> Self {
        Self::with_flags(pointer, alloc, ContainerFlags::VIEW)
    }

    /// Handle that adopts an existing, separately allocated header
    pub fn owned(pointer: Pointer, alloc: AllocRef) -> Self {
        Self::with_flags(pointer, alloc, ContainerFlags::OWNED)
    }

    fn with_flags(pointer: Pointer, alloc: AllocRef, flags: ContainerFlags) -> Self {
        if pointer.is_null() {
            return Self::null();
        }
        Self {
            header: alloc.convert(pointer),
            pointer,
            alloc: Some(alloc),
            flags,
            _marker: PhantomData,
        }
    }

    pub fn pointer(&self) -> Pointer {
        self.pointer
    }

    pub fn is_null(&self) -> bool {
        self.header.is_null()
    }

    pub fn flags(&self) -> ContainerFlags {
        self.flags
    }

    pub fn is_destructable(&self) -> bool {
        self.flags.contains(ContainerFlags::DESTRUCTABLE)
    }

    /// Owned handle whose header may be moved by pointer alone
    pub fn is_owned(&self) -> bool {
        self.flags.contains(ContainerFlags::OWNED)
    }

    pub fn allocator(&self) -> Option<&AllocRef> {
        self.alloc.as_ref()
    }

    pub fn allocator_id(&self) -> AllocatorId {
        self.alloc.as_ref().map_or(AllocatorId::NULL, |alloc| alloc.id())
    }

    /// Allocator of a non-null handle
    ///
    /// # Panics
    /// On a null (moved-from) handle.
    pub fn alloc(&self) -> &AllocRef {
        match self.alloc.as_ref() {
            Some(alloc) => alloc,
            None => panic!("use of a null shared-memory container"),
        }
    }

    /// # Panics
    /// On a null (moved-from) handle.
    pub fn header(&self) -> &C::Header {
        assert!(!self.is_null(), "use of a null shared-memory container");
        unsafe { &*self.header }
    }

    /// # Panics
    /// On a null (moved-from) handle.
    pub fn header_mut(&mut self) -> &mut C::Header {
        assert!(!self.is_null(), "use of a null shared-memory container");
        unsafe { &mut *self.header }
    }

    /// Raw header address, for containers that synchronize through locks in the header
    pub fn header_ptr(&self) -> *mut C::Header {
        self.header
    }

    /// Tear down the payload, and the header too if asked and owned
    pub fn destroy(&mut self, destroy_header: bool) -> ShmResult<()> {
        if self.is_null() {
            return Ok(());
        }
        let alloc = self.alloc().clone();
        if self.flags.contains(ContainerFlags::DATA_VALID) {
            C::destroy_payload(unsafe { &mut *self.header }, &alloc)?;
            self.flags.remove(ContainerFlags::DATA_VALID);
        }
        if destroy_header {
            let owns_header = self.flags.contains(ContainerFlags::HEADER_DESTRUCTABLE);
            let pointer = self.pointer;
            // The replaced value is dropped below and must not tear down again
            self.flags = ContainerFlags::empty();
            *self = Self::null();
            if owns_header {
                alloc.free(pointer)?;
            }
        } else {
            self.disown();
        }
        Ok(())
    }

    /// Stop this handle from destroying anything on drop
    pub fn disown(&mut self) {
        self.flags
            .remove(ContainerFlags::DESTRUCTABLE | ContainerFlags::HEADER_DESTRUCTABLE);
    }

    /// Move the handle out, leaving a null handle behind
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::null())
    }
}

impl<C: ShmContainer> Drop for ShmHandle<C> {
    fn drop(&mut self) {
        if self.is_destructable() {
            if let Err(e) = self.destroy(true) {
                log::warn!("failed to destroy container at {:?}: {}", self.pointer, e);
            }
        }
    }
}

impl<C: ShmContainer> fmt::Debug for ShmHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmHandle")
            .field("pointer", &self.pointer)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A data structure whose state lives in shared memory
///
/// Implementors describe their header and how to destroy and deep-copy the
/// payload it refers to; everything about ownership (moving, copying,
/// (de)serializing, dropping) is provided on top of that.
pub trait ShmContainer: Sized {
    /// `#[repr(C)]` header stored in shared memory
    type Header;

    fn handle(&self) -> &ShmHandle<Self>;

    fn handle_mut(&mut self) -> &mut ShmHandle<Self>;

    fn from_handle(handle: ShmHandle<Self>) -> Self;

    /// Free everything `header` refers to (but not the header itself)
    fn destroy_payload(header: &mut Self::Header, alloc: &AllocRef) -> ShmResult<()>;

    /// Deep-copy the payload of `src` (resolved through `from`) into `to`
    fn copy_payload(src: &Self::Header, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Header>;

    fn is_null(&self) -> bool {
        self.handle().is_null()
    }

    fn allocator(&self) -> Option<&AllocRef> {
        self.handle().allocator()
    }

    /// Process-independent address of the header
    fn serialize(&self) -> Pointer {
        self.handle().pointer()
    }

    /// Non-owning view of the container at `p`
    fn deserialize(manager: &MemoryManager, p: Pointer) -> ShmResult<Self> {
        if p.is_null() {
            return Ok(Self::from_handle(ShmHandle::null()));
        }
        let alloc = manager.get_allocator(p.allocator_id)?;
        Ok(Self::from_handle(ShmHandle::view(p, alloc)))
    }

    /// Non-owning view when the allocator is already at hand
    fn deserialize_in(alloc: &AllocRef, p: Pointer) -> Self {
        Self::from_handle(ShmHandle::view(p, alloc.clone()))
    }

    /// Adopt the container at `p`, e.g. one handed over by another process
    fn deserialize_owned(manager: &MemoryManager, p: Pointer) -> ShmResult<Self> {
        if p.is_null() {
            return Ok(Self::from_handle(ShmHandle::null()));
        }
        let alloc = manager.get_allocator(p.allocator_id)?;
        Ok(Self::from_handle(ShmHandle::owned(p, alloc)))
    }

    /// Tear down payload and header now instead of on drop
    fn destroy(&mut self) -> ShmResult<()> {
        self.handle_mut().destroy(true)
    }

    /// Transfer ownership out of `other`, leaving it null
    ///
    /// An in-place header cannot change hands by pointer, so its bytes are
    /// copied into a freshly allocated header first.
    fn weak_move(other: &mut Self) -> ShmResult<Self> {
        let src = other.handle_mut();
        if !src.is_null() && src.flags().contains(ContainerFlags::IN_PLACE) && !src.is_owned() {
            let alloc = src.alloc().clone();
            let (pointer, header) = alloc.allocate_ptr::<Self::Header>(1)?;
            unsafe { ptr::copy_nonoverlapping(src.header_ptr() as *const Self::Header, header, 1) };
            let mut old = src.take();
            old.disown();
            return Ok(Self::from_handle(ShmHandle::owned(pointer, alloc)));
        }
        Ok(Self::from_handle(src.take()))
    }

    /// Deep copy into a new header owned by the result
    fn strong_copy(&self, alloc: &AllocRef) -> ShmResult<Self> {
        let src = self.handle();
        if src.is_null() {
            return Ok(Self::from_handle(ShmHandle::null()));
        }
        let pointer = copy_into::<Self>(src.header(), src.alloc(), alloc)?;
        Ok(Self::from_handle(ShmHandle::owned(pointer, alloc.clone())))
    }

    /// Deep copy into the same allocator
    fn try_clone(&self) -> ShmResult<Self> {
        match self.allocator() {
            Some(alloc) => self.strong_copy(&alloc.clone()),
            None => Ok(Self::from_handle(ShmHandle::null())),
        }
    }
}

/// Deep-copy a header into a fresh allocation in `to`
fn copy_into<C: ShmContainer>(src: &C::Header, from: &AllocRef, to: &AllocRef) -> ShmResult<Pointer> {
    let mut header = C::copy_payload(src, from, to)?;
    match to.allocate_ptr::<C::Header>(1) {
        Ok((pointer, dst)) => {
            unsafe { dst.write(header) };
            Ok(pointer)
        }
        Err(e) => {
            C::destroy_payload(&mut header, to)?;
            Err(e)
        }
    }
}

/// How a value is kept inside a container
///
/// Plain data is stored inline by bitwise copy. Containers are stored as a
/// [`Pointer`] to their header: storing an owned handle from the same
/// allocator moves it, anything else (views, in-place headers, handles from
/// another allocator) is deep-copied.
pub trait ShmElement: Sized {
    /// Inline representation inside the container's memory
    type Stored: Copy + 'static;

    /// Convert into the stored form, giving up ownership
    fn store(self, alloc: &AllocRef) -> ShmResult<Self::Stored>;

    /// Transient access: a copy for plain data, a view for containers
    fn load(stored: &Self::Stored, alloc: &AllocRef) -> Self;

    /// Take ownership back out of a slot that is being vacated
    fn take(stored: Self::Stored, alloc: &AllocRef) -> Self;

    fn destroy_stored(stored: &mut Self::Stored, alloc: &AllocRef) -> ShmResult<()>;

    fn copy_stored(stored: &Self::Stored, from: &AllocRef, to: &AllocRef) -> ShmResult<Self::Stored>;
}

impl<C: ShmContainer> ShmElement for C {
    type Stored = Pointer;

    fn store(mut self, alloc: &AllocRef) -> ShmResult<Pointer> {
        let handle = self.handle_mut();
        if handle.is_null() {
            return Ok(Pointer::NULL);
        }
        if handle.is_owned() && handle.allocator_id() == alloc.id() {
            let pointer = handle.pointer();
            handle.disown();
            return Ok(pointer);
        }
        copy_into::<C>(handle.header(), handle.alloc(), alloc)
    }

    fn load(stored: &Pointer, alloc: &AllocRef) -> Self {
        Self::from_handle(ShmHandle::view(*stored, alloc.clone()))
    }

    fn take(stored: Pointer, alloc: &AllocRef) -> Self {
        Self::from_handle(ShmHandle::owned(stored, alloc.clone()))
    }

    fn destroy_stored(stored: &mut Pointer, alloc: &AllocRef) -> ShmResult<()> {
        // Through the container so that shared owners only drop their reference
        C::from_handle(ShmHandle::owned(*stored, alloc.clone())).destroy()?;
        *stored = Pointer::NULL;
        Ok(())
    }

    fn copy_stored(stored: &Pointer, from: &AllocRef, to: &AllocRef) -> ShmResult<Pointer> {
        if stored.is_null() {
            return Ok(Pointer::NULL);
        }
        let src: *const C::Header = from.convert(*stored);
        copy_into::<C>(unsafe { &*src }, from, to)
    }
}

/// Store plain-old-data types inline in containers
///
/// ```
/// #[derive(Clone, Copy)]
/// #[repr(C)]
/// struct Sample { t: u64, v: f32 }
/// shmkit_core::impl_shm_pod!(Sample);
/// ```
#[macro_export]
macro_rules! impl_shm_pod {
    ($($ty:ty),* $(,)?) => {$(
        impl $crate::containers::ShmElement for $ty {
            type Stored = $ty;

            fn store(self, _alloc: &$crate::memory::AllocRef) -> $crate::error::ShmResult<$ty> {
                Ok(self)
            }

            fn load(stored: &$ty, _alloc: &$crate::memory::AllocRef) -> $ty {
                *stored
            }

            fn take(stored: $ty, _alloc: &$crate::memory::AllocRef) -> $ty {
                stored
            }

            fn destroy_stored(
                _stored: &mut $ty,
                _alloc: &$crate::memory::AllocRef,
            ) -> $crate::error::ShmResult<()> {
                Ok(())
            }

            fn copy_stored(
                stored: &$ty,
                _from: &$crate::memory::AllocRef,
                _to: &$crate::memory::AllocRef,
            ) -> $crate::error::ShmResult<$ty> {
                Ok(*stored)
            }
        }
    )*};
}

impl_shm_pod!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);
impl_shm_pod!(Pointer, AllocatorId);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::test_support::{page_allocator, stack_allocator};
    use crate::containers::{ShmHashMap, ShmList, ShmVec};

    #[test]
    fn test_flag_sets() {
        assert!(ContainerFlags::OWNED.contains(ContainerFlags::IN_PLACE));
        assert!(ContainerFlags::IN_PLACE.contains(ContainerFlags::VIEW));
        assert!(!ContainerFlags::VIEW.contains(ContainerFlags::DESTRUCTABLE));
        assert!(!ContainerFlags::IN_PLACE.contains(ContainerFlags::HEADER_DESTRUCTABLE));
    }

    #[test]
    fn test_owned_drop_on_page_allocator() {
        let alloc = page_allocator();
        {
            let mut vec = ShmVec::<u32>::new(&alloc).unwrap();
            vec.push(1).unwrap();
            let mut list = ShmList::<u64>::new(&alloc).unwrap();
            list.push_back(2).unwrap();
            let map = ShmHashMap::<u64, u64>::new(&alloc).unwrap();
            map.emplace(3, 4).unwrap();
        }
        assert_eq!(alloc.currently_allocated_size(), 0);

        // Every page went back exactly once
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_destroy_frees_header_once() {
        let alloc = stack_allocator();
        let mut vec = ShmVec::<u64>::new(&alloc).unwrap();
        vec.push(7).unwrap();
        let header = vec.serialize();

        vec.destroy().unwrap();
        assert!(vec.is_null());
        assert!(vec.handle().flags().is_empty());
        assert_eq!(alloc.currently_allocated_size(), 0);
        assert!(matches!(alloc.free(header), Err(ShmError::DoubleFree { .. })));

        // Destroying again and dropping are no-ops
        vec.destroy().unwrap();
        drop(vec);
        assert_eq!(alloc.currently_allocated_size(), 0);
    }

    #[test]
    fn test_page_header_freed_once_on_drop() {
        let alloc = page_allocator();
        let vec = ShmVec::<u8>::new(&alloc).unwrap();
        let header = vec.serialize();
        drop(vec);
        assert!(matches!(alloc.free(header), Err(ShmError::DoubleFree { .. })));
    }
}
