// Growable array in shared memory

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::{ShmError, ShmResult};
use crate::memory::{AllocRef, Pointer};
use std::fmt;
use std::mem;
use std::ptr;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VecHeader {
    pub(crate) buf: Pointer,
    pub(crate) len: u64,
    pub(crate) cap: u64,
}

impl VecHeader {
    pub const EMPTY: VecHeader = VecHeader {
        buf: Pointer::NULL,
        len: 0,
        cap: 0,
    };
}

/// Vector of `T` whose buffer lives in an allocator slot
pub struct ShmVec<T: ShmElement> {
    handle: ShmHandle<Self>,
}

impl<T: ShmElement> ShmContainer for ShmVec<T> {
    type Header = VecHeader;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut VecHeader, alloc: &AllocRef) -> ShmResult<()> {
        if header.buf.is_null() {
            return Ok(());
        }
        let data: *mut T::Stored = alloc.convert(header.buf);
        for i in 0..header.len as usize {
            T::destroy_stored(unsafe { &mut *data.add(i) }, alloc)?;
        }
        alloc.free(header.buf)?;
        *header = VecHeader::EMPTY;
        Ok(())
    }

    fn copy_payload(src: &VecHeader, from: &AllocRef, to: &AllocRef) -> ShmResult<VecHeader> {
        if src.len == 0 {
            return Ok(VecHeader::EMPTY);
        }
        let len = src.len as usize;
        let (buf, dst) = to.allocate_ptr::<T::Stored>(len)?;
        let data: *const T::Stored = from.convert(src.buf);
        let mut copied = VecHeader {
            buf,
            len: 0,
            cap: len as u64,
        };
        for i in 0..len {
            match T::copy_stored(unsafe { &*data.add(i) }, from, to) {
                Ok(stored) => unsafe { dst.add(i).write(stored) },
                Err(e) => {
                    Self::destroy_payload(&mut copied, to)?;
                    return Err(e);
                }
            }
            copied.len += 1;
        }
        Ok(copied)
    }
}

impl<T: ShmElement> ShmVec<T> {
    pub fn new(alloc: &AllocRef) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(None, alloc, VecHeader::EMPTY)?))
    }

    pub fn with_capacity(alloc: &AllocRef, capacity: usize) -> ShmResult<Self> {
        let mut vec = Self::new(alloc)?;
        vec.reserve(capacity)?;
        Ok(vec)
    }

    /// Construct an empty vector whose header lives at `at`
    pub fn new_in_place(alloc: &AllocRef, at: Pointer) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(Some(at), alloc, VecHeader::EMPTY)?))
    }

    pub fn len(&self) -> usize {
        self.handle.header().len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.handle.header().cap as usize
    }

    fn data(&self) -> *mut T::Stored {
        self.handle.alloc().convert(self.handle.header().buf)
    }

    /// Make room for at least `additional` more elements
    pub fn reserve(&mut self, additional: usize) -> ShmResult<()> {
        let overflow = || {
            ShmError::out_of_memory(
                "ShmVec::reserve",
                format!("{} more elements overflow the addressable size", additional),
            )
        };
        let needed = self.len().checked_add(additional).ok_or_else(overflow)?;
        if needed <= self.capacity() {
            return Ok(());
        }
        let new_cap = needed.max(self.capacity().saturating_mul(2)).max(4);
        let bytes = new_cap
            .checked_mul(mem::size_of::<T::Stored>().max(1))
            .ok_or_else(overflow)?;
        let alloc = self.handle.alloc().clone();
        let header = self.handle.header_mut();
        header.buf = if header.buf.is_null() {
            alloc.allocate(bytes)?
        } else {
            alloc.reallocate(header.buf, bytes)?
        };
        header.cap = new_cap as u64;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> ShmResult<()> {
        self.reserve(1)?;
        let stored = value.store(self.handle.alloc())?;
        let len = self.len();
        unsafe { self.data().add(len).write(stored) };
        self.handle.header_mut().len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let stored = unsafe { self.data().add(len - 1).read() };
        self.handle.header_mut().len -= 1;
        Some(T::take(stored, self.handle.alloc()))
    }

    pub fn get(&self, index: usize) -> ShmResult<T> {
        self.check_index("ShmVec::get", index)?;
        Ok(T::load(unsafe { &*self.data().add(index) }, self.handle.alloc()))
    }

    pub fn first(&self) -> Option<T> {
        self.get(0).ok()
    }

    pub fn last(&self) -> Option<T> {
        self.len().checked_sub(1).and_then(|i| self.get(i).ok())
    }

    /// Replace the element at `index`, destroying the old one
    pub fn set(&mut self, index: usize, value: T) -> ShmResult<()> {
        self.check_index("ShmVec::set", index)?;
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        let slot = unsafe { &mut *self.data().add(index) };
        T::destroy_stored(slot, &alloc)?;
        *slot = stored;
        Ok(())
    }

    pub fn insert(&mut self, index: usize, value: T) -> ShmResult<()> {
        let len = self.len();
        if index > len {
            return Err(ShmError::out_of_bounds("ShmVec::insert", index, len));
        }
        self.reserve(1)?;
        let stored = value.store(self.handle.alloc())?;
        unsafe {
            let at = self.data().add(index);
            ptr::copy(at, at.add(1), len - index);
            at.write(stored);
        }
        self.handle.header_mut().len += 1;
        Ok(())
    }

    /// Remove and return the element at `index`, shifting the rest down
    pub fn remove(&mut self, index: usize) -> ShmResult<T> {
        self.check_index("ShmVec::remove", index)?;
        let len = self.len();
        let stored = unsafe {
            let at = self.data().add(index);
            let stored = at.read();
            ptr::copy(at.add(1), at, len - index - 1);
            stored
        };
        self.handle.header_mut().len -= 1;
        Ok(T::take(stored, self.handle.alloc()))
    }

    /// Grow with values from `f` or shrink by destroying the tail
    pub fn resize_with<F>(&mut self, new_len: usize, mut f: F) -> ShmResult<()>
    where
        F: FnMut() -> ShmResult<T>,
    {
        while self.len() > new_len {
            if let Some(value) = self.pop() {
                drop(value);
            }
        }
        if new_len > self.len() {
            self.reserve(new_len - self.len())?;
            while self.len() < new_len {
                self.push(f()?)?;
            }
        }
        Ok(())
    }

    pub fn resize(&mut self, new_len: usize, value: T) -> ShmResult<()>
    where
        T: Clone,
    {
        self.resize_with(new_len, || Ok(value.clone()))
    }

    /// Destroy every element, keeping the buffer
    pub fn clear(&mut self) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let data = self.data();
        for i in 0..self.len() {
            T::destroy_stored(unsafe { &mut *data.add(i) }, &alloc)?;
        }
        self.handle.header_mut().len = 0;
        Ok(())
    }

    pub fn iter(&self) -> ShmVecIter<'_, T> {
        ShmVecIter { vec: self, index: 0 }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Stored representation of the elements
    pub fn as_stored(&self) -> &[T::Stored] {
        if self.is_empty() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data(), self.len()) }
    }

    fn check_index(&self, op: &'static str, index: usize) -> ShmResult<()> {
        let len = self.len();
        if index >= len {
            return Err(ShmError::out_of_bounds(op, index, len));
        }
        Ok(())
    }
}

impl<T: ShmElement<Stored = T> + Copy> ShmVec<T> {
    /// Direct access for inline element types
    pub fn as_slice(&self) -> &[T] {
        self.as_stored()
    }
}

/// Iterator over transient element views
pub struct ShmVecIter<'a, T: ShmElement> {
    vec: &'a ShmVec<T>,
    index: usize,
}

impl<T: ShmElement> Iterator for ShmVecIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.vec.get(self.index).ok()?;
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.vec.len().saturating_sub(self.index);
        (left, Some(left))
    }
}

impl<T: ShmElement + fmt::Debug> fmt::Debug for ShmVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmVec(null)");
        }
        f.debug_list().entries(self.iter()).finish()
    }
}
