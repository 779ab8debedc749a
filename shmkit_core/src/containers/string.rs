// UTF-8 string in shared memory

use super::protocol::{ShmContainer, ShmHandle};
use crate::error::ShmResult;
use crate::memory::{AllocRef, Pointer};
use std::fmt;
use std::hash::{Hash, Hasher};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringHeader {
    buf: Pointer,
    len: u64,
    cap: u64,
}

const EMPTY: StringHeader = StringHeader {
    buf: Pointer::NULL,
    len: 0,
    cap: 0,
};

/// Owned string whose bytes live in an allocator slot
///
/// Equality and hashing look at the content only, so a view compares equal
/// to the string it was deserialized from.
pub struct ShmString {
    handle: ShmHandle<Self>,
}

impl ShmContainer for ShmString {
    type Header = StringHeader;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut StringHeader, alloc: &AllocRef) -> ShmResult<()> {
        if !header.buf.is_null() {
            alloc.free(header.buf)?;
        }
        *header = EMPTY;
        Ok(())
    }

    fn copy_payload(src: &StringHeader, from: &AllocRef, to: &AllocRef) -> ShmResult<StringHeader> {
        if src.len == 0 {
            return Ok(EMPTY);
        }
        let (buf, dst) = to.allocate_ptr::<u8>(src.len as usize)?;
        unsafe {
            std::ptr::copy_nonoverlapping(from.convert::<u8>(src.buf), dst, src.len as usize);
        }
        Ok(StringHeader {
            buf,
            len: src.len,
            cap: src.len,
        })
    }
}

impl ShmString {
    pub fn new(alloc: &AllocRef) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(None, alloc, EMPTY)?))
    }

    pub fn from_str(alloc: &AllocRef, s: &str) -> ShmResult<Self> {
        let mut string = Self::new(alloc)?;
        string.push_str(s)?;
        Ok(string)
    }

    pub fn len(&self) -> usize {
        self.handle.header().len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        let header = self.handle.header();
        if header.len == 0 {
            return &[];
        }
        let data: *const u8 = self.handle.alloc().convert(header.buf);
        unsafe { std::slice::from_raw_parts(data, header.len as usize) }
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from &str
        unsafe { std::str::from_utf8_unchecked(self.as_bytes()) }
    }

    pub fn push_str(&mut self, s: &str) -> ShmResult<()> {
        if s.is_empty() {
            return Ok(());
        }
        let alloc = self.handle.alloc().clone();
        let header = self.handle.header_mut();
        let needed = header.len as usize + s.len();
        if needed > header.cap as usize {
            let cap = needed.max(header.cap as usize * 2);
            header.buf = if header.buf.is_null() {
                alloc.allocate(cap)?
            } else {
                alloc.reallocate(header.buf, cap)?
            };
            header.cap = cap as u64;
        }
        unsafe {
            let dst = alloc.convert::<u8>(header.buf).add(header.len as usize);
            std::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
        }
        header.len = needed as u64;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.handle.header_mut().len = 0;
    }
}

impl PartialEq for ShmString {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ShmString {}

impl PartialEq<str> for ShmString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for ShmString {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Hash for ShmString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl fmt::Display for ShmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ShmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmString(null)");
        }
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::test_support::stack_allocator;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_push_and_compare() {
        let alloc = stack_allocator();
        let mut s = ShmString::from_str(&alloc, "hello").unwrap();
        s.push_str(", world").unwrap();
        assert_eq!(s.as_str(), "hello, world");
        assert_eq!(s, "hello, world");
        assert_eq!(s.len(), 12);
        assert_eq!(s.to_string(), "hello, world");
    }

    #[test]
    fn test_view_equals_by_content() {
        let alloc = stack_allocator();
        let a = ShmString::from_str(&alloc, "key").unwrap();
        let b = ShmString::from_str(&alloc, "key").unwrap();
        let view = ShmString::deserialize_in(&alloc, a.serialize());
        assert_eq!(a, b);
        assert_eq!(view, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(hash_of(&a), hash_of("key"));
    }

    #[test]
    fn test_empty_and_freed() {
        let alloc = stack_allocator();
        {
            let s = ShmString::new(&alloc).unwrap();
            assert!(s.is_empty());
            assert_eq!(s.as_str(), "");
            let t = ShmString::from_str(&alloc, "abc").unwrap();
            let copy = t.try_clone().unwrap();
            drop(t);
            assert_eq!(copy, "abc");
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
    }
}
