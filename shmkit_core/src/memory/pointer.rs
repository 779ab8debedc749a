//! Process-independent addressing
//!
//! A [`Pointer`] names a byte by (allocator id, offset into that allocator's
//! slot). The same shared region is mapped at a different virtual address in
//! every process, so this pair is the only form in which an address may cross
//! a process boundary.

use bytemuck::{Pod, Zeroable};
use std::fmt;
use std::ops::{Add, Sub};

/// Identifies one allocator instance across processes
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct AllocatorId {
    /// Process-scope id (the creating process' pid by default)
    pub major: u32,
    /// Process-local sequence number
    pub minor: u32,
}

impl AllocatorId {
    pub const NULL: AllocatorId = AllocatorId {
        major: u32::MAX,
        minor: u32::MAX,
    };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl Default for AllocatorId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "AllocatorId(null)")
        } else {
            write!(f, "AllocatorId({}.{})", self.major, self.minor)
        }
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Process-independent pointer: {allocator_id, offset}
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Pointer {
    pub allocator_id: AllocatorId,
    pub offset: u64,
}

/// Size of the wire encoding
pub const POINTER_WIRE_SIZE: usize = 16;

impl Pointer {
    pub const NULL: Pointer = Pointer {
        allocator_id: AllocatorId::NULL,
        offset: 0,
    };

    pub const fn new(allocator_id: AllocatorId, offset: u64) -> Self {
        Self {
            allocator_id,
            offset,
        }
    }

    pub fn is_null(&self) -> bool {
        self.allocator_id.is_null()
    }

    /// Encode as `{major:u32, minor:u32, offset:u64}`, little-endian
    pub fn to_bytes(&self) -> [u8; POINTER_WIRE_SIZE] {
        let mut out = [0u8; POINTER_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.allocator_id.major.to_le_bytes());
        out[4..8].copy_from_slice(&self.allocator_id.minor.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode the little-endian wire form produced by [`Pointer::to_bytes`]
    pub fn from_bytes(bytes: &[u8; POINTER_WIRE_SIZE]) -> Self {
        let mut major = [0u8; 4];
        let mut minor = [0u8; 4];
        let mut offset = [0u8; 8];
        major.copy_from_slice(&bytes[0..4]);
        minor.copy_from_slice(&bytes[4..8]);
        offset.copy_from_slice(&bytes[8..16]);
        Self {
            allocator_id: AllocatorId::new(u32::from_le_bytes(major), u32::from_le_bytes(minor)),
            offset: u64::from_le_bytes(offset),
        }
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Pointer(null)")
        } else {
            write!(f, "Pointer({}+{:#x})", self.allocator_id, self.offset)
        }
    }
}

impl Add<u64> for Pointer {
    type Output = Pointer;

    fn add(self, rhs: u64) -> Pointer {
        Pointer::new(self.allocator_id, self.offset + rhs)
    }
}

impl Sub<u64> for Pointer {
    type Output = Pointer;

    fn sub(self, rhs: u64) -> Pointer {
        Pointer::new(self.allocator_id, self.offset - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_all_ones() {
        assert!(AllocatorId::NULL.is_null());
        assert_eq!(AllocatorId::NULL.major, u32::MAX);
        assert_eq!(AllocatorId::NULL.minor, u32::MAX);
        assert!(Pointer::NULL.is_null());
        assert!(Pointer::default().is_null());
        assert!(!Pointer::new(AllocatorId::new(0, 0), 0).is_null());
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(std::mem::size_of::<Pointer>(), POINTER_WIRE_SIZE);
        let p = Pointer::new(AllocatorId::new(7, 3), 0x1122_3344_5566_7788);
        let bytes = p.to_bytes();
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(Pointer::from_bytes(&bytes), p);
    }

    #[test]
    fn test_offset_arithmetic() {
        let p = Pointer::new(AllocatorId::new(1, 2), 100);
        assert_eq!((p + 28).offset, 128);
        assert_eq!((p - 36).offset, 64);
        assert_eq!((p + 28).allocator_id, p.allocator_id);
    }
}
