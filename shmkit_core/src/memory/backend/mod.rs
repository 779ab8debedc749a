//! Memory backends
//!
//! A backend owns (or attaches to) one memory segment and grows it in
//! discrete slots. Every slot keeps its id for the lifetime of the segment;
//! the per-process virtual address of a slot is local, only (slot id, offset)
//! pairs mean the same thing in every process.
//!
//! Slots are never unmapped individually. Mappings stay valid for as long as
//! the backend value is alive, even after [`MemoryBackend::destroy`] removed
//! the segment's name.

use crate::config::BackendConfig;
use crate::error::{ShmError, ShmResult};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

pub mod array;
#[cfg(unix)]
pub mod posix_shm;
pub mod private_mmap;

pub use array::ArrayBackend;
#[cfg(unix)]
pub use posix_shm::PosixShmBackend;
pub use private_mmap::PrivateMmapBackend;

/// Index of a slot inside its backend
pub type SlotId = usize;

/// Available memory backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendType {
    /// Named POSIX shared-memory object, attachable from other processes
    PosixShm,
    /// Anonymous private mappings, visible to this process only
    PrivateMmap,
    /// A region supplied by the caller, see [`ArrayBackend`]
    Array,
}

impl fmt::Display for MemoryBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryBackendType::PosixShm => write!(f, "posix_shm"),
            MemoryBackendType::PrivateMmap => write!(f, "private_mmap"),
            MemoryBackendType::Array => write!(f, "array"),
        }
    }
}

impl std::str::FromStr for MemoryBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "posix_shm" | "posix" | "shm" => Ok(MemoryBackendType::PosixShm),
            "private_mmap" | "private" | "mmap" => Ok(MemoryBackendType::PrivateMmap),
            "array" => Ok(MemoryBackendType::Array),
            _ => Err(format!(
                "Unknown memory backend: {}. Available: posix_shm, private_mmap, array",
                s
            )),
        }
    }
}

/// What a slot is used for
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Backend header
    Header = 1,
    /// Slot-descriptor table (current or retired)
    SlotTable = 2,
    /// Allocator region
    Data = 3,
}

impl SlotKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(SlotKind::Header),
            2 => Some(SlotKind::SlotTable),
            3 => Some(SlotKind::Data),
            _ => None,
        }
    }
}

/// Slot descriptor as stored in the shared slot table
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SlotDescriptor {
    pub off: u64,
    pub size: u64,
    pub kind: u32,
    pub _reserved: u32,
}

impl SlotDescriptor {
    pub fn new(off: u64, size: u64, kind: SlotKind) -> Self {
        Self {
            off,
            size,
            kind: kind as u32,
            _reserved: 0,
        }
    }
}

/// A mapped slot as seen from this process
#[derive(Debug, Clone, Copy)]
pub struct SlotInfo {
    pub id: SlotId,
    /// Offset of the slot inside the segment
    pub off: u64,
    pub size: usize,
    pub kind: SlotKind,
    ptr: NonNull<u8>,
}

// The pointer is into a mapping owned by the backend
unsafe impl Send for SlotInfo {}
unsafe impl Sync for SlotInfo {}

impl SlotInfo {
    pub(crate) fn new(id: SlotId, off: u64, size: usize, kind: SlotKind, ptr: NonNull<u8>) -> Self {
        Self {
            id,
            off,
            size,
            kind,
            ptr,
        }
    }

    /// Local address of the first byte of the slot
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// A memory segment divided into slots
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Name of the segment
    fn url(&self) -> &str;

    fn backend_type(&self) -> MemoryBackendType;

    /// Create the segment (replacing any stale segment of the same name)
    fn create(&self) -> ShmResult<()>;

    /// Attach to a segment created by another participant
    fn attach(&self) -> ShmResult<()>;

    /// Extend the segment by a new slot of at least `size` bytes
    fn create_slot(&self, size: usize) -> ShmResult<SlotInfo>;

    /// Look up a slot mapped in this process
    fn slot(&self, id: SlotId) -> Option<SlotInfo>;

    /// Number of slots mapped in this process
    fn num_slots(&self) -> usize;

    /// Map slots other participants created since the last attach/refresh
    ///
    /// Returns the number of newly mapped slots.
    fn refresh(&self) -> ShmResult<usize>;

    /// Stop creating slots; existing mappings stay valid until drop
    fn detach(&self) -> ShmResult<()>;

    /// Remove the segment's name; existing mappings stay valid until drop
    fn destroy(&self) -> ShmResult<()>;

    /// Slots holding allocator regions, in id order
    fn data_slots(&self) -> Vec<SlotInfo> {
        (0..self.num_slots())
            .filter_map(|id| self.slot(id))
            .filter(|slot| slot.kind == SlotKind::Data)
            .collect()
    }
}

/// Builds backends by type
pub struct MemoryBackendFactory;

impl MemoryBackendFactory {
    /// Construct an unopened backend of `backend_type` named `url`
    pub fn get(
        backend_type: MemoryBackendType,
        url: &str,
        config: &BackendConfig,
    ) -> ShmResult<Arc<dyn MemoryBackend>> {
        match backend_type {
            #[cfg(unix)]
            MemoryBackendType::PosixShm => Ok(Arc::new(PosixShmBackend::new(url, config)?)),
            #[cfg(not(unix))]
            MemoryBackendType::PosixShm => Err(ShmError::backend_unsupported(
                "MemoryBackendFactory::get",
                format!("POSIX shm is not available on {}", super::platform::platform_name()),
            )),
            MemoryBackendType::PrivateMmap => Ok(Arc::new(PrivateMmapBackend::new(url, config))),
            MemoryBackendType::Array => Err(ShmError::backend_unsupported(
                "MemoryBackendFactory::get",
                format!(
                    "{} needs a caller-supplied region; build an ArrayBackend and register it",
                    url
                ),
            )),
        }
    }
}

pub(crate) fn check_slot_size(op: &'static str, size: usize) -> ShmResult<()> {
    if size == 0 {
        return Err(ShmError::out_of_memory(op, "cannot create a zero-sized slot"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_parsing() {
        assert_eq!(
            "posix_shm".parse::<MemoryBackendType>().unwrap(),
            MemoryBackendType::PosixShm
        );
        assert_eq!(
            "PRIVATE".parse::<MemoryBackendType>().unwrap(),
            MemoryBackendType::PrivateMmap
        );
        assert!("hugepage".parse::<MemoryBackendType>().is_err());
    }

    #[test]
    fn test_backend_type_display_roundtrip() {
        for ty in [
            MemoryBackendType::PosixShm,
            MemoryBackendType::PrivateMmap,
            MemoryBackendType::Array,
        ] {
            assert_eq!(ty.to_string().parse::<MemoryBackendType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_factory_refuses_array() {
        let err = MemoryBackendFactory::get(MemoryBackendType::Array, "/a", &BackendConfig::default())
            .unwrap_err();
        assert!(matches!(err, ShmError::BackendUnsupportedOperation { .. }));
    }

    #[test]
    fn test_slot_kind_raw() {
        assert_eq!(SlotKind::from_raw(3), Some(SlotKind::Data));
        assert_eq!(SlotKind::from_raw(0), None);
        assert_eq!(std::mem::size_of::<SlotDescriptor>(), 24);
    }
}
