//! Allocators living inside backend slots
//!
//! Every allocator owns exactly one data slot. The slot starts with an
//! [`AllocatorHeader`] so that any process mapping the slot can tell which
//! strategy manages it and rebuild the allocator object over it
//! ([`AllocatorFactory::attach`]). Everything an allocator hands out is a
//! [`Pointer`] whose offset is relative to the start of that slot.

use crate::config::PageConfig;
use crate::error::{ShmError, ShmResult};
use crate::memory::backend::{MemoryBackend, SlotInfo};
use crate::memory::platform::align_up;
use crate::memory::pointer::{AllocatorId, Pointer};
use crate::sync::ThreadIdentity;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub mod page;
pub mod stack;

pub use page::{PageAllocator, PageId};
pub use stack::StackAllocator;

/// Shared handle to a live allocator
pub type AllocRef = Arc<dyn Allocator>;

/// Tag stored in the first word of an allocator slot
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorType {
    Stack = 1,
    Page = 2,
}

impl AllocatorType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(AllocatorType::Stack),
            2 => Some(AllocatorType::Page),
            _ => None,
        }
    }
}

impl fmt::Display for AllocatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorType::Stack => write!(f, "stack"),
            AllocatorType::Page => write!(f, "page"),
        }
    }
}

/// Leading header of every allocator slot
///
/// The tag is published last: a zero tag means the creator has not finished
/// initializing the slot yet.
#[repr(C)]
#[derive(Debug)]
pub struct AllocatorHeader {
    allocator_type: AtomicU32,
    pub custom_header_size: u32,
    pub allocator_id: AllocatorId,
}

pub const ALLOCATOR_HEADER_SIZE: usize = mem::size_of::<AllocatorHeader>();

impl AllocatorHeader {
    /// # Safety
    /// The slot must be at least [`ALLOCATOR_HEADER_SIZE`] bytes and mapped.
    pub(crate) unsafe fn from_slot<'a>(slot: &SlotInfo) -> &'a AllocatorHeader {
        &*(slot.as_ptr() as *const AllocatorHeader)
    }

    /// Tag of the slot, `None` while it is still being initialized
    pub fn allocator_type(&self) -> Option<AllocatorType> {
        AllocatorType::from_raw(self.allocator_type.load(Ordering::Acquire))
    }

    pub(crate) fn raw_type(&self) -> u32 {
        self.allocator_type.load(Ordering::Acquire)
    }

    /// Fill in the id fields; the tag stays zero until [`Self::publish`]
    pub(crate) fn configure(slot: &SlotInfo, id: AllocatorId, custom_header_size: usize) -> ShmResult<()> {
        let custom = u32::try_from(custom_header_size)
            .map_err(|_| ShmError::config(format!("custom header of {} bytes is too large", custom_header_size)))?;
        unsafe {
            (slot.as_ptr() as *mut AllocatorHeader).write(AllocatorHeader {
                allocator_type: AtomicU32::new(0),
                custom_header_size: custom,
                allocator_id: id,
            });
        }
        Ok(())
    }

    pub(crate) fn publish(&self, ty: AllocatorType) {
        self.allocator_type.store(ty as u32, Ordering::Release);
    }

    /// Offset at which the strategy's own header starts
    pub(crate) fn internal_header_offset(custom_header_size: usize) -> usize {
        align_up(ALLOCATOR_HEADER_SIZE + custom_header_size, 64)
    }
}

/// A memory allocation strategy over one slot
///
/// All methods take `&self`; implementations synchronize through state kept
/// in the slot itself, so several processes may allocate from the same
/// allocator concurrently.
pub trait Allocator: Send + Sync + fmt::Debug {
    fn id(&self) -> AllocatorId;

    fn allocator_type(&self) -> AllocatorType;

    /// The slot this allocator manages, as mapped in this process
    fn slot(&self) -> SlotInfo;

    /// Backend holding the slot
    fn backend(&self) -> &Arc<dyn MemoryBackend>;

    /// Allocate at least `size` bytes
    fn allocate(&self, size: usize) -> ShmResult<Pointer>;

    /// Allocate `size` bytes aligned to `alignment`
    fn aligned_allocate(&self, size: usize, alignment: usize) -> ShmResult<Pointer>;

    /// Resize an allocation, possibly moving it
    fn reallocate(&self, p: Pointer, new_size: usize) -> ShmResult<Pointer>;

    fn free(&self, p: Pointer) -> ShmResult<()>;

    /// Bytes currently handed out; used for leak checks
    fn currently_allocated_size(&self) -> usize;

    /// Whether a local address lies inside this allocator's slot
    fn contains_ptr(&self, ptr: *const u8) -> bool {
        let slot = self.slot();
        let base = slot.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + slot.size
    }
}

impl dyn Allocator {
    /// Local address of `p`; a null pointer maps to null
    pub fn convert<T>(&self, p: Pointer) -> *mut T {
        if p.is_null() {
            return std::ptr::null_mut();
        }
        unsafe { self.slot().as_ptr().add(p.offset as usize) as *mut T }
    }

    /// Inverse of [`convert`](Self::convert), `None` if `ptr` is outside the slot
    pub fn pointer_of<T>(&self, ptr: *const T) -> Option<Pointer> {
        if ptr.is_null() || !self.contains_ptr(ptr as *const u8) {
            return None;
        }
        let off = ptr as usize - self.slot().as_ptr() as usize;
        Some(Pointer::new(self.id(), off as u64))
    }

    /// Allocate room for `count` values of `T`
    pub fn allocate_ptr<T>(&self, count: usize) -> ShmResult<(Pointer, *mut T)> {
        let size = mem::size_of::<T>()
            .max(1)
            .checked_mul(count.max(1))
            .ok_or_else(|| {
                ShmError::out_of_memory(
                    "Allocator::allocate_ptr",
                    format!("{} values of {} bytes overflow usize", count, mem::size_of::<T>()),
                )
            })?;
        let p = self.allocate(size)?;
        Ok((p, self.convert(p)))
    }

    /// Caller-reserved bytes following the allocator header
    pub fn custom_header<T>(&self) -> *mut T {
        unsafe { self.slot().as_ptr().add(ALLOCATOR_HEADER_SIZE) as *mut T }
    }

    pub fn custom_header_size(&self) -> usize {
        unsafe { AllocatorHeader::from_slot(&self.slot()).custom_header_size as usize }
    }

    /// Whether `p` was issued by this allocator
    pub fn owns(&self, p: Pointer) -> bool {
        p.allocator_id == self.id() && (p.offset as usize) < self.slot().size
    }
}

/// Page allocator tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub page_size: usize,
    /// Shard count; 0 means one per CPU
    pub concurrency: usize,
    pub min_free_count: usize,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self::from(&PageConfig::default())
    }
}

impl From<&PageConfig> for PageOptions {
    fn from(config: &PageConfig) -> Self {
        Self {
            page_size: config.page_size,
            concurrency: config.effective_concurrency(),
            min_free_count: config.min_free_count,
        }
    }
}

/// Strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Stack,
    Page(PageOptions),
}

impl AllocatorKind {
    pub fn allocator_type(&self) -> AllocatorType {
        match self {
            AllocatorKind::Stack => AllocatorType::Stack,
            AllocatorKind::Page(_) => AllocatorType::Page,
        }
    }
}

/// Everything needed to initialize a new allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorOptions {
    pub kind: AllocatorKind,
    pub custom_header_size: usize,
}

impl AllocatorOptions {
    pub fn stack() -> Self {
        Self {
            kind: AllocatorKind::Stack,
            custom_header_size: 0,
        }
    }

    pub fn page(options: PageOptions) -> Self {
        Self {
            kind: AllocatorKind::Page(options),
            custom_header_size: 0,
        }
    }

    pub fn with_custom_header(mut self, size: usize) -> Self {
        self.custom_header_size = size;
        self
    }
}

/// Creates allocators in fresh slots and rebuilds them over existing ones
pub struct AllocatorFactory;

impl AllocatorFactory {
    /// Initialize a new allocator inside `slot`
    pub fn create(
        backend: Arc<dyn MemoryBackend>,
        slot: SlotInfo,
        id: AllocatorId,
        options: &AllocatorOptions,
        threads: Arc<dyn ThreadIdentity>,
    ) -> ShmResult<AllocRef> {
        let alloc: AllocRef = match options.kind {
            AllocatorKind::Stack => Arc::new(StackAllocator::create(
                backend,
                slot,
                id,
                options.custom_header_size,
            )?),
            AllocatorKind::Page(page) => Arc::new(PageAllocator::create(
                backend,
                slot,
                id,
                options.custom_header_size,
                &page,
                threads,
            )?),
        };
        log::info!(
            "Created {} allocator {} in slot {} ({} bytes)",
            options.kind.allocator_type(),
            id,
            slot.id,
            slot.size
        );
        Ok(alloc)
    }

    /// Rebuild the allocator another participant created in `slot`
    ///
    /// Returns `Ok(None)` while the slot's tag is still zero.
    pub fn attach(
        backend: Arc<dyn MemoryBackend>,
        slot: SlotInfo,
        threads: Arc<dyn ThreadIdentity>,
    ) -> ShmResult<Option<AllocRef>> {
        if slot.size < ALLOCATOR_HEADER_SIZE {
            return Err(ShmError::invalid_pointer(
                "AllocatorFactory::attach",
                format!("slot {} is too small to hold an allocator", slot.id),
            ));
        }
        let header = unsafe { AllocatorHeader::from_slot(&slot) };
        let raw = header.raw_type();
        if raw == 0 {
            return Ok(None);
        }
        let alloc: AllocRef = match AllocatorType::from_raw(raw) {
            Some(AllocatorType::Stack) => Arc::new(StackAllocator::attach(backend, slot)?),
            Some(AllocatorType::Page) => Arc::new(PageAllocator::attach(backend, slot, threads)?),
            None => {
                return Err(ShmError::not_found(
                    "AllocatorFactory::attach",
                    format!("slot {} has unknown allocator tag {}", slot.id, raw),
                ))
            }
        };
        Ok(Some(alloc))
    }
}

/// Reject pointers that this allocator did not issue
pub(crate) fn check_owned(op: &'static str, id: AllocatorId, slot: &SlotInfo, p: Pointer) -> ShmResult<()> {
    if p.allocator_id != id {
        return Err(ShmError::invalid_pointer(
            op,
            format!("{:?} belongs to allocator {}, not {}", p, p.allocator_id, id),
        ));
    }
    if p.offset as usize >= slot.size {
        return Err(ShmError::invalid_pointer(
            op,
            format!("{:?} is past the end of a {} byte slot", p, slot.size),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::memory::backend::PrivateMmapBackend;
    use crate::sync::OsThreadIdentity;

    fn slot(size: usize) -> (Arc<dyn MemoryBackend>, SlotInfo) {
        let backend: Arc<dyn MemoryBackend> =
            Arc::new(PrivateMmapBackend::new("alloc-test", &BackendConfig::default()));
        backend.create().unwrap();
        let slot = backend.create_slot(size).unwrap();
        (backend, slot)
    }

    #[test]
    fn test_unpublished_slot_is_skipped() {
        let (backend, slot) = slot(4096);
        AllocatorHeader::configure(&slot, AllocatorId::new(1, 1), 0).unwrap();
        let found = AllocatorFactory::attach(backend, slot, Arc::new(OsThreadIdentity)).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_attach_rebuilds_same_type() {
        let (backend, slot) = slot(64 * 1024);
        let id = AllocatorId::new(9, 4);
        let threads: Arc<dyn ThreadIdentity> = Arc::new(OsThreadIdentity);
        let created = AllocatorFactory::create(
            backend.clone(),
            slot,
            id,
            &AllocatorOptions::stack().with_custom_header(32),
            threads.clone(),
        )
        .unwrap();
        let p = created.allocate(100).unwrap();

        let attached = AllocatorFactory::attach(backend, slot, threads).unwrap().unwrap();
        assert_eq!(attached.id(), id);
        assert_eq!(attached.allocator_type(), AllocatorType::Stack);
        assert_eq!(attached.custom_header_size(), 32);
        assert_eq!(attached.convert::<u8>(p), created.convert::<u8>(p));
        assert_eq!(attached.currently_allocated_size(), created.currently_allocated_size());
    }

    #[test]
    fn test_convert_and_pointer_of() {
        let (backend, slot) = slot(64 * 1024);
        let alloc = AllocatorFactory::create(
            backend,
            slot,
            AllocatorId::new(1, 2),
            &AllocatorOptions::stack(),
            Arc::new(OsThreadIdentity),
        )
        .unwrap();
        let p = alloc.allocate(16).unwrap();
        let local: *mut u64 = alloc.convert(p);
        assert_eq!(alloc.pointer_of(local), Some(p));
        assert!(alloc.convert::<u8>(Pointer::NULL).is_null());
        assert!(alloc.pointer_of(&0u64 as *const u64).is_none());
        assert!(alloc.owns(p));
        assert!(!alloc.owns(Pointer::new(AllocatorId::new(1, 3), p.offset)));
    }
}
