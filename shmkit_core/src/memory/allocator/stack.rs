// Bump allocator: every allocation advances one shared offset
//
// Freed memory is never handed out again. Each allocation is prefixed with a
// PageHeader so frees can be checked and accounted.

use super::{check_owned, AllocRef, Allocator, AllocatorHeader, AllocatorType};
use crate::error::{ShmError, ShmResult};
use crate::memory::backend::{MemoryBackend, SlotInfo};
use crate::memory::platform::align_up;
use crate::memory::pointer::{AllocatorId, Pointer};
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[repr(C)]
#[derive(Debug)]
struct StackHeader {
    /// Next free offset in the slot
    region_off: AtomicU64,
    /// One past the last usable offset
    region_end: u64,
    total_alloc: AtomicU64,
}

/// Header in front of every bump allocation
#[repr(C)]
#[derive(Debug)]
pub struct PageHeader {
    allocated: AtomicU32,
    _pad: u32,
    /// Bytes consumed by the allocation, header included
    pub page_size: u64,
    /// Offset of this header inside the slot
    pub off: u64,
}

const PAGE_HEADER_SIZE: usize = mem::size_of::<PageHeader>();

#[derive(Debug)]
pub struct StackAllocator {
    backend: Arc<dyn MemoryBackend>,
    slot: SlotInfo,
    id: AllocatorId,
    header: *const StackHeader,
}

// The header points into the slot, which the backend keeps mapped
unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
    pub fn create(
        backend: Arc<dyn MemoryBackend>,
        slot: SlotInfo,
        id: AllocatorId,
        custom_header_size: usize,
    ) -> ShmResult<Self> {
        let header_off = AllocatorHeader::internal_header_offset(custom_header_size);
        let region_off = align_up(header_off + mem::size_of::<StackHeader>(), 8);
        if region_off >= slot.size {
            return Err(ShmError::out_of_memory(
                "StackAllocator::create",
                format!("slot of {} bytes cannot hold the allocator headers", slot.size),
            ));
        }

        AllocatorHeader::configure(&slot, id, custom_header_size)?;
        let header = unsafe { slot.as_ptr().add(header_off) as *mut StackHeader };
        unsafe {
            header.write(StackHeader {
                region_off: AtomicU64::new(region_off as u64),
                region_end: slot.size as u64,
                total_alloc: AtomicU64::new(0),
            });
            AllocatorHeader::from_slot(&slot).publish(AllocatorType::Stack);
        }

        Ok(Self {
            backend,
            slot,
            id,
            header,
        })
    }

    pub fn attach(backend: Arc<dyn MemoryBackend>, slot: SlotInfo) -> ShmResult<Self> {
        let alloc_header = unsafe { AllocatorHeader::from_slot(&slot) };
        let header_off = AllocatorHeader::internal_header_offset(alloc_header.custom_header_size as usize);
        let header = unsafe { slot.as_ptr().add(header_off) as *const StackHeader };
        Ok(Self {
            backend,
            slot,
            id: alloc_header.allocator_id,
            header,
        })
    }

    fn header(&self) -> &StackHeader {
        unsafe { &*self.header }
    }

    fn page_header(&self, p: Pointer) -> ShmResult<&PageHeader> {
        check_owned("StackAllocator::free", self.id, &self.slot, p)?;
        let off = p.offset as usize;
        if off < PAGE_HEADER_SIZE || off % 8 != 0 {
            return Err(ShmError::invalid_pointer(
                "StackAllocator::free",
                format!("{:?} is not an allocation start", p),
            ));
        }
        let page = unsafe { &*(self.slot.as_ptr().add(off - PAGE_HEADER_SIZE) as *const PageHeader) };
        if page.off as usize != off - PAGE_HEADER_SIZE {
            return Err(ShmError::invalid_pointer(
                "StackAllocator::free",
                format!("{:?} is not an allocation start", p),
            ));
        }
        Ok(page)
    }

    /// Usable bytes left before the region is exhausted
    pub fn remaining(&self) -> usize {
        let header = self.header();
        (header.region_end - header.region_off.load(Ordering::Relaxed)) as usize
    }

    pub fn into_ref(self) -> AllocRef {
        Arc::new(self)
    }
}

impl Allocator for StackAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::Stack
    }

    fn slot(&self) -> SlotInfo {
        self.slot
    }

    fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    fn allocate(&self, size: usize) -> ShmResult<Pointer> {
        let header = self.header();
        let total = size
            .checked_add(PAGE_HEADER_SIZE + 7)
            .map(|padded| (padded & !7) as u64)
            .ok_or_else(|| {
                ShmError::out_of_memory(
                    "StackAllocator::allocate",
                    format!("{} bytes requested, allocator {} cannot address that much", size, self.id),
                )
            })?;

        let mut cur = header.region_off.load(Ordering::Relaxed);
        loop {
            if cur.checked_add(total).map_or(true, |end| end > header.region_end) {
                return Err(ShmError::out_of_memory(
                    "StackAllocator::allocate",
                    format!(
                        "{} bytes requested, {} left in allocator {}",
                        size,
                        header.region_end - cur,
                        self.id
                    ),
                ));
            }
            match header.region_off.compare_exchange_weak(
                cur,
                cur + total,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        unsafe {
            (self.slot.as_ptr().add(cur as usize) as *mut PageHeader).write(PageHeader {
                allocated: AtomicU32::new(1),
                _pad: 0,
                page_size: total,
                off: cur,
            });
        }
        header.total_alloc.fetch_add(total, Ordering::Relaxed);
        Ok(Pointer::new(self.id, cur + PAGE_HEADER_SIZE as u64))
    }

    fn aligned_allocate(&self, _size: usize, _alignment: usize) -> ShmResult<Pointer> {
        Err(ShmError::aligned_alloc_unsupported(
            "StackAllocator::aligned_allocate",
            "the stack allocator only bump-allocates",
        ))
    }

    fn reallocate(&self, p: Pointer, new_size: usize) -> ShmResult<Pointer> {
        let old = self.page_header(p)?;
        let old_len = old.page_size as usize - PAGE_HEADER_SIZE;
        let new_p = self.allocate(new_size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.slot.as_ptr().add(p.offset as usize),
                self.slot.as_ptr().add(new_p.offset as usize),
                old_len.min(new_size),
            );
        }
        self.free(p)?;
        Ok(new_p)
    }

    fn free(&self, p: Pointer) -> ShmResult<()> {
        let page = self.page_header(p)?;
        if page.allocated.swap(0, Ordering::AcqRel) == 0 {
            return Err(ShmError::double_free(
                "StackAllocator::free",
                format!("{:?} was already freed", p),
            ));
        }
        self.header().total_alloc.fetch_sub(page.page_size, Ordering::Relaxed);
        Ok(())
    }

    fn currently_allocated_size(&self) -> usize {
        self.header().total_alloc.load(Ordering::Relaxed) as usize
    }
}
