// Fixed-size page allocator with per-thread shards
//
// Slot layout:
//   [AllocatorHeader][custom header][PageAllocHeader][Shard; n][page bitmap][page area]
// The page area is split evenly among the shards; each shard carves pages
// from its share and recycles freed pages through its own FIFO queue. Idle
// pages migrate between shards by borrowing, which only ever holds one shard
// lock at a time. The bitmap holds one bit per page, set while the page is
// handed out.

use super::{check_owned, Allocator, AllocatorHeader, AllocatorType, PageOptions};
use crate::error::{ShmError, ShmResult};
use crate::memory::backend::{MemoryBackend, SlotInfo};
use crate::memory::platform::align_up;
use crate::memory::pointer::{AllocatorId, Pointer};
use crate::sync::{ShmMutex, ShmMutexGuard, ThreadIdentity};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Index of a page in the page area
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    pub const NONE: PageId = PageId(u64::MAX);

    pub fn index(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// FIFO of free pages; the link to the next page is kept inside each free page
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PageQueue {
    head: PageId,
    tail: PageId,
    len: u64,
}

impl PageQueue {
    const EMPTY: PageQueue = PageQueue {
        head: PageId::NONE,
        tail: PageId::NONE,
        len: 0,
    };
}

#[repr(C)]
struct ShardState {
    queue: PageQueue,
    /// Next never-used byte of this shard's share of the page area
    region_next: u64,
    region_end: u64,
}

#[repr(C, align(64))]
struct Shard {
    lock: ShmMutex,
    _pad: u32,
    state: UnsafeCell<ShardState>,
    /// Bytes this shard can still hand out (queue + uncarved region)
    free_size: AtomicU64,
    alloc_size: AtomicU64,
    freed_size: AtomicU64,
}

#[repr(C)]
#[derive(Debug)]
struct PageAllocHeader {
    page_size: u64,
    concurrency: u64,
    min_free_count: u64,
    shards_off: u64,
    bitmap_off: u64,
    area_off: u64,
    num_pages: u64,
}

/// Allocator of fixed-size pages
pub struct PageAllocator {
    backend: Arc<dyn MemoryBackend>,
    slot: SlotInfo,
    id: AllocatorId,
    threads: Arc<dyn ThreadIdentity>,
    page_size: u64,
    concurrency: usize,
    min_free_size: u64,
    area_off: u64,
    num_pages: u64,
    shards: *const Shard,
    bitmap: *const AtomicU64,
}

unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("id", &self.id)
            .field("slot", &self.slot.id)
            .field("page_size", &self.page_size)
            .field("concurrency", &self.concurrency)
            .field("num_pages", &self.num_pages)
            .finish()
    }
}

impl PageAllocator {
    pub fn create(
        backend: Arc<dyn MemoryBackend>,
        slot: SlotInfo,
        id: AllocatorId,
        custom_header_size: usize,
        options: &PageOptions,
        threads: Arc<dyn ThreadIdentity>,
    ) -> ShmResult<Self> {
        let page_size = options.page_size;
        if !page_size.is_power_of_two() || page_size < mem::size_of::<PageId>() {
            return Err(ShmError::config(format!(
                "page size {} must be a power of two of at least {} bytes",
                page_size,
                mem::size_of::<PageId>()
            )));
        }
        let concurrency = if options.concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            options.concurrency
        };

        let header_off = AllocatorHeader::internal_header_offset(custom_header_size);
        let shards_off = align_up(header_off + mem::size_of::<PageAllocHeader>(), mem::align_of::<Shard>());
        let bitmap_off = shards_off + concurrency * mem::size_of::<Shard>();
        let bitmap_words = (slot.size / page_size).div_ceil(64);
        let area_off = align_up(bitmap_off + bitmap_words * mem::size_of::<AtomicU64>(), page_size);
        let pages_per_shard = slot.size.saturating_sub(area_off) / page_size / concurrency;
        if pages_per_shard == 0 {
            return Err(ShmError::out_of_memory(
                "PageAllocator::create",
                format!(
                    "slot of {} bytes leaves less than one {} byte page per shard ({} shards)",
                    slot.size, page_size, concurrency
                ),
            ));
        }
        let shard_bytes = (pages_per_shard * page_size) as u64;

        AllocatorHeader::configure(&slot, id, custom_header_size)?;
        unsafe {
            let base = slot.as_ptr();
            (base.add(header_off) as *mut PageAllocHeader).write(PageAllocHeader {
                page_size: page_size as u64,
                concurrency: concurrency as u64,
                min_free_count: options.min_free_count as u64,
                shards_off: shards_off as u64,
                bitmap_off: bitmap_off as u64,
                area_off: area_off as u64,
                num_pages: (pages_per_shard * concurrency) as u64,
            });
            std::ptr::write_bytes(base.add(bitmap_off), 0, bitmap_words * mem::size_of::<AtomicU64>());
            let shards = base.add(shards_off) as *mut Shard;
            for i in 0..concurrency {
                let start = area_off as u64 + i as u64 * shard_bytes;
                shards.add(i).write(Shard {
                    lock: ShmMutex::new(),
                    _pad: 0,
                    state: UnsafeCell::new(ShardState {
                        queue: PageQueue::EMPTY,
                        region_next: start,
                        region_end: start + shard_bytes,
                    }),
                    free_size: AtomicU64::new(shard_bytes),
                    alloc_size: AtomicU64::new(0),
                    freed_size: AtomicU64::new(0),
                });
            }
            AllocatorHeader::from_slot(&slot).publish(AllocatorType::Page);
        }

        Self::attach(backend, slot, threads)
    }

    pub fn attach(
        backend: Arc<dyn MemoryBackend>,
        slot: SlotInfo,
        threads: Arc<dyn ThreadIdentity>,
    ) -> ShmResult<Self> {
        let alloc_header = unsafe { AllocatorHeader::from_slot(&slot) };
        let header_off = AllocatorHeader::internal_header_offset(alloc_header.custom_header_size as usize);
        let header = unsafe { &*(slot.as_ptr().add(header_off) as *const PageAllocHeader) };

        Ok(Self {
            backend,
            slot,
            id: alloc_header.allocator_id,
            threads,
            page_size: header.page_size,
            concurrency: header.concurrency as usize,
            min_free_size: header.page_size * header.min_free_count,
            area_off: header.area_off,
            num_pages: header.num_pages,
            shards: unsafe { slot.as_ptr().add(header.shards_off as usize) as *const Shard },
            bitmap: unsafe { slot.as_ptr().add(header.bitmap_off as usize) as *const AtomicU64 },
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size as usize
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages as usize
    }

    /// Bytes still available across all shards
    pub fn free_size(&self) -> usize {
        (0..self.concurrency)
            .map(|i| self.shard(i).free_size.load(Ordering::Relaxed))
            .sum::<u64>() as usize
    }

    fn shard(&self, idx: usize) -> &Shard {
        unsafe { &*self.shards.add(idx) }
    }

    fn page_off(&self, id: PageId) -> u64 {
        self.area_off + id.0 * self.page_size
    }

    fn page_id(&self, off: u64) -> PageId {
        PageId((off - self.area_off) / self.page_size)
    }

    /// Set or clear the allocated bit of `id`, returning its previous value
    fn mark(&self, id: PageId, allocated: bool) -> bool {
        let word = unsafe { &*self.bitmap.add((id.0 / 64) as usize) };
        let mask = 1u64 << (id.0 % 64);
        let prev = if allocated {
            word.fetch_or(mask, Ordering::AcqRel)
        } else {
            word.fetch_and(!mask, Ordering::AcqRel)
        };
        prev & mask != 0
    }

    fn link(&self, id: PageId) -> *mut PageId {
        unsafe { self.slot.as_ptr().add(self.page_off(id) as usize) as *mut PageId }
    }

    fn push(&self, queue: &mut PageQueue, id: PageId) {
        unsafe { self.link(id).write(PageId::NONE) };
        if queue.tail.is_none() {
            queue.head = id;
        } else {
            unsafe { self.link(queue.tail).write(id) };
        }
        queue.tail = id;
        queue.len += 1;
    }

    fn pop(&self, queue: &mut PageQueue) -> Option<PageId> {
        if queue.head.is_none() {
            return None;
        }
        let id = queue.head;
        queue.head = unsafe { self.link(id).read() };
        if queue.head.is_none() {
            queue.tail = PageId::NONE;
        }
        queue.len -= 1;
        Some(id)
    }

    /// Append every page of `chain` to `queue`
    fn splice(&self, queue: &mut PageQueue, chain: PageQueue) {
        if chain.len == 0 {
            return;
        }
        if queue.tail.is_none() {
            queue.head = chain.head;
        } else {
            unsafe { self.link(queue.tail).write(chain.head) };
        }
        queue.tail = chain.tail;
        queue.len += chain.len;
    }

    /// Recycled page first, else carve from the shard's region. Caller holds the shard lock.
    fn take_free_page(&self, state: &mut ShardState) -> Option<PageId> {
        if let Some(id) = self.pop(&mut state.queue) {
            return Some(id);
        }
        if state.region_next + self.page_size <= state.region_end {
            let off = state.region_next;
            state.region_next += self.page_size;
            return Some(self.page_id(off));
        }
        None
    }

    fn take_locked(&self, shard: &Shard, _guard: &ShmMutexGuard<'_>) -> Option<PageId> {
        let state = unsafe { &mut *shard.state.get() };
        let id = self.take_free_page(state)?;
        shard.free_size.fetch_sub(self.page_size, Ordering::Relaxed);
        shard.alloc_size.fetch_add(self.page_size, Ordering::Relaxed);
        Some(id)
    }

    fn try_shard(&self, idx: usize, tid: usize, blocking: bool) -> Option<PageId> {
        let shard = self.shard(idx);
        if shard.free_size.load(Ordering::Relaxed) < self.page_size {
            return None;
        }
        let guard = if blocking {
            shard.lock.lock_with(&*self.threads)
        } else {
            shard.lock.try_lock()?
        };
        if let Some(id) = self.take_locked(shard, &guard) {
            return Some(id);
        }
        drop(guard);

        if self.borrow(idx, tid, false) {
            let guard = shard.lock.lock_with(&*self.threads);
            return self.take_locked(shard, &guard);
        }
        None
    }

    /// Move idle pages from other shards into `target`
    ///
    /// Takes half the free pages of the first shard holding at least
    /// `min_free_size` bytes. In append mode keeps going through every shard.
    fn borrow(&self, target: usize, tid: usize, append: bool) -> bool {
        let n = self.concurrency;
        let mut moved = 0u64;

        for i in 1..=n {
            let src_idx = (tid + i) % n;
            if src_idx == target {
                continue;
            }
            let src = self.shard(src_idx);
            if src.free_size.load(Ordering::Relaxed) < self.min_free_size.max(self.page_size) {
                continue;
            }

            let mut chain = PageQueue::EMPTY;
            {
                let _guard = src.lock.lock_with(&*self.threads);
                let free = src.free_size.load(Ordering::Relaxed);
                if free < self.min_free_size.max(self.page_size) {
                    continue;
                }
                let state = unsafe { &mut *src.state.get() };
                let want = (free / self.page_size / 2).max(1);
                while chain.len < want {
                    match self.take_free_page(state) {
                        Some(id) => self.push(&mut chain, id),
                        None => break,
                    }
                }
                src.free_size.fetch_sub(chain.len * self.page_size, Ordering::Relaxed);
            }
            if chain.len == 0 {
                continue;
            }

            let dst = self.shard(target);
            {
                let _guard = dst.lock.lock_with(&*self.threads);
                let state = unsafe { &mut *dst.state.get() };
                self.splice(&mut state.queue, chain);
                dst.free_size.fetch_add(chain.len * self.page_size, Ordering::Relaxed);
            }
            log::debug!(
                "allocator {}: shard {} lent {} page(s) to shard {}",
                self.id,
                src_idx,
                chain.len,
                target
            );
            moved += chain.len;
            if !append {
                break;
            }
        }
        moved > 0
    }

    fn check_page(&self, op: &'static str, p: Pointer) -> ShmResult<PageId> {
        check_owned(op, self.id, &self.slot, p)?;
        let end = self.area_off + self.num_pages * self.page_size;
        if p.offset < self.area_off || p.offset >= end || (p.offset - self.area_off) % self.page_size != 0 {
            return Err(ShmError::invalid_pointer(
                op,
                format!("{:?} is not a page of allocator {}", p, self.id),
            ));
        }
        Ok(self.page_id(p.offset))
    }
}

impl Allocator for PageAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn allocator_type(&self) -> AllocatorType {
        AllocatorType::Page
    }

    fn slot(&self) -> SlotInfo {
        self.slot
    }

    fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    fn allocate(&self, size: usize) -> ShmResult<Pointer> {
        if size as u64 > self.page_size {
            return Err(ShmError::page_size_unsupported(
                "PageAllocator::allocate",
                format!("{} bytes requested, pages are {} bytes", size, self.page_size),
            ));
        }
        let tid = self.threads.tid() as usize;
        let n = self.concurrency;

        // The retry pass blocks on shard locks instead of skipping busy shards
        for pass in 0..2 {
            for i in 0..n {
                if let Some(id) = self.try_shard((tid + i) % n, tid, pass > 0) {
                    self.mark(id, true);
                    return Ok(Pointer::new(self.id, self.page_off(id)));
                }
            }
            if pass == 0 {
                self.borrow(n - 1, tid, true);
            }
        }

        Err(ShmError::out_of_memory(
            "PageAllocator::allocate",
            format!("allocator {} has no free {} byte page", self.id, self.page_size),
        ))
    }

    fn aligned_allocate(&self, _size: usize, _alignment: usize) -> ShmResult<Pointer> {
        Err(ShmError::aligned_alloc_unsupported(
            "PageAllocator::aligned_allocate",
            "pages are only aligned to the page size",
        ))
    }

    fn reallocate(&self, p: Pointer, new_size: usize) -> ShmResult<Pointer> {
        if new_size as u64 > self.page_size {
            return Err(ShmError::page_size_unsupported(
                "PageAllocator::reallocate",
                format!("{} bytes requested, pages are {} bytes", new_size, self.page_size),
            ));
        }
        self.check_page("PageAllocator::reallocate", p)?;
        Ok(p)
    }

    fn free(&self, p: Pointer) -> ShmResult<()> {
        let id = self.check_page("PageAllocator::free", p)?;
        if !self.mark(id, false) {
            return Err(ShmError::double_free(
                "PageAllocator::free",
                format!("{:?} is not allocated", p),
            ));
        }
        let n = self.concurrency;
        let home = self.threads.tid() as usize % n;

        let (shard, guard) = match self.shard(home).lock.try_lock() {
            Some(guard) => (self.shard(home), guard),
            None => (0..n)
                .map(|i| self.shard(i))
                .find_map(|shard| shard.lock.try_lock().map(|guard| (shard, guard)))
                .unwrap_or_else(|| {
                    let shard = self.shard(home);
                    (shard, shard.lock.lock_with(&*self.threads))
                }),
        };

        let state = unsafe { &mut *shard.state.get() };
        self.push(&mut state.queue, id);
        shard.free_size.fetch_add(self.page_size, Ordering::Relaxed);
        shard.freed_size.fetch_add(self.page_size, Ordering::Relaxed);
        drop(guard);
        Ok(())
    }

    fn currently_allocated_size(&self) -> usize {
        let (alloc, freed) = (0..self.concurrency).fold((0u64, 0u64), |(a, f), i| {
            let shard = self.shard(i);
            (
                a + shard.alloc_size.load(Ordering::Relaxed),
                f + shard.freed_size.load(Ordering::Relaxed),
            )
        });
        alloc.saturating_sub(freed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::memory::backend::PrivateMmapBackend;
    use crate::sync::OsThreadIdentity;
    use std::collections::HashSet;

    fn page_alloc(slot_size: usize, options: PageOptions) -> ShmResult<PageAllocator> {
        let backend: Arc<dyn MemoryBackend> =
            Arc::new(PrivateMmapBackend::new("page-test", &BackendConfig::default()));
        backend.create().unwrap();
        let slot = backend.create_slot(slot_size).unwrap();
        PageAllocator::create(
            backend,
            slot,
            AllocatorId::new(3, 1),
            0,
            &options,
            Arc::new(OsThreadIdentity),
        )
    }

    fn options(concurrency: usize) -> PageOptions {
        PageOptions {
            page_size: 4096,
            concurrency,
            min_free_count: 4,
        }
    }

    #[test]
    fn test_pages_distinct_and_aligned() {
        let alloc = page_alloc(1 << 20, options(2)).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let p = alloc.allocate(4096).unwrap();
            assert!(seen.insert(p.offset));
        }
        let mut offsets: Vec<u64> = seen.into_iter().collect();
        offsets.sort();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 4096);
        }
        assert!(offsets.iter().all(|off| (off - offsets[0]) % 4096 == 0));
    }

    #[test]
    fn test_oversized_requests_rejected() {
        let alloc = page_alloc(1 << 20, options(1)).unwrap();
        assert!(matches!(
            alloc.allocate(4097),
            Err(ShmError::PageSizeUnsupported { .. })
        ));
        let p = alloc.allocate(10).unwrap();
        assert_eq!(alloc.reallocate(p, 4096).unwrap(), p);
        assert!(matches!(
            alloc.reallocate(p, 8192),
            Err(ShmError::PageSizeUnsupported { .. })
        ));
        assert!(matches!(
            alloc.aligned_allocate(64, 64),
            Err(ShmError::AlignedAllocUnsupported { .. })
        ));
    }

    #[test]
    fn test_free_validates_pointer() {
        let alloc = page_alloc(1 << 20, options(1)).unwrap();
        let p = alloc.allocate(4096).unwrap();
        assert!(matches!(alloc.free(p + 8), Err(ShmError::InvalidPointer { .. })));
        assert!(matches!(
            alloc.free(Pointer::new(AllocatorId::new(0, 0), p.offset)),
            Err(ShmError::InvalidPointer { .. })
        ));
        alloc.free(p).unwrap();
        assert_eq!(alloc.currently_allocated_size(), 0);
    }

    #[test]
    fn test_double_free_rejected() {
        let alloc = page_alloc(1 << 20, options(1)).unwrap();
        let a = alloc.allocate(4096).unwrap();
        alloc.free(a).unwrap();
        assert!(matches!(alloc.free(a), Err(ShmError::DoubleFree { .. })));

        // The queue holds `a` once, so two allocations get two pages
        let x = alloc.allocate(4096).unwrap();
        let y = alloc.allocate(4096).unwrap();
        assert_ne!(x, y);
        assert_eq!(alloc.currently_allocated_size(), 2 * 4096);

        let never = Pointer::new(alloc.id(), x.offset.max(y.offset) + 4096);
        assert!(matches!(alloc.free(never), Err(ShmError::DoubleFree { .. })));
    }

    #[test]
    fn test_attached_view_shares_allocated_bits() {
        let alloc = page_alloc(1 << 20, options(2)).unwrap();
        let p = alloc.allocate(100).unwrap();
        let other = PageAllocator::attach(
            alloc.backend().clone(),
            alloc.slot(),
            Arc::new(OsThreadIdentity),
        )
        .unwrap();
        other.free(p).unwrap();
        assert!(matches!(alloc.free(p), Err(ShmError::DoubleFree { .. })));
    }

    #[test]
    fn test_tiny_slot_rejected() {
        let err = page_alloc(4096, options(4)).unwrap_err();
        assert!(matches!(err, ShmError::OutOfMemory { .. }));
    }

    #[test]
    fn test_exhaustion_uses_every_shard() {
        let alloc = page_alloc(256 * 1024, options(4)).unwrap();
        let total = alloc.num_pages();
        let pages: Vec<Pointer> = (0..total).map(|_| alloc.allocate(4096).unwrap()).collect();
        assert!(matches!(alloc.allocate(1), Err(ShmError::OutOfMemory { .. })));
        assert_eq!(alloc.currently_allocated_size(), total * 4096);
        for p in pages {
            alloc.free(p).unwrap();
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
        assert_eq!(alloc.free_size(), total * 4096);
    }

    #[test]
    fn test_borrow_moves_half() {
        let alloc = page_alloc(1 << 20, options(2)).unwrap();
        let before = alloc.shard(1).free_size.load(Ordering::Relaxed);
        assert!(alloc.borrow(0, 0, false));
        let after = alloc.shard(1).free_size.load(Ordering::Relaxed);
        assert_eq!(after, before - (before / 4096 / 2) * 4096);
        assert_eq!(alloc.free_size(), alloc.num_pages() * 4096);
    }

    #[test]
    fn test_freed_pages_recycled_fifo() {
        let alloc = page_alloc(1 << 20, options(1)).unwrap();
        let a = alloc.allocate(4096).unwrap();
        let b = alloc.allocate(4096).unwrap();
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        // Region is not exhausted, so the queue is consulted first
        assert_eq!(alloc.allocate(4096).unwrap(), a);
        assert_eq!(alloc.allocate(4096).unwrap(), b);
    }

    #[test]
    fn test_threads_leak_free() {
        let alloc = page_alloc(4 << 20, options(4)).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let alloc = &alloc;
                s.spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..1024 {
                        held.push(alloc.allocate(4096).unwrap());
                        if i % 4 == 3 {
                            for p in held.drain(..) {
                                alloc.free(p).unwrap();
                            }
                        }
                    }
                });
            }
        });
        assert_eq!(alloc.currently_allocated_size(), 0);
        assert_eq!(alloc.free_size(), alloc.num_pages() * 4096);
    }
}
