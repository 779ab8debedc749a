// Allocator behavior through the MemoryManager
use shmkit_core::config::MEGABYTES;
use shmkit_core::error::ShmError;
use shmkit_core::memory::{
    AllocRef, AllocatorId, AllocatorOptions, MemoryBackendType, MemoryManager, PageOptions, Pointer,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn manager_with(url: &str) -> MemoryManager {
    let manager = MemoryManager::new();
    manager
        .create_backend(MemoryBackendType::PrivateMmap, url)
        .unwrap();
    manager
}

fn page_options(concurrency: usize) -> AllocatorOptions {
    AllocatorOptions::page(PageOptions {
        page_size: 4096,
        concurrency,
        min_free_count: 4,
    })
}

#[test]
fn test_address_bijection() {
    let manager = manager_with("bijection");
    let stack = manager
        .create_allocator("bijection", AllocatorId::NULL, MEGABYTES, &AllocatorOptions::stack())
        .unwrap();
    let pages = manager
        .create_allocator("bijection", AllocatorId::NULL, 4 * MEGABYTES, &page_options(2))
        .unwrap();

    for alloc in [&stack, &pages] {
        for size in [1, 24, 100, 4000] {
            let p = alloc.allocate(size).unwrap();
            let local: *mut u8 = manager.convert(p).unwrap();
            assert!(!local.is_null());
            assert_eq!(manager.convert_ptr(local as *const u8).unwrap(), p);
            assert_eq!(alloc.convert::<u8>(p), local);
        }
    }

    assert!(manager.convert::<u8>(Pointer::NULL).unwrap().is_null());
    assert_eq!(manager.convert_ptr::<u8>(std::ptr::null()).unwrap(), Pointer::NULL);

    let outside = 0u64;
    assert!(matches!(
        manager.convert_ptr(&outside as *const u64),
        Err(ShmError::NotFound { .. })
    ));
}

#[test]
fn test_live_allocations_do_not_overlap() {
    let manager = manager_with("overlap");
    let alloc = manager
        .create_allocator("overlap", AllocatorId::NULL, 4 * MEGABYTES, &AllocatorOptions::stack())
        .unwrap();

    let mut ranges = Vec::new();
    for i in 0..200usize {
        let size = 1 + (i * 37) % 500;
        let p = alloc.allocate(size).unwrap();
        ranges.push((p.offset, p.offset + size as u64));
        if i % 3 == 0 {
            let (start, _) = ranges.pop().unwrap();
            alloc
                .free(Pointer::new(alloc.id(), start))
                .unwrap();
        }
    }
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

#[test]
fn test_stack_double_free() {
    let manager = manager_with("double-free");
    let alloc = manager
        .create_allocator("double-free", AllocatorId::NULL, MEGABYTES, &AllocatorOptions::stack())
        .unwrap();

    let p = alloc.allocate(64).unwrap();
    alloc.free(p).unwrap();
    assert!(matches!(alloc.free(p), Err(ShmError::DoubleFree { .. })));
}

#[test]
fn test_page_recycling_within_first_round() {
    // 1024 pages of 4 KB do not fit a 1 MB backend, so the slot is 8 MB
    let manager = manager_with("page-scenario");
    let alloc = manager
        .create_allocator("page-scenario", AllocatorId::NULL, 8 * MEGABYTES, &page_options(1))
        .unwrap();

    let first: Vec<Pointer> = (0..1024).map(|_| alloc.allocate(4096).unwrap()).collect();
    let distinct: HashSet<u64> = first.iter().map(|p| p.offset).collect();
    assert_eq!(distinct.len(), 1024);

    let mut offsets: Vec<u64> = first.iter().map(|p| p.offset).collect();
    offsets.sort();
    for pair in offsets.windows(2) {
        assert!(pair[1] - pair[0] >= 4096);
    }
    let (min, max) = (offsets[0], offsets[1023]);

    for p in &first {
        alloc.free(*p).unwrap();
    }
    assert_eq!(alloc.currently_allocated_size(), 0);

    for _ in 0..1024 {
        let p = alloc.allocate(4096).unwrap();
        assert!(p.offset >= min && p.offset <= max);
    }
}

#[test]
fn test_page_allocator_threads_leak_free() {
    let manager = manager_with("page-threads");
    let alloc: AllocRef = manager
        .create_allocator("page-threads", AllocatorId::NULL, 16 * MEGABYTES, &page_options(8))
        .unwrap();

    let handles: Vec<_> = (0..8u8)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || {
                for _ in 0..16 {
                    let live: Vec<Pointer> = (0..64).map(|_| alloc.allocate(4096).unwrap()).collect();
                    for p in &live {
                        unsafe { alloc.convert::<u8>(*p).write_bytes(t, 4096) };
                    }
                    for p in &live {
                        let page = unsafe { std::slice::from_raw_parts(alloc.convert::<u8>(*p), 4096) };
                        assert!(page.iter().all(|b| *b == t));
                        alloc.free(*p).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(alloc.currently_allocated_size(), 0);
}

#[test]
fn test_oversized_page_request() {
    let manager = manager_with("page-oversized");
    let alloc = manager
        .create_allocator("page-oversized", AllocatorId::NULL, MEGABYTES, &page_options(1))
        .unwrap();
    assert!(matches!(
        alloc.allocate(4097),
        Err(ShmError::PageSizeUnsupported { .. })
    ));
}
