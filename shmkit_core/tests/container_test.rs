// Container ownership rules and the concurrent map
use shmkit_core::config::MEGABYTES;
use shmkit_core::containers::{
    ContainerFlags, MapOptions, ShmBox, ShmContainer, ShmHashMap, ShmList, ShmString, ShmVec,
};
use shmkit_core::memory::{AllocRef, AllocatorId, AllocatorOptions, MemoryBackendType, MemoryManager};
use std::sync::Arc;
use std::thread;

fn stack_allocator(manager: &MemoryManager, url: &str, size: usize) -> AllocRef {
    if manager.get_backend(url).is_none() {
        manager
            .create_backend(MemoryBackendType::PrivateMmap, url)
            .unwrap();
    }
    manager
        .create_allocator(url, AllocatorId::NULL, size, &AllocatorOptions::stack())
        .unwrap()
}

#[test]
fn test_store_moves_owned_and_copies_views() {
    let manager = MemoryManager::new();
    let alloc = stack_allocator(&manager, "move-copy", 4 * MEGABYTES);

    let mut names = ShmVec::<ShmString>::new(&alloc).unwrap();
    let owned = ShmString::from_str(&alloc, "moved").unwrap();
    let header = owned.serialize();
    names.push(owned).unwrap();
    // Same allocator and owned: the header itself now belongs to the vector
    assert_eq!(names.as_stored()[0], header);

    let original = ShmString::from_str(&alloc, "viewed").unwrap();
    let view = ShmString::deserialize_in(&alloc, original.serialize());
    assert_eq!(view.handle().flags(), ContainerFlags::VIEW);
    names.push(view).unwrap();
    // Views are deep-copied, so the original stays independent
    assert_ne!(names.as_stored()[1], original.serialize());
    drop(original);
    assert_eq!(names.get(1).unwrap(), "viewed");
}

#[test]
fn test_copy_across_allocators() {
    let manager = MemoryManager::new();
    let a = stack_allocator(&manager, "cross-alloc", 2 * MEGABYTES);
    let b = stack_allocator(&manager, "cross-alloc", 2 * MEGABYTES);
    {
        let mut list = ShmList::<ShmVec<u32>>::new(&a).unwrap();
        for n in 1..4u32 {
            let mut v = ShmVec::new(&a).unwrap();
            v.resize(n as usize, n).unwrap();
            list.push_back(v).unwrap();
        }

        let copy = list.strong_copy(&b).unwrap();
        assert_eq!(copy.allocator().unwrap().id(), b.id());
        assert_eq!(copy.get(2).unwrap().to_vec(), vec![3, 3, 3]);
        assert_eq!(copy.get(0).unwrap().serialize().allocator_id, b.id());

        drop(list);
        assert_eq!(a.currently_allocated_size(), 0);
        assert_eq!(copy.len(), 3);
    }
    assert_eq!(b.currently_allocated_size(), 0);
}

#[test]
fn test_in_place_move_gets_own_header() {
    let manager = MemoryManager::new();
    let alloc = stack_allocator(&manager, "in-place", MEGABYTES);
    {
        let spot = alloc.allocate(64).unwrap();
        let mut in_place = ShmVec::<u8>::new_in_place(&alloc, spot).unwrap();
        assert_eq!(in_place.handle().flags(), ContainerFlags::IN_PLACE);
        in_place.push(9).unwrap();

        let moved = ShmVec::weak_move(&mut in_place).unwrap();
        assert!(in_place.is_null());
        assert_ne!(moved.serialize(), spot);
        assert_eq!(moved.to_vec(), vec![9]);
        alloc.free(spot).unwrap();
    }
    assert_eq!(alloc.currently_allocated_size(), 0);
}

#[test]
fn test_view_drop_leaves_container() {
    let manager = MemoryManager::new();
    let alloc = stack_allocator(&manager, "view-drop", MEGABYTES);
    let boxed = ShmBox::new(&alloc, 5u64).unwrap();
    {
        let view = ShmBox::<u64>::deserialize(&manager, boxed.serialize()).unwrap();
        assert_eq!(view.get(), 5);
    }
    assert_eq!(boxed.get(), 5);
}

#[test]
fn test_map_concurrent_disjoint_inserts() {
    let manager = MemoryManager::new();
    let alloc = stack_allocator(&manager, "map-threads", 64 * MEGABYTES);
    let map = Arc::new(ShmHashMap::<u64, u64>::new(&alloc).unwrap());

    let threads = 8u64;
    let per_thread = 256u64;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    assert!(map.emplace(key, key * 3).unwrap());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.len(), (threads * per_thread) as usize);
    for key in 0..threads * per_thread {
        assert_eq!(map.get(&key), Some(key * 3));
    }
    assert_eq!(map.entries().len(), map.len());
}

#[test]
fn test_map_grows_and_keeps_entries() {
    let manager = MemoryManager::new();
    let alloc = stack_allocator(&manager, "map-growth", 4 * MEGABYTES);
    let options = MapOptions {
        num_buckets: 20,
        max_collisions: 4,
        growth_numerator: 5,
        growth_denominator: 4,
    };
    let map = ShmHashMap::<u32, u32>::with_options(&alloc, options).unwrap();
    for i in 0..100 {
        map.emplace(i, !i).unwrap();
    }
    assert!(map.num_buckets() >= 30);
    for i in 0..100 {
        assert_eq!(map.get(&i), Some(!i));
    }
}
