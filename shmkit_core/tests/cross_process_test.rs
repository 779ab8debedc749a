// A second MemoryManager standing in for another process
#![cfg(unix)]

use shmkit_core::config::MEGABYTES;
use shmkit_core::containers::{ShmContainer, ShmHashMap, ShmSharedPtr, ShmString, ShmVec};
use shmkit_core::error::ShmError;
use shmkit_core::memory::{AllocatorId, AllocatorOptions, MemoryBackendType, MemoryManager};

fn segment_name(tag: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("/shmkit-{}-{}", tag, &id[..12])
}

#[test]
fn test_second_manager_reads_containers() {
    let url = segment_name("xproc");
    let owner = MemoryManager::new();
    owner.create_backend(MemoryBackendType::PosixShm, &url).unwrap();
    let alloc = owner
        .create_allocator(&url, AllocatorId::NULL, 4 * MEGABYTES, &AllocatorOptions::stack())
        .unwrap();

    let mut samples = ShmVec::<u32>::new(&alloc).unwrap();
    for i in 0..10 {
        samples.push(i * i).unwrap();
    }
    let names = ShmHashMap::<u64, ShmString>::new(&alloc).unwrap();
    names.emplace(1, ShmString::from_str(&alloc, "lidar").unwrap()).unwrap();
    names.emplace(2, ShmString::from_str(&alloc, "camera").unwrap()).unwrap();

    {
        let reader = MemoryManager::new();
        reader.attach_backend(MemoryBackendType::PosixShm, &url).unwrap();
        assert_eq!(reader.get_allocator(alloc.id()).unwrap().id(), alloc.id());

        let seen = ShmVec::<u32>::deserialize(&reader, samples.serialize()).unwrap();
        assert_eq!(seen.to_vec(), samples.to_vec());

        let map = ShmHashMap::<u64, ShmString>::deserialize(&reader, names.serialize()).unwrap();
        assert_eq!(map.get(&2).unwrap(), "camera");

        // Writes by the owner are visible through the reader's mapping
        samples.push(1000).unwrap();
        assert_eq!(seen.last(), Some(1000));

        // Allocators created after attaching are found on lookup
        let late = owner
            .create_allocator(&url, AllocatorId::NULL, MEGABYTES, &AllocatorOptions::stack())
            .unwrap();
        let late_vec = {
            let mut v = ShmVec::<u8>::new(&late).unwrap();
            v.push(42).unwrap();
            v
        };
        let late_view = ShmVec::<u8>::deserialize(&reader, late_vec.serialize()).unwrap();
        assert_eq!(late_view.to_vec(), vec![42]);
    }

    drop(names);
    drop(samples);
    owner.destroy_backend(&url).unwrap();
}

#[test]
fn test_shared_pointer_owned_from_two_managers() {
    let url = segment_name("shared");
    let owner = MemoryManager::new();
    owner.create_backend(MemoryBackendType::PosixShm, &url).unwrap();
    let alloc = owner
        .create_allocator(&url, AllocatorId::NULL, 2 * MEGABYTES, &AllocatorOptions::stack())
        .unwrap();

    let config = ShmSharedPtr::new(&alloc, ShmString::from_str(&alloc, "rate=100").unwrap()).unwrap();
    let published = config.serialize();

    let reader = MemoryManager::new();
    reader.attach_backend(MemoryBackendType::PosixShm, &url).unwrap();
    let held = ShmSharedPtr::<ShmString>::acquire(&reader, published).unwrap();
    assert_eq!(config.ref_count(), 2);

    // The publisher leaves; the reader's reference keeps the string alive
    drop(config);
    assert!(held.is_unique());
    assert_eq!(held.get(), "rate=100");

    drop(held);
    assert_eq!(alloc.currently_allocated_size(), 0);
    owner.destroy_backend(&url).unwrap();
}

#[test]
fn test_attach_missing_segment() {
    let manager = MemoryManager::new();
    let err = manager
        .attach_backend(MemoryBackendType::PosixShm, &segment_name("missing"))
        .unwrap_err();
    assert!(matches!(err, ShmError::BackendCreateFailed { .. }));
}
