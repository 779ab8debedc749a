//! # Shared-memory containers
//!
//! Data structures whose whole state lives in allocator slots and is linked
//! by [`Pointer`](crate::memory::Pointer) only, so that any process attached
//! to the same backend can read them:
//!
//! - **ShmVec / ShmList / ShmString**: sequences
//! - **ShmPair / ShmTuple / ShmBox**: fixed records
//! - **ShmSharedPtr**: reference-counted box
//! - **ShmHashMap**: concurrent map with per-bucket locks
//!
//! All of them follow the ownership rules of [`protocol`]: a container is
//! owned, constructed in place, or a view, and containers nest by storing
//! each other as pointers.

pub mod boxed;
pub mod hash_map;
pub mod list;
pub mod pair;
pub mod protocol;
pub mod shared_ptr;
pub mod string;
pub mod tuple;
pub mod vec;

pub use boxed::ShmBox;
pub use hash_map::{MapOptions, ShmBucket, ShmHashMap};
pub use list::{ListHeader, ShmList, ShmListIter};
pub use pair::ShmPair;
pub use protocol::{ContainerFlags, ShmContainer, ShmElement, ShmHandle};
pub use shared_ptr::{SharedPtrHeader, ShmSharedPtr};
pub use string::ShmString;
pub use tuple::{ShmTuple, ShmTupleElements};
pub use vec::{ShmVec, ShmVecIter, VecHeader};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{BackendConfig, MEGABYTES};
    use crate::memory::{
        AllocRef, AllocatorFactory, AllocatorId, AllocatorOptions, MemoryBackend,
        PageOptions, PrivateMmapBackend,
    };
    use crate::sync::OsThreadIdentity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    static NEXT_MINOR: AtomicU32 = AtomicU32::new(1);

    fn allocator(options: AllocatorOptions) -> AllocRef {
        let backend: Arc<dyn MemoryBackend> = Arc::new(PrivateMmapBackend::new(
            "container-test",
            &BackendConfig::default(),
        ));
        backend.create().unwrap();
        let slot = backend.create_slot(4 * MEGABYTES).unwrap();
        let id = AllocatorId::new(7, NEXT_MINOR.fetch_add(1, Ordering::Relaxed));
        AllocatorFactory::create(backend, slot, id, &options, Arc::new(OsThreadIdentity)).unwrap()
    }

    pub fn stack_allocator() -> AllocRef {
        allocator(AllocatorOptions::stack())
    }

    pub fn page_allocator() -> AllocRef {
        allocator(AllocatorOptions::page(PageOptions {
            page_size: 4096,
            concurrency: 4,
            min_free_count: 4,
        }))
    }
}
