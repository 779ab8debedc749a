//! # shmkit core
//!
//! Runtime for sharing data structures between processes through shared memory.
//!
//! - **Memory**: backends, allocators, process-independent pointers and the
//!   [`MemoryManager`] registry that resolves them
//! - **Sync**: spin locks that live inside shared memory
//! - **Containers**: vectors, lists, strings, records, a shared pointer and a
//!   concurrent hash map built on top of the allocators
//! - **Config**: TOML and environment driven defaults
//!
//! ## Quick Start
//!
//! ```no_run
//! use shmkit_core::{AllocatorId, AllocatorOptions, MemoryBackendType, MemoryManager, ShmHashMap};
//! use shmkit_core::containers::ShmContainer;
//!
//! let manager = MemoryManager::new();
//! manager.create_backend(MemoryBackendType::PosixShm, "/quickstart").unwrap();
//! let alloc = manager
//!     .create_allocator("/quickstart", AllocatorId::NULL, 16 << 20, &AllocatorOptions::stack())
//!     .unwrap();
//!
//! let map = ShmHashMap::<u64, f64>::new(&alloc).unwrap();
//! map.emplace(1, 0.5).unwrap();
//!
//! // Hand `p` to another process; it deserializes a view of the same map
//! let p = map.serialize();
//! # let _ = p;
//! ```

pub mod config;
pub mod containers;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::{MapConfig, ShmConfig};
pub use containers::{
    ShmBox, ShmContainer, ShmElement, ShmHashMap, ShmList, ShmPair, ShmSharedPtr, ShmString,
    ShmTuple, ShmVec,
};
pub use error::{ShmError, ShmResult};
pub use memory::{
    AllocRef, Allocator, AllocatorId, AllocatorOptions, AllocatorType, ArrayBackend,
    MemoryBackendType, MemoryManager, PageOptions, Pointer,
};
pub use sync::{ShmMutex, ShmRwLock};
