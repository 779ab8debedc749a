//! # Shared memory layer for shmkit
//!
//! - **Backends**: named segments (POSIX shm), private mappings or caller
//!   regions, grown in slots
//! - **Allocators**: bump ("stack") and sharded fixed-page strategies, one per slot
//! - **Pointers**: `{allocator id, offset}` addresses valid in every process
//! - **MemoryManager**: the registry that turns pointers into local addresses
//!
//! A typical process either creates a backend and allocators in it, or
//! attaches to a backend another process created and discovers the
//! allocators already living there:
//!
//! ```no_run
//! use shmkit_core::memory::{AllocatorId, AllocatorOptions, MemoryBackendType, MemoryManager};
//!
//! let manager = MemoryManager::new();
//! manager.create_backend(MemoryBackendType::PosixShm, "/demo").unwrap();
//! let alloc = manager
//!     .create_allocator("/demo", AllocatorId::NULL, 1 << 20, &AllocatorOptions::stack())
//!     .unwrap();
//! let p = alloc.allocate(64).unwrap();
//!
//! // elsewhere
//! let other = MemoryManager::new();
//! other.attach_backend(MemoryBackendType::PosixShm, "/demo").unwrap();
//! let local: *mut u8 = other.convert(p).unwrap();
//! # let _ = local;
//! ```

pub mod allocator;
pub mod backend;
pub mod manager;
pub mod platform;
pub mod pointer;

pub use allocator::{
    AllocRef, Allocator, AllocatorFactory, AllocatorHeader, AllocatorKind, AllocatorOptions,
    AllocatorType, PageAllocator, PageId, PageOptions, StackAllocator,
};
pub use backend::{
    ArrayBackend, MemoryBackend, MemoryBackendFactory, MemoryBackendType, PrivateMmapBackend,
    SlotDescriptor, SlotId, SlotInfo, SlotKind,
};
#[cfg(unix)]
pub use backend::PosixShmBackend;
pub use manager::MemoryManager;
pub use platform::SystemInfo;
pub use pointer::{AllocatorId, Pointer, POINTER_WIRE_SIZE};
