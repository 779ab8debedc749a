//! # shmkit
//!
//! Allocators and data structures that live in shared memory and can be
//! used from several processes at once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shmkit::prelude::*;
//!
//! fn main() -> AnyResult<()> {
//!     let manager = MemoryManager::new();
//!     manager.create_backend(MemoryBackendType::PosixShm, "/sensors")?;
//!     let alloc = manager.create_allocator(
//!         "/sensors",
//!         AllocatorId::NULL,
//!         64 << 20,
//!         &AllocatorOptions::page(PageOptions::default()),
//!     )?;
//!
//!     let mut readings = ShmVec::<f32>::new(&alloc)?;
//!     readings.push(0.25)?;
//!
//!     // Another process calls ShmVec::<f32>::deserialize(&manager, p)
//!     let p = readings.serialize();
//!     println!("readings at {:?}", p);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **POSIX shared memory** segments grown slot by slot
//! - **Stack and page allocators** addressed by process-independent pointers
//! - **Containers** with explicit owned / in-place / view semantics
//! - **Concurrent hash map** with per-bucket locks

pub use shmkit_core::{self, *};

/// The shmkit prelude - everything you need to get started
pub mod prelude {
    // Memory layer
    pub use shmkit_core::memory::{
        AllocRef, Allocator, AllocatorId, AllocatorOptions, AllocatorType, MemoryBackendType,
        MemoryManager, PageOptions, Pointer,
    };

    // Containers
    pub use shmkit_core::containers::{
        MapOptions, ShmBox, ShmContainer, ShmElement, ShmHashMap, ShmList, ShmPair, ShmString,
        ShmTuple, ShmVec,
    };

    // Locks
    pub use shmkit_core::sync::{ShmMutex, ShmRwLock};

    // Configuration
    pub use shmkit_core::config::ShmConfig;

    // Error types
    pub use shmkit_core::error::{ShmError, ShmResult};
    pub type Result<T> = ShmResult<T>;

    // Common std types
    pub use std::sync::Arc;

    // Common traits
    pub use serde::{Deserialize, Serialize};

    // Re-export anyhow for error handling
    pub use anyhow::{anyhow, bail, ensure, Context, Result as AnyResult};

    pub use shmkit_core::impl_shm_pod;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get shmkit version
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
    }
}
