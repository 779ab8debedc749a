// Process-local registry of backends and allocators
//
// A MemoryManager is the runtime context everything else is handed: it maps
// backend URLs to open backends and allocator ids to live allocators, and it
// resolves Pointers to local addresses and back.

use super::allocator::{AllocRef, AllocatorFactory, AllocatorOptions, PageOptions};
use super::backend::{MemoryBackend, MemoryBackendFactory, MemoryBackendType, SlotId};
use super::platform::SystemInfo;
use super::pointer::{AllocatorId, Pointer};
use crate::config::ShmConfig;
use crate::error::{ShmError, ShmResult};
use crate::sync::{OsThreadIdentity, ThreadIdentity};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// Shared by every manager in the process so generated ids never collide
static NEXT_MINOR: AtomicU32 = AtomicU32::new(0);

/// Registry of backends and allocators for one process
pub struct MemoryManager {
    config: ShmConfig,
    system: SystemInfo,
    threads: Arc<dyn ThreadIdentity>,
    backends: RwLock<HashMap<String, Arc<dyn MemoryBackend>>>,
    allocators: RwLock<HashMap<AllocatorId, AllocRef>>,
    /// (backend url, slot id) pairs already turned into allocators
    known_slots: Mutex<HashSet<(String, SlotId)>>,
    default_allocator: RwLock<Option<AllocRef>>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("system", &self.system)
            .field("backends", &self.backends.read().keys().collect::<Vec<_>>())
            .field("allocators", &self.allocators.read().len())
            .finish()
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::with_config(ShmConfig::default())
    }

    pub fn with_config(config: ShmConfig) -> Self {
        Self::with_thread_identity(config, Arc::new(OsThreadIdentity))
    }

    /// Use a custom thread-identity service (e.g. worker ids of a runtime)
    pub fn with_thread_identity(config: ShmConfig, threads: Arc<dyn ThreadIdentity>) -> Self {
        Self {
            config,
            system: SystemInfo::current(),
            threads,
            backends: RwLock::new(HashMap::new()),
            allocators: RwLock::new(HashMap::new()),
            known_slots: Mutex::new(HashSet::new()),
            default_allocator: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system
    }

    pub fn thread_identity(&self) -> &Arc<dyn ThreadIdentity> {
        &self.threads
    }

    /// `<url_prefix>_<pid>`
    pub fn default_backend_url(&self) -> String {
        format!("{}_{}", self.config.backend.url_prefix, self.system.pid)
    }

    // ---- backends -------------------------------------------------------

    /// Create a new segment and register it under `url`
    pub fn create_backend(
        &self,
        backend_type: MemoryBackendType,
        url: &str,
    ) -> ShmResult<Arc<dyn MemoryBackend>> {
        let mut backends = self.backends.write();
        if backends.contains_key(url) {
            return Err(ShmError::backend_create_failed(
                "MemoryManager::create_backend",
                format!("{} is already registered", url),
            ));
        }
        let backend = MemoryBackendFactory::get(backend_type, url, &self.config.backend)?;
        backend.create()?;
        backends.insert(url.to_string(), backend.clone());
        Ok(backend)
    }

    /// Register a backend built outside the factory, e.g. an
    /// [`ArrayBackend`](super::backend::ArrayBackend) over a caller region
    ///
    /// The backend must already be created or attached.
    pub fn register_backend(&self, backend: Arc<dyn MemoryBackend>) -> ShmResult<()> {
        let mut backends = self.backends.write();
        if backends.contains_key(backend.url()) {
            return Err(ShmError::backend_create_failed(
                "MemoryManager::register_backend",
                format!("{} is already registered", backend.url()),
            ));
        }
        log::debug!("Registered {} backend {}", backend.backend_type(), backend.url());
        backends.insert(backend.url().to_string(), backend);
        Ok(())
    }

    /// Attach a segment created elsewhere and pick up its allocators
    pub fn attach_backend(
        &self,
        backend_type: MemoryBackendType,
        url: &str,
    ) -> ShmResult<Arc<dyn MemoryBackend>> {
        if let Some(existing) = self.get_backend(url) {
            self.scan_backends()?;
            return Ok(existing);
        }
        let backend = MemoryBackendFactory::get(backend_type, url, &self.config.backend)?;
        backend.attach().map_err(|e| match e {
            e @ ShmError::BackendCreateFailed { .. } => e,
            other => ShmError::backend_create_failed("MemoryManager::attach_backend", other.to_string()),
        })?;
        self.backends.write().insert(url.to_string(), backend.clone());
        self.scan_backends()?;
        Ok(backend)
    }

    pub fn get_backend(&self, url: &str) -> Option<Arc<dyn MemoryBackend>> {
        self.backends.read().get(url).cloned()
    }

    /// Unlink the segment and forget it together with its allocators
    pub fn destroy_backend(&self, url: &str) -> ShmResult<()> {
        let backend = self.backends.write().remove(url).ok_or_else(|| {
            ShmError::not_found("MemoryManager::destroy_backend", format!("no backend named {}", url))
        })?;

        self.allocators
            .write()
            .retain(|_, alloc| alloc.backend().url() != url);
        self.known_slots.lock().retain(|(slot_url, _)| slot_url != url);
        {
            let mut default = self.default_allocator.write();
            if default.as_ref().map_or(false, |alloc| alloc.backend().url() == url) {
                *default = None;
            }
        }
        backend.destroy()
    }

    // ---- allocators -----------------------------------------------------

    /// Carve a slot out of backend `url` and build an allocator in it
    ///
    /// A null `id` is replaced by `{pid, next sequence number}`.
    pub fn create_allocator(
        &self,
        url: &str,
        id: AllocatorId,
        slot_size: usize,
        options: &AllocatorOptions,
    ) -> ShmResult<AllocRef> {
        let backend = self.get_backend(url).ok_or_else(|| {
            ShmError::not_found("MemoryManager::create_allocator", format!("no backend named {}", url))
        })?;
        let id = if id.is_null() {
            AllocatorId::new(self.system.pid, NEXT_MINOR.fetch_add(1, Ordering::Relaxed))
        } else {
            id
        };

        // Held until the allocator is registered so the id cannot be claimed twice
        let mut allocators = self.allocators.write();
        if allocators.contains_key(&id) {
            return Err(ShmError::allocator_exists(
                "MemoryManager::create_allocator",
                format!("allocator {} is already registered", id),
            ));
        }

        let slot = backend.create_slot(slot_size)?;
        let alloc = AllocatorFactory::create(backend, slot, id, options, self.threads.clone())
            .map_err(|e| {
                log::warn!("{}: slot {} left unused, allocator {} failed: {}", url, slot.id, id, e);
                e
            })?;
        allocators.insert(id, alloc.clone());
        self.known_slots.lock().insert((url.to_string(), slot.id));
        drop(allocators);

        self.adopt_default(&alloc);
        Ok(alloc)
    }

    /// Create a backend at [`default_backend_url`](Self::default_backend_url)
    /// if needed, plus a page allocator sized and tuned from the config
    pub fn create_default_allocator(&self) -> ShmResult<AllocRef> {
        let url = self.default_backend_url();
        if self.get_backend(&url).is_none() {
            self.create_backend(self.config.backend.default_type, &url)?;
        }
        let options = AllocatorOptions::page(PageOptions::from(&self.config.page))
            .with_custom_header(self.config.allocator.custom_header_size);
        self.create_allocator(
            &url,
            AllocatorId::NULL,
            self.config.allocator.default_slot_size,
            &options,
        )
    }

    /// Add an allocator to the registry; the first one becomes the default
    pub fn register_allocator(&self, alloc: AllocRef) -> ShmResult<()> {
        if !self.try_register(&alloc) {
            return Err(ShmError::allocator_exists(
                "MemoryManager::register_allocator",
                format!("allocator {} is already registered", alloc.id()),
            ));
        }
        Ok(())
    }

    /// Insert unless the id is taken; returns whether `alloc` was added
    fn try_register(&self, alloc: &AllocRef) -> bool {
        {
            let mut allocators = self.allocators.write();
            if allocators.contains_key(&alloc.id()) {
                return false;
            }
            allocators.insert(alloc.id(), alloc.clone());
        }
        self.adopt_default(alloc);
        true
    }

    fn adopt_default(&self, alloc: &AllocRef) {
        let mut default = self.default_allocator.write();
        if default.is_none() {
            *default = Some(alloc.clone());
        }
    }

    /// Resolve an allocator id, scanning backends once on a miss
    pub fn get_allocator(&self, id: AllocatorId) -> ShmResult<AllocRef> {
        if id.is_null() {
            return Err(ShmError::not_found("MemoryManager::get_allocator", "null allocator id"));
        }
        if let Some(alloc) = self.allocators.read().get(&id) {
            return Ok(alloc.clone());
        }
        self.scan_backends()?;
        self.allocators.read().get(&id).cloned().ok_or_else(|| {
            ShmError::not_found(
                "MemoryManager::get_allocator",
                format!("allocator {} is not registered", id),
            )
        })
    }

    /// All registered allocators, in no particular order
    pub fn allocators(&self) -> Vec<AllocRef> {
        self.allocators.read().values().cloned().collect()
    }

    /// Map new slots of every backend and register the allocators in them
    ///
    /// Returns the number of allocators registered by this scan.
    pub fn scan_backends(&self) -> ShmResult<usize> {
        let backends: Vec<(String, Arc<dyn MemoryBackend>)> = self
            .backends
            .read()
            .iter()
            .map(|(url, backend)| (url.clone(), backend.clone()))
            .collect();

        let mut found = 0;
        for (url, backend) in backends {
            backend.refresh()?;
            for slot in backend.data_slots() {
                if self.known_slots.lock().contains(&(url.clone(), slot.id)) {
                    continue;
                }
                let alloc = match AllocatorFactory::attach(backend.clone(), slot, self.threads.clone()) {
                    Ok(Some(alloc)) => alloc,
                    Ok(None) => {
                        log::debug!("{}: slot {} not initialized yet, skipping", url, slot.id);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("{}: skipping slot {}: {}", url, slot.id, e);
                        continue;
                    }
                };
                self.known_slots.lock().insert((url.clone(), slot.id));
                // A concurrent scan or create may have registered it meanwhile
                if !self.try_register(&alloc) {
                    continue;
                }
                log::debug!(
                    "{}: found {} allocator {} in slot {}",
                    url,
                    alloc.allocator_type(),
                    alloc.id(),
                    slot.id
                );
                found += 1;
            }
        }
        Ok(found)
    }

    pub fn default_allocator(&self) -> ShmResult<AllocRef> {
        self.default_allocator
            .read()
            .clone()
            .ok_or_else(|| ShmError::not_found("MemoryManager::default_allocator", "no allocator registered"))
    }

    pub fn set_default_allocator(&self, alloc: AllocRef) {
        *self.default_allocator.write() = Some(alloc);
    }

    // ---- address translation --------------------------------------------

    /// Local address of `p`; a null pointer converts to null
    pub fn convert<T>(&self, p: Pointer) -> ShmResult<*mut T> {
        if p.is_null() {
            return Ok(std::ptr::null_mut());
        }
        Ok(self.get_allocator(p.allocator_id)?.convert(p))
    }

    /// Process-independent form of a local address
    pub fn convert_ptr<T>(&self, ptr: *const T) -> ShmResult<Pointer> {
        if ptr.is_null() {
            return Ok(Pointer::NULL);
        }
        let allocators = self.allocators.read();
        allocators
            .values()
            .find_map(|alloc| alloc.pointer_of(ptr))
            .ok_or_else(|| {
                ShmError::not_found(
                    "MemoryManager::convert_ptr",
                    format!("{:p} is not inside any registered allocator", ptr),
                )
            })
    }
}
