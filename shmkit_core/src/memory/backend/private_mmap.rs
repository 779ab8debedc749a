// Process-private backend over anonymous mappings

use super::{check_slot_size, MemoryBackend, MemoryBackendType, SlotId, SlotInfo, SlotKind};
use crate::config::BackendConfig;
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::{align_up, os_page_size};
use memmap2::MmapMut;
use parking_lot::RwLock;
use std::ptr::NonNull;

#[derive(Debug)]
struct PrivateState {
    open: bool,
    slots: Vec<(SlotInfo, MmapMut)>,
    cur_size: usize,
}

/// Anonymous memory, visible to this process only
///
/// Useful for tests and single-process use of the containers. Slots are
/// numbered from 0 and are all data slots; there is no header to attach to.
#[derive(Debug)]
pub struct PrivateMmapBackend {
    url: String,
    max_size: usize,
    page_size: usize,
    state: RwLock<PrivateState>,
}

unsafe impl Send for PrivateMmapBackend {}
unsafe impl Sync for PrivateMmapBackend {}

impl PrivateMmapBackend {
    pub fn new(url: &str, config: &BackendConfig) -> Self {
        Self {
            url: url.to_string(),
            max_size: config.max_size,
            page_size: os_page_size(),
            state: RwLock::new(PrivateState {
                open: false,
                slots: Vec::new(),
                cur_size: 0,
            }),
        }
    }
}

impl MemoryBackend for PrivateMmapBackend {
    fn url(&self) -> &str {
        &self.url
    }

    fn backend_type(&self) -> MemoryBackendType {
        MemoryBackendType::PrivateMmap
    }

    fn create(&self) -> ShmResult<()> {
        let mut state = self.state.write();
        state.open = true;
        log::debug!("Created private backend {}", self.url);
        Ok(())
    }

    fn attach(&self) -> ShmResult<()> {
        Err(ShmError::backend_unsupported(
            "PrivateMmapBackend::attach",
            format!("{} is process-private", self.url),
        ))
    }

    fn create_slot(&self, size: usize) -> ShmResult<SlotInfo> {
        check_slot_size("PrivateMmapBackend::create_slot", size)?;
        let size = align_up(size, self.page_size);

        let mut state = self.state.write();
        if !state.open {
            return Err(ShmError::backend_unsupported(
                "PrivateMmapBackend::create_slot",
                format!("{} is not open", self.url),
            ));
        }
        if state.cur_size + size > self.max_size {
            return Err(ShmError::out_of_memory(
                "PrivateMmapBackend::create_slot",
                format!(
                    "slot of {} bytes does not fit ({} of {} bytes used)",
                    size, state.cur_size, self.max_size
                ),
            ));
        }

        let mut map = MmapMut::map_anon(size)?;
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            ShmError::backend_create_failed("PrivateMmapBackend::create_slot", "null mapping")
        })?;
        let id = state.slots.len();
        let info = SlotInfo::new(id, state.cur_size as u64, size, SlotKind::Data, ptr);
        state.cur_size += size;
        state.slots.push((info, map));
        Ok(info)
    }

    fn slot(&self, id: SlotId) -> Option<SlotInfo> {
        self.state.read().slots.get(id).map(|(info, _)| *info)
    }

    fn num_slots(&self) -> usize {
        self.state.read().slots.len()
    }

    fn refresh(&self) -> ShmResult<usize> {
        Ok(0)
    }

    fn detach(&self) -> ShmResult<()> {
        self.state.write().open = false;
        Ok(())
    }

    fn destroy(&self) -> ShmResult<()> {
        self.state.write().open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_data_and_zeroed() {
        let backend = PrivateMmapBackend::new("private", &BackendConfig::default());
        backend.create().unwrap();
        let a = backend.create_slot(100).unwrap();
        let b = backend.create_slot(100).unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(a.kind, SlotKind::Data);
        assert_eq!(b.off, a.size as u64);
        assert_eq!(unsafe { a.as_ptr().add(50).read() }, 0);
        assert_eq!(backend.data_slots().len(), 2);
    }

    #[test]
    fn test_attach_unsupported() {
        let backend = PrivateMmapBackend::new("private", &BackendConfig::default());
        let err = backend.attach().unwrap_err();
        assert!(matches!(err, ShmError::BackendUnsupportedOperation { .. }));
        assert_eq!(backend.refresh().unwrap(), 0);
    }

    #[test]
    fn test_closed_backend_refuses_slots() {
        let backend = PrivateMmapBackend::new("private", &BackendConfig::default());
        assert!(backend.create_slot(64).is_err());
        backend.create().unwrap();
        backend.detach().unwrap();
        assert!(backend.create_slot(64).is_err());
    }

    #[test]
    fn test_max_size() {
        let config = BackendConfig {
            max_size: 8192,
            ..BackendConfig::default()
        };
        let backend = PrivateMmapBackend::new("private", &config);
        backend.create().unwrap();
        let err = backend.create_slot(1 << 20).unwrap_err();
        assert!(matches!(err, ShmError::OutOfMemory { .. }));
    }
}
