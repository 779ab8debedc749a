// Backend over a memory region the caller already has

use super::{check_slot_size, MemoryBackend, MemoryBackendType, SlotId, SlotInfo, SlotKind};
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::align_up;
use parking_lot::RwLock;
use std::ptr::{self, NonNull};

/// Slot starts and sizes are multiples of this
pub const ARRAY_SLOT_ALIGN: usize = 64;

#[derive(Debug)]
struct ArrayState {
    open: bool,
    slots: Vec<SlotInfo>,
    /// Next unused byte, relative to the aligned start of the region
    cur_size: usize,
}

/// Slots carved out of a caller-supplied byte region
///
/// The region may be a boxed buffer handed over to the backend or any
/// memory the caller keeps alive, such as a window of a mapping made
/// elsewhere. Slot ids and offsets are local bookkeeping; there is no header
/// in the region, so nothing can attach to it.
#[derive(Debug)]
pub struct ArrayBackend {
    url: String,
    /// First 64-byte aligned address of the region
    base: NonNull<u8>,
    len: usize,
    /// Set when the region came from `from_boxed` and is freed on drop
    owned: Option<(NonNull<u8>, usize)>,
    state: RwLock<ArrayState>,
}

// The region is only reached through slot pointers handed to allocators
unsafe impl Send for ArrayBackend {}
unsafe impl Sync for ArrayBackend {}

impl ArrayBackend {
    /// Take ownership of `buffer` and carve slots out of it
    pub fn from_boxed(url: &str, buffer: Box<[u8]>) -> Self {
        let len = buffer.len();
        let raw = Box::into_raw(buffer) as *mut u8;
        // Box never hands out a null pointer
        let start = NonNull::new(raw).unwrap_or(NonNull::dangling());
        let mut backend = Self::over(url, start, len);
        backend.owned = Some((start, len));
        backend
    }

    /// Use `len` bytes at `ptr` without taking ownership
    ///
    /// # Safety
    /// The bytes must stay valid for reads and writes, and untouched by
    /// anything but this backend's allocators, for as long as the backend or
    /// any allocator built on it is alive.
    pub unsafe fn from_raw_parts(url: &str, ptr: *mut u8, len: usize) -> ShmResult<Self> {
        let start = NonNull::new(ptr).ok_or_else(|| {
            ShmError::backend_create_failed("ArrayBackend::from_raw_parts", "null region")
        })?;
        Ok(Self::over(url, start, len))
    }

    fn over(url: &str, start: NonNull<u8>, len: usize) -> Self {
        let addr = start.as_ptr() as usize;
        let skip = (align_up(addr, ARRAY_SLOT_ALIGN) - addr).min(len);
        let base = unsafe { NonNull::new_unchecked(start.as_ptr().add(skip)) };
        Self {
            url: url.to_string(),
            base,
            len: len - skip,
            owned: None,
            state: RwLock::new(ArrayState {
                open: false,
                slots: Vec::new(),
                cur_size: 0,
            }),
        }
    }

    /// Usable bytes after aligning the start of the region
    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn remaining(&self) -> usize {
        self.len - self.state.read().cur_size
    }
}

impl Drop for ArrayBackend {
    fn drop(&mut self) {
        if let Some((start, len)) = self.owned.take() {
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(start.as_ptr(), len))) };
        }
    }
}

impl MemoryBackend for ArrayBackend {
    fn url(&self) -> &str {
        &self.url
    }

    fn backend_type(&self) -> MemoryBackendType {
        MemoryBackendType::Array
    }

    fn create(&self) -> ShmResult<()> {
        if self.len < ARRAY_SLOT_ALIGN {
            return Err(ShmError::backend_create_failed(
                "ArrayBackend::create",
                format!("region of {} usable bytes is too small", self.len),
            ));
        }
        let mut state = self.state.write();
        state.open = true;
        state.slots.clear();
        state.cur_size = 0;
        log::debug!("Created array backend {} ({} bytes)", self.url, self.len);
        Ok(())
    }

    fn attach(&self) -> ShmResult<()> {
        Err(ShmError::backend_unsupported(
            "ArrayBackend::attach",
            format!("{} has no header to attach to", self.url),
        ))
    }

    fn create_slot(&self, size: usize) -> ShmResult<SlotInfo> {
        check_slot_size("ArrayBackend::create_slot", size)?;
        let size = size
            .checked_add(ARRAY_SLOT_ALIGN - 1)
            .map(|padded| padded & !(ARRAY_SLOT_ALIGN - 1))
            .ok_or_else(|| ShmError::out_of_memory("ArrayBackend::create_slot", "slot size overflows"))?;

        let mut state = self.state.write();
        if !state.open {
            return Err(ShmError::backend_unsupported(
                "ArrayBackend::create_slot",
                format!("{} is not open", self.url),
            ));
        }
        if size > self.len - state.cur_size {
            return Err(ShmError::out_of_memory(
                "ArrayBackend::create_slot",
                format!(
                    "slot of {} bytes does not fit ({} of {} bytes used)",
                    size, state.cur_size, self.len
                ),
            ));
        }

        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(state.cur_size)) };
        let info = SlotInfo::new(state.slots.len(), state.cur_size as u64, size, SlotKind::Data, ptr);
        state.cur_size += size;
        state.slots.push(info);
        log::debug!("{}: created slot {} ({} bytes at {:#x})", self.url, info.id, size, info.off);
        Ok(info)
    }

    fn slot(&self, id: SlotId) -> Option<SlotInfo> {
        self.state.read().slots.get(id).copied()
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
    fn test_slots_are_aligned_and_disjoint() {
        let backend = ArrayBackend::from_boxed("array", vec![0u8; 10_000].into_boxed_slice());
        backend.create().unwrap();
        let a = backend.create_slot(100).unwrap();
        let b = backend.create_slot(1).unwrap();
        assert_eq!((a.id, b.id), (0, 1));
        assert_eq!(a.size, 128);
        assert_eq!(b.off, 128);
        assert_eq!(a.as_ptr() as usize % ARRAY_SLOT_ALIGN, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 128);
        assert_eq!(backend.data_slots().len(), 2);
        assert_eq!(backend.remaining(), backend.capacity() - 192);
    }

    #[test]
    fn test_region_bounds_enforced() {
        let backend = ArrayBackend::from_boxed("array", vec![0u8; 4096].into_boxed_slice());
        backend.create().unwrap();
        let err = backend.create_slot(backend.capacity() + 1).unwrap_err();
        assert!(matches!(err, ShmError::OutOfMemory { .. }));
        assert!(matches!(
            backend.create_slot(usize::MAX).unwrap_err(),
            ShmError::OutOfMemory { .. }
        ));
        let first = backend.create_slot(1024).unwrap();
        assert_eq!(first.size, 1024);
        assert!(backend.create_slot(backend.remaining() + 1).is_err());
        let rest = backend.remaining() & !(ARRAY_SLOT_ALIGN - 1);
        backend.create_slot(rest).unwrap();
        assert!(backend.create_slot(1).is_err());
    }

    #[test]
    fn test_caller_region_sees_writes() {
        let mut region = vec![0u64; 1024];
        let backend = unsafe {
            ArrayBackend::from_raw_parts("array", region.as_mut_ptr() as *mut u8, 8192).unwrap()
        };
        backend.create().unwrap();
        let slot = backend.create_slot(64).unwrap();
        unsafe { (slot.as_ptr() as *mut u64).write(0x1122_3344) };
        drop(backend);
        assert!(region.contains(&0x1122_3344));
    }

    #[test]
    fn test_unsupported_and_closed() {
        let backend = ArrayBackend::from_boxed("array", vec![0u8; 32].into_boxed_slice());
        assert!(matches!(
            backend.create().unwrap_err(),
            ShmError::BackendCreateFailed { .. }
        ));
        assert!(matches!(
            backend.attach().unwrap_err(),
            ShmError::BackendUnsupportedOperation { .. }
        ));
        assert!(unsafe { ArrayBackend::from_raw_parts("array", ptr::null_mut(), 64) }.is_err());

        let backend = ArrayBackend::from_boxed("array", vec![0u8; 4096].into_boxed_slice());
        assert!(backend.create_slot(64).is_err());
        backend.create().unwrap();
        backend.detach().unwrap();
        assert!(backend.create_slot(64).is_err());
    }
}
