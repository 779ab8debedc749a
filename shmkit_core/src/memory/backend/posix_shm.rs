// POSIX shared-memory backend - shm_open + mmap, grown slot by slot
//
// Segment layout:
//   [slot 0: BackendHeader, one OS page][slot 1: slot table][data slots ...]
// The slot table may be relocated into a bigger slot later; the header always
// says where the current one is.

use super::{check_slot_size, MemoryBackend, MemoryBackendType, SlotDescriptor, SlotId, SlotInfo, SlotKind};
use crate::config::BackendConfig;
use crate::error::{ShmError, ShmResult};
use crate::memory::platform::{align_up, os_page_size};
use crate::sync::ShmMutex;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::FromRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

const BACKEND_MAGIC: u64 = 0x5348_4d4b_4954_0001; // "SHMKIT" v1

/// Header at offset 0 of every segment
#[repr(C)]
struct BackendHeader {
    magic: u64,
    lock: ShmMutex,
    _pad: u32,
    num_slots: AtomicU64,
    slot_table_slot: AtomicU64,
    slot_table_off: AtomicU64,
    slot_table_size: AtomicU64,
    cur_size: AtomicU64,
    max_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Closed,
    Open,
    Detached,
    Destroyed,
}

#[derive(Debug)]
struct MappedSlot {
    info: SlotInfo,
    _map: MmapMut,
}

#[derive(Debug)]
struct PosixState {
    status: Status,
    file: Option<File>,
    header: Option<NonNull<BackendHeader>>,
    slots: Vec<MappedSlot>,
    table_slot: SlotId,
}

/// Named POSIX shared-memory segment
#[derive(Debug)]
pub struct PosixShmBackend {
    url: String,
    name: CString,
    page_size: usize,
    max_size: usize,
    initial_table_size: usize,
    state: RwLock<PosixState>,
}

// Raw pointers in the state point into mappings owned by the same state
unsafe impl Send for PosixShmBackend {}
unsafe impl Sync for PosixShmBackend {}

impl PosixShmBackend {
    pub fn new(url: &str, config: &BackendConfig) -> ShmResult<Self> {
        if !url.starts_with('/') || url.len() < 2 || url[1..].contains('/') {
            return Err(ShmError::backend_create_failed(
                "PosixShmBackend::new",
                format!("'{}' is not a valid shm name (expected '/name')", url),
            ));
        }
        let name = CString::new(url).map_err(|e| {
            ShmError::backend_create_failed("PosixShmBackend::new", e.to_string())
        })?;
        let page_size = os_page_size();

        Ok(Self {
            url: url.to_string(),
            name,
            page_size,
            max_size: config.max_size,
            initial_table_size: align_up(config.slot_table_size.max(page_size), page_size),
            state: RwLock::new(PosixState {
                status: Status::Closed,
                file: None,
                header: None,
                slots: Vec::new(),
                table_slot: 0,
            }),
        })
    }

    fn shm_open(&self, create: bool) -> io::Result<File> {
        let flags = if create {
            libc::O_CREAT | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        #[cfg(target_os = "linux")]
        let mode: libc::mode_t = 0o666;
        #[cfg(not(target_os = "linux"))]
        let mode: libc::c_uint = 0o666;

        let fd = unsafe { libc::shm_open(self.name.as_ptr(), flags, mode) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn map_region(file: &File, off: u64, size: usize) -> ShmResult<MmapMut> {
        unsafe { MmapOptions::new().offset(off).len(size).map_mut(file) }.map_err(|e| {
            ShmError::backend_create_failed(
                "PosixShmBackend::map_slot",
                format!("mmap of {} bytes at {:#x} failed: {}", size, off, e),
            )
        })
    }

    fn push_slot(
        state: &mut PosixState,
        id: SlotId,
        desc: SlotDescriptor,
        mut map: MmapMut,
    ) -> ShmResult<SlotInfo> {
        let kind = SlotKind::from_raw(desc.kind).ok_or_else(|| {
            ShmError::backend_create_failed(
                "PosixShmBackend::map_slot",
                format!("slot {} has unknown kind {}", id, desc.kind),
            )
        })?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| ShmError::backend_create_failed("PosixShmBackend::map_slot", "null mapping"))?;
        let info = SlotInfo::new(id, desc.off, desc.size as usize, kind, ptr);
        state.slots.push(MappedSlot { info, _map: map });
        Ok(info)
    }

    fn header<'a>(state: &PosixState) -> ShmResult<&'a BackendHeader> {
        match state.header {
            // The header lives in slot 0, mapped until the backend drops
            Some(header) => Ok(unsafe { &*header.as_ptr() }),
            None => Err(ShmError::backend_unsupported(
                "PosixShmBackend",
                "backend is neither created nor attached",
            )),
        }
    }

    fn file<'a>(state: &'a PosixState, op: &'static str) -> ShmResult<&'a File> {
        match (state.status, state.file.as_ref()) {
            (Status::Open, Some(file)) => Ok(file),
            (status, _) => Err(ShmError::backend_unsupported(
                op,
                format!("backend is {:?}", status),
            )),
        }
    }

    fn table_ptr(state: &PosixState) -> *mut SlotDescriptor {
        state.slots[state.table_slot].info.as_ptr() as *mut SlotDescriptor
    }

    /// Map every slot this process has not seen yet. Caller holds the header lock.
    fn replay_locked(&self, state: &mut PosixState) -> ShmResult<usize> {
        let header = Self::header(state)?;
        let num_slots = header.num_slots.load(Ordering::Acquire) as usize;
        let table_slot = header.slot_table_slot.load(Ordering::Acquire) as usize;
        let table_off = header.slot_table_off.load(Ordering::Acquire);
        let table_size = header.slot_table_size.load(Ordering::Acquire) as usize;

        let file = Self::file(state, "PosixShmBackend::refresh")?;
        let temp_table;
        let table: *const SlotDescriptor = if table_slot < state.slots.len() {
            state.slots[table_slot].info.as_ptr() as *const SlotDescriptor
        } else {
            temp_table = Self::map_region(file, table_off, table_size)?;
            temp_table.as_ptr() as *const SlotDescriptor
        };

        let mut mapped = 0;
        for id in state.slots.len()..num_slots {
            let desc = unsafe { *table.add(id) };
            let file = Self::file(state, "PosixShmBackend::refresh")?;
            let map = Self::map_region(file, desc.off, desc.size as usize)?;
            Self::push_slot(state, id, desc, map)?;
            mapped += 1;
        }
        state.table_slot = table_slot;

        if mapped > 0 {
            log::debug!("{}: mapped {} slot(s) created elsewhere", self.url, mapped);
        }
        Ok(mapped)
    }

    /// Move the slot table into a slot twice its size. Caller holds the header lock.
    fn grow_table_locked(&self, state: &mut PosixState) -> ShmResult<()> {
        let header = Self::header(state)?;
        let num_slots = header.num_slots.load(Ordering::Relaxed) as usize;
        let old_size = header.slot_table_size.load(Ordering::Relaxed) as usize;
        let new_size = old_size * 2;
        let off = header.cur_size.load(Ordering::Relaxed);

        if off as usize + new_size > self.max_size {
            return Err(ShmError::out_of_memory(
                "PosixShmBackend::create_slot",
                format!("no room to grow the slot table to {} bytes", new_size),
            ));
        }

        let file = Self::file(state, "PosixShmBackend::create_slot")?;
        file.set_len(off + new_size as u64)?;
        let map = Self::map_region(file, off, new_size)?;

        let old_table = Self::table_ptr(state);
        let new_table = map.as_ptr() as *mut SlotDescriptor;
        let desc = SlotDescriptor::new(off, new_size as u64, SlotKind::SlotTable);
        unsafe {
            std::ptr::copy_nonoverlapping(old_table, new_table, num_slots);
            new_table.add(num_slots).write(desc);
        }

        header.slot_table_off.store(off, Ordering::Release);
        header.slot_table_size.store(new_size as u64, Ordering::Release);
        header.slot_table_slot.store(num_slots as u64, Ordering::Release);
        header.cur_size.store(off + new_size as u64, Ordering::Release);
        header.num_slots.store(num_slots as u64 + 1, Ordering::Release);

        Self::push_slot(state, num_slots, desc, map)?;
        state.table_slot = num_slots;

        log::debug!(
            "{}: slot table relocated to slot {} ({} bytes)",
            self.url,
            num_slots,
            new_size
        );
        Ok(())
    }
}

impl MemoryBackend for PosixShmBackend {
    fn url(&self) -> &str {
        &self.url
    }

    fn backend_type(&self) -> MemoryBackendType {
        MemoryBackendType::PosixShm
    }

    fn create(&self) -> ShmResult<()> {
        let mut state = self.state.write();
        if state.status == Status::Open {
            return Err(ShmError::backend_create_failed(
                "PosixShmBackend::create",
                format!("{} is already open", self.url),
            ));
        }

        let file = self.shm_open(true).map_err(|e| {
            ShmError::backend_create_failed(
                "PosixShmBackend::create",
                format!("shm_open({}) failed: {}", self.url, e),
            )
        })?;

        let header_size = self.page_size;
        let table_size = self.initial_table_size;
        let initial = (header_size + table_size) as u64;
        if initial as usize > self.max_size {
            return Err(ShmError::out_of_memory(
                "PosixShmBackend::create",
                format!("max_size {} cannot hold the header and slot table", self.max_size),
            ));
        }

        // Drop whatever a previous owner of this name left behind
        file.set_len(0)?;
        file.set_len(initial)?;

        let header_map = Self::map_region(&file, 0, header_size)?;
        let table_map = Self::map_region(&file, header_size as u64, table_size)?;

        let header_desc = SlotDescriptor::new(0, header_size as u64, SlotKind::Header);
        let table_desc = SlotDescriptor::new(header_size as u64, table_size as u64, SlotKind::SlotTable);

        let header_ptr = header_map.as_ptr() as *mut BackendHeader;
        unsafe {
            header_ptr.write(BackendHeader {
                magic: BACKEND_MAGIC,
                lock: ShmMutex::new(),
                _pad: 0,
                num_slots: AtomicU64::new(2),
                slot_table_slot: AtomicU64::new(1),
                slot_table_off: AtomicU64::new(header_size as u64),
                slot_table_size: AtomicU64::new(table_size as u64),
                cur_size: AtomicU64::new(initial),
                max_size: self.max_size as u64,
            });
            let table = table_map.as_ptr() as *mut SlotDescriptor;
            table.write(header_desc);
            table.add(1).write(table_desc);
        }

        state.slots.clear();
        Self::push_slot(&mut state, 0, header_desc, header_map)?;
        Self::push_slot(&mut state, 1, table_desc, table_map)?;
        state.header = NonNull::new(header_ptr);
        state.table_slot = 1;
        state.file = Some(file);
        state.status = Status::Open;

        log::info!(
            "Created shm backend {} (header {} bytes, slot table {} bytes, max {} bytes)",
            self.url,
            header_size,
            table_size,
            self.max_size
        );
        Ok(())
    }

    fn attach(&self) -> ShmResult<()> {
        let mut state = self.state.write();
        if state.status == Status::Open {
            return Ok(());
        }

        let file = self.shm_open(false).map_err(|e| {
            ShmError::backend_create_failed(
                "PosixShmBackend::attach",
                format!("shm_open({}) failed: {}", self.url, e),
            )
        })?;

        let len = file.metadata()?.len() as usize;
        if len < self.page_size {
            return Err(ShmError::backend_create_failed(
                "PosixShmBackend::attach",
                format!("{} is too small ({} bytes) to hold a header", self.url, len),
            ));
        }

        let header_map = Self::map_region(&file, 0, self.page_size)?;
        let header_ptr = header_map.as_ptr() as *mut BackendHeader;
        let magic = unsafe { (*header_ptr).magic };
        if magic != BACKEND_MAGIC {
            return Err(ShmError::backend_create_failed(
                "PosixShmBackend::attach",
                format!("{} has bad magic {:#x}", self.url, magic),
            ));
        }

        state.slots.clear();
        let header_desc = SlotDescriptor::new(0, self.page_size as u64, SlotKind::Header);
        Self::push_slot(&mut state, 0, header_desc, header_map)?;
        state.header = NonNull::new(header_ptr);
        state.table_slot = usize::MAX;
        state.file = Some(file);
        state.status = Status::Open;

        let header = Self::header(&state)?;
        let _guard = header.lock.lock();
        let mapped = self.replay_locked(&mut state)?;

        log::info!(
            "Attached shm backend {} ({} slots, {} bytes)",
            self.url,
            mapped + 1,
            header.cur_size.load(Ordering::Relaxed)
        );
        Ok(())
    }

    fn create_slot(&self, size: usize) -> ShmResult<SlotInfo> {
        check_slot_size("PosixShmBackend::create_slot", size)?;
        let size = align_up(size, self.page_size);

        let mut state = self.state.write();
        Self::file(&state, "PosixShmBackend::create_slot")?;
        let header = Self::header(&state)?;
        let _guard = header.lock.lock();

        // Our slot id is the shared slot count; catch up with other creators first
        self.replay_locked(&mut state)?;

        let table_capacity =
            header.slot_table_size.load(Ordering::Relaxed) as usize / mem::size_of::<SlotDescriptor>();
        if header.num_slots.load(Ordering::Relaxed) as usize >= table_capacity {
            self.grow_table_locked(&mut state)?;
        }

        let off = header.cur_size.load(Ordering::Relaxed);
        let max = header.max_size;
        if off + size as u64 > max {
            return Err(ShmError::out_of_memory(
                "PosixShmBackend::create_slot",
                format!(
                    "slot of {} bytes does not fit ({} of {} bytes used)",
                    size, off, max
                ),
            ));
        }

        let file = Self::file(&state, "PosixShmBackend::create_slot")?;
        file.set_len(off + size as u64)?;
        let map = Self::map_region(file, off, size)?;

        let id = header.num_slots.load(Ordering::Relaxed) as usize;
        let desc = SlotDescriptor::new(off, size as u64, SlotKind::Data);
        unsafe { Self::table_ptr(&state).add(id).write(desc) };
        header.cur_size.store(off + size as u64, Ordering::Release);
        header.num_slots.store(id as u64 + 1, Ordering::Release);

        let info = Self::push_slot(&mut state, id, desc, map)?;
        log::debug!("{}: created slot {} ({} bytes at {:#x})", self.url, id, size, off);
        Ok(info)
    }

    fn slot(&self, id: SlotId) -> Option<SlotInfo> {
        self.state.read().slots.get(id).map(|slot| slot.info)
    }

    fn num_slots(&self) -> usize {
        self.state.read().slots.len()
    }

    fn refresh(&self) -> ShmResult<usize> {
        let mut state = self.state.write();
        if state.status != Status::Open {
            return Ok(0);
        }
        let header = Self::header(&state)?;
        let _guard = header.lock.lock();
        self.replay_locked(&mut state)
    }

    fn detach(&self) -> ShmResult<()> {
        let mut state = self.state.write();
        if state.status == Status::Open {
            state.status = Status::Detached;
            state.file = None;
            log::info!("Detached shm backend {}", self.url);
        }
        Ok(())
    }

    fn destroy(&self) -> ShmResult<()> {
        let mut state = self.state.write();
        if state.status == Status::Destroyed {
            return Ok(());
        }
        state.status = Status::Destroyed;
        state.file = None;

        let ret = unsafe { libc::shm_unlink(self.name.as_ptr()) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        log::info!("Destroyed shm backend {}", self.url);
        Ok(())
    }
}
