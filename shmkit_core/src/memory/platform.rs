// Platform facts the memory layer consumes
//
// Linux: POSIX shm objects live under /dev/shm (tmpfs, RAM-backed)
// macOS: shm_open objects have no filesystem path
// Everything else: assume /dev/shm when it exists

use std::path::PathBuf;

/// Process and machine facts used to derive defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    /// Current process id, used as the major part of generated allocator ids
    pub pid: u32,
    /// Number of logical CPUs, default page allocator concurrency
    pub num_cpus: usize,
    /// OS page size; slot offsets and sizes are multiples of it
    pub os_page_size: usize,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            num_cpus: num_cpus::get().max(1),
            os_page_size: os_page_size(),
        }
    }
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// Get the OS page size
pub fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Round `size` up to a multiple of `align` (a power of two)
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Where a POSIX shm object named `url` shows up on the filesystem, if anywhere
///
/// Only used for diagnostics and test cleanup checks; the backend itself goes
/// through shm_open.
pub fn shm_object_path(url: &str) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/dev/shm").join(url.trim_start_matches('/')))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = url;
        None
    }
}

/// Check if we're running on a platform with true shared memory (tmpfs)
pub fn has_native_shm() -> bool {
    #[cfg(target_os = "linux")]
    {
        true
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Get platform name for logging/diagnostics
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "linux")]
    { "Linux" }

    #[cfg(target_os = "macos")]
    { "macOS" }

    #[cfg(target_os = "windows")]
    { "Windows" }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    { "Unix" }
}
