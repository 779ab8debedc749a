/// Configuration file support for shmkit
///
/// Backend, allocator and container defaults can come from a TOML file
/// instead of being hardcoded at every call site. Environment variables
/// override whatever the file says.
use crate::error::{ShmError, ShmResult};
use crate::memory::backend::MemoryBackendType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const KILOBYTES: usize = 1024;
pub const MEGABYTES: usize = 1024 * KILOBYTES;
pub const GIGABYTES: usize = 1024 * MEGABYTES;

/// Backend defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend used when none is named explicitly
    pub default_type: MemoryBackendType,

    /// Prefix for generated backend URLs (pid is appended)
    pub url_prefix: String,

    /// Upper bound on the total size of a segment
    pub max_size: usize,

    /// Initial size of the slot-descriptor table slot
    pub slot_table_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_type: MemoryBackendType::PosixShm,
            url_prefix: "/shmkit".to_string(),
            max_size: 64 * GIGABYTES,
            slot_table_size: 64 * KILOBYTES,
        }
    }
}

/// Defaults shared by every allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Slot size used by `MemoryManager::create_default_allocator`
    pub default_slot_size: usize,

    /// Bytes reserved after the allocator header for caller data
    pub custom_header_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_slot_size: 64 * MEGABYTES,
            custom_header_size: 0,
        }
    }
}

/// Page allocator defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub page_size: usize,

    /// Number of free-list shards; 0 means one per CPU
    pub concurrency: usize,

    /// A shard lends pages only while it holds more than this many free pages
    pub min_free_count: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * KILOBYTES,
            concurrency: 0,
            min_free_count: 16,
        }
    }
}

impl PageConfig {
    /// Shard count with the CPU-count default resolved
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            self.concurrency
        }
    }
}

/// Concurrent hash map defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub num_buckets: usize,
    pub max_collisions: usize,
    pub growth_numerator: usize,
    pub growth_denominator: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            num_buckets: 20,
            max_collisions: 4,
            growth_numerator: 5,
            growth_denominator: 4,
        }
    }
}

/// Full shmkit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    pub backend: BackendConfig,
    pub allocator: AllocatorConfig,
    pub page: PageConfig,
    pub map: MapConfig,
}

impl ShmConfig {
    /// Load config from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ShmResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ShmError::config(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&contents)
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> ShmResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ShmError::config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load config file from standard search paths
    ///
    /// Search order:
    /// 1. ./shmkit.toml
    /// 2. ~/.shmkit/config.toml
    /// 3. /etc/shmkit/config.toml
    ///
    /// Falls back to defaults when no file exists. Environment overrides are
    /// applied in both cases.
    pub fn find_and_load() -> ShmResult<Self> {
        let mut config = match Self::get_search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                log::info!("Loading shmkit config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Get standard config file search paths
    pub fn get_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("shmkit.toml")];

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".shmkit").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/shmkit/config.toml"));
        paths
    }

    /// Override fields from SHMKIT_* environment variables
    pub fn apply_env(&mut self) -> ShmResult<()> {
        if let Ok(prefix) = std::env::var("SHMKIT_URL_PREFIX") {
            self.backend.url_prefix = prefix;
        }
        if let Some(v) = env_usize("SHMKIT_MAX_SIZE")? {
            self.backend.max_size = v;
        }
        if let Some(v) = env_usize("SHMKIT_PAGE_SIZE")? {
            self.page.page_size = v;
        }
        if let Some(v) = env_usize("SHMKIT_CONCURRENCY")? {
            self.page.concurrency = v;
        }
        self.validate()
    }

    /// Reject configurations the allocators cannot work with
    pub fn validate(&self) -> ShmResult<()> {
        if !self.backend.url_prefix.starts_with('/') {
            return Err(ShmError::config(format!(
                "backend.url_prefix must start with '/', got '{}'",
                self.backend.url_prefix
            )));
        }
        if self.backend.slot_table_size == 0 {
            return Err(ShmError::config("backend.slot_table_size must be non-zero"));
        }
        if self.page.page_size < std::mem::size_of::<u64>() {
            return Err(ShmError::config(format!(
                "page.page_size {} is smaller than a free-list link",
                self.page.page_size
            )));
        }
        if self.map.num_buckets == 0 {
            return Err(ShmError::config("map.num_buckets must be non-zero"));
        }
        if self.map.growth_denominator == 0
            || self.map.growth_numerator < self.map.growth_denominator
        {
            return Err(ShmError::config(format!(
                "map growth {}/{} must be >= 1",
                self.map.growth_numerator, self.map.growth_denominator
            )));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> ShmResult<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ShmError::config(format!("{}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
