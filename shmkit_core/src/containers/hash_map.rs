// Concurrent hash map with per-bucket locks and online growth
//
// Locking: the map lock is taken shared by every entry operation and
// exclusively only by growth and clear. Each bucket has its own lock guarding
// its collision list. Growth is triggered after both locks are released.

use super::list::{ListHeader, ShmList};
use super::pair::ShmPair;
use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use super::vec::{ShmVec, VecHeader};
use crate::config::MapConfig;
use crate::error::{ShmError, ShmResult};
use crate::memory::AllocRef;
use crate::sync::ShmRwLock;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

/// Map tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOptions {
    pub num_buckets: usize,
    pub max_collisions: usize,
    pub growth_numerator: usize,
    pub growth_denominator: usize,
}

impl From<&MapConfig> for MapOptions {
    fn from(config: &MapConfig) -> Self {
        Self {
            num_buckets: config.num_buckets,
            max_collisions: config.max_collisions,
            growth_numerator: config.growth_numerator,
            growth_denominator: config.growth_denominator,
        }
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::from(&MapConfig::default())
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct BucketHeader {
    lock: ShmRwLock,
    list: ListHeader,
}

/// One bucket: a lock plus the collision list, which lives inside the bucket header
pub struct ShmBucket<K: ShmElement, V: ShmElement> {
    handle: ShmHandle<Self>,
}

impl<K: ShmElement, V: ShmElement> ShmContainer for ShmBucket<K, V> {
    type Header = BucketHeader;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut BucketHeader, alloc: &AllocRef) -> ShmResult<()> {
        ShmList::<ShmPair<K, V>>::destroy_payload(&mut header.list, alloc)
    }

    fn copy_payload(src: &BucketHeader, from: &AllocRef, to: &AllocRef) -> ShmResult<BucketHeader> {
        Ok(BucketHeader {
            lock: ShmRwLock::new(),
            list: ShmList::<ShmPair<K, V>>::copy_payload(&src.list, from, to)?,
        })
    }
}

impl<K: ShmElement, V: ShmElement> ShmBucket<K, V> {
    pub fn new(alloc: &AllocRef) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(
            None,
            alloc,
            BucketHeader {
                lock: ShmRwLock::new(),
                list: ListHeader::EMPTY,
            },
        )?))
    }

    pub fn lock(&self) -> &ShmRwLock {
        &self.handle.header().lock
    }

    fn list_pointer(&self) -> crate::memory::Pointer {
        self.handle.pointer() + mem::offset_of!(BucketHeader, list) as u64
    }

    /// View of the collision list; hold the bucket lock while using it
    pub fn list(&self) -> ShmList<ShmPair<K, V>> {
        ShmList::deserialize_in(self.handle.alloc(), self.list_pointer())
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct MapHeader {
    lock: ShmRwLock,
    buckets: VecHeader,
    max_collisions: u64,
    growth_numerator: u64,
    growth_denominator: u64,
    length: AtomicU64,
}

/// Hash map safe for concurrent use from many threads and processes
///
/// `S` must hash identically in every process, so the default is
/// `BuildHasherDefault<DefaultHasher>` rather than a randomly seeded hasher.
pub struct ShmHashMap<K, V, S = BuildHasherDefault<DefaultHasher>>
where
    K: ShmElement + Hash + PartialEq,
    V: ShmElement,
    S: BuildHasher + Default,
{
    handle: ShmHandle<Self>,
    _hasher: PhantomData<fn() -> S>,
}

impl<K, V, S> ShmContainer for ShmHashMap<K, V, S>
where
    K: ShmElement + Hash + PartialEq,
    V: ShmElement,
    S: BuildHasher + Default,
{
    type Header = MapHeader;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self {
            handle,
            _hasher: PhantomData,
        }
    }

    fn destroy_payload(header: &mut MapHeader, alloc: &AllocRef) -> ShmResult<()> {
        ShmVec::<ShmBucket<K, V>>::destroy_payload(&mut header.buckets, alloc)?;
        header.length.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn copy_payload(src: &MapHeader, from: &AllocRef, to: &AllocRef) -> ShmResult<MapHeader> {
        let _guard = src.lock.read();
        Ok(MapHeader {
            lock: ShmRwLock::new(),
            buckets: ShmVec::<ShmBucket<K, V>>::copy_payload(&src.buckets, from, to)?,
            max_collisions: src.max_collisions,
            growth_numerator: src.growth_numerator,
            growth_denominator: src.growth_denominator,
            length: AtomicU64::new(src.length.load(Ordering::Relaxed)),
        })
    }
}

impl<K, V, S> ShmHashMap<K, V, S>
where
    K: ShmElement + Hash + PartialEq,
    V: ShmElement,
    S: BuildHasher + Default,
{
    pub fn new(alloc: &AllocRef) -> ShmResult<Self> {
        Self::with_options(alloc, MapOptions::default())
    }

    pub fn with_options(alloc: &AllocRef, options: MapOptions) -> ShmResult<Self> {
        if options.num_buckets == 0 || options.growth_denominator == 0 {
            return Err(ShmError::config(format!("invalid map options {:?}", options)));
        }
        let map = Self::from_handle(ShmHandle::init(
            None,
            alloc,
            MapHeader {
                lock: ShmRwLock::new(),
                buckets: VecHeader::EMPTY,
                max_collisions: options.max_collisions as u64,
                growth_numerator: options.growth_numerator as u64,
                growth_denominator: options.growth_denominator as u64,
                length: AtomicU64::new(0),
            },
        )?);
        let mut buckets = map.buckets();
        buckets.reserve(options.num_buckets)?;
        for _ in 0..options.num_buckets {
            buckets.push(ShmBucket::new(alloc)?)?;
        }
        Ok(map)
    }

    fn header(&self) -> &MapHeader {
        self.handle.header()
    }

    fn buckets(&self) -> ShmVec<ShmBucket<K, V>> {
        let at = self.handle.pointer() + mem::offset_of!(MapHeader, buckets) as u64;
        ShmVec::deserialize_in(self.handle.alloc(), at)
    }

    fn bucket_index(key: &K, num_buckets: usize) -> usize {
        let mut hasher = S::default().build_hasher();
        key.hash(&mut hasher);
        // An empty bucket vector yields index 0, which lookups treat as out of bounds
        (hasher.finish() % num_buckets.max(1) as u64) as usize
    }

    /// Insert or overwrite; returns true if the key was new
    pub fn emplace(&self, key: K, value: V) -> ShmResult<bool> {
        self.insert_entry(key, value, true)
    }

    /// Insert only if the key is absent; returns true if inserted
    pub fn try_emplace(&self, key: K, value: V) -> ShmResult<bool> {
        self.insert_entry(key, value, false)
    }

    fn insert_entry(&self, key: K, value: V, overwrite: bool) -> ShmResult<bool> {
        let header = self.header();
        let alloc = self.handle.alloc();

        let (inserted, collisions, num_buckets) = {
            let _map = header.lock.read();
            let buckets = self.buckets();
            let num_buckets = buckets.len();
            let bucket = buckets.get(Self::bucket_index(&key, num_buckets))?;
            let _bucket = bucket.lock().write();
            let mut list = bucket.list();

            let existing = list.iter().find(|pair| pair.first() == key);
            match existing {
                Some(mut pair) => {
                    if overwrite {
                        pair.set_second(value)?;
                    }
                    (false, list.len(), num_buckets)
                }
                None => {
                    list.push_back(ShmPair::new(alloc, key, value)?)?;
                    (true, list.len(), num_buckets)
                }
            }
        };

        if inserted {
            header.length.fetch_add(1, Ordering::Relaxed);
            if collisions as u64 > header.max_collisions {
                // The entry is in; a map that cannot grow only gets longer chains
                if let Err(e) = self.grow_map(num_buckets) {
                    log::warn!(
                        "map {:?}: cannot grow past {} buckets: {}",
                        self.handle.pointer(),
                        num_buckets,
                        e
                    );
                }
            }
        }
        Ok(inserted)
    }

    /// Rehash into more buckets unless someone else already did
    ///
    /// The new bucket vector is fully allocated before any entry moves, so a
    /// failed growth leaves the map as it was. Entries are relinked node by
    /// node and never reallocated.
    pub fn grow_map(&self, observed_buckets: usize) -> ShmResult<()> {
        let header = self.header();
        let alloc = self.handle.alloc();
        let _map = header.lock.write();

        let buckets = self.buckets();
        let old = buckets.len();
        if old != observed_buckets {
            return Ok(());
        }
        let scaled = old.saturating_mul(header.growth_numerator as usize) / header.growth_denominator as usize;
        let new = scaled.max(old.saturating_add(10));

        let mut fresh = ShmVec::<ShmBucket<K, V>>::new(alloc)?;
        fresh.reserve(new)?;
        for _ in 0..new {
            fresh.push(ShmBucket::new(alloc)?)?;
        }

        for bucket in buckets.iter() {
            let mut list = bucket.list();
            while let Some(key) = list.front().map(|pair| pair.first()) {
                let mut dst = fresh.get(Self::bucket_index(&key, new))?.list();
                list.move_front_to(&mut dst);
            }
        }

        // Hand the new buckets to the map; `fresh` now owns the emptied old ones
        let map_buckets = unsafe { &mut (*self.handle.header_ptr()).buckets };
        mem::swap(map_buckets, fresh.handle_mut().header_mut());
        fresh.destroy()?;

        log::debug!("map {:?}: grew from {} to {} buckets", self.handle.pointer(), old, new);
        Ok(())
    }

    /// Value stored under `key`: a copy for plain data, a view for containers
    pub fn get(&self, key: &K) -> Option<V> {
        let _map = self.header().lock.read();
        let buckets = self.buckets();
        let bucket = buckets.get(Self::bucket_index(key, buckets.len())).ok()?;
        let _bucket = bucket.lock().read();
        let found = bucket
            .list()
            .iter()
            .find(|pair| pair.first() == *key)
            .map(|pair| pair.second());
        found
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let _map = self.header().lock.read();
        let buckets = self.buckets();
        match buckets.get(Self::bucket_index(key, buckets.len())) {
            Ok(bucket) => {
                let _bucket = bucket.lock().read();
                let found = bucket.list().iter().any(|pair| pair.first() == *key);
                found
            }
            Err(_) => false,
        }
    }

    /// Remove `key`; returns true if it was present
    pub fn erase(&self, key: &K) -> ShmResult<bool> {
        let header = self.header();
        let removed = {
            let _map = header.lock.read();
            let buckets = self.buckets();
            let bucket = buckets.get(Self::bucket_index(key, buckets.len()))?;
            let _bucket = bucket.lock().write();
            let removed = bucket.list().retain(|pair| pair.first() != *key)?;
            removed
        };
        if removed > 0 {
            header.length.fetch_sub(removed as u64, Ordering::Relaxed);
        }
        Ok(removed > 0)
    }

    /// Destroy every entry, keeping the buckets
    pub fn clear(&self) -> ShmResult<()> {
        let header = self.header();
        let _map = header.lock.write();
        for bucket in self.buckets().iter() {
            bucket.list().clear()?;
        }
        header.length.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.header().length.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_buckets(&self) -> usize {
        let _map = self.header().lock.read();
        self.buckets().len()
    }

    pub fn max_collisions(&self) -> usize {
        self.header().max_collisions as usize
    }

    /// Visit every entry under the map and bucket read locks
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(K, V),
    {
        let _map = self.header().lock.read();
        for bucket in self.buckets().iter() {
            let _bucket = bucket.lock().read();
            for pair in bucket.list().iter() {
                f(pair.first(), pair.second());
            }
        }
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|k, v| out.push((k, v)));
        out
    }
}

impl<K, V, S> fmt::Debug for ShmHashMap<K, V, S>
where
    K: ShmElement + Hash + PartialEq + fmt::Debug,
    V: ShmElement + fmt::Debug,
    S: BuildHasher + Default,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmHashMap(null)");
        }
        f.debug_map().entries(self.entries()).finish()
    }
}
