//! Bounded-memory LRU of fully-loaded source instances.
//!
//! The sender reads chunk bytes through this cache so that a bucket of
//! many small instances does not hit the host archive once per chunk.
//! Entries are whole instances; reads copy the requested subrange out
//! under the cache lock so no caller ever holds borrowed cache memory
//! across network I/O.

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tracing::debug;

use caravel_types::instance::content_md5;
use caravel_types::{CaravelError, InstanceInfo, Result, TransferBucket};

use crate::archive::Archive;

struct CachedInstance {
    info: InstanceInfo,
    content: Vec<u8>,
}

impl CachedInstance {
    fn chunk(&self, offset: u64, size: u64) -> Result<(Vec<u8>, String)> {
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= self.content.len() as u64)
            .ok_or_else(|| {
                CaravelError::ParameterOutOfRange(format!(
                    "chunk {offset}+{size} out of bounds for instance {} of size {}",
                    self.info.id(),
                    self.content.len()
                ))
            })?;

        let copy = self.content[offset as usize..end as usize].to_vec();
        let md5 = content_md5(&copy);
        Ok((copy, md5))
    }
}

struct CacheInner {
    entries: LruCache<String, CachedInstance>,
    memory_size: u64,
    max_memory_size: u64,
}

impl CacheInner {
    fn evict_oldest(&mut self) {
        if let Some((id, evicted)) = self.entries.pop_lru() {
            self.memory_size -= evicted.info.size();
            debug!(instance = %id, "evicted instance from the transfer cache");
        }
    }

    /// Insert a freshly loaded instance, evicting from the oldest until
    /// it fits. A single instance larger than the whole cache is
    /// admitted intact.
    fn store(&mut self, id: &str, instance: CachedInstance) {
        if self.entries.contains(id) {
            // Another thread loaded the same instance since our lookup;
            // keep the resident copy and only refresh its recency.
            self.entries.promote(id);
            return;
        }

        while !self.entries.is_empty()
            && self.memory_size + instance.info.size() > self.max_memory_size
        {
            self.evict_oldest();
        }

        self.memory_size += instance.info.size();
        self.entries.put(id.to_string(), instance);
    }
}

/// Thread-safe LRU of source instances, sized in bytes.
pub struct InstancesCache {
    archive: Arc<dyn Archive>,
    inner: Mutex<CacheInner>,
}

impl InstancesCache {
    pub fn new(archive: Arc<dyn Archive>, max_memory_size: u64) -> Self {
        Self {
            archive,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                memory_size: 0,
                max_memory_size,
            }),
        }
    }

    /// The host archive this cache reads through.
    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    pub fn memory_size(&self) -> u64 {
        self.lock().memory_size
    }

    pub fn max_memory_size(&self) -> u64 {
        self.lock().max_memory_size
    }

    /// Shrink (or grow) the cache capacity, evicting from the oldest as
    /// needed. A single oversized resident entry survives.
    pub fn set_max_memory_size(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "the cache size must be positive".into(),
            ));
        }

        let mut inner = self.lock();
        while inner.memory_size > size && inner.entries.len() > 1 {
            inner.evict_oldest();
        }
        inner.max_memory_size = size;
        Ok(())
    }

    /// Descriptor of an instance, loading it whole on a miss.
    pub fn instance_info(&self, instance_id: &str) -> Result<InstanceInfo> {
        if let Some(entry) = self.lock().entries.get(instance_id) {
            return Ok(entry.info.clone());
        }

        let instance = self.load(instance_id)?;
        let info = instance.info.clone();
        self.lock().store(instance_id, instance);
        Ok(info)
    }

    /// Copy one byte range of an instance, with the MD5 of the copy.
    pub fn chunk(&self, instance_id: &str, offset: u64, size: u64) -> Result<(Vec<u8>, String)> {
        if let Some(entry) = self.lock().entries.get(instance_id) {
            return entry.chunk(offset, size);
        }

        let instance = self.load(instance_id)?;
        let chunk = instance.chunk(offset, size)?;
        self.lock().store(instance_id, instance);
        Ok(chunk)
    }

    /// Copy the bytes of one chunk of a bucket.
    pub fn bucket_chunk(&self, bucket: &TransferBucket, index: usize) -> Result<(Vec<u8>, String)> {
        let chunk = bucket.chunk(index)?;
        self.chunk(&chunk.instance_id, chunk.offset, chunk.size)
    }

    /// Load an instance whole from the host archive. Runs without the
    /// cache lock so slow archive reads do not stall other workers.
    fn load(&self, instance_id: &str) -> Result<CachedInstance> {
        debug!(instance = instance_id, "transfer cache miss, reading from the archive");
        let content = self.archive.read_instance(instance_id)?;
        let info = InstanceInfo::from_content(instance_id, &content);
        Ok(CachedInstance { info, content })
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap()
    }
}
