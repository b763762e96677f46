//! Write-back LRU cache over a blob store.

use crate::{BlobStore, Key, Result, StoreError};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

/// LRU of keys with a byte budget instead of an entry budget.
struct SizedLru {
    entries: LruCache<Key, usize>,
    used: usize,
    capacity: usize,
}

impl SizedLru {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used: 0,
            capacity,
        }
    }

    fn contains(&mut self, key: &Key) -> bool {
        self.entries.get(key).is_some()
    }

    fn size_of(&mut self, key: &Key) -> Option<usize> {
        self.entries.get(key).copied()
    }

    /// Insert a key, returning the keys evicted to stay within budget.
    fn push(&mut self, key: Key, size: usize) -> Vec<Key> {
        if let Some(old) = self.entries.pop(&key) {
            self.used -= old;
        }
        let mut evicted = Vec::new();
        while self.used + size > self.capacity {
            match self.entries.pop_lru() {
                Some((victim, victim_size)) => {
                    self.used -= victim_size;
                    evicted.push(victim);
                }
                None => break,
            }
        }
        self.entries.push(key, size);
        self.used += size;
        evicted
    }

    fn remove(&mut self, key: &Key) -> bool {
        if let Some(size) = self.entries.pop(key) {
            self.used -= size;
            return true;
        }
        false
    }

    fn pop(&mut self) -> Option<(Key, usize)> {
        let popped = self.entries.pop_lru();
        if let Some((_, size)) = popped {
            self.used -= size;
        }
        popped
    }
}

/// Blob store with an in-memory LRU front.
///
/// Values whose length exceeds the bypass threshold skip the cache in both
/// directions; everything else is served from memory and written back on
/// eviction.
pub struct CachedStore<S: BlobStore> {
    store: S,
    lru: Mutex<SizedLru>,
    map: DashMap<Key, Vec<u8>>,
    bypass_threshold: usize,
}

impl<S: BlobStore> CachedStore<S> {
    /// Wrap `store` with a cache of `capacity` bytes.
    pub fn new(store: S, capacity: usize) -> Self {
        Self {
            store,
            lru: Mutex::new(SizedLru::new(capacity)),
            map: DashMap::new(),
            bypass_threshold: usize::MAX,
        }
    }

    /// Operations on values longer than `threshold` bypass the cache.
    #[must_use]
    pub fn with_bypass_threshold(mut self, threshold: usize) -> Self {
        self.bypass_threshold = threshold;
        self
    }

    fn flush_evicted(&self, evicted: Vec<Key>) -> Result<()> {
        for key in evicted {
            if let Some((_, data)) = self.map.remove(&key) {
                self.store.put_or_create(key, &data)?;
            }
        }
        Ok(())
    }

    /// Load a blob into the cache if absent. Caller holds no locks.
    fn ensure_cached(&self, key: Key) -> Result<()> {
        let mut lru = self.lru.lock();
        if lru.contains(&key) {
            return Ok(());
        }
        let size = self.store.blob_size(key)?;
        let mut data = vec![0_u8; size];
        self.store.get_all(key, &mut data)?;
        let evicted = lru.push(key, size);
        self.map.insert(key, data);
        drop(lru);
        self.flush_evicted(evicted)
    }
}

impl<S: BlobStore> BlobStore for CachedStore<S> {
    fn contains(&self, key: Key) -> Result<bool> {
        if self.lru.lock().contains(&key) {
            return Ok(true);
        }
        self.store.contains(key)
    }

    fn blob_size(&self, key: Key) -> Result<usize> {
        if let Some(size) = self.lru.lock().size_of(&key) {
            return Ok(size);
        }
        self.store.blob_size(key)
    }

    fn create(&self, key: Key, value: &[u8]) -> Result<()> {
        if value.len() > self.bypass_threshold {
            return self.store.create(key, value);
        }
        let mut lru = self.lru.lock();
        if lru.contains(&key) || self.store.contains(key)? {
            return Err(StoreError::AlreadyExists);
        }
        let evicted = lru.push(key, value.len());
        self.map.insert(key, value.to_vec());
        drop(lru);
        self.flush_evicted(evicted)?;
        self.store.create(key, value)
    }

    fn put_at(&self, key: Key, value: &[u8], offset: usize) -> Result<()> {
        if value.len() > self.bypass_threshold {
            return self.store.put_at(key, value, offset);
        }
        self.ensure_cached(key)?;
        let mut data = self.map.get_mut(&key).ok_or(StoreError::NotFound)?;
        if offset + value.len() > data.len() {
            return Err(StoreError::Range);
        }
        data[offset..offset + value.len()].copy_from_slice(value);
        Ok(())
    }

    fn put_or_create(&self, key: Key, value: &[u8]) -> Result<()> {
        if value.len() > self.bypass_threshold {
            return self.store.put_or_create(key, value);
        }
        let mut lru = self.lru.lock();
        let evicted = lru.push(key, value.len());
        self.map.insert(key, value.to_vec());
        drop(lru);
        self.flush_evicted(evicted)?;
        self.store.put_or_create(key, value)
    }

    fn get_all(&self, key: Key, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.bypass_threshold {
            return self.store.get_all(key, buf);
        }
        self.ensure_cached(key)?;
        let data = self.map.get(&key).ok_or(StoreError::NotFound)?;
        if data.len() != buf.len() {
            return Err(StoreError::Range);
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn get_at(&self, key: Key, buf: &mut [u8], offset: usize) -> Result<()> {
        if buf.len() > self.bypass_threshold {
            return self.store.get_at(key, buf, offset);
        }
        self.ensure_cached(key)?;
        let data = self.map.get(&key).ok_or(StoreError::NotFound)?;
        if offset + buf.len() > data.len() {
            return Err(StoreError::Range);
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn remove(&self, key: Key) -> Result<()> {
        // Invalidate the cache entry first so a failed backing remove never
        // leaves stale cached bytes serving reads.
        self.lru.lock().remove(&key);
        self.map.remove(&key);
        self.store.remove(key)
    }
}

impl<S: BlobStore> Drop for CachedStore<S> {
    fn drop(&mut self) {
        let mut lru = self.lru.lock();
        while let Some((key, _)) = lru.pop() {
            if let Some((_, data)) = self.map.remove(&key) {
                if let Err(e) = self.store.put_or_create(key, &data) {
                    warn!(?key, error = %e, "failed to flush cached blob");
                }
            }
        }
    }
}
