//! The swap tier.
//!
//! Swap spills entry state out of the in-memory cell: serialized value
//! bytes, type tag, version and TTL state travel together as one
//! `SwapEntry` tuple, which is the entire contract between the cell and the
//! swap manager. Entries whose value lives off-heap are indexed by the swap
//! manager as well, carrying the bare pointer instead of a byte copy.

pub mod device;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::offheap::OffHeapAllocator;
use crate::value::{CacheKey, TypeTag};
use crate::version::GridVersion;

/// The unit of exchange with the swap tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapEntry {
    pub key: CacheKey,
    #[serde(with = "serde_bytes")]
    pub value_bytes: Vec<u8>,
    pub type_tag: TypeTag,
    pub version: GridVersion,
    pub ttl: i64,
    pub expire_time: i64,
    pub key_loader_id: Option<u64>,
    pub value_loader_id: Option<u64>,
    /// Present when the value still resides off-heap; promotion adopts the
    /// pointer instead of copying bytes. Never persisted.
    #[serde(skip)]
    pub offheap_ptr: Option<u64>,
}

/// The swap manager consumed by the entry cell. Externally thread-safe;
/// `read_and_remove` is invoked under the entry lock as part of the
/// promote-once protocol.
pub trait SwapManager: Send + Sync {
    /// Whether evicting values to the off-heap tier is enabled at all.
    fn offheap_eviction_enabled(&self) -> bool {
        false
    }

    /// Re-enables off-heap eviction for a key whose value already resides
    /// off-heap, instead of writing a duplicate copy.
    fn enable_offheap_eviction(&self, _key: &CacheKey) -> CResult<()> {
        Ok(())
    }

    /// Reads the swap state for a key without removing it. `include_offheap`
    /// and `include_swap` select which tiers are consulted; `peek_only`
    /// promises the caller will not promote the result.
    fn read(
        &self,
        key: &CacheKey,
        peek_only: bool,
        include_offheap: bool,
        include_swap: bool,
    ) -> CResult<Option<SwapEntry>>;

    /// Reads and removes in one step (remove-on-read). The caller adopts
    /// any off-heap pointer the returned entry carries.
    fn read_and_remove(&self, key: &CacheKey) -> CResult<Option<SwapEntry>>;

    /// Reads the off-heap tier only; the returned entry carries the bare
    /// pointer.
    fn read_offheap_pointer(&self, key: &CacheKey) -> CResult<Option<SwapEntry>>;

    fn write(&self, entry: SwapEntry) -> CResult<()>;

    /// Flushes a batch of evictions in one swap I/O.
    fn write_batch(&self, entries: Vec<SwapEntry>) -> CResult<()> {
        for entry in entries {
            self.write(entry)?;
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CResult<()>;

    /// Removes any off-heap copy only, leaving disk swap state alone.
    fn remove_offheap(&self, key: &CacheKey) -> CResult<()>;
}

/// An in-memory swap device holding both tiers in one map. Entries carrying
/// an off-heap pointer belong to the off-heap tier, the rest to disk swap.
pub struct MemorySwap {
    entries: Mutex<HashMap<Vec<u8>, SwapEntry>>,
    evictable: Mutex<HashSet<Vec<u8>>>,
    /// Allocator used to release pointers adopted by the device.
    alloc: Option<Arc<dyn OffHeapAllocator>>,
    offheap_eviction: bool,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemorySwap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            evictable: Mutex::new(HashSet::new()),
            alloc: None,
            offheap_eviction: false,
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Enables the off-heap tier, releasing adopted pointers through the
    /// given allocator.
    pub fn with_allocator(mut self, alloc: Arc<dyn OffHeapAllocator>) -> Self {
        self.alloc = Some(alloc);
        self.offheap_eviction = true;
        self
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("swap poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether off-heap eviction has been re-enabled for a key.
    pub fn eviction_enabled_for(&self, key: &CacheKey) -> bool {
        self.evictable.lock().expect("swap poisoned").contains(key.bytes())
    }

    fn release_ptr(&self, entry: &SwapEntry) {
        if let (Some(ptr), Some(alloc)) = (entry.offheap_ptr, &self.alloc) {
            if let Err(err) = alloc.remove(ptr) {
                log::debug!("failed to release adopted off-heap pointer {}: {}", ptr, err);
            }
        }
    }
}

impl Default for MemorySwap {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapManager for MemorySwap {
    fn offheap_eviction_enabled(&self) -> bool {
        self.offheap_eviction
    }

    fn enable_offheap_eviction(&self, key: &CacheKey) -> CResult<()> {
        self.evictable.lock()?.insert(key.bytes().to_vec());
        Ok(())
    }

    fn read(
        &self,
        key: &CacheKey,
        _peek_only: bool,
        include_offheap: bool,
        include_swap: bool,
    ) -> CResult<Option<SwapEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock()?;
        match entries.get(key.bytes()) {
            Some(entry) if entry.offheap_ptr.is_some() && include_offheap => {
                Ok(Some(entry.clone()))
            }
            Some(entry) if entry.offheap_ptr.is_none() && include_swap => Ok(Some(entry.clone())),
            _ => Ok(None),
        }
    }

    fn read_and_remove(&self, key: &CacheKey) -> CResult<Option<SwapEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.evictable.lock()?.remove(key.bytes());
        Ok(self.entries.lock()?.remove(key.bytes()))
    }

    fn read_offheap_pointer(&self, key: &CacheKey) -> CResult<Option<SwapEntry>> {
        self.read(key, true, true, false)
    }

    fn write(&self, entry: SwapEntry) -> CResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(old) = self.entries.lock()?.insert(entry.key.bytes().to_vec(), entry) {
            self.release_ptr(&old);
        }
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CResult<()> {
        self.evictable.lock()?.remove(key.bytes());
        if let Some(old) = self.entries.lock()?.remove(key.bytes()) {
            self.release_ptr(&old);
        }
        Ok(())
    }

    fn remove_offheap(&self, key: &CacheKey) -> CResult<()> {
        let mut entries = self.entries.lock()?;
        if entries.get(key.bytes()).map_or(false, |e| e.offheap_ptr.is_some()) {
            if let Some(old) = entries.remove(key.bytes()) {
                self.release_ptr(&old);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(key: &CacheKey, bytes: &[u8], ptr: Option<u64>) -> SwapEntry {
        SwapEntry {
            key: key.clone(),
            value_bytes: bytes.to_vec(),
            type_tag: 0,
            version: GridVersion::new(1, 1, 1, 0),
            ttl: 0,
            expire_time: 0,
            key_loader_id: None,
            value_loader_id: None,
            offheap_ptr: ptr,
        }
    }

    #[test]
    fn write_read_round_trip() -> CResult<()> {
        let swap = MemorySwap::new();
        let key = CacheKey::new(b"k".to_vec());
        swap.write(entry(&key, b"v", None))?;

        let read = swap.read(&key, false, false, true)?.unwrap();
        assert_eq!(read.value_bytes, b"v".to_vec());

        // The swap-tier entry is invisible to an off-heap-only read.
        assert_eq!(swap.read(&key, false, true, false)?, None);
        Ok(())
    }

    #[test]
    fn read_and_remove_removes() -> CResult<()> {
        let swap = MemorySwap::new();
        let key = CacheKey::new(b"k".to_vec());
        swap.write(entry(&key, b"v", None))?;

        assert!(swap.read_and_remove(&key)?.is_some());
        assert!(swap.read_and_remove(&key)?.is_none());
        assert!(swap.is_empty());
        Ok(())
    }

    #[test]
    fn offheap_tier_selection() -> CResult<()> {
        let swap = MemorySwap::new();
        let key = CacheKey::new(b"k".to_vec());
        swap.write(entry(&key, b"", Some(42)))?;

        assert!(swap.read_offheap_pointer(&key)?.is_some());
        assert_eq!(swap.read(&key, false, false, true)?, None);
        Ok(())
    }

    #[test]
    fn eviction_enable_tracks_keys() -> CResult<()> {
        let swap = MemorySwap::new();
        let key = CacheKey::new(b"k".to_vec());
        assert!(!swap.eviction_enabled_for(&key));
        swap.enable_offheap_eviction(&key)?;
        assert!(swap.eviction_enabled_for(&key));
        Ok(())
    }
}
