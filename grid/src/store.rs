//! The persistent store seam.
//!
//! The store is consulted on read misses (read-through) and mirrored on
//! writes and removes (write-through). Store I/O happens outside the entry
//! lock for transactional operations; atomic-mode updates call it inside,
//! which the trait must tolerate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::CResult;
use crate::value::{CacheKey, CacheValue};
use crate::version::GridVersion;

/// A read-through/write-through persistent store. Implementations are
/// externally thread-safe.
pub trait CacheStore: Send + Sync {
    /// Whether the store is consulted on read misses.
    fn read_through(&self) -> bool {
        true
    }

    /// Whether writes and removes are mirrored to the store.
    fn write_through(&self) -> bool {
        true
    }

    /// Whether atomic updates load the previous value from the store.
    fn load_previous_value(&self) -> bool {
        false
    }

    /// Whether the store is node-local (each node holds its own data).
    fn is_local(&self) -> bool {
        false
    }

    /// Loads the value for a key. `tx` associates the load with an outer
    /// transaction when one is in progress.
    fn load(&self, tx: Option<u64>, key: &CacheKey) -> CResult<Option<CacheValue>>;

    fn put(
        &self,
        tx: Option<u64>,
        key: &CacheKey,
        value: &CacheValue,
        version: &GridVersion,
    ) -> CResult<()>;

    fn remove(&self, tx: Option<u64>, key: &CacheKey) -> CResult<()>;
}

/// An in-memory store over a BTreeMap, with operation counters. The default
/// store for tests and local embeddings.
pub struct MemStore {
    data: Mutex<BTreeMap<Vec<u8>, CacheValue>>,
    loads: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            loads: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    /// Seeds a key/value pair, bypassing the counters.
    pub fn seed(&self, key: &CacheKey, value: CacheValue) {
        self.data.lock().expect("store poisoned").insert(key.bytes().to_vec(), value);
    }

    /// The stored value for a key, if any.
    pub fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        self.data.lock().expect("store poisoned").get(key.bytes()).cloned()
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::SeqCst)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemStore {
    fn load(&self, _tx: Option<u64>, key: &CacheKey) -> CResult<Option<CacheValue>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.data.lock()?.get(key.bytes()).cloned())
    }

    fn put(
        &self,
        _tx: Option<u64>,
        key: &CacheKey,
        value: &CacheValue,
        _version: &GridVersion,
    ) -> CResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.data.lock()?.insert(key.bytes().to_vec(), value.clone());
        Ok(())
    }

    fn remove(&self, _tx: Option<u64>, key: &CacheKey) -> CResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.data.lock()?.remove(key.bytes());
        Ok(())
    }
}
