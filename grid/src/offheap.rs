//! The off-heap value tier.
//!
//! In off-heap memory modes the entry keeps only a pointer; the serialized
//! bytes and type tag live in the allocator. The pointer is held through a
//! move-only handle that releases the allocation on drop unless the pointer
//! is explicitly adopted by the swap tier or a successor value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CResult, Error};
use crate::value::TypeTag;

/// An off-heap memory allocator for serialized values. Implementations are
/// externally thread-safe; the entry calls them under its own lock.
pub trait OffHeapAllocator: Send + Sync {
    /// Places bytes plus a type tag off-heap, returning the address.
    fn put(&self, bytes: &[u8], tag: TypeTag) -> CResult<u64>;

    /// Reads back the bytes and type tag at an address.
    fn get(&self, ptr: u64) -> CResult<(Vec<u8>, TypeTag)>;

    /// Releases the allocation at an address.
    fn remove(&self, ptr: u64) -> CResult<()>;

    /// Total bytes currently allocated.
    fn allocated(&self) -> u64;
}

/// A slab-style allocator backed by boxed slices outside any entry state.
pub struct ArenaAllocator {
    slots: Mutex<HashMap<u64, (TypeTag, Box<[u8]>)>>,
    next: AtomicU64,
    bytes: AtomicU64,
}

impl ArenaAllocator {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
            bytes: AtomicU64::new(0),
        }
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.slots.lock().expect("arena poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl OffHeapAllocator for ArenaAllocator {
    fn put(&self, bytes: &[u8], tag: TypeTag) -> CResult<u64> {
        let ptr = self.next.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.slots.lock()?.insert(ptr, (tag, bytes.to_vec().into_boxed_slice()));
        Ok(ptr)
    }

    fn get(&self, ptr: u64) -> CResult<(Vec<u8>, TypeTag)> {
        match self.slots.lock()?.get(&ptr) {
            Some((tag, bytes)) => Ok((bytes.to_vec(), *tag)),
            None => Err(Error::Internal(format!("no off-heap allocation at {}", ptr))),
        }
    }

    fn remove(&self, ptr: u64) -> CResult<()> {
        if let Some((_, bytes)) = self.slots.lock()?.remove(&ptr) {
            self.bytes.fetch_sub(bytes.len() as u64, Ordering::SeqCst);
        }
        Ok(())
    }

    fn allocated(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// A move-only handle to an off-heap allocation. Dropping the handle
/// releases the allocation; `into_raw` transfers ownership of the bare
/// address to swap or to a successor value instead.
pub struct OffHeapHandle {
    ptr: u64,
    alloc: Option<Arc<dyn OffHeapAllocator>>,
}

impl OffHeapHandle {
    pub fn new(ptr: u64, alloc: Arc<dyn OffHeapAllocator>) -> Self {
        Self { ptr, alloc: Some(alloc) }
    }

    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Reads the bytes and type tag behind the handle.
    pub fn read(&self) -> CResult<(Vec<u8>, TypeTag)> {
        match &self.alloc {
            Some(alloc) => alloc.get(self.ptr),
            None => Err(Error::Internal("off-heap handle already released".into())),
        }
    }

    /// Gives up ownership without releasing. The caller is responsible for
    /// the allocation from here on.
    pub fn into_raw(mut self) -> u64 {
        self.alloc = None;
        self.ptr
    }
}

impl Drop for OffHeapHandle {
    fn drop(&mut self) {
        if let Some(alloc) = self.alloc.take() {
            if let Err(err) = alloc.remove(self.ptr) {
                log::debug!("failed to release off-heap allocation {}: {}", self.ptr, err);
            }
        }
    }
}

impl std::fmt::Debug for OffHeapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OffHeapHandle({})", self.ptr)
    }
}
