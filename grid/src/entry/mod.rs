//! The per-key entry cell.
//!
//! Every operation on a key is dispatched to exactly one `GridEntry`. The
//! entry is the lock, the value holder, the lock-candidate record, the TTL
//! tracker, the index-update site, the write-through sink, the swap and
//! off-heap handle and the event source for its key, all at once.
//!
//! All non-trivial reads and writes acquire the entry's own mutex. Store
//! I/O happens outside the mutex for transactional operations (re-validated
//! with an optimistic version check on re-entry) and inside it for atomic
//! ones. Events and continuous-query notifications fire inside the mutex,
//! so they observe the same per-key order as the mutations that caused
//! them.
//!
//! Lifecycle: an entry is created New by the owning map, turns Live on its
//! first successful update, and ends Deleted (a deferred-delete tombstone)
//! or Obsolete (terminal). Once obsolete, every operation returns the
//! removed signal and the caller re-fetches a fresh entry.

pub mod extras;
pub mod ops;
pub mod peek;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::CacheContext;
use crate::error::{CResult, Error};
use crate::expiry;
use crate::offheap::OffHeapHandle;
use crate::swap::SwapEntry;
use crate::value::{CacheKey, CacheValue, TypeTag};
use crate::version::GridVersion;

use extras::{Attributes, EntryExtras, ExtrasParts};

/// Deferred-delete tombstone.
const FLAG_DELETED: u8 = 0b01;

/// Swap has already been consulted for this entry.
const FLAG_UNSWAPPED: u8 = 0b10;

/// Fixed on-heap footprint of an entry, excluding extras, key and value.
/// Recomputed whenever fields are added.
const ENTRY_OVERHEAD: usize = 77;

/// The value slot. Exactly one representation holds the current value at
/// rest; `OffHeap` means the bytes live in the allocator only.
enum ValueSlot {
    Empty,
    Heap(CacheValue),
    OffHeap { handle: OffHeapHandle, len: usize, tag: TypeTag },
}

impl ValueSlot {
    fn has_value(&self) -> bool {
        !matches!(self, ValueSlot::Empty)
    }

    /// Length of the value's byte representation; zero when empty.
    fn byte_len(&self) -> usize {
        match self {
            ValueSlot::Empty => 0,
            ValueSlot::Heap(v) => v.len(),
            ValueSlot::OffHeap { len, .. } => *len,
        }
    }
}

/// Entry state guarded by the entry mutex.
struct EntryInner {
    val: ValueSlot,
    ver: GridVersion,
    extras: Option<EntryExtras>,
    flags: u8,
}

/// A snapshot of an entry's versioned state, as handed to rebalancing and
/// version-aware user code.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedEntry {
    pub key: CacheKey,
    pub value: Option<CacheValue>,
    pub ttl: i64,
    pub expire_time: i64,
    pub version: GridVersion,
    pub conflict_version: Option<GridVersion>,
    pub is_new: bool,
}

/// A transfer snapshot used by preloading/supply: the value travels in its
/// byte form.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub value_bytes: Option<(Vec<u8>, TypeTag)>,
    pub ttl: i64,
    pub expire_time: i64,
    pub version: GridVersion,
    pub is_new: bool,
    pub deleted: bool,
}

/// The per-key entry cell.
pub struct GridEntry {
    ctx: Arc<CacheContext>,
    key: CacheKey,
    /// The version order captured at construction; together with the local
    /// node order it identifies an entry that has never been updated.
    start_ver_order: u64,
    /// Lock-free obsolescence hint for the owning map. Decisions always
    /// take the lock.
    obsolete_hint: AtomicBool,
    inner: Mutex<EntryInner>,
    /// Successor links for the owning map's segmented bucket chains;
    /// written only by the map, segment parity selects the slot.
    next: Mutex<[Option<Arc<GridEntry>>; 2]>,
}

impl GridEntry {
    /// Creates an entry under a fresh version. The initial value, if any,
    /// is committed to the configured value tier and the TTL is applied
    /// immediately.
    pub fn new(
        ctx: Arc<CacheContext>,
        key: CacheKey,
        initial: Option<CacheValue>,
        ttl: i64,
    ) -> CResult<Self> {
        debug_assert!(ttl >= 0, "TTL sentinels must not reach construction");

        let ver = ctx.versions().next();
        let start_ver_order = ver.order;

        let extras = if ttl > 0 {
            extras::rebuild(ExtrasParts {
                ttl,
                expire_time: expiry::expire_time(ttl, ctx.now_millis()),
                ..Default::default()
            })
        } else {
            None
        };

        let entry = Self {
            ctx,
            key,
            start_ver_order,
            obsolete_hint: AtomicBool::new(false),
            inner: Mutex::new(EntryInner { val: ValueSlot::Empty, ver, extras, flags: 0 }),
            next: Mutex::new([None, None]),
        };

        if initial.is_some() {
            let mut inner = entry.lock()?;
            entry.set_value_locked(&mut inner, initial)?;
            drop(inner);
            entry.retrack()?;
        }

        Ok(entry)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn hash(&self) -> u32 {
        self.key.hash()
    }

    pub fn partition(&self) -> u32 {
        self.ctx.topology().partition(&self.key)
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.ctx
    }

    /// The key's byte form, as handed to swap and the store.
    pub fn key_bytes(&self) -> &[u8] {
        self.key.bytes()
    }

    // ---------------------------------------------------------------- lock

    fn lock(&self) -> CResult<MutexGuard<'_, EntryInner>> {
        Ok(self.inner.lock()?)
    }

    fn check_obsolete(&self, inner: &EntryInner) -> CResult<()> {
        if self.obsolete_version_unlocked(inner).is_some() {
            return Err(Error::EntryRemoved);
        }
        Ok(())
    }

    // -------------------------------------------------------- value store

    /// Replaces the value slot, honoring the configured memory mode. In
    /// off-heap-values mode the serialized bytes move through the
    /// allocator before the old slot is dropped, so a codec or allocator
    /// failure leaves the previous value intact.
    fn set_value_locked(&self, inner: &mut EntryInner, v: Option<CacheValue>) -> CResult<()> {
        if self.ctx.config().block_data_cache {
            if let Some(accountant) = self.ctx.size_accountant() {
                let new_len = v.as_ref().map_or(0, |v| v.len()) as i64;
                accountant.on_size_delta(new_len - inner.val.byte_len() as i64);
            }
        }

        let slot = match v {
            None => ValueSlot::Empty,
            Some(val) if self.ctx.offheap_values() => {
                let alloc = self.ctx.offheap().ok_or_else(|| {
                    Error::Internal("off-heap memory mode without an allocator".into())
                })?;
                let (bytes, tag) = val.value_bytes();
                let len = bytes.len();
                let ptr = alloc.put(bytes, tag)?;
                ValueSlot::OffHeap { handle: OffHeapHandle::new(ptr, alloc.clone()), len, tag }
            }
            Some(val) => ValueSlot::Heap(val),
        };

        // Dropping the old slot releases any off-heap allocation it held.
        inner.val = slot;
        Ok(())
    }

    /// Reads the current value. Off-heap values are rehydrated only when
    /// `unmarshal` is set.
    fn value_unlocked(&self, inner: &EntryInner, unmarshal: bool) -> CResult<Option<CacheValue>> {
        match &inner.val {
            ValueSlot::Empty => Ok(None),
            ValueSlot::Heap(v) => Ok(Some(v.clone())),
            ValueSlot::OffHeap { handle, .. } => {
                if !unmarshal {
                    return Ok(None);
                }
                let (bytes, tag) = handle.read()?;
                Ok(Some(CacheValue::from_parts(bytes, tag)))
            }
        }
    }

    /// The value's byte representation plus type tag, from whichever slot
    /// representation is present. It is an error to call with neither.
    fn value_bytes_unlocked(&self, inner: &EntryInner) -> CResult<(Vec<u8>, TypeTag)> {
        match &inner.val {
            ValueSlot::Empty => Err(Error::Internal("entry has no value".into())),
            ValueSlot::Heap(v) => {
                let (bytes, tag) = v.value_bytes();
                Ok((bytes.to_vec(), tag))
            }
            ValueSlot::OffHeap { handle, .. } => handle.read(),
        }
    }

    fn has_value_unlocked(&self, inner: &EntryInner) -> bool {
        inner.val.has_value()
    }

    // ---------------------------------------------------------- ttl state

    fn ttl_unlocked(inner: &EntryInner) -> i64 {
        inner.extras.as_ref().map_or(0, |e| e.ttl())
    }

    fn expire_time_unlocked(inner: &EntryInner) -> i64 {
        inner.extras.as_ref().map_or(0, |e| e.expire_time())
    }

    fn expired_unlocked(&self, inner: &EntryInner, now: i64) -> bool {
        let expire = Self::expire_time_unlocked(inner);
        expire > 0 && expire <= now
    }

    fn set_ttl_locked(&self, inner: &mut EntryInner, ttl: i64, expire_time: i64) {
        let mut parts = ExtrasParts::from(inner.extras.take());
        parts.ttl = ttl;
        parts.expire_time = expire_time;
        inner.extras = extras::rebuild(parts);
    }

    /// Re-registers the entry with the eager-TTL tracker to match its
    /// current expire time and liveness.
    fn retrack(&self) -> CResult<()> {
        if !self.ctx.config().eager_ttl {
            return Ok(());
        }
        let tracker = match self.ctx.ttl_tracker() {
            Some(t) => t.clone(),
            None => return Ok(()),
        };
        let inner = self.lock()?;
        let expire = Self::expire_time_unlocked(&inner);
        let live = self.obsolete_version_unlocked(&inner).is_none();
        drop(inner);
        if expire > 0 && live {
            tracker.track(&self.key, expire);
        } else {
            tracker.untrack(&self.key);
        }
        Ok(())
    }

    fn retrack_locked(&self, inner: &EntryInner) {
        if !self.ctx.config().eager_ttl {
            return;
        }
        if let Some(tracker) = self.ctx.ttl_tracker() {
            let expire = Self::expire_time_unlocked(inner);
            if expire > 0 && self.obsolete_version_unlocked(inner).is_none() {
                tracker.track(&self.key, expire);
            } else {
                tracker.untrack(&self.key);
            }
        }
    }

    pub fn ttl(&self) -> CResult<i64> {
        let inner = self.lock()?;
        Ok(Self::ttl_unlocked(&inner))
    }

    pub fn expire_time(&self) -> CResult<i64> {
        let inner = self.lock()?;
        Ok(Self::expire_time_unlocked(&inner))
    }

    /// Refreshes the TTL in place if the version still matches. Used by
    /// expiry-policy access refreshes arriving from remote reads.
    pub fn update_ttl(&self, ver: Option<&GridVersion>, ttl: i64) -> CResult<bool> {
        debug_assert!(ttl >= 0, "TTL sentinels must not be stored");
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;
        if let Some(expect) = ver {
            if expect != &inner.ver {
                return Ok(false);
            }
        }
        let expire = expiry::expire_time(ttl, self.ctx.now_millis());
        self.set_ttl_locked(&mut inner, ttl, expire);
        self.retrack_locked(&inner);
        Ok(true)
    }

    // ----------------------------------------------------------- flags

    fn deleted_unlocked(inner: &EntryInner) -> bool {
        inner.flags & FLAG_DELETED != 0
    }

    fn set_deleted_locked(&self, inner: &mut EntryInner, deleted: bool) {
        debug_assert!(
            !deleted || self.ctx.deferred_delete_enabled(),
            "tombstones require deferred delete"
        );
        if deleted {
            inner.flags |= FLAG_DELETED;
        } else {
            inner.flags &= !FLAG_DELETED;
        }
    }

    fn unswapped_unlocked(inner: &EntryInner) -> bool {
        inner.flags & FLAG_UNSWAPPED != 0
    }

    /// Whether the entry carries a deferred-delete tombstone.
    pub fn deleted(&self) -> CResult<bool> {
        let inner = self.lock()?;
        Ok(Self::deleted_unlocked(&inner))
    }

    // ----------------------------------------------------------- lifecycle

    fn is_new_unlocked(&self, inner: &EntryInner) -> bool {
        inner.ver.order == self.start_ver_order
            && inner.ver.node_order == self.ctx.versions().node_order()
    }

    /// Whether the entry has never been updated since construction.
    pub fn is_start_version(&self) -> CResult<bool> {
        let inner = self.lock()?;
        Ok(self.is_new_unlocked(&inner))
    }

    fn obsolete_version_unlocked<'a>(&self, inner: &'a EntryInner) -> Option<&'a GridVersion> {
        inner.extras.as_ref().and_then(|e| e.obsolete_version())
    }

    /// Lock-free obsolescence hint. May lag the locked state; decisions
    /// take the lock.
    pub fn obsolete_hint(&self) -> bool {
        self.obsolete_hint.load(Ordering::SeqCst)
    }

    pub fn obsolete(&self) -> CResult<bool> {
        let inner = self.lock()?;
        Ok(self.obsolete_version_unlocked(&inner).is_some())
    }

    pub fn obsolete_version(&self) -> CResult<Option<GridVersion>> {
        let inner = self.lock()?;
        Ok(self.obsolete_version_unlocked(&inner).cloned())
    }

    /// Marks the entry obsolete, clearing the value. Returns false while
    /// lock candidates other than `ver` keep the entry in use.
    pub fn mark_obsolete(&self, ver: GridVersion) -> CResult<bool> {
        let mut inner = self.lock()?;
        self.mark_obsolete0(&mut inner, ver, true)
    }

    /// The obsoletion primitive. Obsolete is terminal: once set the version
    /// never clears. A no-op returning true when already obsolete.
    fn mark_obsolete0(
        &self,
        inner: &mut EntryInner,
        ver: GridVersion,
        clear: bool,
    ) -> CResult<bool> {
        if self.obsolete_version_unlocked(inner).is_some() {
            return Ok(true);
        }

        if let Some(mvcc) = inner.extras.as_ref().and_then(|e| e.mvcc()) {
            if !mvcc.is_empty_excluding(&[&ver]) {
                return Ok(false);
            }
        }

        let mut parts = ExtrasParts::from(inner.extras.take());
        parts.obsolete = Some(ver);
        inner.extras = extras::rebuild(parts);

        if clear {
            self.set_value_locked(inner, None)?;
        }

        self.obsolete_hint.store(true, Ordering::SeqCst);
        self.retrack_locked(inner);
        Ok(true)
    }

    /// Obsoletes the entry only if it has no value or has expired. Under
    /// deferred delete a live empty entry is tombstoned and enqueued
    /// instead. Returns whether the entry became obsolete.
    pub fn mark_obsolete_if_empty(&self, ver: Option<GridVersion>) -> CResult<bool> {
        let mut inner = self.lock()?;
        if self.obsolete_version_unlocked(&inner).is_some() {
            return Ok(false);
        }

        let now = self.ctx.now_millis();
        let empty = !self.has_value_unlocked(&inner) || self.expired_unlocked(&inner, now);
        if !empty {
            return Ok(false);
        }

        if self.ctx.deferred_delete_enabled() && !Self::deleted_unlocked(&inner) {
            let ver = ver.unwrap_or_else(|| self.ctx.versions().next());
            self.set_deleted_locked(&mut inner, true);
            self.set_value_locked(&mut inner, None)?;
            inner.ver = ver.clone();
            if let Some(queue) = self.ctx.deferred_deletes() {
                queue.enqueue(&self.key, ver);
            }
            return Ok(false);
        }

        let ver = ver.unwrap_or_else(|| self.ctx.versions().next());
        self.mark_obsolete0(&mut inner, ver, true)
    }

    // ---------------------------------------------------------- swap tier

    /// Writes the live value out to the swap tier. Expired entries only
    /// shed their off-heap copy; values already off-heap re-enable
    /// off-heap eviction instead of writing a duplicate.
    pub fn swap(&self) -> CResult<()> {
        let swap = match self.ctx.swap() {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        if !self.ctx.swap_or_offheap_enabled() {
            return Ok(());
        }

        let inner = self.lock()?;
        if Self::deleted_unlocked(&inner) || !self.has_value_unlocked(&inner) {
            return Ok(());
        }

        let now = self.ctx.now_millis();
        if self.expired_unlocked(&inner, now) {
            swap.remove_offheap(&self.key)?;
            return Ok(());
        }

        if let ValueSlot::OffHeap { .. } = inner.val {
            if swap.offheap_eviction_enabled() {
                swap.enable_offheap_eviction(&self.key)?;
            }
            return Ok(());
        }

        let (bytes, tag) = self.value_bytes_unlocked(&inner)?;
        swap.write(SwapEntry {
            key: self.key.clone(),
            value_bytes: bytes,
            type_tag: tag,
            version: inner.ver.clone(),
            ttl: Self::ttl_unlocked(&inner),
            expire_time: Self::expire_time_unlocked(&inner),
            key_loader_id: None,
            value_loader_id: None,
            offheap_ptr: None,
        })?;
        log::debug!("Wrote swap entry for key {}", self.key);
        Ok(())
    }

    /// Promotes swap/off-heap state into the entry. Runs at most once per
    /// entry; expired swap state is released instead of promoted. Returns
    /// the promoted value when `need_value` is set.
    pub fn unswap(&self, ignore_flags: bool, need_value: bool) -> CResult<Option<CacheValue>> {
        let mut inner = self.lock()?;
        self.unswap_locked(&mut inner, ignore_flags, need_value)
    }

    fn unswap_locked(
        &self,
        inner: &mut EntryInner,
        ignore_flags: bool,
        need_value: bool,
    ) -> CResult<Option<CacheValue>> {
        let swap = match self.ctx.swap() {
            Some(s) => s.clone(),
            None => return Ok(None),
        };
        if !ignore_flags && !self.ctx.swap_or_offheap_enabled() {
            return Ok(None);
        }
        if Self::unswapped_unlocked(inner) {
            return Ok(None);
        }
        inner.flags |= FLAG_UNSWAPPED;

        let entry = match swap.read_and_remove(&self.key)? {
            Some(e) => e,
            None => return Ok(None),
        };

        let now = self.ctx.now_millis();
        if entry.expire_time > 0 && entry.expire_time <= now {
            // Expired while swapped out: release instead of promoting.
            self.clear_index()?;
            return Ok(None);
        }

        if let Some(ptr) = entry.offheap_ptr {
            let alloc = self.ctx.offheap().ok_or_else(|| {
                Error::Internal("adopted off-heap pointer without an allocator".into())
            })?;
            let (bytes, tag) = alloc.get(ptr)?;
            inner.val = ValueSlot::OffHeap {
                handle: OffHeapHandle::new(ptr, alloc.clone()),
                len: bytes.len(),
                tag,
            };
        } else {
            let val = CacheValue::from_parts(entry.value_bytes.clone(), entry.type_tag);
            self.set_value_locked(inner, Some(val))?;
        }

        inner.ver = entry.version;
        self.set_ttl_locked(inner, entry.ttl, entry.expire_time);
        self.retrack_locked(inner);
        log::debug!("Promoted swap entry for key {}", self.key);

        if need_value {
            self.value_unlocked(inner, true)
        } else {
            Ok(None)
        }
    }

    /// Marks the entry obsolete without clearing the value and returns a
    /// swap descriptor, so the caller can flush many evictions in one swap
    /// I/O. Returns None when the entry stays (lock candidates) or has
    /// nothing worth swapping.
    pub fn evict_in_batch(&self, obsolete_ver: GridVersion) -> CResult<Option<SwapEntry>> {
        let mut inner = self.lock()?;
        if !self.mark_obsolete0(&mut inner, obsolete_ver, false)? {
            return Ok(None);
        }

        if self.ctx.statistics_enabled() {
            self.ctx.metrics().on_evict();
        }

        let now = self.ctx.now_millis();
        if !self.has_value_unlocked(&inner)
            || self.expired_unlocked(&inner, now)
            || Self::deleted_unlocked(&inner)
        {
            return Ok(None);
        }

        let (bytes, tag) = self.value_bytes_unlocked(&inner)?;
        Ok(Some(SwapEntry {
            key: self.key.clone(),
            value_bytes: bytes,
            type_tag: tag,
            version: inner.ver.clone(),
            ttl: Self::ttl_unlocked(&inner),
            expire_time: Self::expire_time_unlocked(&inner),
            key_loader_id: None,
            value_loader_id: None,
            offheap_ptr: None,
        }))
    }

    /// Evicts the entry: writes it to swap first when asked, then marks it
    /// obsolete. The filter sees the current value; lock candidates veto.
    pub fn evict_internal(
        &self,
        swap: bool,
        obsolete_ver: GridVersion,
        filter: Option<&ops::EntryFilter>,
    ) -> CResult<bool> {
        let mut inner = self.lock()?;
        if self.obsolete_version_unlocked(&inner).is_some() {
            return Ok(false);
        }

        if let Some(filter) = filter {
            let val = self.value_unlocked(&inner, true)?;
            if !filter(val.as_ref()) {
                return Ok(false);
            }
        }

        if swap && self.ctx.swap_or_offheap_enabled() {
            let now = self.ctx.now_millis();
            if self.has_value_unlocked(&inner)
                && !self.expired_unlocked(&inner, now)
                && !Self::deleted_unlocked(&inner)
            {
                if let Some(mgr) = self.ctx.swap() {
                    let (bytes, tag) = self.value_bytes_unlocked(&inner)?;
                    mgr.write(SwapEntry {
                        key: self.key.clone(),
                        value_bytes: bytes,
                        type_tag: tag,
                        version: inner.ver.clone(),
                        ttl: Self::ttl_unlocked(&inner),
                        expire_time: Self::expire_time_unlocked(&inner),
                        key_loader_id: None,
                        value_loader_id: None,
                        offheap_ptr: None,
                    })?;
                }
            }
        }

        if !self.mark_obsolete0(&mut inner, obsolete_ver, true)? {
            return Ok(false);
        }

        if self.ctx.statistics_enabled() {
            self.ctx.metrics().on_evict();
        }
        Ok(true)
    }

    fn release_swap(&self) -> CResult<()> {
        if let Some(swap) = self.ctx.swap() {
            swap.remove(&self.key)?;
        }
        Ok(())
    }

    // ----------------------------------------------------------- indexing

    fn update_index(
        &self,
        value: &CacheValue,
        ver: &GridVersion,
        expire_time: i64,
    ) -> CResult<()> {
        if let Some(index) = self.ctx.index() {
            index
                .store(&self.key, value, ver, expire_time)
                .map_err(|e| Error::Index(e.to_string()))?;
        }
        Ok(())
    }

    fn clear_index(&self) -> CResult<()> {
        if let Some(index) = self.ctx.index() {
            index.remove(&self.key).map_err(|e| Error::Index(e.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------- auxiliaries

    /// Reports the entry to the eviction policy.
    pub fn touch(&self) {
        if let Some(evictions) = self.ctx.evictions() {
            evictions.touch(&self.key, self.ctx.versions().topology_version());
        }
    }

    /// On-heap footprint: the fixed overhead plus extras, key bytes and at
    /// least one value byte.
    pub fn memory_size(&self) -> CResult<usize> {
        let inner = self.lock()?;
        let extras_size = inner.extras.as_ref().map_or(0, |e| e.size());
        Ok(ENTRY_OVERHEAD + extras_size + self.key.len() + std::cmp::max(1, inner.val.byte_len()))
    }

    /// Reads the current value without any side effects. Maintenance/test
    /// surface for the owning map.
    pub fn raw_get(&self) -> CResult<Option<CacheValue>> {
        let inner = self.lock()?;
        self.value_unlocked(&inner, true)
    }

    /// Replaces the value and TTL in place, without a version change and
    /// without side effects. Returns the previous value.
    pub fn raw_put(&self, v: Option<CacheValue>, ttl: i64) -> CResult<Option<CacheValue>> {
        let mut inner = self.lock()?;
        let old = self.value_unlocked(&inner, true)?;
        self.set_value_locked(&mut inner, v)?;
        let expire = expiry::expire_time(ttl, self.ctx.now_millis());
        self.set_ttl_locked(&mut inner, ttl, expire);
        Ok(old)
    }

    pub fn has_value(&self) -> CResult<bool> {
        let inner = self.lock()?;
        Ok(self.has_value_unlocked(&inner))
    }

    /// In-place value refresh for maintenance: commits under the next
    /// version, refreshes the index, bypasses the interceptor and emits no
    /// events.
    pub fn poke(&self, v: CacheValue) -> CResult<()> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;
        let next_ver = self.ctx.versions().next();
        self.update_index(&v, &next_ver, Self::expire_time_unlocked(&inner))?;
        self.set_value_locked(&mut inner, Some(v))?;
        inner.ver = next_ver;
        Ok(())
    }

    /// Installs a value only if the entry is new, or tombstoned and this
    /// is not a preload. Keeps the supplied version: loads do not mint.
    pub fn initial_value(
        &self,
        v: Option<CacheValue>,
        ver: GridVersion,
        ttl: i64,
        expire_time: i64,
        preload: bool,
        dr_type: crate::conflict::DrType,
    ) -> CResult<bool> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        let deleted = Self::deleted_unlocked(&inner);
        if !self.is_new_unlocked(&inner) && !(deleted && !preload) {
            return Ok(false);
        }

        let expire = if expire_time > 0 {
            expire_time
        } else {
            expiry::expire_time(ttl, self.ctx.now_millis())
        };

        match &v {
            Some(val) => self.update_index(val, &ver, expire)?,
            None => self.clear_index()?,
        }
        self.set_value_locked(&mut inner, v.clone())?;
        inner.ver = ver.clone();
        self.set_ttl_locked(&mut inner, ttl.max(0), expire);
        if deleted {
            self.set_deleted_locked(&mut inner, false);
        }
        self.retrack_locked(&inner);

        if let Some(queries) = self.ctx.queries() {
            queries.on_entry_updated(&self.key, v.as_ref(), None, preload);
        }
        if dr_type.is_dr() {
            if let Some(replicator) = self.ctx.replicator() {
                replicator.replicate(
                    &self.key,
                    v.as_ref(),
                    ttl.max(0),
                    expire,
                    &ver,
                    dr_type,
                )?;
            }
        }
        Ok(true)
    }

    /// `initial_value` from a promoted swap entry, as used by preloading.
    pub fn initial_value_from_swap(&self, entry: SwapEntry) -> CResult<bool> {
        let val = CacheValue::from_parts(entry.value_bytes, entry.type_tag);
        self.initial_value(
            Some(val),
            entry.version,
            entry.ttl,
            entry.expire_time,
            true,
            crate::conflict::DrType::None,
        )
    }

    /// Swaps the value only when the current version matches, minting a
    /// new version if none is supplied. Returns whether the swap happened
    /// and the entry's resulting version.
    pub fn versioned_value(
        &self,
        v: CacheValue,
        cur_ver: Option<&GridVersion>,
        new_ver: Option<GridVersion>,
    ) -> CResult<(bool, GridVersion)> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        if let Some(expect) = cur_ver {
            if expect != &inner.ver {
                return Ok((false, inner.ver.clone()));
            }
        }

        let new_ver = new_ver.unwrap_or_else(|| self.ctx.versions().next());
        self.update_index(&v, &new_ver, Self::expire_time_unlocked(&inner))?;
        self.set_value_locked(&mut inner, Some(v))?;
        inner.ver = new_ver.clone();
        Ok((true, new_ver))
    }

    /// Empties the entry if the current version matches: clears the value,
    /// bumps the version, releases swap and clears the index. The entry is
    /// not obsoleted.
    pub fn invalidate(
        &self,
        cur_ver: Option<&GridVersion>,
        new_ver: Option<GridVersion>,
    ) -> CResult<bool> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        if let Some(expect) = cur_ver {
            if expect != &inner.ver {
                return Ok(false);
            }
        }

        self.release_swap()?;
        self.clear_index()?;
        self.set_value_locked(&mut inner, None)?;
        inner.ver = new_ver.unwrap_or_else(|| self.ctx.versions().next());
        self.ctx.topology().on_invalidate(&self.key);
        Ok(true)
    }

    /// Filtered invalidate with the optimistic version-retry loop: a
    /// concurrent change between the filter evaluation and the commit
    /// restarts the attempt.
    pub fn invalidate_filtered(&self, filter: &ops::EntryFilter) -> CResult<bool> {
        loop {
            let (cur_ver, val) = {
                let inner = self.lock()?;
                self.check_obsolete(&inner)?;
                (inner.ver.clone(), self.value_unlocked(&inner, true)?)
            };
            if !filter(val.as_ref()) {
                return Ok(false);
            }
            if self.invalidate(Some(&cur_ver), None)? {
                return Ok(true);
            }
            // Version moved underneath us; retry against the new state.
        }
    }

    /// Attempts to make the entry obsolete. The index and swap state are
    /// released outside the lock, so a concurrent change between the two
    /// critical sections invalidates the attempt and it retries. Fails
    /// gracefully while near-cache readers remain, unless `readers` forces
    /// it.
    pub fn clear(
        &self,
        ver: GridVersion,
        readers: bool,
        filter: Option<&ops::EntryFilter>,
    ) -> CResult<bool> {
        loop {
            let cur_ver = {
                let inner = self.lock()?;
                if self.obsolete_version_unlocked(&inner).is_some() {
                    return Ok(false);
                }

                if let Some(filter) = filter {
                    let val = self.value_unlocked(&inner, true)?;
                    if !filter(val.as_ref()) {
                        return Ok(false);
                    }
                }

                if !readers && self.ctx.topology().has_readers(&self.key) {
                    return Ok(false);
                }

                inner.ver.clone()
            };

            self.clear_index()?;
            self.release_swap()?;

            let mut inner = self.lock()?;
            if inner.ver != cur_ver {
                // A concurrent change slipped in between the critical
                // sections; retry against the new state.
                continue;
            }
            return self.mark_obsolete0(&mut inner, ver.clone(), true);
        }
    }

    /// No-op unless the entry is expired or empty, in which case it is
    /// cleared away.
    pub fn compact(&self, filter: Option<&ops::EntryFilter>) -> CResult<bool> {
        let expired_or_empty = {
            let inner = self.lock()?;
            self.check_obsolete(&inner)?;
            if let Some(filter) = filter {
                let val = self.value_unlocked(&inner, true)?;
                if !filter(val.as_ref()) {
                    return Ok(false);
                }
            }
            let now = self.ctx.now_millis();
            !self.has_value_unlocked(&inner) || self.expired_unlocked(&inner, now)
        };

        if !expired_or_empty {
            return Ok(false);
        }
        self.clear(self.ctx.versions().next(), false, filter)
    }

    /// TTL sweeper callback. A tombstoned entry transitions to obsolete
    /// silently; a live expired value is removed (tombstoned under
    /// deferred delete) with exactly one EXPIRED event.
    pub fn on_ttl_expired(&self, obsolete_ver: GridVersion) -> CResult<bool> {
        let mut inner = self.lock()?;

        let now = self.ctx.now_millis();
        let deleted = Self::deleted_unlocked(&inner);
        let had_value = self.has_value_unlocked(&inner);

        if had_value && !self.expired_unlocked(&inner, now) {
            return Ok(false);
        }

        let expired_val = self.value_unlocked(&inner, true)?;
        let mut obsoleted = false;

        if self.ctx.deferred_delete_enabled() && !deleted && had_value {
            self.set_deleted_locked(&mut inner, true);
            self.set_value_locked(&mut inner, None)?;
            self.clear_index()?;
            inner.ver = obsolete_ver.clone();
            if let Some(queue) = self.ctx.deferred_deletes() {
                queue.enqueue(&self.key, obsolete_ver);
            }
        } else if self.mark_obsolete0(&mut inner, obsolete_ver, true)? {
            obsoleted = true;
            self.clear_index()?;
            self.release_swap()?;
        }

        if had_value {
            ops::record_event_locked(
                self,
                &inner,
                crate::events::EventType::Expired,
                None,
                false,
                expired_val.clone(),
                None,
                None,
                None,
                None,
            );
            if let Some(queries) = self.ctx.queries() {
                queries.on_entry_expired(&self.key, expired_val.as_ref());
            }
        }

        Ok(obsoleted)
    }

    /// Reads the entry's versioned state, unswapping a new entry first.
    pub fn versioned_entry(&self) -> CResult<VersionedEntry> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        if self.is_new_unlocked(&inner) {
            self.unswap_locked(&mut inner, true, true)?;
        }

        let is_new = self.is_new_unlocked(&inner);
        Ok(VersionedEntry {
            key: self.key.clone(),
            value: self.value_unlocked(&inner, true)?,
            ttl: Self::ttl_unlocked(&inner),
            expire_time: Self::expire_time_unlocked(&inner),
            version: inner.ver.clone(),
            conflict_version: inner.ver.conflict.clone().map(|b| *b),
            is_new,
        })
    }

    /// A transfer snapshot for preloading/supply. None for obsolete
    /// entries.
    pub fn info(&self) -> CResult<Option<EntryInfo>> {
        let inner = self.lock()?;
        if self.obsolete_version_unlocked(&inner).is_some() {
            return Ok(None);
        }
        let value_bytes = if self.has_value_unlocked(&inner) {
            Some(self.value_bytes_unlocked(&inner)?)
        } else {
            None
        };
        Ok(Some(EntryInfo {
            key: self.key.clone(),
            value_bytes,
            ttl: Self::ttl_unlocked(&inner),
            expire_time: Self::expire_time_unlocked(&inner),
            version: inner.ver.clone(),
            is_new: self.is_new_unlocked(&inner),
            deleted: Self::deleted_unlocked(&inner),
        }))
    }

    /// The entry's current version.
    pub fn version(&self) -> CResult<GridVersion> {
        Ok(self.lock()?.ver.clone())
    }

    /// A user attribute attached to the entry.
    pub fn attribute(&self, name: &str) -> CResult<Option<String>> {
        let inner = self.lock()?;
        Ok(inner
            .extras
            .as_ref()
            .and_then(|e| e.attributes())
            .and_then(|attrs| attrs.get(name).cloned()))
    }

    /// Attaches a user attribute, returning the previous value.
    pub fn set_attribute(&self, name: &str, value: &str) -> CResult<Option<String>> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;
        let mut parts = ExtrasParts::from(inner.extras.take());
        let attrs = parts.attrs.get_or_insert_with(Attributes::new);
        let old = attrs.insert(name.to_string(), value.to_string());
        inner.extras = extras::rebuild(parts);
        Ok(old)
    }

    // ----------------------------------------------- map chain bookkeeping

    /// Successor in the owning map's bucket chain for a segment. Written
    /// only by the map, under its own bucket lock.
    pub fn next(&self, seg: usize) -> Option<Arc<GridEntry>> {
        self.next.lock().expect("chain links poisoned")[seg & 1].clone()
    }

    pub fn set_next(&self, seg: usize, next: Option<Arc<GridEntry>>) {
        self.next.lock().expect("chain links poisoned")[seg & 1] = next;
    }
}

impl std::fmt::Display for GridEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(inner) => write!(
                f,
                "GridEntry [key={}, ver={}, hasVal={}, deleted={}, obsolete={}]",
                self.key,
                inner.ver,
                inner.val.has_value(),
                Self::deleted_unlocked(&inner),
                self.obsolete_version_unlocked(&inner).is_some(),
            ),
            Err(_) => write!(f, "GridEntry [key={}, <locked>]", self.key),
        }
    }
}
