//! The operation engine.
//!
//! Every operation acquires the entry mutex on entry and releases it before
//! returning results. Transactional operations perform store I/O outside
//! the mutex and re-validate with the captured start version; atomic
//! operations write the store inside the mutex, which is the accepted price
//! of atomic mode. Events, continuous-query and data-structure
//! notifications fire inside the mutex.

use std::sync::Arc;

use crate::conflict::{ConflictContext, ConflictView, DrType};
use crate::error::{CResult, Error};
use crate::events::EventType;
use crate::expiry::{self, ExpiryPolicy, TTL_MINIMUM, TTL_NOT_CHANGED, TTL_ZERO};
use crate::tx::Transaction;
use crate::value::{CacheKey, CacheValue};
use crate::version::{atomic_cmp, GridVersion};

use super::extras::ExtrasParts;
use super::{extras, EntryInner, GridEntry};

/// A value filter evaluated under the entry lock.
pub type EntryFilter = dyn Fn(Option<&CacheValue>) -> bool + Send + Sync;

/// What an update writes: a value, a removal, or an entry processor.
#[derive(Clone)]
pub enum WriteOp {
    Update(CacheValue),
    Delete,
    Transform(Arc<dyn EntryProcessor>),
}

impl std::fmt::Debug for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteOp::Update(v) => write!(f, "Update({})", v),
            WriteOp::Delete => write!(f, "Delete"),
            WriteOp::Transform(_) => write!(f, "Transform"),
        }
    }
}

/// A transform closure run against an invoke-entry view of the value.
pub trait EntryProcessor: Send + Sync {
    /// Mutates the entry view and returns a result for the caller.
    fn process(&self, entry: &mut InvokeEntry) -> CResult<Option<CacheValue>>;
}

/// The mutable view handed to an entry processor.
pub struct InvokeEntry {
    key: CacheKey,
    value: Option<CacheValue>,
    modified: bool,
}

impl InvokeEntry {
    fn new(key: CacheKey, value: Option<CacheValue>) -> Self {
        Self { key, value, modified: false }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn set(&mut self, value: CacheValue) {
        self.value = Some(value);
        self.modified = true;
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.modified = true;
    }
}

/// The captured outcome of one entry-processor run. Closure failures are
/// captured here and never propagated out of the operation.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeResult {
    pub result: Option<CacheValue>,
    pub error: Option<String>,
}

/// Result of a transactional set or remove.
#[derive(Clone, Debug, PartialEq)]
pub struct TxUpdateResult {
    pub success: bool,
    pub old_value: Option<CacheValue>,
}

/// Result of an atomic update; carries everything the caller needs to
/// propagate the outcome to backups and deferred-delete queues.
#[derive(Clone, Debug, PartialEq)]
pub struct AtomicUpdateResult {
    pub success: bool,
    pub old_value: Option<CacheValue>,
    pub new_value: Option<CacheValue>,
    pub invoke_result: Option<InvokeResult>,
    /// The TTL the commit resolved to, for backup propagation.
    pub system_ttl: i64,
    /// The expire time the commit resolved to, for backup propagation.
    pub system_expire_time: i64,
    /// Version the caller must enqueue for deferred delete, if any.
    pub enqueue_ver: Option<GridVersion>,
    pub conflict: Option<ConflictContext>,
    pub committed: bool,
}

impl AtomicUpdateResult {
    fn no_change(old_value: Option<CacheValue>) -> Self {
        Self {
            success: false,
            old_value,
            new_value: None,
            invoke_result: None,
            system_ttl: TTL_NOT_CHANGED,
            system_expire_time: -1,
            enqueue_ver: None,
            conflict: None,
            committed: false,
        }
    }
}

/// Read request flags.
pub struct GetRequest<'a> {
    pub tx: Option<&'a Transaction>,
    /// Consult swap for a never-updated entry.
    pub read_swap: bool,
    /// Fall through to the store on a miss.
    pub read_through: bool,
    /// Rehydrate off-heap bytes into a value.
    pub unmarshal: bool,
    pub update_metrics: bool,
    pub event: bool,
    /// Do not mutate the entry: skips the TTL access refresh and the
    /// read-through install.
    pub temporary: bool,
    pub subject_id: Option<u64>,
    pub task_name: Option<&'a str>,
    pub transform_tag: Option<&'a str>,
    pub expiry: Option<&'a dyn ExpiryPolicy>,
}

impl Default for GetRequest<'_> {
    fn default() -> Self {
        Self {
            tx: None,
            read_swap: true,
            read_through: false,
            unmarshal: true,
            update_metrics: true,
            event: true,
            temporary: false,
            subject_id: None,
            task_name: None,
            transform_tag: None,
            expiry: None,
        }
    }
}

/// Transactional write request.
pub struct SetRequest<'a> {
    pub tx: Option<&'a Transaction>,
    pub value: CacheValue,
    pub explicit_ver: Option<GridVersion>,
    /// `TTL_NOT_CHANGED` keeps the current TTL.
    pub ttl: i64,
    /// Explicit replicated expire time; negative when absent. Wins over
    /// the TTL when present.
    pub dr_expire_time: i64,
    pub dr_type: DrType,
    pub event: bool,
    pub update_metrics: bool,
    pub filter: Option<&'a EntryFilter>,
    pub subject_id: Option<u64>,
    pub task_name: Option<&'a str>,
}

impl<'a> SetRequest<'a> {
    pub fn new(value: CacheValue) -> Self {
        Self {
            tx: None,
            value,
            explicit_ver: None,
            ttl: TTL_NOT_CHANGED,
            dr_expire_time: -1,
            dr_type: DrType::None,
            event: true,
            update_metrics: true,
            filter: None,
            subject_id: None,
            task_name: None,
        }
    }
}

/// Transactional remove request.
pub struct RemoveRequest<'a> {
    pub tx: Option<&'a Transaction>,
    pub explicit_ver: Option<GridVersion>,
    pub dr_type: DrType,
    pub event: bool,
    pub update_metrics: bool,
    pub filter: Option<&'a EntryFilter>,
    pub subject_id: Option<u64>,
    pub task_name: Option<&'a str>,
}

impl Default for RemoveRequest<'_> {
    fn default() -> Self {
        Self {
            tx: None,
            explicit_ver: None,
            dr_type: DrType::None,
            event: true,
            update_metrics: true,
            filter: None,
            subject_id: None,
            task_name: None,
        }
    }
}

/// Atomic update request for a local cache.
pub struct LocalUpdateRequest<'a> {
    pub op: WriteOp,
    pub filter: Option<&'a EntryFilter>,
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    /// Explicit TTL; `TTL_NOT_CHANGED` defers to the expiry policy.
    pub ttl: i64,
    pub read_through: bool,
    pub event: bool,
    pub update_metrics: bool,
    pub subject_id: Option<u64>,
    pub task_name: Option<&'a str>,
    pub transform_tag: Option<&'a str>,
}

impl<'a> LocalUpdateRequest<'a> {
    pub fn new(op: WriteOp) -> Self {
        Self {
            op,
            filter: None,
            expiry: None,
            ttl: TTL_NOT_CHANGED,
            read_through: false,
            event: true,
            update_metrics: true,
            subject_id: None,
            task_name: None,
            transform_tag: None,
        }
    }
}

/// Atomic update request for replicated/partitioned caches.
pub struct AtomicUpdateRequest<'a> {
    pub new_ver: GridVersion,
    pub op: WriteOp,
    pub filter: Option<&'a EntryFilter>,
    pub dr_type: DrType,
    /// Explicit TTL; `TTL_NOT_CHANGED` defers to the expiry policy.
    pub explicit_ttl: i64,
    /// Explicit expire time; negative when absent.
    pub explicit_expire: i64,
    pub conflict_ver: Option<GridVersion>,
    /// Consult the conflict resolver.
    pub conflict_resolve: bool,
    /// Ignore updates whose version does not advance the entry.
    pub ver_check: bool,
    /// Whether this node is the primary owner of the key.
    pub primary: bool,
    pub read_through: bool,
    pub event: bool,
    pub update_metrics: bool,
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    pub subject_id: Option<u64>,
    pub task_name: Option<&'a str>,
    pub transform_tag: Option<&'a str>,
}

impl<'a> AtomicUpdateRequest<'a> {
    pub fn new(new_ver: GridVersion, op: WriteOp) -> Self {
        Self {
            new_ver,
            op,
            filter: None,
            dr_type: DrType::None,
            explicit_ttl: TTL_NOT_CHANGED,
            explicit_expire: -1,
            conflict_ver: None,
            conflict_resolve: false,
            ver_check: false,
            primary: true,
            read_through: false,
            event: true,
            update_metrics: true,
            expiry: None,
            subject_id: None,
            task_name: None,
            transform_tag: None,
        }
    }
}

/// Builds and emits one event record, inside the entry lock, if the bus
/// records the type.
#[allow(clippy::too_many_arguments)]
pub(super) fn record_event_locked(
    entry: &GridEntry,
    inner: &EntryInner,
    kind: EventType,
    new_value: Option<CacheValue>,
    has_new: bool,
    old_value: Option<CacheValue>,
    tx_id: Option<u64>,
    subject_id: Option<u64>,
    transform_tag: Option<&str>,
    task_name: Option<&str>,
) {
    let bus = entry.ctx.events();
    if !bus.is_recordable(kind) {
        return;
    }
    let has_old = old_value.is_some();
    bus.add_event(crate::events::CacheEvent {
        partition: entry.partition(),
        key: entry.key.clone(),
        tx_id,
        version: inner.ver.clone(),
        kind,
        new_value,
        has_new,
        old_value,
        has_old,
        subject_id,
        transform_tag: transform_tag.map(str::to_owned),
        task_name: task_name.map(str::to_owned),
    });
}

/// Translates an access-refresh TTL into storable TTL/expire state. The
/// zero sentinel becomes the minimum TTL with a past expire time, so the
/// entry expires on its next inspection.
fn access_ttl(ttl: i64, now: i64) -> (i64, i64) {
    if ttl == TTL_ZERO {
        (TTL_MINIMUM, now)
    } else {
        (ttl, expiry::expire_time(ttl, now))
    }
}

impl GridEntry {
    fn resolve_version(
        &self,
        explicit: Option<GridVersion>,
        tx: Option<&Transaction>,
    ) -> GridVersion {
        explicit
            .or_else(|| tx.map(|t| t.write_version().clone()))
            .unwrap_or_else(|| self.ctx.versions().next())
    }

    /// Applies an expiry policy's access refresh, when one applies.
    fn refresh_access_ttl(&self, inner: &mut EntryInner, policy: Option<&dyn ExpiryPolicy>) {
        if let Some(policy) = policy {
            let ttl = policy.for_access();
            if ttl != TTL_NOT_CHANGED {
                let (ttl, expire) = access_ttl(ttl, self.ctx.now_millis());
                self.set_ttl_locked(inner, ttl, expire);
                self.retrack_locked(inner);
            }
        }
    }

    fn notify_update_locked(
        &self,
        new: Option<&CacheValue>,
        old: Option<&CacheValue>,
        removed: bool,
    ) {
        if let Some(queries) = self.ctx.queries() {
            queries.on_entry_updated(&self.key, new, old, false);
        }
        if let Some(ds) = self.ctx.data_structures() {
            ds.on_entry_updated(&self.key, removed);
        }
    }

    /// Reads the entry, consulting swap for a new entry and falling
    /// through to the store when requested. Emits READ or EXPIRED, never
    /// both for one access. The read-through load runs outside the lock
    /// and commits only if the version has not moved since the miss was
    /// observed.
    pub fn inner_get(&self, req: GetRequest<'_>) -> CResult<Option<CacheValue>> {
        let tx_id = req.tx.map(|t| t.xid());
        let start_ver;
        let ret;
        {
            let mut inner = self.lock()?;
            self.check_obsolete(&inner)?;
            start_ver = inner.ver.clone();
            let now = self.ctx.now_millis();

            let mut val = self.value_unlocked(&inner, req.unmarshal)?;

            if val.is_none() && req.read_swap && self.is_new_unlocked(&inner) {
                val = self.unswap_locked(&mut inner, false, true)?;
            }

            let was_expired = self.expired_unlocked(&inner, now);
            let mut expired_val = None;
            if was_expired {
                expired_val = self.value_unlocked(&inner, true)?;
                self.set_value_locked(&mut inner, None)?;
                self.set_ttl_locked(&mut inner, 0, 0);
                self.retrack_locked(&inner);
                val = None;
            }

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_read(val.is_some());
            }

            if was_expired {
                record_event_locked(
                    self,
                    &inner,
                    EventType::Expired,
                    None,
                    false,
                    expired_val.clone(),
                    tx_id,
                    req.subject_id,
                    req.transform_tag,
                    req.task_name,
                );
                if let Some(queries) = self.ctx.queries() {
                    queries.on_entry_expired(&self.key, expired_val.as_ref());
                }
            } else if val.is_some() && req.event {
                record_event_locked(
                    self,
                    &inner,
                    EventType::Read,
                    val.clone(),
                    true,
                    None,
                    tx_id,
                    req.subject_id,
                    req.transform_tag,
                    req.task_name,
                );
            }

            if val.is_some() && !req.temporary {
                self.refresh_access_ttl(&mut inner, req.expiry);
            }

            ret = val;
        }

        if ret.is_some() || !req.read_through {
            return Ok(ret);
        }
        let store = match self.ctx.store() {
            Some(s) if s.read_through() => s.clone(),
            _ => return Ok(ret),
        };

        // The store load runs outside the lock, associated with the outer
        // transaction.
        let loaded = store.load(tx_id, &self.key)?;

        if req.temporary {
            return Ok(loaded);
        }

        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;
        if inner.ver == start_ver {
            if let Some(v) = loaded.clone() {
                let new_ver = self.ctx.versions().next_for_load();
                self.update_index(&v, &new_ver, GridEntry::expire_time_unlocked(&inner))?;
                if GridEntry::deleted_unlocked(&inner) {
                    self.set_deleted_locked(&mut inner, false);
                }
                self.set_value_locked(&mut inner, Some(v.clone()))?;
                inner.ver = new_ver;
                if req.event {
                    record_event_locked(
                        self,
                        &inner,
                        EventType::Read,
                        Some(v),
                        true,
                        None,
                        tx_id,
                        req.subject_id,
                        req.transform_tag,
                        req.task_name,
                    );
                }
            }
            Ok(loaded)
        } else {
            // Lost the optimistic race: another operation committed while
            // the store was consulted. Surface the committed state.
            self.value_unlocked(&inner, true)
        }
    }

    /// Unconditionally re-reads the store. Commits the loaded value (or
    /// emptiness) under a fresh load version only when the version has not
    /// moved; releases swap and marks the entry touched either way.
    pub fn inner_reload(&self) -> CResult<Option<CacheValue>> {
        let store = match self.ctx.store() {
            Some(s) => s.clone(),
            None => return Ok(None),
        };

        let start_ver = {
            let inner = self.lock()?;
            self.check_obsolete(&inner)?;
            inner.ver.clone()
        };

        let loaded = store.load(None, &self.key)?;

        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;
        let ret = if inner.ver == start_ver {
            self.release_swap()?;
            let new_ver = self.ctx.versions().next_for_load();
            match &loaded {
                Some(v) => self.update_index(v, &new_ver, GridEntry::expire_time_unlocked(&inner))?,
                None => self.clear_index()?,
            }
            if GridEntry::deleted_unlocked(&inner) && loaded.is_some() {
                self.set_deleted_locked(&mut inner, false);
            }
            self.set_value_locked(&mut inner, loaded.clone())?;
            inner.ver = new_ver;
            loaded
        } else {
            self.value_unlocked(&inner, true)?
        };
        drop(inner);

        self.touch();
        Ok(ret)
    }

    /// Transactional write. The in-memory commit, index update and event
    /// happen under the lock; write-through and the after-put hook run
    /// after release.
    pub fn inner_set(&self, req: SetRequest<'_>) -> CResult<TxUpdateResult> {
        let tx_id = req.tx.map(|t| t.xid());
        let old;
        let committed_val;
        let new_ver;
        {
            let mut inner = self.lock()?;
            self.check_obsolete(&inner)?;

            if self.is_new_unlocked(&inner) {
                self.unswap_locked(&mut inner, true, false)?;
            }

            old = self.value_unlocked(&inner, true)?;

            if let Some(filter) = req.filter {
                if !filter(old.as_ref()) {
                    return Ok(TxUpdateResult { success: false, old_value: old });
                }
            }

            new_ver = self.resolve_version(req.explicit_ver.clone(), req.tx);

            let mut val = req.value;
            if let Some(interceptor) = self.ctx.interceptor() {
                match interceptor.on_before_put(&self.key, old.as_ref(), &val) {
                    Some(v) => val = v,
                    None => return Ok(TxUpdateResult { success: false, old_value: old }),
                }
            }

            let now = self.ctx.now_millis();
            let (ttl, expire) = if req.dr_expire_time >= 0 {
                (req.ttl.max(0), req.dr_expire_time)
            } else if req.ttl == TTL_NOT_CHANGED {
                (GridEntry::ttl_unlocked(&inner), GridEntry::expire_time_unlocked(&inner))
            } else {
                let (ttl, expire) = access_ttl(req.ttl, now);
                (ttl, expire)
            };

            self.update_index(&val, &new_ver, expire)?;
            if GridEntry::deleted_unlocked(&inner) {
                self.set_deleted_locked(&mut inner, false);
            }
            self.set_value_locked(&mut inner, Some(val.clone()))?;
            inner.ver = new_ver.clone();
            self.set_ttl_locked(&mut inner, ttl, expire);
            self.retrack_locked(&inner);

            if req.dr_type.is_dr() {
                if let Some(replicator) = self.ctx.replicator() {
                    replicator.replicate(&self.key, Some(&val), ttl, expire, &new_ver, req.dr_type)?;
                }
            }
            self.ctx.topology().record_node_id(&self.key, self.ctx.config().local_node_id);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_write();
            }

            if req.event {
                record_event_locked(
                    self,
                    &inner,
                    EventType::Put,
                    Some(val.clone()),
                    true,
                    old.clone(),
                    tx_id,
                    req.subject_id,
                    None,
                    req.task_name,
                );
            }
            self.notify_update_locked(Some(&val), old.as_ref(), false);

            committed_val = val;
        }

        // Write-through outside the lock so a slow store never blocks
        // other operations on the key.
        if let Some(store) = self.ctx.store() {
            if store.write_through() {
                store.put(tx_id, &self.key, &committed_val, &new_ver)?;
            }
        }
        if let Some(interceptor) = self.ctx.interceptor() {
            interceptor.on_after_put(&self.key, &committed_val);
        }

        Ok(TxUpdateResult { success: true, old_value: old })
    }

    /// Transactional delete. Under deferred delete the entry is
    /// tombstoned and enqueued; otherwise the entry re-enters the lock
    /// after write-through and obsoletes itself if still at this version.
    pub fn inner_remove(&self, req: RemoveRequest<'_>) -> CResult<TxUpdateResult> {
        let tx_id = req.tx.map(|t| t.xid());
        let old;
        let new_ver;
        {
            let mut inner = self.lock()?;
            self.check_obsolete(&inner)?;

            if self.is_new_unlocked(&inner) {
                self.unswap_locked(&mut inner, true, false)?;
            }

            old = self.value_unlocked(&inner, true)?;

            if let Some(filter) = req.filter {
                if !filter(old.as_ref()) {
                    return Ok(TxUpdateResult { success: false, old_value: old });
                }
            }

            new_ver = self.resolve_version(req.explicit_ver.clone(), req.tx);

            if let Some(interceptor) = self.ctx.interceptor() {
                let (cancel, val) = interceptor.on_before_remove(&self.key, old.as_ref());
                if cancel {
                    return Ok(TxUpdateResult { success: false, old_value: val });
                }
            }

            self.clear_index()?;
            self.set_value_locked(&mut inner, None)?;
            self.set_ttl_locked(&mut inner, 0, 0);
            if let Some(swap) = self.ctx.swap() {
                swap.remove_offheap(&self.key)?;
            }

            // Readers: all of them when no other lock candidate conflicts,
            // otherwise only the remover's own registration.
            let no_conflict = inner
                .extras
                .as_ref()
                .and_then(|e| e.mvcc())
                .map_or(true, |m| m.is_empty_excluding(&[&new_ver]));
            if no_conflict {
                self.ctx.topology().clear_readers(&self.key);
            } else {
                self.ctx.topology().clear_reader(&self.key, self.ctx.config().local_node_id);
            }

            if self.ctx.deferred_delete_enabled() {
                self.set_deleted_locked(&mut inner, true);
                if let Some(queue) = self.ctx.deferred_deletes() {
                    queue.enqueue(&self.key, new_ver.clone());
                }
            }

            inner.ver = new_ver.clone();

            // Hand the removed lock back to MVCC.
            let mut parts = ExtrasParts::from(inner.extras.take());
            if let Some(mvcc) = parts.mvcc.as_mut() {
                mvcc.remove(&new_ver);
            }
            inner.extras = extras::rebuild(parts);
            self.retrack_locked(&inner);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_remove();
            }

            if req.event {
                record_event_locked(
                    self,
                    &inner,
                    EventType::Removed,
                    None,
                    false,
                    old.clone(),
                    tx_id,
                    req.subject_id,
                    None,
                    req.task_name,
                );
            }
            self.notify_update_locked(None, old.as_ref(), true);
        }

        if let Some(store) = self.ctx.store() {
            if store.write_through() {
                store.remove(tx_id, &self.key)?;
            }
        }
        if let Some(interceptor) = self.ctx.interceptor() {
            interceptor.on_after_remove(&self.key, old.as_ref());
        }

        if !self.ctx.deferred_delete_enabled() {
            // Re-enter and obsolete if nothing else moved the version; a
            // concurrent write keeps the emptied entry alive.
            let mut inner = self.lock()?;
            if inner.ver == new_ver && self.obsolete_version_unlocked(&inner).is_none() {
                self.mark_obsolete0(&mut inner, new_ver.clone(), true)?;
            }
        }

        Ok(TxUpdateResult { success: true, old_value: old })
    }

    /// Atomic update for a local cache: the single-owner fast path. The
    /// whole operation, including write-through, runs under the lock.
    pub fn inner_update_local(
        &self,
        req: LocalUpdateRequest<'_>,
    ) -> CResult<(bool, Option<CacheValue>, Option<InvokeResult>)> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        if self.is_new_unlocked(&inner) {
            self.unswap_locked(&mut inner, true, false)?;
        }

        let now = self.ctx.now_millis();
        let mut old = self.value_unlocked(&inner, true)?;
        if self.expired_unlocked(&inner, now) {
            self.set_value_locked(&mut inner, None)?;
            self.set_ttl_locked(&mut inner, 0, 0);
            old = None;
        }

        if old.is_none() && req.read_through {
            if let Some(store) = self.ctx.store() {
                if store.read_through() {
                    // Atomic mode: the load runs under the lock.
                    if let Some(loaded) = store.load(None, &self.key)? {
                        let ttl0 = match req.expiry.map(|p| p.for_create()) {
                            Some(TTL_NOT_CHANGED) | None => 0,
                            Some(ttl) => ttl.max(0),
                        };
                        let expire0 = expiry::expire_time(ttl0, now);
                        self.update_index(&loaded, &inner.ver.clone(), expire0)?;
                        self.set_value_locked(&mut inner, Some(loaded.clone()))?;
                        self.set_ttl_locked(&mut inner, ttl0, expire0);
                        old = Some(loaded);
                    }
                }
            }
        }

        if let Some(filter) = req.filter {
            if !filter(old.as_ref()) {
                if old.is_some() {
                    self.refresh_access_ttl(&mut inner, req.expiry);
                }
                return Ok((false, old, None));
            }
        }

        let mut invoke_result = None;
        let mut new_val = match &req.op {
            WriteOp::Update(v) => Some(v.clone()),
            WriteOp::Delete => None,
            WriteOp::Transform(processor) => {
                let mut view = InvokeEntry::new(self.key.clone(), old.clone());
                match processor.process(&mut view) {
                    Ok(result) => invoke_result = Some(InvokeResult { result, error: None }),
                    Err(err) => {
                        invoke_result =
                            Some(InvokeResult { result: None, error: Some(err.to_string()) })
                    }
                }
                if !view.modified {
                    if old.is_some() {
                        self.refresh_access_ttl(&mut inner, req.expiry);
                    }
                    return Ok((false, old, invoke_result));
                }
                view.value
            }
        };

        let mut delete = new_val.is_none();

        let (ttl, expire) = if req.ttl != TTL_NOT_CHANGED {
            access_ttl(req.ttl, now)
        } else {
            let policy_ttl = match req.expiry {
                Some(p) if old.is_none() => p.for_create(),
                Some(p) => p.for_update(),
                None => TTL_NOT_CHANGED,
            };
            match policy_ttl {
                TTL_NOT_CHANGED => {
                    (GridEntry::ttl_unlocked(&inner), GridEntry::expire_time_unlocked(&inner))
                }
                TTL_ZERO => {
                    delete = true;
                    new_val = None;
                    (0, 0)
                }
                ttl => (ttl, expiry::expire_time(ttl, now)),
            }
        };

        if !delete {
            let mut val = match new_val.take() {
                Some(v) => v,
                None => return Err(Error::Internal("update path without a value".into())),
            };
            if let Some(interceptor) = self.ctx.interceptor() {
                match interceptor.on_before_put(&self.key, old.as_ref(), &val) {
                    Some(v) => val = v,
                    None => return Ok((false, old, invoke_result)),
                }
            }

            let new_ver = self.ctx.versions().next();
            if let Some(store) = self.ctx.store() {
                if store.write_through() {
                    store.put(None, &self.key, &val, &new_ver)?;
                }
            }
            self.update_index(&val, &new_ver, expire)?;
            self.set_value_locked(&mut inner, Some(val.clone()))?;
            inner.ver = new_ver;
            self.set_ttl_locked(&mut inner, ttl, expire);
            self.retrack_locked(&inner);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_write();
            }
            if req.event {
                if matches!(req.op, WriteOp::Transform(_)) {
                    record_event_locked(
                        self,
                        &inner,
                        EventType::Read,
                        old.clone(),
                        old.is_some(),
                        None,
                        None,
                        req.subject_id,
                        req.transform_tag,
                        req.task_name,
                    );
                }
                record_event_locked(
                    self,
                    &inner,
                    EventType::Put,
                    Some(val.clone()),
                    true,
                    old.clone(),
                    None,
                    req.subject_id,
                    req.transform_tag,
                    req.task_name,
                );
            }
            self.notify_update_locked(Some(&val), old.as_ref(), false);

            drop(inner);
            if let Some(interceptor) = self.ctx.interceptor() {
                interceptor.on_after_put(&self.key, &val);
            }
            Ok((true, old, invoke_result))
        } else {
            if let Some(interceptor) = self.ctx.interceptor() {
                let (cancel, val) = interceptor.on_before_remove(&self.key, old.as_ref());
                if cancel {
                    return Ok((false, val, invoke_result));
                }
            }

            let new_ver = self.ctx.versions().next();
            if let Some(store) = self.ctx.store() {
                if store.write_through() {
                    store.remove(None, &self.key)?;
                }
            }
            self.clear_index()?;
            self.set_value_locked(&mut inner, None)?;
            inner.ver = new_ver;
            self.set_ttl_locked(&mut inner, 0, 0);
            self.retrack_locked(&inner);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_remove();
            }
            if req.event {
                if matches!(req.op, WriteOp::Transform(_)) {
                    record_event_locked(
                        self,
                        &inner,
                        EventType::Read,
                        old.clone(),
                        old.is_some(),
                        None,
                        None,
                        req.subject_id,
                        req.transform_tag,
                        req.task_name,
                    );
                }
                record_event_locked(
                    self,
                    &inner,
                    EventType::Removed,
                    None,
                    false,
                    old.clone(),
                    None,
                    req.subject_id,
                    req.transform_tag,
                    req.task_name,
                );
            }
            self.notify_update_locked(None, old.as_ref(), true);

            drop(inner);
            if let Some(interceptor) = self.ctx.interceptor() {
                interceptor.on_after_remove(&self.key, old.as_ref());
            }
            Ok((true, old, invoke_result))
        }
    }

    /// Atomic update for replicated/partitioned caches: version check,
    /// conflict resolution, transform, TTL resolution, interceptor, then
    /// commit. The store is written inside the lock (atomic mode).
    pub fn inner_update(&self, req: AtomicUpdateRequest<'_>) -> CResult<AtomicUpdateResult> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        if self.is_new_unlocked(&inner) {
            self.unswap_locked(&mut inner, true, false)?;
        }

        let now = self.ctx.now_millis();
        let mut old = self.value_unlocked(&inner, true)?;
        if self.expired_unlocked(&inner, now) {
            self.set_value_locked(&mut inner, None)?;
            self.set_ttl_locked(&mut inner, 0, 0);
            old = None;
        }

        let mut op = req.op.clone();
        let mut conflict_ctx = None;
        let mut conflict_ver = req.conflict_ver.clone();

        let conflict_path =
            req.conflict_resolve && self.ctx.conflict_enabled() && conflict_ver.is_some();

        if conflict_path {
            let resolver = self.ctx.conflict_resolver().cloned().ok_or_else(|| {
                Error::Internal("conflict resolution enabled without a resolver".into())
            })?;
            let incoming_ver = conflict_ver.clone().ok_or_else(|| {
                Error::Internal("conflict resolution without a conflict version".into())
            })?;

            // The prospective value the update would write, after any
            // transform.
            let prospective = match &op {
                WriteOp::Update(v) => Some(v.clone()),
                WriteOp::Delete => None,
                WriteOp::Transform(processor) => {
                    let mut view = InvokeEntry::new(self.key.clone(), old.clone());
                    let _ = processor.process(&mut view);
                    view.value
                }
            };

            let new_ttl = if req.explicit_ttl != TTL_NOT_CHANGED { req.explicit_ttl.max(0) } else { 0 };
            let old_view = ConflictView {
                key: &self.key,
                value: old.as_ref(),
                version: &inner.ver,
                ttl: GridEntry::ttl_unlocked(&inner),
                expire_time: GridEntry::expire_time_unlocked(&inner),
            };
            let new_view = ConflictView {
                key: &self.key,
                value: prospective.as_ref(),
                version: &incoming_ver,
                ttl: new_ttl,
                expire_time: req.explicit_expire.max(0),
            };
            let resolved = resolver.resolve(&old_view, &new_view, req.ver_check)?;

            if resolved.is_use_old() {
                // Store repair: an equal-version duplicate from the same
                // data center still refreshes the store on the primary.
                if req.ver_check
                    && incoming_ver.data_center_id == inner.ver.data_center_id
                    && atomic_cmp(&incoming_ver, &inner.ver) == std::cmp::Ordering::Equal
                    && req.primary
                {
                    self.store_repair(&inner, old.as_ref())?;
                }
                let mut result = AtomicUpdateResult::no_change(old);
                result.conflict = Some(resolved);
                return Ok(result);
            }
            if resolved.is_merge() {
                op = match resolved.merged_value.clone() {
                    Some(v) => WriteOp::Update(v),
                    None => WriteOp::Delete,
                };
                // The merged value commits under the regular version.
                conflict_ver = None;
            }
            conflict_ctx = Some(resolved);
        } else if req.ver_check {
            let cmp = atomic_cmp(&inner.ver, &req.new_ver);
            if cmp != std::cmp::Ordering::Less {
                if cmp == std::cmp::Ordering::Equal && req.primary {
                    self.store_repair(&inner, old.as_ref())?;
                }
                log::debug!("Ignored stale atomic update for key {}", self.key);
                return Ok(AtomicUpdateResult::no_change(old));
            }
        } else {
            debug_assert!(
                atomic_cmp(&req.new_ver, &inner.ver) != std::cmp::Ordering::Less,
                "version must not move backwards without a version check"
            );
        }

        // Optionally load the previous value through the store.
        if old.is_none() && req.read_through {
            let load_previous = matches!(op, WriteOp::Transform(_))
                || self.ctx.store().map_or(false, |s| s.load_previous_value());
            if load_previous {
                if let Some(store) = self.ctx.store() {
                    if store.read_through() {
                        if let Some(loaded) = store.load(None, &self.key)? {
                            let ttl0 = match req.expiry.map(|p| p.for_create()) {
                                Some(TTL_NOT_CHANGED) | None => 0,
                                Some(ttl) => ttl.max(0),
                            };
                            let expire0 = expiry::expire_time(ttl0, now);
                            // The loaded value commits under the current
                            // version: loads do not mint.
                            self.update_index(&loaded, &inner.ver.clone(), expire0)?;
                            self.set_value_locked(&mut inner, Some(loaded.clone()))?;
                            self.set_ttl_locked(&mut inner, ttl0, expire0);
                            old = Some(loaded);
                        }
                    }
                }
            }
        }

        if let Some(filter) = req.filter {
            if !filter(old.as_ref()) {
                if old.is_some() {
                    self.refresh_access_ttl(&mut inner, req.expiry);
                }
                return Ok(AtomicUpdateResult::no_change(old));
            }
        }

        let mut invoke_result = None;
        let mut new_val = match &op {
            WriteOp::Update(v) => Some(v.clone()),
            WriteOp::Delete => None,
            WriteOp::Transform(processor) => {
                let mut view = InvokeEntry::new(self.key.clone(), old.clone());
                match processor.process(&mut view) {
                    Ok(result) => invoke_result = Some(InvokeResult { result, error: None }),
                    Err(err) => {
                        invoke_result =
                            Some(InvokeResult { result: None, error: Some(err.to_string()) })
                    }
                }
                if !view.modified {
                    if old.is_some() {
                        self.refresh_access_ttl(&mut inner, req.expiry);
                    }
                    let mut result = AtomicUpdateResult::no_change(old);
                    result.invoke_result = invoke_result;
                    return Ok(result);
                }
                view.value
            }
        };

        // A transform producing nothing is a delete.
        let mut delete = new_val.is_none();

        let (ttl, expire) = if let Some(cctx) = &conflict_ctx {
            (cctx.ttl, cctx.expire_time)
        } else if req.explicit_ttl != TTL_NOT_CHANGED {
            let ttl = req.explicit_ttl.max(0);
            let expire =
                if req.explicit_expire >= 0 { req.explicit_expire } else { expiry::expire_time(ttl, now) };
            (ttl, expire)
        } else {
            let policy_ttl = match req.expiry {
                Some(p) if old.is_none() => p.for_create(),
                Some(p) => p.for_update(),
                None => TTL_NOT_CHANGED,
            };
            match policy_ttl {
                TTL_NOT_CHANGED => {
                    (GridEntry::ttl_unlocked(&inner), GridEntry::expire_time_unlocked(&inner))
                }
                TTL_ZERO => {
                    delete = true;
                    new_val = None;
                    (0, 0)
                }
                ttl => (ttl, expiry::expire_time(ttl, now)),
            }
        };

        let notify_queries = req.primary || self.ctx.topology().is_replicated();
        let is_transform = matches!(req.op, WriteOp::Transform(_));
        let tag = req.transform_tag.filter(|_| is_transform);

        if !delete {
            let mut val = match new_val.take() {
                Some(v) => v,
                None => return Err(Error::Internal("update path without a value".into())),
            };
            if let Some(interceptor) = self.ctx.interceptor() {
                match interceptor.on_before_put(&self.key, old.as_ref(), &val) {
                    Some(v) => val = v,
                    None => {
                        let mut result = AtomicUpdateResult::no_change(old);
                        result.invoke_result = invoke_result;
                        return Ok(result);
                    }
                }
            }

            let commit_ver = match conflict_ver {
                Some(cv) => req.new_ver.clone().with_conflict(cv),
                None => req.new_ver.clone(),
            };

            // Atomic mode: write-through happens inside the lock.
            if let Some(store) = self.ctx.store() {
                if store.write_through() && req.primary {
                    store.put(None, &self.key, &val, &commit_ver)?;
                }
            }
            self.update_index(&val, &commit_ver, expire)?;
            if GridEntry::deleted_unlocked(&inner) {
                self.set_deleted_locked(&mut inner, false);
            }
            self.set_value_locked(&mut inner, Some(val.clone()))?;
            inner.ver = commit_ver.clone();
            self.set_ttl_locked(&mut inner, ttl, expire);
            self.retrack_locked(&inner);

            if req.dr_type.is_dr() {
                if let Some(replicator) = self.ctx.replicator() {
                    replicator.replicate(&self.key, Some(&val), ttl, expire, &commit_ver, req.dr_type)?;
                }
            }
            self.ctx.topology().record_node_id(&self.key, self.ctx.config().local_node_id);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_write();
            }
            if req.event {
                if is_transform {
                    record_event_locked(
                        self,
                        &inner,
                        EventType::Read,
                        old.clone(),
                        old.is_some(),
                        None,
                        None,
                        req.subject_id,
                        tag,
                        req.task_name,
                    );
                }
                record_event_locked(
                    self,
                    &inner,
                    EventType::Put,
                    Some(val.clone()),
                    true,
                    old.clone(),
                    None,
                    req.subject_id,
                    tag,
                    req.task_name,
                );
            }
            if notify_queries {
                if let Some(queries) = self.ctx.queries() {
                    queries.on_entry_updated(&self.key, Some(&val), old.as_ref(), false);
                }
            }
            if let Some(ds) = self.ctx.data_structures() {
                ds.on_entry_updated(&self.key, false);
            }

            drop(inner);
            if let Some(interceptor) = self.ctx.interceptor() {
                interceptor.on_after_put(&self.key, &val);
            }

            Ok(AtomicUpdateResult {
                success: true,
                old_value: old,
                new_value: Some(val),
                invoke_result,
                system_ttl: ttl,
                system_expire_time: expire,
                enqueue_ver: None,
                conflict: conflict_ctx,
                committed: true,
            })
        } else {
            if let Some(interceptor) = self.ctx.interceptor() {
                let (cancel, val) = interceptor.on_before_remove(&self.key, old.as_ref());
                if cancel {
                    let mut result = AtomicUpdateResult::no_change(val);
                    result.invoke_result = invoke_result;
                    return Ok(result);
                }
            }

            let commit_ver = req.new_ver.clone();

            if let Some(store) = self.ctx.store() {
                if store.write_through() && req.primary {
                    store.remove(None, &self.key)?;
                }
            }
            self.clear_index()?;
            self.set_value_locked(&mut inner, None)?;
            self.set_ttl_locked(&mut inner, 0, 0);
            if let Some(swap) = self.ctx.swap() {
                swap.remove_offheap(&self.key)?;
            }
            inner.ver = commit_ver.clone();

            let mut enqueue_ver = None;
            if self.ctx.deferred_delete_enabled() {
                self.set_deleted_locked(&mut inner, true);
                enqueue_ver = Some(commit_ver.clone());
            } else {
                self.mark_obsolete0(&mut inner, commit_ver.clone(), true)?;
            }

            let no_conflict = inner
                .extras
                .as_ref()
                .and_then(|e| e.mvcc())
                .map_or(true, |m| m.is_empty_excluding(&[&commit_ver]));
            if no_conflict {
                self.ctx.topology().clear_readers(&self.key);
            } else {
                self.ctx.topology().clear_reader(&self.key, self.ctx.config().local_node_id);
            }
            self.retrack_locked(&inner);

            if req.update_metrics && self.ctx.statistics_enabled() {
                self.ctx.metrics().on_remove();
            }
            if req.event {
                if is_transform {
                    record_event_locked(
                        self,
                        &inner,
                        EventType::Read,
                        old.clone(),
                        old.is_some(),
                        None,
                        None,
                        req.subject_id,
                        tag,
                        req.task_name,
                    );
                }
                record_event_locked(
                    self,
                    &inner,
                    EventType::Removed,
                    None,
                    false,
                    old.clone(),
                    None,
                    req.subject_id,
                    tag,
                    req.task_name,
                );
            }
            if notify_queries {
                if let Some(queries) = self.ctx.queries() {
                    queries.on_entry_updated(&self.key, None, old.as_ref(), false);
                }
            }
            if let Some(ds) = self.ctx.data_structures() {
                ds.on_entry_updated(&self.key, true);
            }

            drop(inner);
            if let Some(interceptor) = self.ctx.interceptor() {
                interceptor.on_after_remove(&self.key, old.as_ref());
            }

            Ok(AtomicUpdateResult {
                success: true,
                old_value: old,
                new_value: None,
                invoke_result,
                system_ttl: ttl,
                system_expire_time: expire,
                enqueue_ver,
                conflict: conflict_ctx,
                committed: true,
            })
        }
    }

    /// Pushes the current value back to the store: the repair applied when
    /// an equal-version duplicate arrives on a write-through primary.
    fn store_repair(&self, inner: &EntryInner, old: Option<&CacheValue>) -> CResult<()> {
        if let (Some(store), Some(val)) = (self.ctx.store(), old) {
            if store.write_through() {
                store.put(None, &self.key, val, &inner.ver)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conflict::{ConflictContext, ConflictResolver};
    use crate::context::{CacheConfig, CacheContext, CacheInterceptor, RecordingQueries};
    use crate::error::Error;
    use crate::events::RecordingEvents;
    use crate::store::{CacheStore, MemStore};
    use crate::value::CacheKey;
    use pretty_assertions::assert_eq;

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s.as_bytes().to_vec())
    }

    fn val(s: &str) -> CacheValue {
        CacheValue::from_bytes(s.as_bytes().to_vec())
    }

    struct Harness {
        ctx: Arc<CacheContext>,
        clock: Arc<ManualClock>,
        events: Arc<RecordingEvents>,
        store: Arc<MemStore>,
        queries: Arc<RecordingQueries>,
    }

    fn harness(cfg: CacheConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(RecordingEvents::new());
        let store = Arc::new(MemStore::new());
        let queries = Arc::new(RecordingQueries::new());
        let ctx = Arc::new(
            CacheContext::new(cfg)
                .with_clock(clock.clone())
                .with_events(events.clone())
                .with_store(store.clone())
                .with_queries(queries.clone()),
        );
        Harness { ctx, clock, events, store, queries }
    }

    fn entry(h: &Harness, k: &str) -> GridEntry {
        GridEntry::new(h.ctx.clone(), key(k), None, 0).unwrap()
    }

    #[test]
    fn fresh_put_then_get() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        let ver0 = e.version()?;

        let res = e.inner_set(SetRequest::new(val("1")))?;
        assert!(res.success);
        assert_eq!(res.old_value, None);

        let ver1 = e.version()?;
        assert!(ver1 > ver0);

        let got = e.inner_get(GetRequest::default())?;
        assert_eq!(got, Some(val("1")));
        assert_eq!(e.version()?, ver1, "reads do not advance the version");

        assert_eq!(h.events.count(EventType::Put), 1);
        assert_eq!(h.events.count(EventType::Read), 1);

        // Write-through saw the value.
        assert_eq!(h.store.get(&key("A")), Some(val("1")));
        Ok(())
    }

    #[test]
    fn expired_on_read_emits_expired_once() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = GridEntry::new(h.ctx.clone(), key("A"), Some(val("x")), 1)?;

        h.clock.advance(2);
        let got = e.inner_get(GetRequest::default())?;
        assert_eq!(got, None);
        assert!(!e.has_value()?);

        let expired = h.events.of_kind(EventType::Expired);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].old_value, Some(val("x")));
        assert_eq!(h.events.count(EventType::Read), 0);

        // Continuous queries saw the expiry too.
        assert_eq!(h.queries.expirations().len(), 1);
        Ok(())
    }

    #[test]
    fn read_through_commits_under_start_version() -> CResult<()> {
        let h = harness(CacheConfig::default());
        h.store.seed(&key("A"), val("s"));
        let e = entry(&h, "A");

        let got = e.inner_get(GetRequest { read_through: true, ..GetRequest::default() })?;
        assert_eq!(got, Some(val("s")));
        assert_eq!(e.raw_get()?, Some(val("s")));
        assert_eq!(h.store.loads(), 1);

        // Loads record READ, not PUT.
        assert_eq!(h.events.count(EventType::Put), 0);
        assert_eq!(h.events.count(EventType::Read), 1);
        Ok(())
    }

    #[test]
    fn read_through_discards_when_version_moved() -> CResult<()> {
        let h = harness(CacheConfig::default());

        // A store whose load sneaks a write into the entry, modeling a
        // concurrent writer between the miss and the re-lock.
        struct RacingStore {
            inner: Arc<MemStore>,
            entry: std::sync::Mutex<Option<Arc<GridEntry>>>,
        }
        impl CacheStore for RacingStore {
            fn load(&self, tx: Option<u64>, key: &CacheKey) -> CResult<Option<CacheValue>> {
                if let Some(entry) = self.entry.lock().expect("poisoned").take() {
                    entry.inner_set(SetRequest::new(val("racer")))?;
                }
                self.inner.load(tx, key)
            }
            fn put(
                &self,
                tx: Option<u64>,
                key: &CacheKey,
                value: &CacheValue,
                ver: &GridVersion,
            ) -> CResult<()> {
                self.inner.put(tx, key, value, ver)
            }
            fn remove(&self, tx: Option<u64>, key: &CacheKey) -> CResult<()> {
                self.inner.remove(tx, key)
            }
        }

        let backing = Arc::new(MemStore::new());
        backing.seed(&key("A"), val("s"));
        let racing =
            Arc::new(RacingStore { inner: backing, entry: std::sync::Mutex::new(None) });
        let ctx = Arc::new(
            CacheContext::new(CacheConfig::default())
                .with_clock(h.clock.clone())
                .with_store(racing.clone()),
        );
        let e = Arc::new(GridEntry::new(ctx, key("A"), None, 0)?);
        *racing.entry.lock().expect("poisoned") = Some(e.clone());

        // The loser of the optimistic race surfaces the racer's commit.
        let got = e.inner_get(GetRequest { read_through: true, ..GetRequest::default() })?;
        assert_eq!(got, Some(val("racer")));
        assert_eq!(e.raw_get()?, Some(val("racer")));
        Ok(())
    }

    #[test]
    fn reload_installs_load_version() -> CResult<()> {
        let h = harness(CacheConfig::default());
        h.store.seed(&key("A"), val("one"));
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("stale")))?;
        let topology_before = e.version()?.topology_version;

        h.store.seed(&key("A"), val("fresh"));
        let got = e.inner_reload()?;
        assert_eq!(got, Some(val("fresh")));
        assert_eq!(e.raw_get()?, Some(val("fresh")));
        assert_eq!(e.version()?.topology_version, topology_before);

        // A store miss reload empties the entry.
        h.store.remove(None, &key("A"))?;
        assert_eq!(e.inner_reload()?, None);
        assert!(!e.has_value()?);
        Ok(())
    }

    #[test]
    fn set_filter_rejects_without_mutation() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;

        let only_two: Box<EntryFilter> = Box::new(|v| v == Some(&val("2")));
        let res = e.inner_set(SetRequest {
            filter: Some(only_two.as_ref()),
            ..SetRequest::new(val("3"))
        })?;
        assert!(!res.success);
        assert_eq!(res.old_value, Some(val("1")));
        assert_eq!(e.raw_get()?, Some(val("1")));
        assert_eq!(h.events.count(EventType::Put), 1);
        Ok(())
    }

    #[test]
    fn interceptor_none_aborts_put() -> CResult<()> {
        struct VetoPuts;
        impl CacheInterceptor for VetoPuts {
            fn on_before_put(
                &self,
                _key: &CacheKey,
                _old: Option<&CacheValue>,
                _new: &CacheValue,
            ) -> Option<CacheValue> {
                None
            }
        }

        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(RecordingEvents::new());
        let ctx = Arc::new(
            CacheContext::new(CacheConfig::default())
                .with_clock(clock)
                .with_events(events.clone())
                .with_interceptor(Arc::new(VetoPuts)),
        );
        let e = GridEntry::new(ctx, key("A"), Some(val("old")), 0)?;
        let ver = e.version()?;

        let res = e.inner_set(SetRequest::new(val("new")))?;
        assert!(!res.success);
        assert_eq!(res.old_value, Some(val("old")));
        assert_eq!(e.raw_get()?, Some(val("old")));
        assert_eq!(e.version()?, ver);
        assert_eq!(events.count(EventType::Put), 0);
        Ok(())
    }

    #[test]
    fn interceptor_transforms_put_value() -> CResult<()> {
        struct Suffix;
        impl CacheInterceptor for Suffix {
            fn on_before_put(
                &self,
                _key: &CacheKey,
                _old: Option<&CacheValue>,
                new: &CacheValue,
            ) -> Option<CacheValue> {
                let (bytes, _) = new.value_bytes();
                let mut out = bytes.to_vec();
                out.push(b'!');
                Some(CacheValue::from_bytes(out))
            }
        }

        let ctx = Arc::new(
            CacheContext::new(CacheConfig::default())
                .with_clock(Arc::new(ManualClock::new(1_000)))
                .with_interceptor(Arc::new(Suffix)),
        );
        let e = GridEntry::new(ctx, key("A"), None, 0)?;
        e.inner_set(SetRequest::new(val("hi")))?;
        assert_eq!(e.raw_get()?, Some(val("hi!")));
        Ok(())
    }

    #[test]
    fn remove_without_deferred_delete_obsoletes() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;

        let res = e.inner_remove(RemoveRequest::default())?;
        assert!(res.success);
        assert_eq!(res.old_value, Some(val("1")));
        assert!(e.obsolete()?);
        assert_eq!(h.events.count(EventType::Removed), 1);
        assert_eq!(h.store.removes(), 1);
        Ok(())
    }

    #[test]
    fn deferred_delete_tombstones_then_obsoletes() -> CResult<()> {
        struct Queue(std::sync::Mutex<Vec<(CacheKey, GridVersion)>>);
        impl crate::context::DeferredDeleteQueue for Queue {
            fn enqueue(&self, key: &CacheKey, version: GridVersion) {
                self.0.lock().expect("poisoned").push((key.clone(), version));
            }
        }

        let queue = Arc::new(Queue(std::sync::Mutex::new(Vec::new())));
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(RecordingEvents::new());
        let ctx = Arc::new(
            CacheContext::new(CacheConfig { deferred_delete: true, ..CacheConfig::default() })
                .with_clock(clock)
                .with_events(events.clone())
                .with_deferred_deletes(queue.clone()),
        );
        let e = GridEntry::new(ctx.clone(), key("A"), Some(val("1")), 0)?;

        let res = e.inner_remove(RemoveRequest::default())?;
        assert!(res.success);

        // Tombstoned, not yet obsolete.
        assert!(e.deleted()?);
        assert!(!e.has_value()?);
        assert!(!e.obsolete()?);
        let enqueued = queue.0.lock().expect("poisoned").clone();
        assert_eq!(enqueued.len(), 1);

        // The sweeper later fires with the enqueued version: obsolete now,
        // and no EXPIRED event since the tombstone holds no value.
        let (_, ver) = enqueued.into_iter().next().expect("one enqueued");
        assert!(e.on_ttl_expired(ver)?);
        assert!(e.obsolete()?);
        assert_eq!(events.count(EventType::Expired), 0);
        assert_eq!(events.count(EventType::Removed), 1);
        Ok(())
    }

    #[test]
    fn atomic_update_with_stale_version_is_ignored() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("current")))?;
        let cur = e.version()?;
        h.events.take();

        let stale = GridVersion::new(cur.topology_version, cur.order - 1, cur.node_order, 0);
        let res = e.inner_update(AtomicUpdateRequest {
            ver_check: true,
            primary: false,
            ..AtomicUpdateRequest::new(stale, WriteOp::Update(val("stale")))
        })?;

        assert!(!res.success);
        assert!(!res.committed);
        assert_eq!(res.old_value, Some(val("current")));
        assert_eq!(e.raw_get()?, Some(val("current")));
        assert!(h.events.all().is_empty());
        Ok(())
    }

    #[test]
    fn equal_version_duplicate_repairs_store_on_primary() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("v")))?;
        let cur = e.version()?;
        let puts_before = h.store.puts();

        let res = e.inner_update(AtomicUpdateRequest {
            ver_check: true,
            primary: true,
            ..AtomicUpdateRequest::new(cur, WriteOp::Update(val("dup")))
        })?;

        assert!(!res.success);
        assert_eq!(e.raw_get()?, Some(val("v")));
        assert_eq!(h.store.puts(), puts_before + 1, "duplicate still repaired the store");
        assert_eq!(h.store.get(&key("A")), Some(val("v")));
        Ok(())
    }

    #[test]
    fn conflict_resolver_merge_commits_merged_value() -> CResult<()> {
        struct Concat;
        impl ConflictResolver for Concat {
            fn resolve(
                &self,
                old: &ConflictView,
                new: &ConflictView,
                _ver_check: bool,
            ) -> CResult<ConflictContext> {
                let mut bytes = old.value.map_or(vec![], |v| v.value_bytes().0.to_vec());
                bytes.extend_from_slice(new.value.map_or(&[][..], |v| v.value_bytes().0));
                Ok(ConflictContext::merge(Some(CacheValue::from_bytes(bytes)), 0, 0))
            }
        }

        struct Recorder(std::sync::Mutex<Vec<(Option<CacheValue>, GridVersion, DrType)>>);
        impl crate::conflict::DrReplicator for Recorder {
            fn replicate(
                &self,
                _key: &CacheKey,
                value: Option<&CacheValue>,
                _ttl: i64,
                _expire: i64,
                version: &GridVersion,
                dr_type: DrType,
            ) -> CResult<()> {
                self.0
                    .lock()
                    .expect("poisoned")
                    .push((value.cloned(), version.clone(), dr_type));
                Ok(())
            }
        }

        let replicated = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let ctx = Arc::new(
            CacheContext::new(CacheConfig {
                conflict_resolution: true,
                ..CacheConfig::default()
            })
            .with_clock(Arc::new(ManualClock::new(1_000)))
            .with_conflict_resolver(Arc::new(Concat))
            .with_replicator(replicated.clone()),
        );
        let e = GridEntry::new(ctx.clone(), key("A"), None, 0)?;
        e.inner_set(SetRequest::new(val("a")))?;

        let new_ver = ctx.versions().next();
        let conflict_ver = GridVersion::new(1, 999, 5, 2);
        let res = e.inner_update(AtomicUpdateRequest {
            conflict_ver: Some(conflict_ver),
            conflict_resolve: true,
            dr_type: DrType::Primary,
            ..AtomicUpdateRequest::new(new_ver.clone(), WriteOp::Update(val("b")))
        })?;

        assert!(res.success);
        assert_eq!(res.new_value, Some(val("ab")));
        assert_eq!(e.raw_get()?, Some(val("ab")));

        // Merged values commit under the regular version, conflict token
        // discarded.
        let committed = e.version()?;
        assert_eq!(committed, new_ver);
        assert_eq!(committed.conflict, None);

        // And the merged value is what replicates.
        let sent = replicated.0.lock().expect("poisoned").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(val("ab")));
        assert_eq!(sent[0].2, DrType::Primary);
        Ok(())
    }

    #[test]
    fn conflict_use_old_keeps_value() -> CResult<()> {
        struct KeepOld;
        impl ConflictResolver for KeepOld {
            fn resolve(
                &self,
                _old: &ConflictView,
                _new: &ConflictView,
                _ver_check: bool,
            ) -> CResult<ConflictContext> {
                Ok(ConflictContext::use_old())
            }
        }

        let ctx = Arc::new(
            CacheContext::new(CacheConfig {
                conflict_resolution: true,
                ..CacheConfig::default()
            })
            .with_clock(Arc::new(ManualClock::new(1_000)))
            .with_conflict_resolver(Arc::new(KeepOld)),
        );
        let e = GridEntry::new(ctx.clone(), key("A"), None, 0)?;
        e.inner_set(SetRequest::new(val("mine")))?;

        let res = e.inner_update(AtomicUpdateRequest {
            conflict_ver: Some(GridVersion::new(1, 999, 5, 2)),
            conflict_resolve: true,
            ..AtomicUpdateRequest::new(ctx.versions().next(), WriteOp::Update(val("theirs")))
        })?;

        assert!(!res.success);
        assert!(res.conflict.expect("resolver consulted").is_use_old());
        assert_eq!(e.raw_get()?, Some(val("mine")));
        Ok(())
    }

    #[test]
    fn ttl_zero_policy_degrades_update_to_delete() -> CResult<()> {
        struct ZeroOnUpdate;
        impl ExpiryPolicy for ZeroOnUpdate {
            fn for_update(&self) -> i64 {
                TTL_ZERO
            }
        }

        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;
        h.events.take();

        let res = e.inner_update(AtomicUpdateRequest {
            expiry: Some(&ZeroOnUpdate),
            ..AtomicUpdateRequest::new(h.ctx.versions().next(), WriteOp::Update(val("2")))
        })?;

        assert!(res.success);
        assert_eq!(res.new_value, None);
        assert!(!e.has_value()?);
        assert_eq!(h.events.count(EventType::Removed), 1);
        assert_eq!(h.events.count(EventType::Put), 0);
        Ok(())
    }

    #[test]
    fn unmodified_transform_emits_no_put() -> CResult<()> {
        struct ReadOnly;
        impl EntryProcessor for ReadOnly {
            fn process(&self, entry: &mut InvokeEntry) -> CResult<Option<CacheValue>> {
                Ok(entry.value().cloned())
            }
        }

        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;
        let ver = e.version()?;
        h.events.take();

        let res = e.inner_update(AtomicUpdateRequest::new(
            h.ctx.versions().next(),
            WriteOp::Transform(Arc::new(ReadOnly)),
        ))?;

        assert!(!res.success);
        assert_eq!(res.invoke_result.expect("ran").result, Some(val("1")));
        assert_eq!(e.version()?, ver);
        assert_eq!(h.events.count(EventType::Put), 0);
        Ok(())
    }

    #[test]
    fn transform_failure_is_captured_not_propagated() -> CResult<()> {
        struct Exploding;
        impl EntryProcessor for Exploding {
            fn process(&self, _entry: &mut InvokeEntry) -> CResult<Option<CacheValue>> {
                Err(Error::Value("boom".into()))
            }
        }

        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;

        let res = e.inner_update(AtomicUpdateRequest::new(
            h.ctx.versions().next(),
            WriteOp::Transform(Arc::new(Exploding)),
        ))?;

        assert!(!res.success);
        let invoke = res.invoke_result.expect("captured");
        assert!(invoke.error.expect("failed").contains("boom"));
        assert_eq!(e.raw_get()?, Some(val("1")));
        Ok(())
    }

    #[test]
    fn transform_appends_and_emits_read_then_put() -> CResult<()> {
        struct Append;
        impl EntryProcessor for Append {
            fn process(&self, entry: &mut InvokeEntry) -> CResult<Option<CacheValue>> {
                let mut bytes =
                    entry.value().map_or(vec![], |v| v.value_bytes().0.to_vec());
                bytes.push(b'+');
                entry.set(CacheValue::from_bytes(bytes));
                Ok(Some(CacheValue::from_bytes(b"done".to_vec())))
            }
        }

        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("x")))?;
        h.events.take();

        let res = e.inner_update(AtomicUpdateRequest {
            transform_tag: Some("append"),
            ..AtomicUpdateRequest::new(
                h.ctx.versions().next(),
                WriteOp::Transform(Arc::new(Append)),
            )
        })?;

        assert!(res.success);
        assert_eq!(e.raw_get()?, Some(val("x+")));
        assert_eq!(res.invoke_result.expect("ran").result, Some(val("done")));

        let kinds: Vec<_> = h.events.all().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventType::Read, EventType::Put]);
        Ok(())
    }

    #[test]
    fn update_local_round_trip() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");

        let (changed, old, _) =
            e.inner_update_local(LocalUpdateRequest::new(WriteOp::Update(val("1"))))?;
        assert!(changed);
        assert_eq!(old, None);
        assert_eq!(e.raw_get()?, Some(val("1")));
        // Atomic local mode writes the store under the lock.
        assert_eq!(h.store.get(&key("A")), Some(val("1")));

        let (changed, old, _) = e.inner_update_local(LocalUpdateRequest::new(WriteOp::Delete))?;
        assert!(changed);
        assert_eq!(old, Some(val("1")));
        assert!(!e.has_value()?);
        assert_eq!(h.store.get(&key("A")), None);
        Ok(())
    }

    #[test]
    fn update_local_reads_through_for_transform() -> CResult<()> {
        struct Upper;
        impl EntryProcessor for Upper {
            fn process(&self, entry: &mut InvokeEntry) -> CResult<Option<CacheValue>> {
                let bytes = entry.value().map_or(vec![], |v| {
                    v.value_bytes().0.to_ascii_uppercase()
                });
                entry.set(CacheValue::from_bytes(bytes));
                Ok(None)
            }
        }

        let h = harness(CacheConfig::default());
        h.store.seed(&key("A"), val("abc"));
        let e = entry(&h, "A");

        let (changed, old, _) = e.inner_update_local(LocalUpdateRequest {
            read_through: true,
            ..LocalUpdateRequest::new(WriteOp::Transform(Arc::new(Upper)))
        })?;
        assert!(changed);
        assert_eq!(old, Some(val("abc")));
        assert_eq!(e.raw_get()?, Some(val("ABC")));
        Ok(())
    }

    #[test]
    fn metrics_track_reads_and_writes() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");

        e.inner_get(GetRequest::default())?; // miss
        e.inner_set(SetRequest::new(val("1")))?;
        e.inner_get(GetRequest::default())?; // hit
        e.inner_remove(RemoveRequest::default())?;

        let snap = h.ctx.metrics().snapshot();
        assert_eq!(snap.reads, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.writes, 1);
        assert_eq!(snap.removes, 1);
        Ok(())
    }

    #[test]
    fn access_expiry_refreshes_ttl_on_read() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest::new(val("1")))?;

        let policy = crate::expiry::TouchedExpiryPolicy { ttl: 500 };
        e.inner_get(GetRequest { expiry: Some(&policy), ..GetRequest::default() })?;
        assert_eq!(e.ttl()?, 500);
        assert_eq!(e.expire_time()?, 1_500);
        Ok(())
    }

    #[test]
    fn explicit_dr_expire_wins_over_ttl() -> CResult<()> {
        let h = harness(CacheConfig::default());
        let e = entry(&h, "A");
        e.inner_set(SetRequest {
            ttl: 100,
            dr_expire_time: 9_999,
            dr_type: DrType::Backup,
            ..SetRequest::new(val("1"))
        })?;
        assert_eq!(e.expire_time()?, 9_999);
        Ok(())
    }
}
