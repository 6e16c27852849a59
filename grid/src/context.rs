//! The cache context: configuration plus every collaborator the entry cell
//! consumes. The context is wired once by the embedding application and
//! shared by all entries of one cache. All collaborators are externally
//! thread-safe and may be called under an entry's lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::conflict::{ConflictResolver, DrReplicator};
use crate::error::CResult;
use crate::events::{EventBus, NoopEvents};
use crate::offheap::OffHeapAllocator;
use crate::store::CacheStore;
use crate::swap::SwapManager;
use crate::value::{CacheKey, CacheValue};
use crate::version::{GridVersion, VersionSource};

/// Cache distribution mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    Local,
    Replicated,
    Partitioned,
}

/// Where values are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryMode {
    /// Values live on the heap slot.
    OnHeap,
    /// Values live off-heap only; the heap slot stays empty.
    OffHeapValues,
    /// Values start on-heap and are demoted to the off-heap tier by
    /// eviction.
    OffHeapTiered,
}

/// Static cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub name: String,
    pub mode: CacheMode,
    pub memory_mode: MemoryMode,
    /// Deletions first set a tombstone; a background queue obsoletes later.
    pub deferred_delete: bool,
    /// Register expiring entries with the TTL tracker for eager sweeping.
    pub eager_ttl: bool,
    pub statistics_enabled: bool,
    /// Consult the conflict resolver for replicated updates.
    pub conflict_resolution: bool,
    /// Spill values to the swap tier on eviction.
    pub swap_enabled: bool,
    /// This cache holds block data; value size deltas are reported to the
    /// data size accountant.
    pub block_data_cache: bool,
    pub local_node_id: u64,
    pub local_node_order: u32,
    pub data_center_id: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            mode: CacheMode::Local,
            memory_mode: MemoryMode::OnHeap,
            deferred_delete: false,
            eager_ttl: true,
            statistics_enabled: true,
            conflict_resolution: false,
            swap_enabled: false,
            block_data_cache: false,
            local_node_id: 1,
            local_node_order: 1,
            data_center_id: 0,
        }
    }
}

/// Cache operation counters.
#[derive(Default)]
pub struct CacheMetrics {
    reads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub reads: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub removes: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn on_read(&self, hit: bool) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if hit {
            self.hits.fetch_add(1, Ordering::SeqCst);
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn on_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_remove(&self) {
        self.removes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_evict(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
        }
    }
}

/// User hook invoked around every put and remove.
pub trait CacheInterceptor: Send + Sync {
    /// Maps the value about to be written. Returning None cancels the
    /// operation and the entry keeps its old value.
    fn on_before_put(
        &self,
        key: &CacheKey,
        old: Option<&CacheValue>,
        new: &CacheValue,
    ) -> Option<CacheValue> {
        let _ = (key, old);
        Some(new.clone())
    }

    fn on_after_put(&self, _key: &CacheKey, _value: &CacheValue) {}

    /// Returns `(cancel, value)`. Cancelling aborts the remove and the
    /// caller observes the returned value.
    fn on_before_remove(
        &self,
        key: &CacheKey,
        old: Option<&CacheValue>,
    ) -> (bool, Option<CacheValue>) {
        let _ = key;
        (false, old.cloned())
    }

    fn on_after_remove(&self, _key: &CacheKey, _value: Option<&CacheValue>) {}
}

/// Topology/affinity behavior of the owning cache variant (local, DHT,
/// near). The entry cell is concrete; variant behavior enters only here.
pub trait TopologyPolicy: Send + Sync {
    fn is_dht(&self) -> bool {
        false
    }

    fn is_near(&self) -> bool {
        false
    }

    fn is_replicated(&self) -> bool {
        false
    }

    fn partition(&self, _key: &CacheKey) -> u32 {
        0
    }

    /// Whether near-cache readers still reference the key.
    fn has_readers(&self, _key: &CacheKey) -> bool {
        false
    }

    /// Drops all reader registrations for the key.
    fn clear_readers(&self, _key: &CacheKey) {}

    /// Drops the reader registration of one node only.
    fn clear_reader(&self, _key: &CacheKey, _node_id: u64) {}

    /// Records the primary affinity node that produced the current value.
    fn record_node_id(&self, _key: &CacheKey, _node_id: u64) {}

    /// Invalidation callback for near caches.
    fn on_invalidate(&self, _key: &CacheKey) {}
}

/// The local (non-distributed) topology.
pub struct LocalTopology;

impl TopologyPolicy for LocalTopology {}

/// The query/index manager seam. Failures are wrapped into index errors by
/// the entry.
pub trait IndexManager: Send + Sync {
    fn store(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        version: &GridVersion,
        expire_time: i64,
    ) -> CResult<()>;

    fn remove(&self, key: &CacheKey) -> CResult<()>;
}

/// Continuous-query notifications, fired inside the entry lock.
pub trait ContinuousQueries: Send + Sync {
    fn on_entry_updated(
        &self,
        key: &CacheKey,
        new_value: Option<&CacheValue>,
        old_value: Option<&CacheValue>,
        preload: bool,
    );

    fn on_entry_expired(&self, key: &CacheKey, expired_value: Option<&CacheValue>);
}

/// Records continuous-query notifications in memory.
pub struct RecordingQueries {
    updates: Mutex<Vec<(CacheKey, Option<CacheValue>, Option<CacheValue>, bool)>>,
    expirations: Mutex<Vec<(CacheKey, Option<CacheValue>)>>,
}

impl RecordingQueries {
    pub fn new() -> Self {
        Self { updates: Mutex::new(Vec::new()), expirations: Mutex::new(Vec::new()) }
    }

    pub fn updates(&self) -> Vec<(CacheKey, Option<CacheValue>, Option<CacheValue>, bool)> {
        self.updates.lock().expect("queries poisoned").clone()
    }

    pub fn expirations(&self) -> Vec<(CacheKey, Option<CacheValue>)> {
        self.expirations.lock().expect("queries poisoned").clone()
    }
}

impl Default for RecordingQueries {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuousQueries for RecordingQueries {
    fn on_entry_updated(
        &self,
        key: &CacheKey,
        new_value: Option<&CacheValue>,
        old_value: Option<&CacheValue>,
        preload: bool,
    ) {
        self.updates.lock().expect("queries poisoned").push((
            key.clone(),
            new_value.cloned(),
            old_value.cloned(),
            preload,
        ));
    }

    fn on_entry_expired(&self, key: &CacheKey, expired_value: Option<&CacheValue>) {
        self.expirations
            .lock()
            .expect("queries poisoned")
            .push((key.clone(), expired_value.cloned()));
    }
}

/// Eager-TTL tracking: the sweeper scans tracked entries and calls
/// `on_ttl_expired` on the ones past their expire time.
pub trait TtlTracker: Send + Sync {
    fn track(&self, key: &CacheKey, expire_time: i64);

    fn untrack(&self, key: &CacheKey);
}

/// Eviction-policy bookkeeping ("touch").
pub trait EvictionObserver: Send + Sync {
    fn touch(&self, key: &CacheKey, topology_version: u32);
}

/// The deferred-delete queue. Tombstoned entries are enqueued here and
/// obsoleted later by the sweeper.
pub trait DeferredDeleteQueue: Send + Sync {
    fn enqueue(&self, key: &CacheKey, version: GridVersion);
}

/// Data-structures manager notifications (queues, sets and the like built
/// on top of the cache observe entry changes through this).
pub trait DataStructuresManager: Send + Sync {
    fn on_entry_updated(&self, key: &CacheKey, removed: bool);
}

/// Size accounting for block-data caches.
pub trait DataSizeAccountant: Send + Sync {
    fn on_size_delta(&self, delta: i64);
}

/// The shared per-cache context.
pub struct CacheContext {
    cfg: CacheConfig,
    versions: VersionSource,
    clock: Arc<dyn Clock>,
    metrics: CacheMetrics,
    events: Arc<dyn EventBus>,
    topology: Arc<dyn TopologyPolicy>,
    store: Option<Arc<dyn CacheStore>>,
    swap: Option<Arc<dyn SwapManager>>,
    offheap: Option<Arc<dyn OffHeapAllocator>>,
    interceptor: Option<Arc<dyn CacheInterceptor>>,
    replicator: Option<Arc<dyn DrReplicator>>,
    conflict: Option<Arc<dyn ConflictResolver>>,
    index: Option<Arc<dyn IndexManager>>,
    queries: Option<Arc<dyn ContinuousQueries>>,
    ttl_tracker: Option<Arc<dyn TtlTracker>>,
    evictions: Option<Arc<dyn EvictionObserver>>,
    deferred: Option<Arc<dyn DeferredDeleteQueue>>,
    data_structures: Option<Arc<dyn DataStructuresManager>>,
    accountant: Option<Arc<dyn DataSizeAccountant>>,
}

impl CacheContext {
    pub fn new(cfg: CacheConfig) -> Self {
        let versions = VersionSource::new(cfg.local_node_order, cfg.data_center_id);
        Self {
            cfg,
            versions,
            clock: Arc::new(SystemClock),
            metrics: CacheMetrics::default(),
            events: Arc::new(NoopEvents),
            topology: Arc::new(LocalTopology),
            store: None,
            swap: None,
            offheap: None,
            interceptor: None,
            replicator: None,
            conflict: None,
            index: None,
            queries: None,
            ttl_tracker: None,
            evictions: None,
            deferred: None,
            data_structures: None,
            accountant: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_topology(mut self, topology: Arc<dyn TopologyPolicy>) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_swap(mut self, swap: Arc<dyn SwapManager>) -> Self {
        self.swap = Some(swap);
        self
    }

    pub fn with_offheap(mut self, offheap: Arc<dyn OffHeapAllocator>) -> Self {
        self.offheap = Some(offheap);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CacheInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn with_replicator(mut self, replicator: Arc<dyn DrReplicator>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    pub fn with_conflict_resolver(mut self, conflict: Arc<dyn ConflictResolver>) -> Self {
        self.conflict = Some(conflict);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn IndexManager>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_queries(mut self, queries: Arc<dyn ContinuousQueries>) -> Self {
        self.queries = Some(queries);
        self
    }

    pub fn with_ttl_tracker(mut self, tracker: Arc<dyn TtlTracker>) -> Self {
        self.ttl_tracker = Some(tracker);
        self
    }

    pub fn with_evictions(mut self, evictions: Arc<dyn EvictionObserver>) -> Self {
        self.evictions = Some(evictions);
        self
    }

    pub fn with_deferred_deletes(mut self, deferred: Arc<dyn DeferredDeleteQueue>) -> Self {
        self.deferred = Some(deferred);
        self
    }

    pub fn with_data_structures(mut self, ds: Arc<dyn DataStructuresManager>) -> Self {
        self.data_structures = Some(ds);
        self
    }

    pub fn with_size_accountant(mut self, accountant: Arc<dyn DataSizeAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn versions(&self) -> &VersionSource {
        &self.versions
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn events(&self) -> &dyn EventBus {
        self.events.as_ref()
    }

    pub fn topology(&self) -> &dyn TopologyPolicy {
        self.topology.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    pub fn swap(&self) -> Option<&Arc<dyn SwapManager>> {
        self.swap.as_ref()
    }

    pub fn offheap(&self) -> Option<&Arc<dyn OffHeapAllocator>> {
        self.offheap.as_ref()
    }

    pub fn interceptor(&self) -> Option<&Arc<dyn CacheInterceptor>> {
        self.interceptor.as_ref()
    }

    pub fn replicator(&self) -> Option<&Arc<dyn DrReplicator>> {
        self.replicator.as_ref()
    }

    pub fn conflict_resolver(&self) -> Option<&Arc<dyn ConflictResolver>> {
        self.conflict.as_ref()
    }

    pub fn index(&self) -> Option<&Arc<dyn IndexManager>> {
        self.index.as_ref()
    }

    pub fn queries(&self) -> Option<&Arc<dyn ContinuousQueries>> {
        self.queries.as_ref()
    }

    pub fn ttl_tracker(&self) -> Option<&Arc<dyn TtlTracker>> {
        self.ttl_tracker.as_ref()
    }

    pub fn evictions(&self) -> Option<&Arc<dyn EvictionObserver>> {
        self.evictions.as_ref()
    }

    pub fn deferred_deletes(&self) -> Option<&Arc<dyn DeferredDeleteQueue>> {
        self.deferred.as_ref()
    }

    pub fn data_structures(&self) -> Option<&Arc<dyn DataStructuresManager>> {
        self.data_structures.as_ref()
    }

    pub fn size_accountant(&self) -> Option<&Arc<dyn DataSizeAccountant>> {
        self.accountant.as_ref()
    }

    /// Whether deletions go through the tombstone path.
    pub fn deferred_delete_enabled(&self) -> bool {
        self.cfg.deferred_delete
    }

    /// Whether values live off-heap only.
    pub fn offheap_values(&self) -> bool {
        self.cfg.memory_mode == MemoryMode::OffHeapValues
    }

    pub fn offheap_tiered(&self) -> bool {
        self.cfg.memory_mode == MemoryMode::OffHeapTiered
    }

    /// Whether evicted state has anywhere to go.
    pub fn swap_or_offheap_enabled(&self) -> bool {
        self.cfg.swap_enabled || self.cfg.memory_mode != MemoryMode::OnHeap
    }

    pub fn conflict_enabled(&self) -> bool {
        self.cfg.conflict_resolution && self.conflict.is_some()
    }

    pub fn statistics_enabled(&self) -> bool {
        self.cfg.statistics_enabled
    }
}
