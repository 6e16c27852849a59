//! The peek/inspect surface.
//!
//! Peeks read entry state without driving the operation engine. A peek
//! never mutates the entry, with one exception: a GLOBAL peek that detects
//! an expired value marks the entry obsolete and requests its removal from
//! the owning map. Every peek honors obsolescence.

use std::sync::Arc;

use crate::error::CResult;
use crate::tx::Transaction;
use crate::value::{CacheKey, CacheValue};
use crate::version::GridVersion;

use super::ops::EntryFilter;
use super::GridEntry;

/// Where a peek looks. A closed enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeekMode {
    /// The current transaction's write-set only.
    Tx,
    /// The in-memory entry.
    Global,
    /// The in-memory entry, on near topologies only.
    NearOnly,
    /// The in-memory entry, on non-near topologies only.
    PartitionedOnly,
    /// TX while the transaction is active, otherwise GLOBAL.
    Smart,
    /// The swap tier only.
    Swap,
    /// The underlying store only.
    Db,
}

/// Peek outcome. The fail-fast filter rejection is a sentinel, not an
/// error.
#[derive(Clone, Debug, PartialEq)]
pub enum Peeked {
    Value(CacheValue),
    FilterFailed,
    Empty,
}

impl Peeked {
    pub fn value(self) -> Option<CacheValue> {
        match self {
            Peeked::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_filter_failed(&self) -> bool {
        matches!(self, Peeked::FilterFailed)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Peeked::Empty)
    }
}

fn filtered(value: CacheValue, filter: Option<&EntryFilter>) -> Peeked {
    match filter {
        Some(f) if !f(Some(&value)) => Peeked::FilterFailed,
        _ => Peeked::Value(value),
    }
}

impl GridEntry {
    /// Peeks one source.
    pub fn peek(
        &self,
        mode: PeekMode,
        filter: Option<&EntryFilter>,
        tx: Option<&Transaction>,
    ) -> CResult<Peeked> {
        match mode {
            PeekMode::Tx => Ok(self.peek_tx(filter, tx)),
            PeekMode::Global => self.peek_global(filter),
            PeekMode::NearOnly => {
                if self.ctx.topology().is_near() {
                    self.peek_global(filter)
                } else {
                    Ok(Peeked::Empty)
                }
            }
            PeekMode::PartitionedOnly => {
                if self.ctx.topology().is_near() {
                    Ok(Peeked::Empty)
                } else {
                    self.peek_global(filter)
                }
            }
            PeekMode::Smart => {
                if tx.map_or(false, |t| t.is_active()) {
                    Ok(self.peek_tx(filter, tx))
                } else {
                    self.peek_global(filter)
                }
            }
            PeekMode::Swap => self.peek_swap(filter),
            PeekMode::Db => self.peek_db(filter),
        }
    }

    /// Peeks sources in order, returning the first non-empty outcome.
    pub fn peek_modes(
        &self,
        modes: &[PeekMode],
        filter: Option<&EntryFilter>,
        tx: Option<&Transaction>,
    ) -> CResult<Peeked> {
        for mode in modes {
            match self.peek(*mode, filter, tx)? {
                Peeked::Empty => continue,
                hit => return Ok(hit),
            }
        }
        Ok(Peeked::Empty)
    }

    fn peek_tx(&self, filter: Option<&EntryFilter>, tx: Option<&Transaction>) -> Peeked {
        match tx.and_then(|t| t.peek(&self.key)) {
            Some(write) => match write.value {
                Some(v) => filtered(v, filter),
                // A pending remove in the write-set.
                None => Peeked::Empty,
            },
            None => Peeked::Empty,
        }
    }

    /// Peeks the in-memory entry. A detected-expired value marks the entry
    /// obsolete, requesting removal from the map, and peeks empty.
    fn peek_global(&self, filter: Option<&EntryFilter>) -> CResult<Peeked> {
        let mut inner = self.lock()?;
        self.check_obsolete(&inner)?;

        let now = self.ctx.now_millis();
        if self.expired_unlocked(&inner, now) {
            let ver = self.ctx.versions().next();
            self.mark_obsolete0(&mut inner, ver, true)?;
            return Ok(Peeked::Empty);
        }

        match self.value_unlocked(&inner, true)? {
            Some(v) => Ok(filtered(v, filter)),
            None => match filter {
                Some(f) if !f(None) => Ok(Peeked::FilterFailed),
                _ => Ok(Peeked::Empty),
            },
        }
    }

    fn peek_swap(&self, filter: Option<&EntryFilter>) -> CResult<Peeked> {
        let swap = match self.ctx.swap() {
            Some(s) => s.clone(),
            None => return Ok(Peeked::Empty),
        };
        match swap.read(&self.key, true, true, true)? {
            Some(entry) => {
                let val = CacheValue::from_parts(entry.value_bytes, entry.type_tag);
                Ok(filtered(val, filter))
            }
            None => Ok(Peeked::Empty),
        }
    }

    fn peek_db(&self, filter: Option<&EntryFilter>) -> CResult<Peeked> {
        let store = match self.ctx.store() {
            Some(s) => s.clone(),
            None => return Ok(Peeked::Empty),
        };
        match store.load(None, &self.key)? {
            Some(v) => Ok(filtered(v, filter)),
            None => Ok(Peeked::Empty),
        }
    }

    /// Snapshots the entry to an externally visible key/value record,
    /// consulting the transaction's write-set when one is active.
    pub fn wrap(&self, tx: Option<&Transaction>) -> CResult<EntrySnapshot> {
        let peeked = match self.peek(PeekMode::Smart, None, tx) {
            Ok(p) => p,
            Err(crate::error::Error::EntryRemoved) => Peeked::Empty,
            Err(err) => return Err(err),
        };
        Ok(EntrySnapshot { key: self.key.clone(), value: peeked.value() })
    }

    /// Wraps the entry with deferred value materialization; each
    /// dereference re-peeks.
    pub fn wrap_lazy(self: &Arc<Self>) -> LazyEntry {
        LazyEntry { entry: self.clone() }
    }

    /// A façade for the eviction policy: key, footprint and a
    /// mutation-free value view.
    pub fn wrap_eviction(self: &Arc<Self>) -> EvictionView {
        EvictionView { entry: self.clone() }
    }

    /// A façade for version-aware user code, capturing the version at
    /// wrap time.
    pub fn wrap_versioned(self: &Arc<Self>) -> CResult<VersionedView> {
        let version = self.version()?;
        Ok(VersionedView { entry: self.clone(), version })
    }
}

/// An externally visible key/value snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub value: Option<CacheValue>,
}

/// Deferred-materialization wrapper: holds the entry, not the value.
pub struct LazyEntry {
    entry: Arc<GridEntry>,
}

impl LazyEntry {
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// Re-peeks the live entry.
    pub fn value(&self) -> CResult<Option<CacheValue>> {
        match self.entry.peek(PeekMode::Global, None, None) {
            Ok(p) => Ok(p.value()),
            Err(crate::error::Error::EntryRemoved) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// The eviction policy's view: never mutates, never obsoletes.
pub struct EvictionView {
    entry: Arc<GridEntry>,
}

impl EvictionView {
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    pub fn memory_size(&self) -> CResult<usize> {
        self.entry.memory_size()
    }

    /// The current value; expired or obsolete entries read as empty.
    pub fn value(&self) -> CResult<Option<CacheValue>> {
        let inner = self.entry.lock()?;
        if self.entry.obsolete_version_unlocked(&inner).is_some() {
            return Ok(None);
        }
        if self.entry.expired_unlocked(&inner, self.entry.ctx.now_millis()) {
            return Ok(None);
        }
        self.entry.value_unlocked(&inner, true)
    }
}

/// The version-aware view handed to user code.
pub struct VersionedView {
    entry: Arc<GridEntry>,
    version: GridVersion,
}

impl VersionedView {
    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    /// The version captured when the view was created.
    pub fn version(&self) -> &GridVersion {
        &self.version
    }

    pub fn value(&self) -> CResult<Option<CacheValue>> {
        match self.entry.peek(PeekMode::Global, None, None) {
            Ok(p) => Ok(p.value()),
            Err(crate::error::Error::EntryRemoved) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
