//! The transaction surface consumed by the entry cell.
//!
//! The cell never drives transactions: it receives one with an operation
//! and consults its write version, state and write-set. Thread-to-
//! transaction binding and commit ordering are the transaction engine's
//! concern and live outside this crate.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::value::{CacheKey, CacheValue};
use crate::version::GridVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RolledBack,
}

/// A pending write recorded in a transaction's write-set. A None value is
/// a pending remove.
#[derive(Clone, Debug, PartialEq)]
pub struct TxWrite {
    pub value: Option<CacheValue>,
    pub ttl: i64,
    pub expire_time: i64,
}

/// A transaction, as seen by the entry cell.
pub struct Transaction {
    xid: u64,
    write_version: GridVersion,
    state: Mutex<TxState>,
    writes: Mutex<BTreeMap<Vec<u8>, TxWrite>>,
}

impl Transaction {
    pub fn new(xid: u64, write_version: GridVersion) -> Self {
        Self {
            xid,
            write_version,
            state: Mutex::new(TxState::Active),
            writes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// The version all of this transaction's writes commit under.
    pub fn write_version(&self) -> &GridVersion {
        &self.write_version
    }

    pub fn state(&self) -> TxState {
        *self.state.lock().expect("tx state poisoned")
    }

    pub fn set_state(&self, state: TxState) {
        *self.state.lock().expect("tx state poisoned") = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxState::Active
    }

    /// Records a pending put in the write-set.
    pub fn put(&self, key: &CacheKey, value: CacheValue, ttl: i64, expire_time: i64) {
        self.writes
            .lock()
            .expect("tx writes poisoned")
            .insert(key.bytes().to_vec(), TxWrite { value: Some(value), ttl, expire_time });
    }

    /// Records a pending remove in the write-set.
    pub fn remove(&self, key: &CacheKey) {
        self.writes
            .lock()
            .expect("tx writes poisoned")
            .insert(key.bytes().to_vec(), TxWrite { value: None, ttl: 0, expire_time: 0 });
    }

    /// Peeks the write-set. None means the transaction has not touched the
    /// key; `Some(TxWrite { value: None, .. })` is a pending remove.
    pub fn peek(&self, key: &CacheKey) -> Option<TxWrite> {
        self.writes.lock().expect("tx writes poisoned").get(key.bytes()).cloned()
    }

    pub fn entry_ttl(&self, key: &CacheKey) -> Option<i64> {
        self.peek(key).map(|w| w.ttl)
    }

    pub fn entry_expire_time(&self, key: &CacheKey) -> Option<i64> {
        self.peek(key).map(|w| w.expire_time)
    }
}
