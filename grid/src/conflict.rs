//! Cross-data-center conflict resolution and replication.

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::value::{CacheKey, CacheValue};
use crate::version::GridVersion;

/// The replication origin of an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrType {
    /// Not a replicated update.
    None,
    /// The update was applied on the primary owner and is to be replicated.
    Primary,
    /// The update arrived on a backup owner.
    Backup,
    /// The update arrived through preloading/rebalancing.
    Preload,
}

impl DrType {
    pub fn is_dr(&self) -> bool {
        !matches!(self, DrType::None)
    }
}

/// What the resolver decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Keep the existing value; the incoming update is discarded.
    UseOld,
    /// Apply the incoming update as-is.
    UseNew,
    /// Apply the resolver's merged value instead of the incoming one.
    Merge,
}

/// The resolver's verdict plus the TTL/expire state the committed value
/// must take when the verdict is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictContext {
    pub outcome: ConflictOutcome,
    /// Present iff the outcome is `Merge`.
    pub merged_value: Option<CacheValue>,
    pub ttl: i64,
    pub expire_time: i64,
}

impl ConflictContext {
    pub fn use_old() -> Self {
        Self { outcome: ConflictOutcome::UseOld, merged_value: None, ttl: 0, expire_time: 0 }
    }

    pub fn use_new(ttl: i64, expire_time: i64) -> Self {
        Self { outcome: ConflictOutcome::UseNew, merged_value: None, ttl, expire_time }
    }

    pub fn merge(value: Option<CacheValue>, ttl: i64, expire_time: i64) -> Self {
        Self { outcome: ConflictOutcome::Merge, merged_value: value, ttl, expire_time }
    }

    pub fn is_use_old(&self) -> bool {
        self.outcome == ConflictOutcome::UseOld
    }

    pub fn is_use_new(&self) -> bool {
        self.outcome == ConflictOutcome::UseNew
    }

    pub fn is_merge(&self) -> bool {
        self.outcome == ConflictOutcome::Merge
    }
}

/// One side of a conflict, as presented to the resolver.
#[derive(Clone, Debug)]
pub struct ConflictView<'a> {
    pub key: &'a CacheKey,
    pub value: Option<&'a CacheValue>,
    pub version: &'a GridVersion,
    pub ttl: i64,
    pub expire_time: i64,
}

/// Resolves a conflict between the entry's current state and an incoming
/// replicated update.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        old: &ConflictView,
        new: &ConflictView,
        ver_check: bool,
    ) -> CResult<ConflictContext>;
}

/// The data-replication dispatcher. Called inside the entry lock after a
/// commit so replicated updates observe mutation order.
pub trait DrReplicator: Send + Sync {
    fn replicate(
        &self,
        key: &CacheKey,
        value: Option<&CacheValue>,
        ttl: i64,
        expire_time: i64,
        version: &GridVersion,
        dr_type: DrType,
    ) -> CResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes() {
        assert!(ConflictContext::use_old().is_use_old());
        assert!(ConflictContext::use_new(1, 2).is_use_new());
        let merged = ConflictContext::merge(Some(CacheValue::from_bytes(b"m".to_vec())), 1, 2);
        assert!(merged.is_merge());
        assert_eq!(merged.merged_value.unwrap().value_bytes().0, b"m");
    }

    #[test]
    fn dr_type() {
        assert!(!DrType::None.is_dr());
        assert!(DrType::Primary.is_dr());
        assert!(DrType::Preload.is_dr());
    }
}
