//! Grid entry versioning.
//!
//! Every successful mutation of an entry is stamped with a `GridVersion`, a
//! composite monotonic token minted by the node-local `VersionSource`. The
//! token carries the topology version at which it was minted, a node-local
//! monotonically increasing order, the minting node's order in the topology
//! and its data center id. An update replicated from another data center
//! additionally carries the originating (conflict) version nested inside.
//!
//! Versions are totally ordered by `atomic_cmp`, which compares topology
//! version, then order, then node order. The data center id and the nested
//! conflict version do not participate in the ordering.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as MemOrdering};

use serde_derive::{Deserialize, Serialize};

/// A composite monotonic version token.
///
/// Equality follows the comparator: two versions are equal iff they agree
/// on topology version, order and node order. The data center id and the
/// nested conflict version are payload, not identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridVersion {
    /// The topology version at which this version was minted.
    pub topology_version: u32,

    /// Node-local monotonic order. The primary ordering component.
    pub order: u64,

    /// Order of the minting node within the topology.
    pub node_order: u32,

    /// Data center id of the minting node.
    pub data_center_id: u8,

    /// The originating version, present when the update arrived through
    /// cross-data-center replication.
    pub conflict: Option<Box<GridVersion>>,
}

impl GridVersion {
    pub fn new(topology_version: u32, order: u64, node_order: u32, data_center_id: u8) -> Self {
        Self { topology_version, order, node_order, data_center_id, conflict: None }
    }

    /// Attaches the originating cross-data-center version.
    pub fn with_conflict(mut self, conflict: GridVersion) -> Self {
        self.conflict = Some(Box::new(conflict));
        self
    }

    /// The conflict version used for cross-data-center reconciliation: the
    /// nested originating version if present, otherwise this version itself.
    pub fn conflict_version(&self) -> &GridVersion {
        match &self.conflict {
            Some(v) => v,
            None => self,
        }
    }

    /// Drops any nested conflict version, leaving the regular token.
    pub fn without_conflict(mut self) -> Self {
        self.conflict = None;
        self
    }
}

impl std::fmt::Display for GridVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[topVer={}, order={}, nodeOrder={}, dc={}]",
            self.topology_version, self.order, self.node_order, self.data_center_id
        )
    }
}

/// The atomic version comparator: topology version, then order, then node
/// order. This is the single ordering used for version checks everywhere in
/// the grid, in particular by the atomic update protocol.
pub fn atomic_cmp(a: &GridVersion, b: &GridVersion) -> Ordering {
    a.topology_version
        .cmp(&b.topology_version)
        .then(a.order.cmp(&b.order))
        .then(a.node_order.cmp(&b.node_order))
}

impl PartialEq for GridVersion {
    fn eq(&self, other: &Self) -> bool {
        atomic_cmp(self, other) == Ordering::Equal
    }
}

impl Eq for GridVersion {}

impl std::hash::Hash for GridVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.topology_version.hash(state);
        self.order.hash(state);
        self.node_order.hash(state);
    }
}

impl PartialOrd for GridVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(atomic_cmp(self, other))
    }
}

impl Ord for GridVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        atomic_cmp(self, other)
    }
}

/// Node-local version source. Mints fresh versions for entry mutations and
/// initial loads, and keeps the order counter ahead of any version received
/// from remote nodes.
pub struct VersionSource {
    node_order: u32,
    data_center_id: u8,
    topology_version: AtomicU32,
    order: AtomicU64,
}

impl VersionSource {
    pub fn new(node_order: u32, data_center_id: u8) -> Self {
        Self {
            node_order,
            data_center_id,
            topology_version: AtomicU32::new(1),
            order: AtomicU64::new(0),
        }
    }

    /// Order of the local node within the topology. Entries compare their
    /// version's node order against this to decide whether they are new.
    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    pub fn data_center_id(&self) -> u8 {
        self.data_center_id
    }

    pub fn topology_version(&self) -> u32 {
        self.topology_version.load(MemOrdering::SeqCst)
    }

    /// Advances the topology version on a topology change. Versions minted
    /// afterwards order above all versions of earlier topologies.
    pub fn on_topology_change(&self, topology_version: u32) {
        self.topology_version.fetch_max(topology_version, MemOrdering::SeqCst);
    }

    /// Mints the next version.
    pub fn next(&self) -> GridVersion {
        let order = self.order.fetch_add(1, MemOrdering::SeqCst) + 1;
        GridVersion::new(self.topology_version(), order, self.node_order, self.data_center_id)
    }

    /// Mints the next version, first advancing the order counter past a
    /// version received from a remote node so the new version orders above
    /// it.
    pub fn next_from(&self, received: &GridVersion) -> GridVersion {
        self.order.fetch_max(received.order, MemOrdering::SeqCst);
        self.next()
    }

    /// Mints a version for a store load or reload. Load versions share the
    /// order stream of regular versions, so per-key monotonicity holds, and
    /// never advance the topology version.
    pub fn next_for_load(&self) -> GridVersion {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_ignores_data_center() {
        let a = GridVersion::new(1, 5, 1, 0);
        let b = GridVersion::new(1, 5, 1, 9);
        assert_eq!(atomic_cmp(&a, &b), Ordering::Equal);
        // Identity follows the comparator.
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_by_components() {
        let base = GridVersion::new(1, 5, 1, 0);
        assert!(GridVersion::new(2, 1, 1, 0) > base);
        assert!(GridVersion::new(1, 6, 1, 0) > base);
        assert!(GridVersion::new(1, 5, 2, 0) > base);
        assert!(GridVersion::new(1, 4, 9, 0) < base);
    }

    #[test]
    fn source_is_monotonic() {
        let src = VersionSource::new(1, 0);
        let mut prev = src.next();
        for _ in 0..100 {
            let next = src.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn next_from_orders_above_received() {
        let src = VersionSource::new(1, 0);
        let remote = GridVersion::new(1, 1000, 7, 1);
        let minted = src.next_from(&remote);
        assert!(minted > remote);
    }

    #[test]
    fn topology_change_orders_above_older_topologies() {
        let src = VersionSource::new(1, 0);
        let before = src.next();
        src.on_topology_change(2);
        let after = src.next();
        assert!(after > before);
        assert_eq!(after.topology_version, 2);
    }

    #[test]
    fn conflict_version_falls_back_to_self() {
        let plain = GridVersion::new(1, 1, 1, 0);
        assert_eq!(plain.conflict_version(), &plain);

        let origin = GridVersion::new(1, 9, 3, 2);
        let tagged = GridVersion::new(1, 2, 1, 0).with_conflict(origin.clone());
        assert_eq!(tagged.conflict_version(), &origin);
    }
}
