//! Per-entry lock candidates.
//!
//! Each entry may carry a list of concurrent lock candidates: transactions
//! (local and remote) queued for ownership of the key. This is not a
//! multiversion history — the list exists so that obsoletion and removal
//! can tell whether the entry is still in use, and so the transaction
//! engine can query ownership. The list lives in the entry's extras record
//! and is mutated only under the entry lock.

use crate::version::GridVersion;

/// One queued lock candidate, identified by its lock version.
#[derive(Clone, Debug, PartialEq)]
pub struct LockCandidate {
    /// The candidate's lock version.
    pub ver: GridVersion,
    /// The node the candidate originates from.
    pub node_id: u64,
    /// The thread that requested the lock on the originating node.
    pub thread_id: u64,
    /// Whether the candidate is local to this node.
    pub local: bool,
    /// Whether the candidate currently owns the lock.
    pub owner: bool,
}

/// The per-entry candidate list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CandidateList {
    cands: Vec<LockCandidate>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_local(&mut self, ver: GridVersion, node_id: u64, thread_id: u64) {
        self.cands.push(LockCandidate { ver, node_id, thread_id, local: true, owner: false });
    }

    pub fn add_remote(&mut self, ver: GridVersion, node_id: u64, thread_id: u64) {
        self.cands.push(LockCandidate { ver, node_id, thread_id, local: false, owner: false });
    }

    /// Promotes the candidate with the given version to owner. Returns
    /// false if no such candidate exists.
    pub fn set_owner(&mut self, ver: &GridVersion) -> bool {
        let mut found = false;
        for cand in &mut self.cands {
            cand.owner = &cand.ver == ver;
            found |= cand.owner;
        }
        found
    }

    /// Removes the candidate with the given version. Returns whether one
    /// was removed.
    pub fn remove(&mut self, ver: &GridVersion) -> bool {
        let before = self.cands.len();
        self.cands.retain(|c| &c.ver != ver);
        self.cands.len() != before
    }

    pub fn len(&self) -> usize {
        self.cands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cands.is_empty()
    }

    /// Whether the list is empty once the given versions are ignored. Used
    /// by obsoletion: a candidate carrying the obsoleting version itself
    /// does not keep the entry alive.
    pub fn is_empty_excluding(&self, exclude: &[&GridVersion]) -> bool {
        self.cands.iter().all(|c| exclude.contains(&&c.ver))
    }

    pub fn has_candidate(&self, ver: &GridVersion) -> bool {
        self.candidate(ver).is_some()
    }

    pub fn candidate(&self, ver: &GridVersion) -> Option<&LockCandidate> {
        self.cands.iter().find(|c| &c.ver == ver)
    }

    /// The first local candidate queued by the given thread.
    pub fn local_candidate(&self, thread_id: u64) -> Option<&LockCandidate> {
        self.cands.iter().find(|c| c.local && c.thread_id == thread_id)
    }

    /// The first remote candidate queued by the given node and thread.
    pub fn remote_candidate(&self, node_id: u64, thread_id: u64) -> Option<&LockCandidate> {
        self.cands.iter().find(|c| !c.local && c.node_id == node_id && c.thread_id == thread_id)
    }

    /// The current owner, if any.
    pub fn any_owner(&self) -> Option<&LockCandidate> {
        self.cands.iter().find(|c| c.owner)
    }

    /// The current owner, if it is local.
    pub fn local_owner(&self) -> Option<&LockCandidate> {
        self.any_owner().filter(|c| c.local)
    }

    pub fn is_owned_by(&self, ver: &GridVersion) -> bool {
        self.any_owner().map_or(false, |c| &c.ver == ver)
    }

    pub fn is_locally_owned(&self, ver: &GridVersion) -> bool {
        self.local_owner().map_or(false, |c| &c.ver == ver)
    }

    pub fn is_locally_owned_by_thread(&self, ver: &GridVersion, thread_id: u64) -> bool {
        self.local_owner().map_or(false, |c| &c.ver == ver && c.thread_id == thread_id)
    }
}
