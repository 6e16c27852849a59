//! The entry extras record.
//!
//! Extras carry everything an entry only sometimes has: user attributes,
//! the MVCC lock-candidate list, the obsolete version and TTL state. Most
//! entries have none of these, so the record is one nullable sum type with
//! one variant per non-empty subset and a dedicated shape for each single
//! field. Every change rebuilds the minimal shape for the fields that
//! remain, keeping per-entry memory at the documented footprint.

use std::collections::BTreeMap;

use crate::mvcc::CandidateList;
use crate::version::GridVersion;

/// User attributes attached to an entry.
pub type Attributes = BTreeMap<String, String>;

/// Heap cost of each extras field, as counted by `memory_size`.
const ATTRS_SIZE: usize = 8;
const MVCC_SIZE: usize = 8;
const OBSOLETE_SIZE: usize = 8;
const TTL_SIZE: usize = 16;

/// The extras record. Absent extras mean all-defaults: no attributes, no
/// candidates, not obsolete, eternal TTL.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryExtras {
    Attributes(Attributes),
    Mvcc(Box<CandidateList>),
    Obsolete(GridVersion),
    Ttl { ttl: i64, expire_time: i64 },
    Full {
        attrs: Option<Attributes>,
        mvcc: Option<Box<CandidateList>>,
        obsolete: Option<GridVersion>,
        ttl: i64,
        expire_time: i64,
    },
}

impl EntryExtras {
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            EntryExtras::Attributes(attrs) => Some(attrs),
            EntryExtras::Full { attrs, .. } => attrs.as_ref(),
            _ => None,
        }
    }

    pub fn mvcc(&self) -> Option<&CandidateList> {
        match self {
            EntryExtras::Mvcc(mvcc) => Some(mvcc),
            EntryExtras::Full { mvcc, .. } => mvcc.as_deref(),
            _ => None,
        }
    }

    pub fn obsolete_version(&self) -> Option<&GridVersion> {
        match self {
            EntryExtras::Obsolete(ver) => Some(ver),
            EntryExtras::Full { obsolete, .. } => obsolete.as_ref(),
            _ => None,
        }
    }

    /// TTL in milliseconds; zero is eternal.
    pub fn ttl(&self) -> i64 {
        match self {
            EntryExtras::Ttl { ttl, .. } => *ttl,
            EntryExtras::Full { ttl, .. } => *ttl,
            _ => 0,
        }
    }

    /// Absolute expire time; zero means never.
    pub fn expire_time(&self) -> i64 {
        match self {
            EntryExtras::Ttl { expire_time, .. } => *expire_time,
            EntryExtras::Full { expire_time, .. } => *expire_time,
            _ => 0,
        }
    }

    /// Heap cost of this shape, as counted by `memory_size`.
    pub fn size(&self) -> usize {
        match self {
            EntryExtras::Attributes(_) => ATTRS_SIZE,
            EntryExtras::Mvcc(_) => MVCC_SIZE,
            EntryExtras::Obsolete(_) => OBSOLETE_SIZE,
            EntryExtras::Ttl { .. } => TTL_SIZE,
            EntryExtras::Full { attrs, mvcc, obsolete, ttl, expire_time } => {
                let mut size = 0;
                if attrs.is_some() {
                    size += ATTRS_SIZE;
                }
                if mvcc.is_some() {
                    size += MVCC_SIZE;
                }
                if obsolete.is_some() {
                    size += OBSOLETE_SIZE;
                }
                if *ttl != 0 || *expire_time != 0 {
                    size += TTL_SIZE;
                }
                size
            }
        }
    }
}

/// The decomposed extras fields, used to apply a change and rebuild the
/// minimal shape.
#[derive(Debug, Default)]
pub struct ExtrasParts {
    pub attrs: Option<Attributes>,
    pub mvcc: Option<Box<CandidateList>>,
    pub obsolete: Option<GridVersion>,
    pub ttl: i64,
    pub expire_time: i64,
}

impl From<Option<EntryExtras>> for ExtrasParts {
    fn from(extras: Option<EntryExtras>) -> Self {
        match extras {
            None => Self::default(),
            Some(EntryExtras::Attributes(attrs)) => {
                Self { attrs: Some(attrs), ..Self::default() }
            }
            Some(EntryExtras::Mvcc(mvcc)) => Self { mvcc: Some(mvcc), ..Self::default() },
            Some(EntryExtras::Obsolete(ver)) => Self { obsolete: Some(ver), ..Self::default() },
            Some(EntryExtras::Ttl { ttl, expire_time }) => {
                Self { ttl, expire_time, ..Self::default() }
            }
            Some(EntryExtras::Full { attrs, mvcc, obsolete, ttl, expire_time }) => {
                Self { attrs, mvcc, obsolete, ttl, expire_time }
            }
        }
    }
}

/// Rebuilds the minimal shape carrying the given fields. Empty attribute
/// maps and empty candidate lists collapse to absent; a zero TTL with no
/// expire time collapses to absent. The TTL must be a storable duration,
/// never a policy sentinel.
pub fn rebuild(mut parts: ExtrasParts) -> Option<EntryExtras> {
    debug_assert!(parts.ttl >= 0, "TTL sentinels must not be stored");

    if parts.attrs.as_ref().map_or(false, |a| a.is_empty()) {
        parts.attrs = None;
    }
    if parts.mvcc.as_ref().map_or(false, |m| m.is_empty()) {
        parts.mvcc = None;
    }

    let has_ttl = parts.ttl != 0 || parts.expire_time != 0;
    let fields = parts.attrs.is_some() as usize
        + parts.mvcc.is_some() as usize
        + parts.obsolete.is_some() as usize
        + has_ttl as usize;

    match fields {
        0 => None,
        1 => Some(if let Some(attrs) = parts.attrs {
            EntryExtras::Attributes(attrs)
        } else if let Some(mvcc) = parts.mvcc {
            EntryExtras::Mvcc(mvcc)
        } else if let Some(ver) = parts.obsolete {
            EntryExtras::Obsolete(ver)
        } else {
            EntryExtras::Ttl { ttl: parts.ttl, expire_time: parts.expire_time }
        }),
        _ => Some(EntryExtras::Full {
            attrs: parts.attrs,
            mvcc: parts.mvcc,
            obsolete: parts.obsolete,
            ttl: parts.ttl,
            expire_time: parts.expire_time,
        }),
    }
}
