//! Expiry policies and TTL sentinels.
//!
//! TTLs are milliseconds. A TTL of zero means eternal and is represented by
//! the absence of a TTL record on the entry; the `TTL_ZERO` sentinel is a
//! policy outcome only and must never be stored — callers translate it into
//! an immediate expiry (minimum TTL with a past expire time) or a delete.

/// Eternal: the entry never expires.
pub const TTL_ETERNAL: i64 = 0;

/// Policy outcome: leave the current TTL untouched.
pub const TTL_NOT_CHANGED: i64 = -1;

/// Policy outcome: the entry expires immediately. Never stored.
pub const TTL_ZERO: i64 = -2;

/// The smallest storable TTL.
pub const TTL_MINIMUM: i64 = 1;

/// Per-operation expiry durations consulted by the operation engine. Each
/// method returns a TTL in milliseconds or one of the sentinels above.
pub trait ExpiryPolicy: Send + Sync {
    /// TTL for a newly created entry.
    fn for_create(&self) -> i64 {
        TTL_NOT_CHANGED
    }

    /// TTL for an updated entry.
    fn for_update(&self) -> i64 {
        TTL_NOT_CHANGED
    }

    /// TTL refresh applied when an entry is read.
    fn for_access(&self) -> i64 {
        TTL_NOT_CHANGED
    }
}

/// Fixed TTL applied on creation only.
pub struct CreatedExpiryPolicy {
    pub ttl: i64,
}

impl ExpiryPolicy for CreatedExpiryPolicy {
    fn for_create(&self) -> i64 {
        self.ttl
    }
}

/// Fixed TTL re-applied on every create, update and access.
pub struct TouchedExpiryPolicy {
    pub ttl: i64,
}

impl ExpiryPolicy for TouchedExpiryPolicy {
    fn for_create(&self) -> i64 {
        self.ttl
    }

    fn for_update(&self) -> i64 {
        self.ttl
    }

    fn for_access(&self) -> i64 {
        self.ttl
    }
}

/// Computes the absolute expire time for a TTL at `now`. Eternal TTLs have
/// no expire time, represented as zero.
pub fn expire_time(ttl: i64, now: i64) -> i64 {
    if ttl == TTL_ETERNAL {
        0
    } else {
        now.saturating_add(ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eternal_has_no_expire_time() {
        assert_eq!(expire_time(TTL_ETERNAL, 12345), 0);
    }

    #[test]
    fn expire_time_is_offset_from_now() {
        assert_eq!(expire_time(500, 1_000), 1_500);
    }

    #[test]
    fn policies() {
        let created = CreatedExpiryPolicy { ttl: 10 };
        assert_eq!(created.for_create(), 10);
        assert_eq!(created.for_update(), TTL_NOT_CHANGED);
        assert_eq!(created.for_access(), TTL_NOT_CHANGED);

        let touched = TouchedExpiryPolicy { ttl: 10 };
        assert_eq!(touched.for_access(), 10);
    }
}
