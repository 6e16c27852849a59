//! `grid` is the per-key entry machinery of an in-memory key/value data
//! grid. Every operation on a key — read, write, transform, remove,
//! invalidate, expire, evict, swap in or out, reconcile versions — is
//! mediated by one `GridEntry`: the per-key state machine that is at once
//! the lock, the value holder, the lock-candidate record, the TTL tracker,
//! the index-update site, the write-through sink, the swap/off-heap handle
//! and the event source.
//!
//! The surrounding cache wires a `CacheContext` once (store, swap device,
//! off-heap allocator, event bus, interceptor, conflict resolver, ...) and
//! shares it across entries; collaborators appear only through the narrow
//! traits the entry consumes.
//!
//! ## Getting started
//!
//! ```rust
//! use std::sync::Arc;
//! use grid::context::{CacheConfig, CacheContext};
//! use grid::entry::GridEntry;
//! use grid::entry::ops::{GetRequest, SetRequest};
//! use grid::error::Error;
//! use grid::value::{CacheKey, CacheValue};
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> Result<(), Error> {
//!     let ctx = Arc::new(CacheContext::new(CacheConfig::default()));
//!     let entry = GridEntry::new(ctx, CacheKey::new(b"answer".to_vec()), None, 0)?;
//!
//!     entry.inner_set(SetRequest::new(CacheValue::from_bytes(b"42".to_vec())))?;
//!
//!     let got = entry.inner_get(GetRequest::default())?;
//!     assert_eq!(got, Some(CacheValue::from_bytes(b"42".to_vec())));
//!
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod conflict;
pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod expiry;
pub mod mvcc;
pub mod offheap;
pub mod store;
pub mod swap;
pub mod tx;
pub mod value;
pub mod version;
