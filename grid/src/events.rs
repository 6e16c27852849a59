//! Cache events.
//!
//! The entry cell emits one event per committed mutation, inside the entry
//! lock, so events for a key observe the same total order as the mutations
//! that caused them. The bus decides per type whether an event is recorded
//! at all; the cell checks before building the record.

use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::value::{CacheKey, CacheValue};
use crate::version::GridVersion;

/// Event types emitted by the entry cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Put,
    Removed,
    Read,
    Expired,
}

/// A cache event record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub partition: u32,
    pub key: CacheKey,
    /// Id of the transaction that caused the event, if any.
    pub tx_id: Option<u64>,
    pub version: GridVersion,
    pub kind: EventType,
    pub new_value: Option<CacheValue>,
    pub has_new: bool,
    pub old_value: Option<CacheValue>,
    pub has_old: bool,
    pub subject_id: Option<u64>,
    /// Tag of the transform closure that caused the event, for invoke
    /// operations.
    pub transform_tag: Option<String>,
    pub task_name: Option<String>,
}

/// The event bus consumed by the entry cell. Externally thread-safe and
/// callable under the entry lock.
pub trait EventBus: Send + Sync {
    /// Whether events of this type are recorded. The cell skips building
    /// the record when not.
    fn is_recordable(&self, kind: EventType) -> bool;

    fn add_event(&self, event: CacheEvent);
}

/// Discards all events.
pub struct NoopEvents;

impl EventBus for NoopEvents {
    fn is_recordable(&self, _kind: EventType) -> bool {
        false
    }

    fn add_event(&self, _event: CacheEvent) {}
}

/// Records events in memory, in emission order.
pub struct RecordingEvents {
    events: Mutex<Vec<CacheEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self { events: Mutex::new(Vec::new()) }
    }

    /// All recorded events, in order.
    pub fn all(&self) -> Vec<CacheEvent> {
        self.events.lock().expect("event log poisoned").clone()
    }

    /// Recorded events of one type, in order.
    pub fn of_kind(&self, kind: EventType) -> Vec<CacheEvent> {
        self.all().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.of_kind(kind).len()
    }

    /// Drains and returns all recorded events.
    pub fn take(&self) -> Vec<CacheEvent> {
        std::mem::take(&mut *self.events.lock().expect("event log poisoned"))
    }
}

impl Default for RecordingEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for RecordingEvents {
    fn is_recordable(&self, _kind: EventType) -> bool {
        true
    }

    fn add_event(&self, event: CacheEvent) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}
