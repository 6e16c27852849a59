//! End-to-end scenarios for the entry cell: the full read/write/remove
//! lifecycle against wired collaborators, including the concurrent cases.

use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;

use grid::clock::ManualClock;
use grid::context::{CacheConfig, CacheContext, MemoryMode};
use grid::entry::ops::{AtomicUpdateRequest, GetRequest, SetRequest, WriteOp};
use grid::entry::GridEntry;
use grid::error::CResult;
use grid::events::{EventType, RecordingEvents};
use grid::offheap::ArenaAllocator;
use grid::store::MemStore;
use grid::swap::device::FileSwap;
use grid::value::{CacheKey, CacheValue};

fn key(s: &str) -> CacheKey {
    CacheKey::new(s.as_bytes().to_vec())
}

fn val(s: &str) -> CacheValue {
    CacheValue::from_bytes(s.as_bytes().to_vec())
}

struct Rig {
    ctx: Arc<CacheContext>,
    clock: Arc<ManualClock>,
    events: Arc<RecordingEvents>,
    store: Arc<MemStore>,
}

fn rig(cfg: CacheConfig) -> Rig {
    let clock = Arc::new(ManualClock::new(1_000));
    let events = Arc::new(RecordingEvents::new());
    let store = Arc::new(MemStore::new());
    let ctx = Arc::new(
        CacheContext::new(cfg)
            .with_clock(clock.clone())
            .with_events(events.clone())
            .with_store(store.clone()),
    );
    Rig { ctx, clock, events, store }
}

/// Scenario: fresh put then get. The version advances exactly once, the
/// returned value matches, and exactly one PUT and one READ fire.
#[test]
fn fresh_put_then_get() -> CResult<()> {
    let r = rig(CacheConfig::default());
    let entry = GridEntry::new(r.ctx.clone(), key("A"), None, 0)?;
    let ver0 = entry.version()?;

    entry.inner_set(SetRequest::new(val("1")))?;
    let ver1 = entry.version()?;
    assert!(ver1 > ver0);

    assert_eq!(entry.inner_get(GetRequest::default())?, Some(val("1")));
    assert_eq!(entry.version()?, ver1);

    assert_eq!(r.events.count(EventType::Put), 1);
    assert_eq!(r.events.count(EventType::Read), 1);
    Ok(())
}

/// Scenario: a read of an expired value returns nothing, clears the slot,
/// and emits exactly one EXPIRED event carrying the prior value — no READ.
#[test]
fn expired_on_read_emits_expired_once() -> CResult<()> {
    let r = rig(CacheConfig::default());
    let entry = GridEntry::new(r.ctx.clone(), key("A"), Some(val("x")), 1)?;

    r.clock.advance(2);
    assert_eq!(entry.inner_get(GetRequest::default())?, None);
    assert!(!entry.has_value()?);

    let expired = r.events.of_kind(EventType::Expired);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].old_value, Some(val("x")));
    assert_eq!(r.events.count(EventType::Read), 0);
    Ok(())
}

/// Scenario: two threads read through a fresh entry. Each may observe the
/// store, but only the thread whose start version survives commits; the
/// loser discards. Both observe the loaded value.
#[test]
fn read_through_with_concurrent_readers() -> CResult<()> {
    let r = rig(CacheConfig::default());
    r.store.seed(&key("A"), val("s"));
    let entry = Arc::new(GridEntry::new(r.ctx.clone(), key("A"), None, 0)?);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let entry = entry.clone();
        handles.push(thread::spawn(move || {
            entry.inner_get(GetRequest { read_through: true, ..GetRequest::default() })
        }));
    }
    for handle in handles {
        let got = handle.join().expect("reader panicked")?;
        assert_eq!(got, Some(val("s")));
    }

    assert_eq!(entry.raw_get()?, Some(val("s")));
    let loads = r.store.loads();
    assert!((1..=2).contains(&loads), "observed {} store loads", loads);

    // Read loads record as READ, never PUT.
    assert_eq!(r.events.count(EventType::Put), 0);
    assert!(r.events.count(EventType::Read) >= 1);
    Ok(())
}

/// Scenario: concurrent atomic updates carrying an equal version are both
/// ignored, but a write-through primary still repairs the store.
#[test]
fn equal_version_updates_are_idempotent_with_store_repair() -> CResult<()> {
    let r = rig(CacheConfig::default());
    let entry = Arc::new(GridEntry::new(r.ctx.clone(), key("A"), None, 0)?);
    entry.inner_set(SetRequest::new(val("v")))?;
    let cur = entry.version()?;
    let puts_before = r.store.puts();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let entry = entry.clone();
        let dup_ver = cur.clone();
        handles.push(thread::spawn(move || {
            entry.inner_update(AtomicUpdateRequest {
                ver_check: true,
                primary: true,
                ..AtomicUpdateRequest::new(dup_ver, WriteOp::Update(val("dup")))
            })
        }));
    }
    for handle in handles {
        let res = handle.join().expect("updater panicked")?;
        assert!(!res.success);
        assert!(!res.committed);
    }

    assert_eq!(entry.raw_get()?, Some(val("v")));
    assert!(r.store.puts() >= puts_before + 1, "the store saw at least one repair put");
    assert_eq!(r.store.get(&key("A")), Some(val("v")));
    Ok(())
}

/// Concurrent writers on one key serialize on the entry mutex: every write
/// commits, every commit emits exactly one PUT, and the version is strictly
/// monotonic across the whole run.
#[test]
fn concurrent_writers_serialize() -> CResult<()> {
    const WRITERS: usize = 8;
    const ROUNDS: usize = 10;

    let r = rig(CacheConfig::default());
    let entry = Arc::new(GridEntry::new(r.ctx.clone(), key("A"), None, 0)?);

    let mut handles = Vec::new();
    for w in 0..WRITERS {
        let entry = entry.clone();
        handles.push(thread::spawn(move || -> CResult<()> {
            for round in 0..ROUNDS {
                let value = format!("{}-{}", w, round);
                entry.inner_set(SetRequest::new(CacheValue::from_bytes(value.into_bytes())))?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    let puts = r.events.of_kind(EventType::Put);
    assert_eq!(puts.len(), WRITERS * ROUNDS);

    // Event emission order matches commit order: versions are strictly
    // increasing across the PUT stream.
    for pair in puts.windows(2) {
        assert!(pair[1].version > pair[0].version);
    }

    assert_eq!(r.ctx.metrics().snapshot().writes, (WRITERS * ROUNDS) as u64);
    assert!(entry.has_value()?);
    Ok(())
}

/// The file-backed swap device carries entry state across an evict/promote
/// cycle with the version preserved.
#[test]
fn file_swap_round_trip() -> CResult<()> {
    let dir = tempdir::TempDir::new("grid-swap")?;
    let swap = Arc::new(FileSwap::new(dir.path().join("swapdb"))?);
    let clock = Arc::new(ManualClock::new(1_000));
    let ctx = Arc::new(
        CacheContext::new(CacheConfig { swap_enabled: true, ..CacheConfig::default() })
            .with_clock(clock)
            .with_swap(swap.clone()),
    );

    let entry = GridEntry::new(ctx.clone(), key("A"), None, 0)?;
    entry.inner_set(SetRequest::new(val("spilled")))?;
    let ver = entry.version()?;

    entry.swap()?;
    assert_eq!(swap.len(), 1);

    // The map drops the entry and re-creates it on next touch; unswap
    // promotes the spilled state back.
    let fresh = GridEntry::new(ctx, key("A"), None, 0)?;
    assert_eq!(fresh.unswap(false, true)?, Some(val("spilled")));
    assert_eq!(fresh.version()?, ver);
    assert!(swap.is_empty());
    Ok(())
}

/// Off-heap values mode: the heap slot stays empty, reads rehydrate from
/// the allocator, and the set/get round trip holds.
#[test]
fn offheap_mode_round_trip() -> CResult<()> {
    let alloc = Arc::new(ArenaAllocator::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let events = Arc::new(RecordingEvents::new());
    let ctx = Arc::new(
        CacheContext::new(CacheConfig {
            memory_mode: MemoryMode::OffHeapValues,
            ..CacheConfig::default()
        })
        .with_clock(clock)
        .with_events(events.clone())
        .with_offheap(alloc.clone()),
    );

    let entry = GridEntry::new(ctx, key("A"), None, 0)?;
    entry.inner_set(SetRequest::new(val("native")))?;
    assert_eq!(alloc.len(), 1);

    assert_eq!(entry.inner_get(GetRequest::default())?, Some(val("native")));
    assert_eq!(events.count(EventType::Put), 1);
    assert_eq!(events.count(EventType::Read), 1);

    entry.inner_set(SetRequest::new(val("replaced")))?;
    assert_eq!(alloc.len(), 1, "the old allocation was released");
    assert_eq!(entry.inner_get(GetRequest::default())?, Some(val("replaced")));
    Ok(())
}

/// Randomized cross-check: a long random op sequence against a known-good
/// model of one key. Removals obsolete the entry, so the harness
/// re-fetches like the owning map would.
#[test]
fn random_ops_match_model() -> CResult<()> {
    use rand::{Rng, SeedableRng};

    const NUM_OPS: usize = 500;

    let seed: u64 = rand::thread_rng().gen();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    println!("seed = {}", seed);

    let r = rig(CacheConfig::default());
    let mut entry = GridEntry::new(r.ctx.clone(), key("A"), None, 0)?;
    let mut model: Option<Vec<u8>> = None;

    for _ in 0..NUM_OPS {
        match rng.gen_range(0..3) {
            0 => {
                let mut value = vec![0u8; rng.gen_range(1..=16)];
                rng.fill(&mut value[..]);
                entry.inner_set(SetRequest::new(CacheValue::from_bytes(value.clone())))?;
                model = Some(value);
            }
            1 => {
                entry.inner_remove(grid::entry::ops::RemoveRequest::default())?;
                model = None;
                // The remove obsoleted the entry; re-fetch.
                entry = GridEntry::new(r.ctx.clone(), key("A"), None, 0)?;
            }
            _ => {
                let got = entry.inner_get(GetRequest {
                    read_through: false,
                    ..GetRequest::default()
                })?;
                let expect = model.clone().map(CacheValue::from_bytes);
                assert_eq!(got, expect, "seed {}", seed);
            }
        }
    }

    Ok(())
}
