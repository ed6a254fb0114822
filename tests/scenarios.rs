//! End-to-end checks of watermark advancement, chunk reclamation, slot allocation and safe
//! timestamps through the public API.

use std::sync::{Arc, Barrier};
use txcore::memory::{ChunkManager, ChunkState, MemoryManager, SlotOffset};
use txcore::txn::safe_ts::SafeTsRegistry;
use txcore::txn::watermark::{is_well_ordered, Watermarks};
use txcore::{EngineBuilder, Timestamp, WatermarkKind};

#[test]
fn durable_commit_is_collected() {
    let mut builder = EngineBuilder::new();
    assert!(builder.set_options_bulk_by_str(
        "max_workers=2 txn_metadata_capacity=4096 chunk_count=4 max_txn_logs=4 persistence=true"
    ));
    let engine = builder.build().unwrap();
    let mut session = engine.open_session().unwrap();

    let b1 = session.begin_transaction().unwrap();
    let c1 = session.commit_transaction().unwrap();
    let log = engine.metadata().get_log_handle(c1);
    assert!(log.is_valid());

    session.perform_maintenance();
    let watermarks = engine.watermarks();
    assert_eq!(watermarks.get(WatermarkKind::PreApply), c1);
    assert_eq!(watermarks.get(WatermarkKind::PostApply), c1);
    // Not durable yet: the log is kept.
    assert_eq!(watermarks.get(WatermarkKind::PostGc), b1);
    assert!(engine.txn_logs().is_allocated(log));

    assert!(engine.mark_txn_durable(c1));
    session.perform_maintenance();
    assert_eq!(watermarks.get(WatermarkKind::PostGc), c1);
    assert!(engine.metadata().is_txn_gc_complete(c1));
    assert!(!engine.txn_logs().is_allocated(log));
    assert!(is_well_ordered(&watermarks.snapshot()));
}

#[test]
fn racing_chunk_reclamation_has_one_winner() {
    let memory = MemoryManager::new(4).unwrap();
    for _ in 0..100 {
        let chunk = memory.allocate_chunk().unwrap();
        let version = memory.chunk_state(chunk).version;
        let barrier = Barrier::new(2);
        let (retired, helped) = crossbeam::scope(|s| {
            let owner = s.spawn(|_| {
                let mut manager = ChunkManager::new(&memory);
                manager.initialize(chunk);
                barrier.wait();
                manager.retire_chunk()
            });
            let helper = s.spawn(|_| {
                barrier.wait();
                let mut reclaimed = 0;
                while memory.chunk_state(chunk).version == version {
                    if memory.try_deallocate_chunk(chunk, version) {
                        reclaimed += 1;
                    }
                }
                reclaimed
            });
            (owner.join().unwrap(), helper.join().unwrap())
        })
        .unwrap();
        assert_eq!(retired as usize + helped, 1);
        let state = memory.chunk_state(chunk);
        assert_eq!(state.state, ChunkState::Empty);
        assert_eq!(state.version, version.next());
    }
    assert_eq!(memory.allocated_chunk_count(), 0);
}

#[test]
fn small_object_lives_until_deallocated() {
    let memory = MemoryManager::new(4).unwrap();
    let mut manager = ChunkManager::new(&memory);
    let chunk = memory.allocate_chunk().unwrap();
    manager.initialize(chunk);
    let offset = manager.allocate(10).unwrap();
    assert_eq!(offset.chunk(), chunk);
    assert_eq!(offset.slot(), SlotOffset::new(0));
    assert_eq!(offset.as_u32(), (chunk.as_usize() as u32) << 16);
    assert!(memory.is_slot_allocated(offset));
    assert_eq!(manager.last_allocated_offset(), Some(offset));

    manager.deallocate(offset);
    assert!(!memory.is_slot_allocated(offset));
    assert!(manager.is_empty());
}

#[test]
fn reservation_holds_back_truncation() {
    let watermarks = Arc::new(Watermarks::new());
    let registry = SafeTsRegistry::new(4, watermarks.clone());
    let slot = registry.register().unwrap();
    let t = Timestamp::new(100);
    slot.reserve(t).unwrap();

    for step in 1..=1000 {
        let ts = Timestamp::new(t.as_u64() + step);
        for kind in [WatermarkKind::PreApply, WatermarkKind::PostApply, WatermarkKind::PostGc] {
            watermarks.advance(kind, ts);
        }
        assert!(registry.advance_pre_truncate() <= t);
    }
    assert_eq!(watermarks.get(WatermarkKind::PreTruncate), t);

    slot.release_safe_ts();
    assert_eq!(registry.advance_pre_truncate(), Timestamp::new(t.as_u64() + 1000));
    assert!(slot.reserve(t).is_err());
}
