//! Benchmarks for the transaction lifecycle.

use criterion::Criterion;
use txcore::txn::metadata::TxnMetadata;
use txcore::{EngineBuilder, LogOperation, ObjectOffset};

pub fn bench(c: &mut Criterion) {
    c.bench_function("txn_register_begin", |b| {
        let metadata = TxnMetadata::new(1 << 30).unwrap();
        b.iter(|| metadata.register_begin())
    });

    let mut builder = EngineBuilder::new();
    assert!(builder.set_options_bulk_by_str("max_workers=2 txn_metadata_capacity=1073741824 chunk_count=64 max_txn_logs=1024 persistence=false"));
    let engine = builder.build().unwrap();
    let mut session = engine.open_session().unwrap();

    // Each transaction replaces the previous version of one object, so GC keeps memory flat.
    c.bench_function("txn_update_commit_with_maintenance", |b| {
        let mut current = ObjectOffset::INVALID;
        b.iter(|| {
            session.begin_transaction().unwrap();
            let offset = session.allocate_object(100).unwrap();
            session.record(1, current, offset, LogOperation::Update).unwrap();
            session.commit_transaction().unwrap();
            current = offset;
            session.perform_maintenance();
        })
    });
}
