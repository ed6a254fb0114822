//! Commit validation.
//!
//! A transaction commits unless some transaction that committed inside its conflict window
//! `(begin_ts, commit_ts)` wrote an object it also wrote. Validation first seals every
//! uninitialized timestamp in the window, so no new commit can appear there afterwards, and
//! decides any still undecided transaction in the window before looking at it. Deciding is
//! deterministic, so any number of threads may validate the same transaction and they all reach
//! the same decision.
//!
//! Logs in the window cannot be collected while the validated transaction is undecided: the apply
//! pass never moves past a begin entry whose commit is still validating, and log GC never moves
//! past the apply pass. The caller keeps the validated transaction's begin timestamp protected,
//! and a helper protects the begin timestamp of every transaction it helps, so no metadata in a
//! window being scanned is truncated.

use crate::txn::log::{LogHandle, TxnLog, TxnLogs};
use crate::txn::metadata::TxnMetadata;
use crate::txn::safe_ts::SafeTsSlot;
use crate::txn::timestamp::Timestamp;

/// Decide the transaction registered at `commit_ts` and return the decision, whoever made it.
///
/// The begin timestamp of the transaction must be protected through `slot` (or some other
/// worker's slot) until this returns.
pub fn decide_txn(
    metadata: &TxnMetadata,
    logs: &TxnLogs,
    slot: &SafeTsSlot,
    commit_ts: Timestamp,
) -> bool {
    let committed = validate_txn(metadata, logs, slot, commit_ts);
    if metadata.update_txn_decision(commit_ts, committed) {
        trace!(
            "Decided txn {}: {}",
            commit_ts,
            if committed { "committed" } else { "aborted" }
        );
    }
    metadata.is_txn_committed(commit_ts)
}

/// Does the transaction registered at `commit_ts` commit?
pub fn validate_txn(
    metadata: &TxnMetadata,
    logs: &TxnLogs,
    slot: &SafeTsSlot,
    commit_ts: Timestamp,
) -> bool {
    let entry = metadata.get(commit_ts);
    debug_assert!(entry.is_commit_ts_entry(), "{} is not a commit: {:?}", commit_ts, entry);
    if entry.is_decided() {
        return entry.is_committed();
    }
    let begin_ts = entry.timestamp();
    let Some(write_set) = read_log(logs, entry.log_handle(), begin_ts) else {
        return decided_elsewhere(metadata, commit_ts);
    };

    for ts in begin_ts.range_after(commit_ts.prev()) {
        if metadata.is_txn_decided(commit_ts) {
            return metadata.is_txn_committed(commit_ts);
        }
        if metadata.seal_uninitialized_ts(ts) {
            continue;
        }
        let mut other = metadata.get(ts);
        if !other.is_commit_ts_entry() {
            continue;
        }
        if other.is_validating() {
            help_decide_txn(metadata, logs, slot, ts, other.timestamp());
            other = metadata.get(ts);
        }
        if !other.is_committed() {
            continue;
        }
        let conflict = logs
            .with_log(other.log_handle(), |log| {
                (log.begin_ts == other.timestamp()).then(|| write_set.conflicts_with(log))
            })
            .flatten();
        match conflict {
            Some(true) => {
                debug!("Txn {} conflicts with txn {}", commit_ts, ts);
                return false;
            }
            Some(false) => {}
            None => return decided_elsewhere(metadata, commit_ts),
        }
    }
    true
}

/// Decide another transaction, keeping its window `(begin_ts, commit_ts)` safe from truncation
/// while it is scanned.
fn help_decide_txn(
    metadata: &TxnMetadata,
    logs: &TxnLogs,
    slot: &SafeTsSlot,
    commit_ts: Timestamp,
    begin_ts: Timestamp,
) {
    match slot.protect(begin_ts) {
        Ok(_guard) => {
            decide_txn(metadata, logs, slot, commit_ts);
        }
        Err(e) => {
            // Truncation only passes a begin timestamp once its commit is decided.
            debug_assert!(
                metadata.is_txn_decided(commit_ts),
                "Undecided txn {} behind ceiling {}",
                commit_ts,
                e.ceiling
            );
            trace!("Txn {} was decided before it could be helped", commit_ts);
        }
    }
}

/// A copy of the log behind `handle`, if it still belongs to the transaction that began at
/// `begin_ts`.
fn read_log(logs: &TxnLogs, handle: LogHandle, begin_ts: Timestamp) -> Option<TxnLog> {
    logs.with_log(handle, |log| (log.begin_ts == begin_ts).then(|| log.clone()))
        .flatten()
}

// A log needed for validation is gone, so GC has passed the transaction, which can only happen
// once it is decided.
fn decided_elsewhere(metadata: &TxnMetadata, commit_ts: Timestamp) -> bool {
    let entry = metadata.get(commit_ts);
    debug_assert!(entry.is_decided(), "Log of undecided txn {} was collected", commit_ts);
    entry.is_committed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChunkOffset, ObjectOffset, SlotOffset};
    use crate::txn::entry::TxnMetadataEntry;
    use crate::txn::log::{LogOperation, LogRecord};
    use crate::txn::safe_ts::SafeTsRegistry;
    use crate::txn::watermark::{WatermarkKind, Watermarks};
    use std::sync::Arc;

    struct Fixture {
        metadata: TxnMetadata,
        logs: TxnLogs,
        registry: SafeTsRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                metadata: TxnMetadata::new(1 << 12).unwrap(),
                logs: TxnLogs::new(16),
                registry: SafeTsRegistry::new(4, Arc::new(Watermarks::new())),
            }
        }

        fn decide(&self, commit_ts: Timestamp) -> bool {
            let slot = self.registry.register().unwrap();
            decide_txn(&self.metadata, &self.logs, &slot, commit_ts)
        }

        fn begin(&self) -> (Timestamp, LogHandle) {
            let begin_ts = self.metadata.register_begin();
            (begin_ts, self.logs.allocate(begin_ts).unwrap())
        }

        fn write(&self, log: LogHandle, locator: u64) {
            self.logs.append(
                log,
                LogRecord {
                    locator,
                    old_offset: ObjectOffset::INVALID,
                    new_offset: ObjectOffset::new(ChunkOffset::new(1), SlotOffset::new(locator as u16)),
                    operation: LogOperation::Create,
                },
            );
        }

        fn submit(&self, begin_ts: Timestamp, log: LogHandle) -> Timestamp {
            let commit_ts = self.metadata.register_commit(begin_ts, log);
            self.metadata.set_active_txn_submitted(begin_ts, commit_ts);
            commit_ts
        }
    }

    #[test]
    fn disjoint_writes_commit() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        let (b2, l2) = f.begin();
        f.write(l1, 1);
        f.write(l2, 2);
        let c1 = f.submit(b1, l1);
        let c2 = f.submit(b2, l2);
        assert!(f.decide(c1));
        assert!(f.decide(c2));
    }

    #[test]
    fn later_writer_of_same_object_aborts() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        let (b2, l2) = f.begin();
        f.write(l1, 7);
        f.write(l2, 7);
        let c1 = f.submit(b1, l1);
        let c2 = f.submit(b2, l2);
        // c2 helps decide c1 first.
        assert!(!f.decide(c2));
        assert!(f.metadata.is_txn_committed(c1));
        assert!(f.metadata.is_txn_aborted(c2));
        // Deciding again returns the recorded decision.
        assert!(f.decide(c1));
        assert!(!f.decide(c2));
    }

    #[test]
    fn aborted_writer_does_not_conflict() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        let (b2, l2) = f.begin();
        let (b3, l3) = f.begin();
        f.write(l1, 1);
        f.write(l2, 1);
        f.write(l2, 2);
        f.write(l3, 2);
        let c1 = f.submit(b1, l1);
        let c2 = f.submit(b2, l2);
        let c3 = f.submit(b3, l3);
        // c2 aborts on c1, so it does not stop c3.
        assert!(f.decide(c3));
        assert!(f.metadata.is_txn_committed(c1));
        assert!(f.metadata.is_txn_aborted(c2));
    }

    #[test]
    fn commit_outside_window_does_not_conflict() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        f.write(l1, 1);
        let c1 = f.submit(b1, l1);
        assert!(f.decide(c1));
        let (b2, l2) = f.begin();
        f.write(l2, 1);
        let c2 = f.submit(b2, l2);
        assert!(f.decide(c2));
    }

    #[test]
    fn validation_seals_unregistered_timestamps() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        // Allocated by a registrant that has not installed its entry yet.
        let hole = f.metadata.allocate_unregistered_ts();
        let c1 = f.submit(b1, l1);
        assert!(f.metadata.is_uninitialized_ts(hole));
        assert!(f.decide(c1));
        assert!(f.metadata.is_sealed_ts(hole));
        // The registrant can no longer claim it.
        let begin = TxnMetadataEntry::new_begin_ts_entry();
        assert!(f.metadata.compare_exchange(hole, TxnMetadataEntry::uninitialized(), begin).is_err());
        assert!(f.metadata.register_begin() > c1);
    }

    #[test]
    fn helper_protects_helped_begin() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        let (b2, l2) = f.begin();
        f.write(l1, 1);
        f.write(l2, 2);
        let c1 = f.submit(b1, l1);
        let c2 = f.submit(b2, l2);
        let slot = f.registry.register().unwrap();
        slot.protect_unguarded(b2).unwrap();
        // While helping c1, the slot publishes b1, below its own begin timestamp.
        assert!(decide_txn(&f.metadata, &f.logs, &slot, c2));
        assert!(f.metadata.is_txn_committed(c1));
        assert_eq!(f.registry.min_published(), Some(b2));
        slot.unprotect(b2);
        assert_eq!(f.registry.min_published(), None);
    }

    #[test]
    fn unprotectable_decided_txn_is_not_helped() {
        let f = Fixture::new();
        let (b1, l1) = f.begin();
        let (b2, l2) = f.begin();
        f.write(l1, 1);
        f.write(l2, 1);
        let c1 = f.submit(b1, l1);
        let c2 = f.submit(b2, l2);
        let watermarks = f.registry.watermarks();
        assert!(f.decide(c1));
        // Truncation has moved past b1, so b1 can no longer be protected.
        for kind in [WatermarkKind::PreApply, WatermarkKind::PostApply, WatermarkKind::PostGc] {
            watermarks.advance(kind, b2);
        }
        assert_eq!(f.registry.advance_pre_truncate(), b2);
        let slot = f.registry.register().unwrap();
        assert!(slot.protect(b1).is_err());
        slot.protect_unguarded(b2).unwrap();
        // A helper that read c1 as validating just before the decision gives up and keeps it.
        help_decide_txn(&f.metadata, &f.logs, &slot, c1, b1);
        assert!(f.metadata.is_txn_committed(c1));
        assert_eq!(f.registry.min_published(), Some(b2));
        assert!(!decide_txn(&f.metadata, &f.logs, &slot, c2));
        slot.unprotect(b2);
    }
}
