//! The transaction metadata table.
//!
//! The table is a fixed-capacity array of 64-bit words indexed by timestamp, reserved up front
//! with `MAP_NORESERVE` so that only the pages actually touched occupy memory. Every mutation is a
//! single compare-and-swap on one word. Pages wholly behind the truncation bound are decommitted
//! en masse and read back as uninitialized.

use crate::txn::entry::{TxnMetadataEntry, MAX_TIMESTAMP};
use crate::txn::log::LogHandle;
use crate::txn::timestamp::{Timestamp, TimestampCounter};
use crate::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD};
use crate::util::memory::MmapRegion;
use crate::util::retry::{retry, update_word};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

const ENTRIES_IN_PAGE: usize = BYTES_IN_PAGE / BYTES_IN_WORD;

pub struct TxnMetadata {
    region: MmapRegion,
    capacity: usize,
    counter: TimestampCounter,
    /// Entries below this timestamp have been decommitted. Always a multiple of a page worth of
    /// entries.
    truncated_up_to: AtomicU64,
}

impl TxnMetadata {
    /// Reserve a table for `capacity` timestamps.
    pub fn new(capacity: usize) -> io::Result<Self> {
        assert!((capacity as u64) <= MAX_TIMESTAMP + 1);
        let region = MmapRegion::reserve(capacity * BYTES_IN_WORD)?;
        debug!("Reserved metadata for {} timestamps", capacity);
        Ok(TxnMetadata {
            region,
            capacity,
            counter: TimestampCounter::new(),
            truncated_up_to: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    fn word(&self, ts: Timestamp) -> &AtomicU64 {
        let index = ts.as_usize();
        assert!(
            index < self.capacity,
            "Timestamp {} is beyond the metadata capacity {}",
            ts,
            self.capacity
        );
        // SAFETY: the index is within the mapping, the mapping is page-aligned and lives as long as
        // self, and every access to it goes through atomics.
        unsafe { &*(self.region.at(index * BYTES_IN_WORD).as_ptr() as *const AtomicU64) }
    }

    /// Read the entry of `ts`.
    #[inline]
    pub fn get(&self, ts: Timestamp) -> TxnMetadataEntry {
        TxnMetadataEntry::from_word(self.word(ts).load(Ordering::SeqCst))
    }

    /// One compare-and-swap on the entry of `ts`. Returns the actual entry on failure. Callers
    /// that want to retry re-derive the new entry from the returned value.
    #[inline]
    pub fn compare_exchange(
        &self,
        ts: Timestamp,
        expected: TxnMetadataEntry,
        new: TxnMetadataEntry,
    ) -> Result<TxnMetadataEntry, TxnMetadataEntry> {
        self.word(ts)
            .compare_exchange(expected.word(), new.word(), Ordering::SeqCst, Ordering::SeqCst)
            .map(TxnMetadataEntry::from_word)
            .map_err(TxnMetadataEntry::from_word)
    }

    /// Repeatedly apply `transition` to the current entry until it installs or declines.
    /// Returns the entry that was replaced, or the entry `transition` declined.
    fn update(
        &self,
        ts: Timestamp,
        mut transition: impl FnMut(TxnMetadataEntry) -> Option<TxnMetadataEntry>,
    ) -> Result<TxnMetadataEntry, TxnMetadataEntry> {
        let mut current = self.get(ts);
        retry(|| match transition(current) {
            None => Some(Err(current)),
            Some(new) => match self.compare_exchange(ts, current, new) {
                Ok(old) => Some(Ok(old)),
                Err(actual) => {
                    current = actual;
                    None
                }
            },
        })
    }

    /// The most recently allocated timestamp.
    pub fn last_allocated_ts(&self) -> Timestamp {
        self.counter.last_allocated()
    }

    /// Allocate a timestamp and install `entry` for it, skipping timestamps that were sealed
    /// between allocation and installation.
    fn register(&self, entry: TxnMetadataEntry) -> Timestamp {
        retry(|| {
            let ts = self.counter.allocate();
            match self.compare_exchange(ts, TxnMetadataEntry::uninitialized(), entry) {
                Ok(_) => Some(ts),
                Err(actual) => {
                    // Only a sealer can get there first.
                    debug_assert!(actual.is_sealed(), "Allocated {} already holds {:?}", ts, actual);
                    debug!("Timestamp {} was sealed before it was installed", ts);
                    None
                }
            }
        })
    }

    /// Allocate a timestamp without installing an entry, as a registrant preempted between the
    /// two steps would.
    #[cfg(test)]
    pub(crate) fn allocate_unregistered_ts(&self) -> Timestamp {
        self.counter.allocate()
    }

    /// Allocate a begin timestamp and mark it active.
    pub fn register_begin(&self) -> Timestamp {
        let ts = self.register(TxnMetadataEntry::new_begin_ts_entry());
        trace!("Registered begin {}", ts);
        ts
    }

    /// Allocate a commit timestamp linked to `begin_ts` and mark it validating.
    pub fn register_commit(&self, begin_ts: Timestamp, log_handle: LogHandle) -> Timestamp {
        debug_assert!(self.is_txn_active(begin_ts), "Txn {} is not active", begin_ts);
        let ts = self.register(TxnMetadataEntry::new_commit_ts_entry(begin_ts, log_handle));
        trace!("Registered commit {} for begin {} with {:?}", ts, begin_ts, log_handle);
        ts
    }

    /// `active -> submitted`, recording `commit_ts`. Only the transaction's owner calls this, and
    /// nothing else writes an active begin entry, so it must succeed.
    pub fn set_active_txn_submitted(&self, begin_ts: Timestamp, commit_ts: Timestamp) {
        let result = self.update(begin_ts, |e| e.is_active().then(|| e.set_submitted(commit_ts)));
        assert!(result.is_ok(), "Failed to submit txn {}: {:?}", begin_ts, result);
    }

    /// `active -> terminated`. Only the owner calls this, so it must succeed.
    pub fn set_active_txn_terminated(&self, begin_ts: Timestamp) {
        let result = self.update(begin_ts, |e| e.is_active().then(|| e.set_terminated()));
        assert!(result.is_ok(), "Failed to terminate txn {}: {:?}", begin_ts, result);
    }

    /// `validating -> committed | aborted`. Several validators may race to decide the same
    /// transaction; they all reach the same decision, and the losers see it already made.
    /// Returns `true` if this call made the decision.
    pub fn update_txn_decision(&self, commit_ts: Timestamp, committed: bool) -> bool {
        match self.update(commit_ts, |e| e.is_validating().then(|| e.set_decision(committed))) {
            Ok(_) => true,
            Err(actual) => {
                debug_assert!(
                    actual.is_decided() && actual.is_committed() == committed,
                    "Txn {} was decided differently: {:?}",
                    commit_ts,
                    actual
                );
                false
            }
        }
    }

    /// Mark a commit as durable. Idempotent; returns `true` unless the entry is not a commit entry.
    pub fn set_txn_durable(&self, commit_ts: Timestamp) -> bool {
        self.update(commit_ts, |e| {
            (e.is_commit_ts_entry() && !e.is_durable()).then(|| e.set_durable())
        })
        .map_or_else(|actual| actual.is_commit_ts_entry(), |_| true)
    }

    /// Mark a commit's log as fully collected. Idempotent; returns `true` unless the entry is not a
    /// decided commit entry.
    pub fn set_txn_gc_complete(&self, commit_ts: Timestamp) -> bool {
        self.update(commit_ts, |e| {
            (e.is_commit_ts_entry() && e.is_decided() && !e.is_gc_complete()).then(|| e.set_gc_complete())
        })
        .map_or_else(|actual| actual.is_decided() && actual.is_gc_complete(), |_| true)
    }

    /// Claim the log of a decided commit for GC. Exactly one caller wins; the others (and calls on
    /// an already-invalidated handle) get `false`.
    pub fn invalidate_txn_log_handle(&self, commit_ts: Timestamp) -> bool {
        self.update(commit_ts, |e| {
            (e.is_commit_ts_entry() && e.is_decided() && e.log_handle().is_valid())
                .then(|| e.invalidate_log_handle())
        })
        .is_ok()
    }

    /// Seal `ts` if it is uninitialized so that it can never be installed. Returns `true` if the
    /// entry is sealed after the call.
    pub fn seal_uninitialized_ts(&self, ts: Timestamp) -> bool {
        match self.compare_exchange(ts, TxnMetadataEntry::uninitialized(), TxnMetadataEntry::sealed()) {
            Ok(_) => {
                trace!("Sealed {}", ts);
                true
            }
            Err(actual) => actual.is_sealed(),
        }
    }

    pub fn is_uninitialized_ts(&self, ts: Timestamp) -> bool {
        self.get(ts).is_uninitialized()
    }

    pub fn is_sealed_ts(&self, ts: Timestamp) -> bool {
        self.get(ts).is_sealed()
    }

    pub fn is_begin_ts(&self, ts: Timestamp) -> bool {
        self.get(ts).is_begin_ts_entry()
    }

    pub fn is_commit_ts(&self, ts: Timestamp) -> bool {
        self.get(ts).is_commit_ts_entry()
    }

    pub fn is_txn_active(&self, begin_ts: Timestamp) -> bool {
        self.get(begin_ts).is_active()
    }

    pub fn is_txn_submitted(&self, begin_ts: Timestamp) -> bool {
        self.get(begin_ts).is_submitted()
    }

    pub fn is_txn_terminated(&self, begin_ts: Timestamp) -> bool {
        self.get(begin_ts).is_terminated()
    }

    pub fn is_txn_validating(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_validating()
    }

    pub fn is_txn_decided(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_decided()
    }

    pub fn is_txn_committed(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_committed()
    }

    pub fn is_txn_aborted(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_aborted()
    }

    pub fn is_txn_durable(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_durable()
    }

    pub fn is_txn_gc_complete(&self, commit_ts: Timestamp) -> bool {
        self.get(commit_ts).is_gc_complete()
    }

    /// The begin timestamp linked from a commit entry.
    pub fn get_begin_ts(&self, commit_ts: Timestamp) -> Timestamp {
        let entry = self.get(commit_ts);
        debug_assert!(entry.is_commit_ts_entry(), "{} is not a commit: {:?}", commit_ts, entry);
        entry.timestamp()
    }

    /// The commit timestamp linked from a begin entry; `INVALID` until submitted.
    pub fn get_commit_ts(&self, begin_ts: Timestamp) -> Timestamp {
        let entry = self.get(begin_ts);
        debug_assert!(entry.is_begin_ts_entry(), "{} is not a begin: {:?}", begin_ts, entry);
        entry.timestamp()
    }

    pub fn get_log_handle(&self, commit_ts: Timestamp) -> LogHandle {
        let entry = self.get(commit_ts);
        debug_assert!(entry.is_commit_ts_entry(), "{} is not a commit: {:?}", commit_ts, entry);
        entry.log_handle()
    }

    pub fn status_to_str(&self, ts: Timestamp) -> &'static str {
        self.get(ts).status_to_str()
    }

    /// A one-line description of the entry of `ts` and, if linked, of its partner entry.
    pub fn dump_txn_metadata(&self, ts: Timestamp) -> String {
        let entry = self.get(ts);
        let linked = entry.timestamp();
        if (entry.is_begin_ts_entry() || entry.is_commit_ts_entry()) && linked.is_valid() {
            format!("{}: {:?} -> {}: {:?}", ts, entry, linked, self.get(linked))
        } else {
            format!("{}: {:?}", ts, entry)
        }
    }

    /// Entries below this timestamp have been reclaimed and must not be read.
    pub fn truncated_up_to(&self) -> Timestamp {
        Timestamp::new(self.truncated_up_to.load(Ordering::SeqCst))
    }

    /// Decommit every page whose entries are all strictly below `bound`. Returns the new
    /// truncation point. Callers guarantee nobody reads entries below `bound` any more.
    pub fn truncate(&self, bound: Timestamp) -> io::Result<Timestamp> {
        let target = (bound.as_usize().min(self.capacity) / ENTRIES_IN_PAGE * ENTRIES_IN_PAGE) as u64;
        let from = match update_word(&self.truncated_up_to, |current| {
            (target > current).then_some(target)
        }) {
            Ok(from) => from,
            Err(current) => return Ok(Timestamp::new(current)),
        };
        let offset = from as usize * BYTES_IN_WORD;
        let size = (target - from) as usize * BYTES_IN_WORD;
        self.region.decommit(offset, size)?;
        debug!("Truncated metadata entries [{}, {})", from, target);
        Ok(Timestamp::new(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TxnMetadata {
        TxnMetadata::new(1 << 16).unwrap()
    }

    #[test]
    fn register_begin_and_commit() {
        let table = table();
        let begin = table.register_begin();
        assert_eq!(begin, Timestamp::new(1));
        assert!(table.is_begin_ts(begin));
        assert!(table.is_txn_active(begin));
        assert_eq!(table.get_commit_ts(begin), Timestamp::INVALID);

        let commit = table.register_commit(begin, LogHandle::new(4));
        assert_eq!(commit, Timestamp::new(2));
        assert!(table.is_commit_ts(commit));
        assert!(table.is_txn_validating(commit));
        assert_eq!(table.get_begin_ts(commit), begin);
        assert_eq!(table.get_log_handle(commit), LogHandle::new(4));

        table.set_active_txn_submitted(begin, commit);
        assert!(table.is_txn_submitted(begin));
        assert_eq!(table.get_commit_ts(begin), commit);

        assert!(table.update_txn_decision(commit, true));
        assert!(table.is_txn_committed(commit));
        assert!(table.is_txn_decided(commit));
        assert_eq!(table.status_to_str(commit), "committed");
        // The decision is made once.
        assert!(!table.update_txn_decision(commit, true));
    }

    #[test]
    fn terminate() {
        let table = table();
        let begin = table.register_begin();
        table.set_active_txn_terminated(begin);
        assert!(table.is_txn_terminated(begin));
        assert!(!table.is_txn_active(begin));
    }

    #[test]
    fn registration_skips_sealed_timestamps() {
        let table = table();
        // Timestamps 1 and 2 are sealed before anyone installs them.
        assert!(table.seal_uninitialized_ts(Timestamp::new(1)));
        assert!(table.seal_uninitialized_ts(Timestamp::new(2)));
        let begin = table.register_begin();
        assert_eq!(begin, Timestamp::new(3));
        assert!(table.is_sealed_ts(Timestamp::new(1)));
        // Sealing is idempotent but never overwrites a live entry.
        assert!(table.seal_uninitialized_ts(Timestamp::new(1)));
        assert!(!table.seal_uninitialized_ts(begin));
        assert!(table.is_txn_active(begin));
    }

    #[test]
    fn flag_transitions_are_idempotent() {
        let table = table();
        let begin = table.register_begin();
        let commit = table.register_commit(begin, LogHandle::new(1));
        assert!(table.set_txn_durable(commit));
        assert!(table.set_txn_durable(commit));
        assert!(table.is_txn_durable(commit));
        // GC completion needs a decision.
        assert!(!table.set_txn_gc_complete(commit));
        table.update_txn_decision(commit, false);
        assert!(table.set_txn_gc_complete(commit));
        assert!(table.set_txn_gc_complete(commit));
        assert!(table.is_txn_gc_complete(commit));
        assert!(table.is_txn_durable(commit));
        assert!(table.is_txn_aborted(commit));
        // Flags do not apply to begin entries.
        assert!(!table.set_txn_durable(begin));
    }

    #[test]
    fn decision_survives_concurrent_flag_updates() {
        let table = table();
        let begin = table.register_begin();
        let commit = table.register_commit(begin, LogHandle::new(1));
        crossbeam::scope(|s| {
            s.spawn(|_| assert!(table.set_txn_durable(commit)));
            s.spawn(|_| assert!(table.update_txn_decision(commit, true)));
        })
        .unwrap();
        assert!(table.is_txn_committed(commit));
        assert!(table.is_txn_durable(commit));
    }

    #[test]
    fn invalidate_log_handle_once() {
        let table = table();
        let begin = table.register_begin();
        let commit = table.register_commit(begin, LogHandle::new(2));
        // Undecided logs cannot be claimed.
        assert!(!table.invalidate_txn_log_handle(commit));
        table.update_txn_decision(commit, true);
        let winners: usize = crossbeam::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|_| table.invalidate_txn_log_handle(commit))).collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        })
        .unwrap();
        assert_eq!(winners, 1);
        assert_eq!(table.get_log_handle(commit), LogHandle::INVALIDATED);
    }

    #[test]
    fn concurrent_registration_is_unique() {
        let table = table();
        let mut all: Vec<Timestamp> = crossbeam::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|_| (0..500).map(|_| table.register_begin()).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        })
        .unwrap();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 2000);
        assert!(all.iter().all(|ts| table.is_txn_active(*ts)));
    }

    #[test]
    fn truncate_by_page() {
        let table = table();
        for _ in 0..ENTRIES_IN_PAGE * 2 + 10 {
            let begin = table.register_begin();
            table.set_active_txn_terminated(begin);
        }
        // Not a whole page yet.
        assert_eq!(table.truncate(Timestamp::new(10)).unwrap(), Timestamp::INVALID);
        let bound = Timestamp::new(ENTRIES_IN_PAGE as u64 + 5);
        assert_eq!(table.truncate(bound).unwrap(), Timestamp::new(ENTRIES_IN_PAGE as u64));
        assert_eq!(table.truncated_up_to(), Timestamp::new(ENTRIES_IN_PAGE as u64));
        // Decommitted entries read as uninitialized; the rest are untouched.
        assert!(table.is_uninitialized_ts(Timestamp::new(1)));
        assert!(table.is_txn_terminated(Timestamp::new(ENTRIES_IN_PAGE as u64)));
        // Truncation never moves backward.
        assert_eq!(table.truncate(Timestamp::new(3)).unwrap(), Timestamp::new(ENTRIES_IN_PAGE as u64));
    }

    #[test]
    fn dump() {
        let table = table();
        let begin = table.register_begin();
        let commit = table.register_commit(begin, LogHandle::new(1));
        table.set_active_txn_submitted(begin, commit);
        let dump = table.dump_txn_metadata(begin);
        assert!(dump.contains("submitted"));
        assert!(dump.contains("validating"));
    }
}
