//! Watermark-driven maintenance.
//!
//! Any worker may run maintenance at any time, and several may run it at once. Each pass scans
//! the timestamps behind one watermark, does its work, and advances the watermark. The passes
//! never block one another; a pass that finds a timestamp it cannot handle yet stops there and
//! leaves the rest to a later pass.

use crate::memory::MemoryManager;
use crate::txn::log::{LogHandle, SharedView, TxnLogs};
use crate::txn::metadata::TxnMetadata;
use crate::txn::safe_ts::{SafeTsRegistry, SafeTsSlot};
use crate::txn::timestamp::Timestamp;
use crate::txn::watermark::{WatermarkKind, Watermarks};

pub struct GcCoordinator<'a> {
    metadata: &'a TxnMetadata,
    registry: &'a SafeTsRegistry,
    logs: &'a TxnLogs,
    memory: &'a MemoryManager,
    view: &'a dyn SharedView,
    /// Hold back log GC of decided transactions until their decision is durable.
    persistence: bool,
    truncate_txn_table: bool,
}

impl<'a> GcCoordinator<'a> {
    pub fn new(
        metadata: &'a TxnMetadata,
        registry: &'a SafeTsRegistry,
        logs: &'a TxnLogs,
        memory: &'a MemoryManager,
        view: &'a dyn SharedView,
    ) -> Self {
        GcCoordinator {
            metadata,
            registry,
            logs,
            memory,
            view,
            persistence: false,
            truncate_txn_table: true,
        }
    }

    pub fn with_persistence(mut self, persistence: bool) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_truncation(mut self, truncate_txn_table: bool) -> Self {
        self.truncate_txn_table = truncate_txn_table;
        self
    }

    fn watermarks(&self) -> &Watermarks {
        self.registry.watermarks()
    }

    /// Run all four passes once, in order.
    pub fn perform_maintenance(&self, slot: &SafeTsSlot) {
        self.apply_txn_logs_to_shared_view(slot);
        self.gc_applied_txn_logs(slot);
        self.update_post_gc_watermark(slot);
        self.truncate_txn_table();
    }

    /// Apply committed logs to the shared view in commit order, moving `PreApply` and
    /// `PostApply` forward one timestamp at a time. Only the thread that moved `PreApply` onto a
    /// timestamp applies it, so logs are applied by one thread at a time.
    ///
    /// Stops at the first timestamp that is not settled: an undecided commit, an active
    /// transaction, or a submitted transaction whose commit is undecided.
    pub fn apply_txn_logs_to_shared_view(&self, slot: &SafeTsSlot) {
        let _guard = slot.protect_watermark(WatermarkKind::PreApply);
        let watermarks = self.watermarks();
        let start = watermarks.get(WatermarkKind::PreApply);
        let last_allocated = self.metadata.last_allocated_ts();

        for ts in start.range_after(last_allocated) {
            let mut entry = self.metadata.get(ts);
            if entry.is_uninitialized() {
                // Either sealed now, or installed by the registrant that got there first.
                self.metadata.seal_uninitialized_ts(ts);
                entry = self.metadata.get(ts);
            }

            if entry.is_commit_ts_entry() && entry.is_validating() {
                break;
            }
            if entry.is_begin_ts_entry()
                && (entry.is_active() || (entry.is_submitted() && self.metadata.is_txn_validating(entry.timestamp())))
            {
                break;
            }

            // Only step onto `ts` from a settled predecessor; anyone else is behind and gives up.
            let previous = ts.prev();
            if watermarks.get(WatermarkKind::PreApply) != previous
                || watermarks.get(WatermarkKind::PostApply) != previous
            {
                break;
            }
            if !watermarks.advance(WatermarkKind::PreApply, ts) {
                break;
            }

            if entry.is_commit_ts_entry() && entry.is_committed() {
                let applied = self.logs.with_log(entry.log_handle(), |log| {
                    self.view.apply_txn_log(ts, log);
                });
                debug_assert!(applied.is_some(), "Log of unapplied txn {} is gone", ts);
            }

            let advanced = watermarks.advance(WatermarkKind::PostApply, ts);
            assert!(advanced, "Failed to advance post-apply watermark to {}", ts);
        }
        trace!("Applied up to {}", watermarks.get(WatermarkKind::PostApply));
    }

    /// Collect the logs of applied transactions: free the versions they made obsolete, then
    /// release the logs themselves.
    pub fn gc_applied_txn_logs(&self, slot: &SafeTsSlot) {
        let _guard = slot.protect_watermark(WatermarkKind::PostGc);
        let watermarks = self.watermarks();
        let start = watermarks.get(WatermarkKind::PostGc);
        let end = watermarks.get(WatermarkKind::PostApply);

        for ts in start.range_after(end) {
            let entry = self.metadata.get(ts);
            if !entry.is_commit_ts_entry() {
                continue;
            }
            debug_assert!(entry.is_decided(), "Applied txn {} is undecided: {:?}", ts, entry);
            if self.persistence && !entry.is_durable() {
                break;
            }
            let log_handle = entry.log_handle();
            if !log_handle.is_valid() {
                // Someone else is collecting it.
                continue;
            }
            if !self.metadata.invalidate_txn_log_handle(ts) {
                break;
            }
            reclaim_txn_log(self.logs, self.memory, log_handle, entry.is_committed());
            let done = self.metadata.set_txn_gc_complete(ts);
            assert!(done, "Failed to mark txn {} GC complete", ts);
            trace!("Collected {:?} of txn {}", log_handle, ts);
        }
    }

    /// Move `PostGc` across every timestamp whose log is collected (or that has no log).
    pub fn update_post_gc_watermark(&self, slot: &SafeTsSlot) {
        let _guard = slot.protect_watermark(WatermarkKind::PostGc);
        let watermarks = self.watermarks();
        let start = watermarks.get(WatermarkKind::PostGc);
        let end = watermarks.get(WatermarkKind::PostApply);

        let mut collected = start;
        for ts in start.range_after(end) {
            let entry = self.metadata.get(ts);
            if entry.is_commit_ts_entry() && !entry.is_gc_complete() {
                break;
            }
            collected = ts;
        }
        if collected > start && watermarks.advance(WatermarkKind::PostGc, collected) {
            debug!("Advanced post-GC watermark to {}", collected);
        }
    }

    /// Move `PreTruncate` as far as safe timestamps allow and, if enabled, decommit the metadata
    /// pages behind it. Returns the new `PreTruncate`.
    pub fn truncate_txn_table(&self) -> Timestamp {
        let pre_truncate = self.registry.advance_pre_truncate();
        if self.truncate_txn_table {
            match self.metadata.truncate(pre_truncate) {
                Ok(truncated) => trace!("Metadata truncated up to {}", truncated),
                Err(e) => warn!("Failed to truncate metadata up to {}: {}", pre_truncate, e),
            }
        }
        pre_truncate
    }
}

/// Free the versions a decided transaction made obsolete: its old versions if it committed, its
/// new versions if not. Then release the log.
pub(crate) fn reclaim_txn_log(logs: &TxnLogs, memory: &MemoryManager, log_handle: LogHandle, committed: bool) {
    let obsolete: Vec<_> = logs
        .with_log(log_handle, |log| log.obsolete_offsets(committed).collect())
        .unwrap_or_default();
    for offset in obsolete {
        memory.deallocate_object(offset);
    }
    logs.deallocate(log_handle);
}
