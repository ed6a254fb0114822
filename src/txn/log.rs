//! Transaction logs and the handles that name them.
//!
//! A log records, for every object a transaction touched, the offset of the version it replaced
//! and the offset of the version it wrote. Which of the two becomes garbage depends on the
//! transaction's fate: a commit obsoletes the old versions, an abort obsoletes the new ones.

use crate::memory::ObjectOffset;
use crate::txn::timestamp::Timestamp;
use crate::util::bitmap;
use crate::util::retry::retry;
use itertools::{EitherOrBoth, Itertools};
use spin::Mutex;
use std::fmt;
use std::sync::atomic::AtomicU64;

/// The number of usable log handles. Handle 0 means "no log" and `u16::MAX` is the invalidated
/// sentinel.
pub const MAX_LOG_HANDLES: usize = u16::MAX as usize - 1;

/// Names a transaction log. Stored in the 16-bit log field of commit entries.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct LogHandle(u16);

impl LogHandle {
    /// No log. Begin entries carry this.
    pub const NONE: LogHandle = LogHandle(0);
    /// The log has been claimed by a GC task and must not be touched by anyone else.
    pub const INVALIDATED: LogHandle = LogHandle(u16::MAX);

    #[inline(always)]
    pub const fn new(raw: u16) -> Self {
        LogHandle(raw)
    }

    #[inline(always)]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NONE.0 && self.0 != Self::INVALIDATED.0
    }

    #[inline(always)]
    fn index(self) -> usize {
        debug_assert!(self.is_valid());
        self.0 as usize - 1
    }

    #[inline(always)]
    fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_LOG_HANDLES);
        LogHandle(index as u16 + 1)
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "log:none"),
            Self::INVALIDATED => write!(f, "log:invalidated"),
            LogHandle(raw) => write!(f, "log:{}", raw),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LogOperation {
    Create,
    Update,
    Remove,
}

/// One change: `locator` identifies the logical object, the offsets its two versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub locator: u64,
    pub old_offset: ObjectOffset,
    pub new_offset: ObjectOffset,
    pub operation: LogOperation,
}

#[derive(Clone, Debug, Default)]
pub struct TxnLog {
    pub begin_ts: Timestamp,
    pub records: Vec<LogRecord>,
}

impl TxnLog {
    pub fn new(begin_ts: Timestamp) -> Self {
        TxnLog {
            begin_ts,
            records: vec![],
        }
    }

    /// Versions that nobody can see once the transaction is decided.
    pub fn obsolete_offsets(&self, committed: bool) -> impl Iterator<Item = ObjectOffset> + '_ {
        self.records
            .iter()
            .map(move |r| if committed { r.old_offset } else { r.new_offset })
            .filter(|offset| offset.is_valid())
    }

    /// Do the two logs write any common object?
    pub fn conflicts_with(&self, other: &TxnLog) -> bool {
        let mine = self.records.iter().map(|r| r.locator).sorted_unstable();
        let theirs = other.records.iter().map(|r| r.locator).sorted_unstable();
        mine.merge_join_by(theirs, |a, b| a.cmp(b))
            .any(|pair| matches!(pair, EitherOrBoth::Both(_, _)))
    }
}

/// The shared visible state that committed logs are applied to.
pub trait SharedView: Send + Sync {
    /// Make the changes of the transaction committed at `commit_ts` visible. Called by exactly one
    /// thread at a time, in commit timestamp order.
    fn apply_txn_log(&self, commit_ts: Timestamp, log: &TxnLog);
}

/// A view that ignores applied logs.
#[derive(Debug, Default)]
pub struct NullView;

impl SharedView for NullView {
    fn apply_txn_log(&self, _commit_ts: Timestamp, _log: &TxnLog) {}
}

/// A fixed-capacity store of transaction logs. Handles are allocated from a bitmap.
pub struct TxnLogs {
    logs: Box<[Mutex<Option<TxnLog>>]>,
    allocated: Box<[AtomicU64]>,
}

impl TxnLogs {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= MAX_LOG_HANDLES);
        TxnLogs {
            logs: (0..capacity).map(|_| Mutex::new(None)).collect(),
            allocated: bitmap::new_bitmap(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.logs.len()
    }

    /// Claim a free handle and start an empty log for the transaction that began at `begin_ts`.
    /// Returns `None` if every handle is in use.
    pub fn allocate(&self, begin_ts: Timestamp) -> Option<LogHandle> {
        let index = retry(|| match bitmap::find_first_unset_bit(&self.allocated, 0, self.capacity()) {
            None => Some(None),
            Some(index) => bitmap::try_set_bit_value(&self.allocated, index, true).then_some(Some(index)),
        })?;
        *self.logs[index].lock() = Some(TxnLog::new(begin_ts));
        let handle = LogHandle::from_index(index);
        trace!("Allocated {:?} for txn {}", handle, begin_ts);
        Some(handle)
    }

    /// Release a handle. The log contents are dropped first, so the next owner starts clean.
    pub fn deallocate(&self, handle: LogHandle) {
        debug_assert!(self.is_allocated(handle), "{:?} is not allocated", handle);
        self.logs[handle.index()].lock().take();
        bitmap::safe_set_bit_value(&self.allocated, handle.index(), false);
        trace!("Deallocated {:?}", handle);
    }

    pub fn is_allocated(&self, handle: LogHandle) -> bool {
        handle.is_valid()
            && handle.index() < self.capacity()
            && bitmap::is_bit_set(&self.allocated, handle.index())
    }

    pub fn allocated_count(&self) -> usize {
        bitmap::count_set_bits(&self.allocated, self.capacity())
    }

    pub fn append(&self, handle: LogHandle, record: LogRecord) {
        match self.logs[handle.index()].lock().as_mut() {
            Some(log) => log.records.push(record),
            None => debug_assert!(false, "Appending to unallocated {:?}", handle),
        }
    }

    /// Run `f` on the log behind `handle`, or return `None` if the handle is not allocated.
    pub fn with_log<R>(&self, handle: LogHandle, f: impl FnOnce(&TxnLog) -> R) -> Option<R> {
        if !handle.is_valid() || handle.index() >= self.capacity() {
            return None;
        }
        self.logs[handle.index()].lock().as_ref().map(f)
    }
}
