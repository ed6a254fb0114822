//! The metadata entry: one 64-bit word per timestamp.
//!
//! ```text
//!  63   61  60   59   58  57           42  41                     0
//! +-------+----+----+----+---------------+------------------------+
//! | status| gc |dur |rsvd|  log handle   |    linked timestamp    |
//! +-------+----+----+----+---------------+------------------------+
//! ```
//!
//! A begin timestamp entry links to its commit timestamp (once known). A commit timestamp entry
//! links to its begin timestamp and carries the transaction's log handle. With the
//! `narrow_timestamps` feature only the low 32 bits hold the linked timestamp; bits 32 to 41
//! stay clear.

use crate::txn::log::LogHandle;
use crate::txn::timestamp::Timestamp;
use std::fmt;

const TXN_STATUS_SHIFT: u32 = 61;
const TXN_STATUS_BITS: u32 = 3;
const TXN_STATUS_MASK: u64 = ((1 << TXN_STATUS_BITS) - 1) << TXN_STATUS_SHIFT;

const GC_COMPLETE_SHIFT: u32 = 60;
const GC_COMPLETE_MASK: u64 = 1 << GC_COMPLETE_SHIFT;

const DURABLE_SHIFT: u32 = 59;
const DURABLE_MASK: u64 = 1 << DURABLE_SHIFT;

const RESERVED_SHIFT: u32 = 58;

const LOG_HANDLE_SHIFT: u32 = 42;
const LOG_HANDLE_BITS: u32 = 16;
const LOG_HANDLE_MASK: u64 = ((1 << LOG_HANDLE_BITS) - 1) << LOG_HANDLE_SHIFT;

cfg_if::cfg_if! {
    if #[cfg(feature = "narrow_timestamps")] {
        /// The number of bits holding the linked timestamp.
        pub const LINKED_TS_BITS: u32 = 32;
    } else {
        /// The number of bits holding the linked timestamp.
        pub const LINKED_TS_BITS: u32 = 42;
    }
}
const LINKED_TS_MASK: u64 = (1 << LINKED_TS_BITS) - 1;

/// The largest timestamp an entry can link to, and so the largest timestamp the table hands out.
pub const MAX_TIMESTAMP: u64 = LINKED_TS_MASK;

const_assert_eq!(TXN_STATUS_SHIFT + TXN_STATUS_BITS, 64);
const_assert_eq!(GC_COMPLETE_SHIFT + 1, TXN_STATUS_SHIFT);
const_assert_eq!(DURABLE_SHIFT + 1, GC_COMPLETE_SHIFT);
const_assert_eq!(RESERVED_SHIFT + 1, DURABLE_SHIFT);
const_assert_eq!(LOG_HANDLE_SHIFT + LOG_HANDLE_BITS, RESERVED_SHIFT);
const_assert!(LINKED_TS_BITS <= LOG_HANDLE_SHIFT);

// Raw status values. The high bit is set for commit timestamp states (and the sealed marker);
// both upper bits are set for decided states.
const STATUS_UNINITIALIZED: u64 = 0b000;
const STATUS_TERMINATED: u64 = 0b001;
const STATUS_ACTIVE: u64 = 0b010;
const STATUS_SUBMITTED: u64 = 0b011;
const STATUS_VALIDATING: u64 = 0b100;
const STATUS_SEALED: u64 = 0b101;
const STATUS_ABORTED: u64 = 0b110;
const STATUS_COMMITTED: u64 = 0b111;

const STATUS_COMMIT_MASK: u64 = 0b100;
const STATUS_DECIDED_MASK: u64 = 0b110;

/// The status field of a metadata entry.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::IntoStaticStr, strum_macros::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TxnStatus {
    Uninitialized = STATUS_UNINITIALIZED as u8,
    Terminated = STATUS_TERMINATED as u8,
    Active = STATUS_ACTIVE as u8,
    Submitted = STATUS_SUBMITTED as u8,
    Validating = STATUS_VALIDATING as u8,
    Sealed = STATUS_SEALED as u8,
    Aborted = STATUS_ABORTED as u8,
    Committed = STATUS_COMMITTED as u8,
}

impl From<TxnStatus> for u64 {
    fn from(status: TxnStatus) -> u64 {
        status as u64
    }
}

impl From<u64> for TxnStatus {
    fn from(bits: u64) -> TxnStatus {
        match bits & 0b111 {
            STATUS_UNINITIALIZED => TxnStatus::Uninitialized,
            STATUS_TERMINATED => TxnStatus::Terminated,
            STATUS_ACTIVE => TxnStatus::Active,
            STATUS_SUBMITTED => TxnStatus::Submitted,
            STATUS_VALIDATING => TxnStatus::Validating,
            STATUS_SEALED => TxnStatus::Sealed,
            STATUS_ABORTED => TxnStatus::Aborted,
            STATUS_COMMITTED => TxnStatus::Committed,
            _ => unreachable!(),
        }
    }
}

/// A decoded copy of one metadata word. Entries are values: transitions return a new entry,
/// and the table installs it with compare-and-swap.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct TxnMetadataEntry(u64);

impl TxnMetadataEntry {
    #[inline(always)]
    pub const fn from_word(word: u64) -> Self {
        TxnMetadataEntry(word)
    }

    #[inline(always)]
    pub const fn word(self) -> u64 {
        self.0
    }

    /// The entry of a timestamp that was allocated but not yet (or never) installed.
    #[inline(always)]
    pub const fn uninitialized() -> Self {
        TxnMetadataEntry(STATUS_UNINITIALIZED << TXN_STATUS_SHIFT)
    }

    /// The marker that stops an uninitialized entry from ever being installed.
    #[inline(always)]
    pub const fn sealed() -> Self {
        TxnMetadataEntry(STATUS_SEALED << TXN_STATUS_SHIFT)
    }

    /// A fresh begin timestamp entry. Its commit timestamp is unknown.
    #[inline(always)]
    pub const fn new_begin_ts_entry() -> Self {
        TxnMetadataEntry(STATUS_ACTIVE << TXN_STATUS_SHIFT)
    }

    /// A fresh commit timestamp entry, linked to `begin_ts` and owning `log_handle`.
    pub fn new_commit_ts_entry(begin_ts: Timestamp, log_handle: LogHandle) -> Self {
        debug_assert!(begin_ts.is_valid() && begin_ts.as_u64() <= MAX_TIMESTAMP);
        debug_assert!(log_handle.is_valid());
        TxnMetadataEntry(
            (STATUS_VALIDATING << TXN_STATUS_SHIFT)
                | ((log_handle.as_u16() as u64) << LOG_HANDLE_SHIFT)
                | begin_ts.as_u64(),
        )
    }

    #[inline(always)]
    fn status_bits(self) -> u64 {
        (self.0 & TXN_STATUS_MASK) >> TXN_STATUS_SHIFT
    }

    #[inline(always)]
    fn with_status(self, status: u64) -> Self {
        TxnMetadataEntry((self.0 & !TXN_STATUS_MASK) | (status << TXN_STATUS_SHIFT))
    }

    pub fn status(self) -> TxnStatus {
        TxnStatus::from(self.status_bits())
    }

    pub fn status_to_str(self) -> &'static str {
        self.status().into()
    }

    #[inline(always)]
    pub fn is_uninitialized(self) -> bool {
        self.0 == Self::uninitialized().0
    }

    #[inline(always)]
    pub fn is_sealed(self) -> bool {
        self.0 == Self::sealed().0
    }

    #[inline(always)]
    pub fn is_begin_ts_entry(self) -> bool {
        let status = self.status_bits();
        status != STATUS_UNINITIALIZED && status & STATUS_COMMIT_MASK == 0
    }

    #[inline(always)]
    pub fn is_commit_ts_entry(self) -> bool {
        !self.is_sealed() && self.status_bits() & STATUS_COMMIT_MASK == STATUS_COMMIT_MASK
    }

    #[inline(always)]
    pub fn is_active(self) -> bool {
        self.status_bits() == STATUS_ACTIVE
    }

    #[inline(always)]
    pub fn is_submitted(self) -> bool {
        self.status_bits() == STATUS_SUBMITTED
    }

    #[inline(always)]
    pub fn is_terminated(self) -> bool {
        self.status_bits() == STATUS_TERMINATED
    }

    #[inline(always)]
    pub fn is_validating(self) -> bool {
        self.status_bits() == STATUS_VALIDATING
    }

    #[inline(always)]
    pub fn is_decided(self) -> bool {
        self.status_bits() & STATUS_DECIDED_MASK == STATUS_DECIDED_MASK
    }

    #[inline(always)]
    pub fn is_committed(self) -> bool {
        self.status_bits() == STATUS_COMMITTED
    }

    #[inline(always)]
    pub fn is_aborted(self) -> bool {
        self.status_bits() == STATUS_ABORTED
    }

    #[inline(always)]
    pub fn is_gc_complete(self) -> bool {
        self.0 & GC_COMPLETE_MASK != 0
    }

    #[inline(always)]
    pub fn is_durable(self) -> bool {
        self.0 & DURABLE_MASK != 0
    }

    /// The linked timestamp: the begin timestamp of a commit entry, or the commit timestamp of a
    /// submitted begin entry. `INVALID` if not linked yet.
    #[inline(always)]
    pub fn timestamp(self) -> Timestamp {
        Timestamp::new(self.0 & LINKED_TS_MASK)
    }

    #[inline(always)]
    pub fn log_handle(self) -> LogHandle {
        LogHandle::new(((self.0 & LOG_HANDLE_MASK) >> LOG_HANDLE_SHIFT) as u16)
    }

    /// `active` to `submitted`, recording the commit timestamp.
    pub fn set_submitted(self, commit_ts: Timestamp) -> Self {
        debug_assert!(self.is_active(), "Not an active txn: {:?}", self);
        debug_assert!(commit_ts.is_valid() && commit_ts.as_u64() <= MAX_TIMESTAMP);
        TxnMetadataEntry((STATUS_SUBMITTED << TXN_STATUS_SHIFT) | commit_ts.as_u64())
    }

    /// `active` to `terminated`.
    pub fn set_terminated(self) -> Self {
        debug_assert!(self.is_active(), "Not an active txn: {:?}", self);
        self.with_status(STATUS_TERMINATED)
    }

    /// `validating` to `committed` or `aborted`. Flags, log handle and link are kept.
    pub fn set_decision(self, committed: bool) -> Self {
        debug_assert!(self.is_validating(), "Not a validating txn: {:?}", self);
        self.with_status(if committed {
            STATUS_COMMITTED
        } else {
            STATUS_ABORTED
        })
    }

    pub fn set_durable(self) -> Self {
        debug_assert!(self.is_commit_ts_entry(), "Not a commit entry: {:?}", self);
        TxnMetadataEntry(self.0 | DURABLE_MASK)
    }

    pub fn set_gc_complete(self) -> Self {
        debug_assert!(self.is_commit_ts_entry(), "Not a commit entry: {:?}", self);
        TxnMetadataEntry(self.0 | GC_COMPLETE_MASK)
    }

    /// Replace the log handle with the invalidated sentinel, marking the log as claimed for GC.
    pub fn invalidate_log_handle(self) -> Self {
        debug_assert!(self.is_commit_ts_entry(), "Not a commit entry: {:?}", self);
        TxnMetadataEntry(
            (self.0 & !LOG_HANDLE_MASK)
                | ((LogHandle::INVALIDATED.as_u16() as u64) << LOG_HANDLE_SHIFT),
        )
    }
}

impl fmt::Debug for TxnMetadataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x} [{}", self.0, self.status_to_str())?;
        if self.is_gc_complete() {
            write!(f, ", gc_complete")?;
        }
        if self.is_durable() {
            write!(f, ", durable")?;
        }
        if self.is_commit_ts_entry() {
            write!(f, ", log: {:?}, begin: {}", self.log_handle(), self.timestamp())?;
        } else if self.is_begin_ts_entry() && self.timestamp().is_valid() {
            write!(f, ", commit: {}", self.timestamp())?;
        }
        write!(f, "]")
    }
}
