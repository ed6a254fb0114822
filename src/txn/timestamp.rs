use bytemuck::NoUninit;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A transaction timestamp. The same counter hands out begin and commit timestamps; which role a
/// timestamp plays is recorded in its metadata entry.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, NoUninit)]
pub struct Timestamp(u64);

impl Timestamp {
    /// No timestamp. Never allocated.
    pub const INVALID: Timestamp = Timestamp(0);

    #[inline(always)]
    pub const fn new(value: u64) -> Self {
        Timestamp(value)
    }

    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    pub const fn next(self) -> Self {
        Timestamp(self.0 + 1)
    }

    /// The preceding timestamp. `INVALID` has none.
    #[inline(always)]
    pub fn prev(self) -> Self {
        debug_assert!(self.is_valid());
        Timestamp(self.0 - 1)
    }

    /// Iterate over `(self, end]`.
    pub fn range_after(self, end: Timestamp) -> impl Iterator<Item = Timestamp> {
        (self.0 + 1..=end.0).map(Timestamp)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts:{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The global source of timestamps. Strictly monotonic; the first timestamp is 1.
#[derive(Debug, Default)]
pub struct TimestampCounter {
    last: AtomicU64,
}

impl TimestampCounter {
    pub const fn new() -> Self {
        TimestampCounter {
            last: AtomicU64::new(0),
        }
    }

    /// Allocate the next timestamp.
    #[inline]
    pub fn allocate(&self) -> Timestamp {
        Timestamp(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently allocated timestamp, or `INVALID` if none.
    #[inline]
    pub fn last_allocated(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::SeqCst))
    }
}
