use crate::util::constants::{BYTES_IN_SLOT, LOG_BYTES_IN_SLOT, MAX_ALLOCATION_SLOTS};
use bytemuck::NoUninit;
use std::fmt;

/// Index of a chunk in the managed address space. Chunk 0 is never handed out.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, NoUninit)]
pub struct ChunkOffset(u16);

impl ChunkOffset {
    pub const INVALID: ChunkOffset = ChunkOffset(0);

    #[inline(always)]
    pub const fn new(raw: u16) -> Self {
        ChunkOffset(raw)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Index of a slot inside its chunk.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, NoUninit)]
pub struct SlotOffset(u16);

impl SlotOffset {
    #[inline(always)]
    pub const fn new(raw: u16) -> Self {
        SlotOffset(raw)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A chunk and a slot packed as `(chunk << 16) | slot`. Zero is the invalid offset, since
/// chunk 0 is never handed out.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, NoUninit)]
pub struct ObjectOffset(u32);

impl ObjectOffset {
    pub const INVALID: ObjectOffset = ObjectOffset(0);

    #[inline(always)]
    pub const fn new(chunk: ChunkOffset, slot: SlotOffset) -> Self {
        ObjectOffset(((chunk.0 as u32) << 16) | slot.0 as u32)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        ObjectOffset(raw)
    }

    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn chunk(self) -> ChunkOffset {
        ChunkOffset((self.0 >> 16) as u16)
    }

    #[inline(always)]
    pub const fn slot(self) -> SlotOffset {
        SlotOffset(self.0 as u16)
    }

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for ObjectOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "obj:{}/{}", self.chunk().0, self.slot().0)
        } else {
            write!(f, "obj:invalid")
        }
    }
}

/// Bumped every time a chunk goes back to `Empty`. 62 bits wide.
#[repr(transparent)]
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkVersion(u64);

impl ChunkVersion {
    pub const MAX: u64 = (1 << 62) - 1;

    #[inline(always)]
    pub const fn new(raw: u64) -> Self {
        ChunkVersion(raw)
    }

    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The following version. Wraps within 62 bits.
    #[inline(always)]
    pub const fn next(self) -> Self {
        ChunkVersion((self.0 + 1) & Self::MAX)
    }
}

/// The lifecycle of a chunk: `Empty -> InUse -> Retired -> Deallocating -> Empty`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChunkState {
    /// Free for any worker to claim.
    Empty = 0b00,
    /// Owned by a worker that allocates from it.
    InUse = 0b01,
    /// Released by its owner. Still holds live objects until GC deallocates them.
    Retired = 0b10,
    /// Being decommitted by the worker that proved it empty.
    Deallocating = 0b11,
}

impl ChunkState {
    const MASK: u64 = 0b11;
    const VERSION_SHIFT: u32 = 2;
}

/// A chunk's state and version, packed into one word so that both are compared and swapped
/// together.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ChunkStateWord {
    pub state: ChunkState,
    pub version: ChunkVersion,
}

impl ChunkStateWord {
    pub const fn new(state: ChunkState, version: ChunkVersion) -> Self {
        ChunkStateWord { state, version }
    }
}

impl From<ChunkStateWord> for u64 {
    fn from(word: ChunkStateWord) -> u64 {
        (word.version.0 << ChunkState::VERSION_SHIFT) | word.state as u64
    }
}

impl From<u64> for ChunkStateWord {
    fn from(word: u64) -> ChunkStateWord {
        let state = match word & ChunkState::MASK {
            0b00 => ChunkState::Empty,
            0b01 => ChunkState::InUse,
            0b10 => ChunkState::Retired,
            0b11 => ChunkState::Deallocating,
            _ => unreachable!(),
        };
        ChunkStateWord {
            state,
            version: ChunkVersion(word >> ChunkState::VERSION_SHIFT),
        }
    }
}

/// The number of slots needed for an object of `bytes` bytes. Always at least one.
#[inline]
pub fn slots_for_bytes(bytes: usize) -> usize {
    ((bytes + BYTES_IN_SLOT - 1) >> LOG_BYTES_IN_SLOT).max(1)
}

/// Can an object of `bytes` bytes be allocated at all?
#[inline]
pub fn is_allocation_size_valid(bytes: usize) -> bool {
    slots_for_bytes(bytes) <= MAX_ALLOCATION_SLOTS
}
