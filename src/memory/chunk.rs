//! Slot allocation inside one chunk.
//!
//! A chunk's slots are tracked by two bitmaps. The owning worker sets the allocation bit of the
//! first slot of every object it allocates; any worker may later set the matching deallocation
//! bit. A slot is live while its allocation bit is set and its deallocation bit is not. Only the
//! first slot of an object is marked, so the bitmaps describe objects, not bytes.

use super::manager::MemoryManager;
use super::types::*;
use crate::util::bitmap;
use crate::util::constants::{MAX_ALLOCATION_SLOTS, SLOTS_IN_CHUNK, WORDS_IN_SLOT_BITMAP};
use std::sync::atomic::{AtomicU64, Ordering};

/// The shared metadata of one chunk.
pub(crate) struct ChunkMetadata {
    /// A packed [`ChunkStateWord`].
    state: AtomicU64,
    /// The last allocation, packed as `(end << 32) | start` in slots. Zero before the first
    /// allocation. Written only by the owner.
    last_allocation: AtomicU64,
    allocated: Box<[AtomicU64]>,
    deallocated: Box<[AtomicU64]>,
}

#[inline(always)]
fn pack_allocation(start: usize, end: usize) -> u64 {
    ((end as u64) << 32) | start as u64
}

#[inline(always)]
fn unpack_allocation(word: u64) -> (usize, usize) {
    ((word & u32::MAX as u64) as usize, (word >> 32) as usize)
}

impl ChunkMetadata {
    pub fn new() -> Self {
        ChunkMetadata {
            state: AtomicU64::new(0),
            last_allocation: AtomicU64::new(0),
            allocated: bitmap::new_bitmap(SLOTS_IN_CHUNK),
            deallocated: bitmap::new_bitmap(SLOTS_IN_CHUNK),
        }
    }

    #[inline]
    pub fn state_word(&self) -> ChunkStateWord {
        ChunkStateWord::from(self.state.load(Ordering::SeqCst))
    }

    /// Swap the whole `(state, version)` word. Fails with the actual word if either differs.
    pub fn compare_exchange_state(
        &self,
        expected: ChunkStateWord,
        new: ChunkStateWord,
    ) -> Result<(), ChunkStateWord> {
        debug_assert!(
            is_legal_transition(expected, new),
            "Illegal chunk transition {:?} -> {:?}",
            expected,
            new
        );
        self.state
            .compare_exchange(expected.into(), new.into(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ChunkStateWord::from)
    }

    /// The number of slots handed out so far.
    fn allocation_end(&self) -> usize {
        unpack_allocation(self.last_allocation.load(Ordering::SeqCst)).1
    }

    /// Allocate `bytes` bytes from this chunk. Only the owner calls this. Returns `None` if the
    /// chunk has no room left.
    pub fn allocate(&self, chunk: ChunkOffset, bytes: usize) -> Option<ObjectOffset> {
        debug_assert_eq!(self.state_word().state, ChunkState::InUse);
        let slots = slots_for_bytes(bytes);
        if slots > MAX_ALLOCATION_SLOTS {
            return None;
        }
        let start = self.allocation_end();
        let end = start + slots;
        if end > SLOTS_IN_CHUNK {
            trace!("{:?} is full: {} + {} slots", chunk, start, slots);
            return None;
        }
        // Cursor first, then the bitmap. If we stop in between, the bitmap is authoritative and
        // `recover_last_allocation` rewinds the cursor.
        self.last_allocation.store(pack_allocation(start, end), Ordering::SeqCst);
        bitmap::set_bit_value(&self.allocated, start, true);
        Some(ObjectOffset::new(chunk, SlotOffset::new(start as u16)))
    }

    /// Mark the object at `slot` as deallocated. Any worker may call this, concurrently with
    /// other deallocations in the same chunk.
    pub fn deallocate(&self, slot: SlotOffset) {
        let state = self.state_word().state;
        debug_assert!(
            state == ChunkState::InUse || state == ChunkState::Retired,
            "Deallocating from a chunk in state {}",
            state
        );
        let slot = slot.as_usize();
        if !bitmap::is_bit_set(&self.allocated, slot) {
            debug_assert!(false, "Deallocating unallocated slot {}", slot);
            error!("Deallocating unallocated slot {}; ignored", slot);
            return;
        }
        debug_assert!(
            !bitmap::is_bit_set(&self.deallocated, slot),
            "Slot {} is deallocated twice",
            slot
        );
        bitmap::safe_set_bit_value(&self.deallocated, slot, true);
    }

    /// Is the object at `slot` live?
    pub fn is_slot_allocated(&self, slot: SlotOffset) -> bool {
        let slot = slot.as_usize();
        let allocated = bitmap::is_bit_set(&self.allocated, slot);
        let deallocated = bitmap::is_bit_set(&self.deallocated, slot);
        debug_assert!(!deallocated || allocated, "Slot {} deallocated but not allocated", slot);
        allocated && !deallocated
    }

    /// Does this chunk hold no live objects? The answer only counts if the chunk is still at
    /// `version` after every word is read; otherwise the chunk was reused mid-scan and the answer
    /// is `false`.
    pub fn is_empty(&self, version: ChunkVersion) -> bool {
        let words = bitmap::words_for_bits(self.allocation_end()).min(WORDS_IN_SLOT_BITMAP);
        for index in 0..words {
            let allocated = self.allocated[index].load(Ordering::SeqCst);
            let deallocated = self.deallocated[index].load(Ordering::SeqCst);
            if self.state_word().version != version {
                return false;
            }
            debug_assert_eq!(deallocated & !allocated, 0, "Deallocated slots that were not allocated");
            if allocated ^ deallocated != 0 {
                return false;
            }
        }
        self.state_word().version == version
    }

    /// The number of live objects.
    pub fn live_object_count(&self) -> usize {
        bitmap::count_set_bits(&self.allocated, SLOTS_IN_CHUNK)
            - bitmap::count_set_bits(&self.deallocated, SLOTS_IN_CHUNK)
    }

    /// The start of the last allocation, according to the cursor.
    pub fn last_allocated_slot(&self) -> Option<SlotOffset> {
        let (start, end) = unpack_allocation(self.last_allocation.load(Ordering::SeqCst));
        (end != 0).then(|| SlotOffset::new(start as u16))
    }

    /// Resynchronize the cursor with the allocation bitmap after an interrupted allocation, and
    /// return the start of the last allocation.
    pub fn recover_last_allocation(&self) -> Option<SlotOffset> {
        let (start, end) = unpack_allocation(self.last_allocation.load(Ordering::SeqCst));
        let recovered = match bitmap::find_last_set_bit(&self.allocated, SLOTS_IN_CHUNK) {
            None if end == 0 => return None,
            None => 0,
            Some(last) if end != 0 && last == start => return Some(SlotOffset::new(start as u16)),
            Some(last) => {
                // The allocation at `start` never reached the bitmap. The one before it ends
                // where the lost one began.
                debug_assert!(last < start, "Allocation bitmap is ahead of the cursor");
                pack_allocation(last, start)
            }
        };
        info!("Rewinding allocation cursor from [{}, {}) to {:?}", start, end, unpack_allocation(recovered));
        self.last_allocation.store(recovered, Ordering::SeqCst);
        (recovered != 0).then(|| SlotOffset::new(unpack_allocation(recovered).0 as u16))
    }

    /// Forget every allocation. Only the worker that moved the chunk to `Deallocating` calls this.
    pub fn reset(&self) {
        debug_assert_eq!(self.state_word().state, ChunkState::Deallocating);
        let words = bitmap::words_for_bits(self.allocation_end()).min(WORDS_IN_SLOT_BITMAP);
        for index in 0..words {
            self.allocated[index].store(0, Ordering::SeqCst);
            self.deallocated[index].store(0, Ordering::SeqCst);
        }
        self.last_allocation.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn simulate_interrupted_allocation(&self, bytes: usize) {
        let start = self.allocation_end();
        self.last_allocation
            .store(pack_allocation(start, start + slots_for_bytes(bytes)), Ordering::SeqCst);
    }
}

fn is_legal_transition(from: ChunkStateWord, to: ChunkStateWord) -> bool {
    use ChunkState::*;
    match (from.state, to.state) {
        (Empty, InUse) | (InUse, Retired) | (Retired, Deallocating) => from.version == to.version,
        (Deallocating, Empty) => to.version == from.version.next(),
        _ => false,
    }
}

/// A worker's allocator over the chunk it currently owns.
pub struct ChunkManager<'a> {
    memory: &'a MemoryManager,
    chunk: ChunkOffset,
    version: ChunkVersion,
}

impl<'a> ChunkManager<'a> {
    /// A manager that owns no chunk yet.
    pub fn new(memory: &'a MemoryManager) -> Self {
        ChunkManager {
            memory,
            chunk: ChunkOffset::INVALID,
            version: ChunkVersion::default(),
        }
    }

    /// Take ownership of a chunk returned by [`MemoryManager::allocate_chunk`].
    pub fn initialize(&mut self, chunk: ChunkOffset) {
        debug_assert!(!self.is_initialized(), "Still owning {:?}", self.chunk);
        let word = self.memory.chunk_state(chunk);
        debug_assert_eq!(word.state, ChunkState::InUse);
        self.chunk = chunk;
        self.version = word.version;
    }

    pub fn is_initialized(&self) -> bool {
        self.chunk.is_valid()
    }

    pub fn chunk(&self) -> ChunkOffset {
        self.chunk
    }

    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    /// Allocate an object of `bytes` bytes from the owned chunk. Returns `None` if there is no
    /// owned chunk or it has no room left.
    pub fn allocate(&self, bytes: usize) -> Option<ObjectOffset> {
        if !self.is_initialized() {
            return None;
        }
        self.memory.chunk_metadata(self.chunk).allocate(self.chunk, bytes)
    }

    /// Deallocate an object of the owned chunk.
    pub fn deallocate(&self, offset: ObjectOffset) {
        debug_assert_eq!(offset.chunk(), self.chunk);
        self.memory.deallocate_object(offset);
    }

    pub fn is_empty(&self) -> bool {
        self.is_initialized() && self.memory.chunk_metadata(self.chunk).is_empty(self.version)
    }

    pub fn last_allocated_offset(&self) -> Option<ObjectOffset> {
        if !self.is_initialized() {
            return None;
        }
        self.memory
            .chunk_metadata(self.chunk)
            .recover_last_allocation()
            .map(|slot| ObjectOffset::new(self.chunk, slot))
    }

    /// Give up the owned chunk. Returns `true` if it held no live objects and was reclaimed
    /// immediately.
    pub fn retire_chunk(&mut self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let reclaimed = self.memory.retire_chunk(self.chunk, self.version);
        self.chunk = ChunkOffset::INVALID;
        reclaimed
    }
}

impl Drop for ChunkManager<'_> {
    fn drop(&mut self) {
        self.retire_chunk();
    }
}
