use super::chunk::ChunkMetadata;
use super::types::*;
use crate::util::bitmap;
use crate::util::constants::{BYTES_IN_CHUNK, BYTES_IN_SLOT, MAX_CHUNKS};
use crate::util::memory::MmapRegion;
use crate::util::retry::retry;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// The outcome of one attempt to claim a never-used chunk.
enum UnusedChunk {
    Claimed(ChunkOffset),
    /// Someone claimed it through the reuse path first.
    Lost,
    Exhausted,
}

/// Owns the managed address space and hands it out a chunk at a time.
///
/// Chunks below the high-water mark have been used at least once and are found again through
/// the allocated-chunk bitmap when they return to `Empty`. Chunks above it have never been
/// touched. Chunk 0 is reserved so that offset 0 can mean "no object".
pub struct MemoryManager {
    region: MmapRegion,
    chunks: Box<[ChunkMetadata]>,
    /// One bit per chunk, set from the moment the chunk is claimed until it is reset.
    allocated_chunks: Box<[AtomicU64]>,
    /// The lowest chunk index never handed out.
    next_unused_chunk: AtomicUsize,
}

impl MemoryManager {
    /// Reserve address space for `chunk_count` chunks (including the reserved chunk 0).
    pub fn new(chunk_count: usize) -> io::Result<Self> {
        assert!(chunk_count >= 2 && chunk_count <= MAX_CHUNKS);
        let region = MmapRegion::reserve(chunk_count * BYTES_IN_CHUNK)?;
        debug!(
            "Reserved {} chunks ({} bytes) at {:?}",
            chunk_count,
            region.size(),
            region.start()
        );
        Ok(MemoryManager {
            region,
            chunks: (0..chunk_count).map(|_| ChunkMetadata::new()).collect(),
            allocated_chunks: bitmap::new_bitmap(chunk_count),
            next_unused_chunk: AtomicUsize::new(1),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline(always)]
    pub(crate) fn chunk_metadata(&self, chunk: ChunkOffset) -> &ChunkMetadata {
        debug_assert!(chunk.is_valid(), "Chunk 0 is reserved");
        &self.chunks[chunk.as_usize()]
    }

    pub fn chunk_state(&self, chunk: ChunkOffset) -> ChunkStateWord {
        self.chunk_metadata(chunk).state_word()
    }

    /// Claim an `Empty` chunk and move it to `InUse`. Previously used chunks are preferred.
    /// Returns `None` if every chunk is taken.
    pub fn allocate_chunk(&self) -> Option<ChunkOffset> {
        let chunk = retry(|| {
            if let Some(chunk) = self.allocate_reused_chunk() {
                return Some(Some(chunk));
            }
            match self.allocate_unused_chunk() {
                UnusedChunk::Claimed(chunk) => Some(Some(chunk)),
                UnusedChunk::Exhausted => Some(None),
                UnusedChunk::Lost => None,
            }
        });
        match chunk {
            Some(chunk) => {
                debug!("Allocated {:?} at {:?}", chunk, self.chunk_state(chunk).version);
                probe::probe!(txcore, chunk_allocate, chunk.as_usize());
            }
            None => debug!("No free chunk"),
        }
        chunk
    }

    fn allocate_reused_chunk(&self) -> Option<ChunkOffset> {
        let limit = self.next_unused_chunk.load(Ordering::SeqCst).min(self.chunk_count());
        let mut start = 1;
        while let Some(index) = bitmap::find_first_unset_bit(&self.allocated_chunks, start, limit) {
            start = index + 1;
            let chunk = ChunkOffset::new(index as u16);
            if self.try_claim(chunk) {
                return Some(chunk);
            }
        }
        None
    }

    fn allocate_unused_chunk(&self) -> UnusedChunk {
        let index = self.next_unused_chunk.fetch_add(1, Ordering::SeqCst);
        if index >= self.chunk_count() {
            // Keep the high-water mark from drifting far past the end.
            self.next_unused_chunk.store(self.chunk_count(), Ordering::SeqCst);
            return UnusedChunk::Exhausted;
        }
        let chunk = ChunkOffset::new(index as u16);
        if self.try_claim(chunk) {
            UnusedChunk::Claimed(chunk)
        } else {
            UnusedChunk::Lost
        }
    }

    fn try_claim(&self, chunk: ChunkOffset) -> bool {
        let metadata = self.chunk_metadata(chunk);
        let word = metadata.state_word();
        if word.state != ChunkState::Empty {
            return false;
        }
        let claimed = metadata
            .compare_exchange_state(word, ChunkStateWord::new(ChunkState::InUse, word.version))
            .is_ok();
        if claimed {
            bitmap::safe_set_bit_value(&self.allocated_chunks, chunk.as_usize(), true);
        }
        claimed
    }

    /// `InUse -> Retired`, then try to reclaim the chunk. Only the owner calls this, so the first
    /// transition must succeed. Returns `true` if the chunk was reclaimed.
    pub fn retire_chunk(&self, chunk: ChunkOffset, version: ChunkVersion) -> bool {
        let result = self.chunk_metadata(chunk).compare_exchange_state(
            ChunkStateWord::new(ChunkState::InUse, version),
            ChunkStateWord::new(ChunkState::Retired, version),
        );
        assert!(result.is_ok(), "Failed to retire {:?}: {:?}", chunk, result);
        trace!("Retired {:?} at {:?}", chunk, version);
        self.try_deallocate_chunk(chunk, version)
    }

    /// Reclaim a retired chunk at `version` if it holds no live objects: decommit its pages and
    /// return it to `Empty` at the next version. Safe to call from any worker, any number of times;
    /// exactly one caller reclaims a given chunk version.
    pub fn try_deallocate_chunk(&self, chunk: ChunkOffset, version: ChunkVersion) -> bool {
        let metadata = self.chunk_metadata(chunk);
        if !metadata.is_empty(version) {
            return false;
        }
        if metadata
            .compare_exchange_state(
                ChunkStateWord::new(ChunkState::Retired, version),
                ChunkStateWord::new(ChunkState::Deallocating, version),
            )
            .is_err()
        {
            return false;
        }

        if let Err(e) = self.region.decommit(chunk.as_usize() * BYTES_IN_CHUNK, BYTES_IN_CHUNK) {
            // The chunk stays usable; its pages just stay resident.
            warn!("Failed to decommit {:?}: {}", chunk, e);
        }
        metadata.reset();

        // Clear the bit while nobody can claim the chunk, so a claimer's bit is never lost.
        bitmap::safe_set_bit_value(&self.allocated_chunks, chunk.as_usize(), false);
        let result = metadata.compare_exchange_state(
            ChunkStateWord::new(ChunkState::Deallocating, version),
            ChunkStateWord::new(ChunkState::Empty, version.next()),
        );
        assert!(result.is_ok(), "Failed to empty {:?}: {:?}", chunk, result);
        debug!("Deallocated {:?} at {:?}", chunk, version);
        probe::probe!(txcore, chunk_deallocate, chunk.as_usize());
        true
    }

    /// Deallocate an object. If this empties a retired chunk, the chunk is reclaimed as well.
    pub fn deallocate_object(&self, offset: ObjectOffset) {
        debug_assert!(offset.is_valid());
        let chunk = offset.chunk();
        let metadata = self.chunk_metadata(chunk);
        metadata.deallocate(offset.slot());
        #[cfg(feature = "extreme_assertions")]
        assert!(!metadata.is_slot_allocated(offset.slot()));
        let word = metadata.state_word();
        if word.state == ChunkState::Retired {
            self.try_deallocate_chunk(chunk, word.version);
        }
    }

    pub fn is_slot_allocated(&self, offset: ObjectOffset) -> bool {
        offset.is_valid() && self.chunk_metadata(offset.chunk()).is_slot_allocated(offset.slot())
    }

    /// The address of an object.
    pub fn object_ptr(&self, offset: ObjectOffset) -> NonNull<u8> {
        debug_assert!(offset.is_valid());
        self.region
            .at(offset.chunk().as_usize() * BYTES_IN_CHUNK + offset.slot().as_usize() * BYTES_IN_SLOT)
    }

    /// The number of chunks not `Empty`.
    pub fn allocated_chunk_count(&self) -> usize {
        bitmap::count_set_bits(&self.allocated_chunks, self.chunk_count())
    }

    /// Bytes in chunks that have never been handed out.
    pub fn unused_memory_size(&self) -> usize {
        let next = self.next_unused_chunk.load(Ordering::SeqCst).min(self.chunk_count());
        (self.chunk_count() - next) * BYTES_IN_CHUNK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ChunkManager;

    #[test]
    fn chunk_zero_is_reserved() {
        let memory = MemoryManager::new(4).unwrap();
        assert_eq!(memory.allocate_chunk(), Some(ChunkOffset::new(1)));
        assert_eq!(memory.allocate_chunk(), Some(ChunkOffset::new(2)));
        assert_eq!(memory.allocate_chunk(), Some(ChunkOffset::new(3)));
        assert_eq!(memory.allocate_chunk(), None);
        assert_eq!(memory.allocate_chunk(), None);
        assert_eq!(memory.allocated_chunk_count(), 3);
        assert_eq!(memory.unused_memory_size(), 0);
    }

    #[test]
    fn empty_chunk_is_reclaimed_on_retire() {
        let memory = MemoryManager::new(4).unwrap();
        let chunk = memory.allocate_chunk().unwrap();
        let version = memory.chunk_state(chunk).version;
        assert!(memory.retire_chunk(chunk, version));
        let state = memory.chunk_state(chunk);
        assert_eq!(state.state, ChunkState::Empty);
        assert_eq!(state.version, version.next());
        assert_eq!(memory.allocated_chunk_count(), 0);
        // Reclaiming again is a no-op.
        assert!(!memory.try_deallocate_chunk(chunk, version));
        assert!(!memory.try_deallocate_chunk(chunk, version.next()));
        // The chunk is reused before untouched ones.
        assert_eq!(memory.allocate_chunk(), Some(chunk));
    }

    #[test]
    fn retired_chunk_is_reclaimed_by_last_deallocation() {
        let memory = MemoryManager::new(4).unwrap();
        let mut manager = ChunkManager::new(&memory);
        let chunk = memory.allocate_chunk().unwrap();
        manager.initialize(chunk);
        let a = manager.allocate(100).unwrap();
        let b = manager.allocate(100).unwrap();
        assert!(!manager.retire_chunk());
        assert_eq!(memory.chunk_state(chunk).state, ChunkState::Retired);

        memory.deallocate_object(a);
        assert_eq!(memory.chunk_state(chunk).state, ChunkState::Retired);
        memory.deallocate_object(b);
        assert_eq!(memory.chunk_state(chunk).state, ChunkState::Empty);
        assert!(!memory.is_slot_allocated(a));
    }

    #[test]
    fn reclaimed_chunk_memory_is_zeroed() {
        let memory = MemoryManager::new(4).unwrap();
        let mut manager = ChunkManager::new(&memory);
        let chunk = memory.allocate_chunk().unwrap();
        manager.initialize(chunk);
        let offset = manager.allocate(8).unwrap();
        unsafe { *memory.object_ptr(offset).as_ptr() = 0xab };
        manager.deallocate(offset);
        assert!(manager.retire_chunk());

        assert_eq!(memory.allocate_chunk(), Some(chunk));
        manager.initialize(chunk);
        let offset = manager.allocate(8).unwrap();
        assert_eq!(offset.slot(), SlotOffset::new(0));
        assert!(memory.is_slot_allocated(offset));
        assert_eq!(unsafe { *memory.object_ptr(offset).as_ptr() }, 0);
    }

    #[test]
    fn stale_scan_cannot_reclaim_reused_chunk() {
        let memory = MemoryManager::new(4).unwrap();
        let chunk = memory.allocate_chunk().unwrap();
        let old = memory.chunk_state(chunk).version;
        assert!(memory.retire_chunk(chunk, old));
        assert_eq!(memory.allocate_chunk(), Some(chunk));
        let new = memory.chunk_state(chunk).version;
        assert_ne!(old, new);
        assert!(!memory.try_deallocate_chunk(chunk, old));
        assert_eq!(memory.chunk_state(chunk).state, ChunkState::InUse);
    }

    #[test]
    fn concurrent_chunk_allocation() {
        let memory = MemoryManager::new(65).unwrap();
        let mut chunks: Vec<ChunkOffset> = crossbeam::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|_| (0..16).map(|_| memory.allocate_chunk().unwrap()).collect::<Vec<_>>()))
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        })
        .unwrap();
        chunks.sort();
        chunks.dedup();
        assert_eq!(chunks.len(), 64);
        assert_eq!(memory.allocate_chunk(), None);
    }
}
