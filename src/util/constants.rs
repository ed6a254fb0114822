/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a bitmap word
pub const LOG_BYTES_IN_WORD: u8 = 3;
/// The number of bytes in a bitmap word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a bitmap word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a bitmap word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of bytes in a slot, the allocation granularity inside a chunk
pub const LOG_BYTES_IN_SLOT: u8 = 6;
/// The number of bytes in a slot
pub const BYTES_IN_SLOT: usize = 1 << LOG_BYTES_IN_SLOT;

/// log2 of the number of bytes in a chunk
pub const LOG_BYTES_IN_CHUNK: u8 = 22;
/// The number of bytes in a chunk
pub const BYTES_IN_CHUNK: usize = 1 << LOG_BYTES_IN_CHUNK;

/// log2 of the number of slots in a chunk
pub const LOG_SLOTS_IN_CHUNK: u8 = LOG_BYTES_IN_CHUNK - LOG_BYTES_IN_SLOT;
/// The number of slots in a chunk. A slot index always fits in 16 bits.
pub const SLOTS_IN_CHUNK: usize = 1 << LOG_SLOTS_IN_CHUNK;
/// The number of words in one per-chunk slot bitmap
pub const WORDS_IN_SLOT_BITMAP: usize = SLOTS_IN_CHUNK >> LOG_BITS_IN_WORD;

/// The number of pages in a chunk
pub const PAGES_IN_CHUNK: usize = BYTES_IN_CHUNK >> LOG_BYTES_IN_PAGE;

/// The largest object a single allocation may request, in slots
pub const MAX_ALLOCATION_SLOTS: usize = 1 << 10;
/// The largest object a single allocation may request, in bytes
pub const MAX_ALLOCATION_BYTES: usize = MAX_ALLOCATION_SLOTS << LOG_BYTES_IN_SLOT;

/// The largest number of chunks. Chunk indexes fit in 16 bits, and chunk 0 is never handed out.
pub const MAX_CHUNKS: usize = 1 << 16;

const_assert!(SLOTS_IN_CHUNK <= u16::MAX as usize + 1);
const_assert!(MAX_ALLOCATION_SLOTS < SLOTS_IN_CHUNK);
const_assert_eq!(BYTES_IN_CHUNK % BYTES_IN_PAGE, 0);
