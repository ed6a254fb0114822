//! The object memory: a reserved address space split into fixed-size chunks, each carved into
//! fixed-size slots.

mod chunk;
mod manager;
mod types;

pub use self::chunk::ChunkManager;
pub(crate) use self::chunk::ChunkMetadata;
pub use self::manager::MemoryManager;
pub use self::types::*;
