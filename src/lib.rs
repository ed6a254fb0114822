//! txcore is the concurrency core of an in-memory database engine.
//!
//! It provides a lock-free multi-version concurrency control (MVCC) mechanism built from
//! three pieces:
//!
//! * a timestamp-indexed [transaction metadata table](txn::metadata::TxnMetadata) whose
//!   entries are single 64-bit words transitioned by compare-and-swap,
//! * a [watermark](txn::watermark::Watermarks) driven garbage collector that applies,
//!   reclaims and finally truncates transaction history without blocking readers, guarded by
//!   the [safe timestamp registry](txn::safe_ts::SafeTsRegistry), and
//! * a [chunk and slot allocator](memory::MemoryManager) that backs object storage.
//!
//! Most users start from an [`EngineBuilder`], set options, and open one [`Session`] per
//! worker thread:
//!
//! ```ignore
//! let engine = EngineBuilder::new().build()?;
//! let mut session = engine.open_session().expect("too many sessions");
//! session.begin_transaction()?;
//! let offset = session.allocate_object(100)?;
//! session.record(42, ObjectOffset::INVALID, offset, LogOperation::Create)?;
//! let commit_ts = session.commit_transaction()?;
//! session.perform_maintenance();
//! ```

#[cfg(test)]
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod engine;
pub mod memory;
pub mod txn;
pub mod util;

pub use crate::engine::Engine;
pub use crate::engine::EngineBuilder;
pub use crate::engine::Session;
pub use crate::engine::TxnError;
pub use crate::memory::{ChunkOffset, ObjectOffset, SlotOffset};
pub use crate::txn::log::{LogHandle, LogOperation, LogRecord, SharedView, TxnLog};
pub use crate::txn::safe_ts::SafeTsFailure;
pub use crate::txn::timestamp::Timestamp;
pub use crate::txn::watermark::WatermarkKind;
