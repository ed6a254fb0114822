//! Utilities shared by the transaction and memory modules.

/// Atomic bitmap primitives.
pub mod bitmap;
/// Constants for slots, chunks and pages.
pub mod constants;
/// The logger initialization.
pub mod logger;
/// Wrappers for raw memory operations.
pub mod memory;
/// Engine options.
pub mod options;
/// The CAS retry combinator.
pub mod retry;

#[cfg(test)]
pub(crate) mod test_util;
