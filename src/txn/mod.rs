//! Transactions: the metadata table, the watermarks and the maintenance that moves them, and
//! the safe timestamps that keep maintenance from reclaiming what is still being read.

pub mod entry;
pub mod gc;
pub mod log;
pub mod metadata;
pub mod safe_ts;
pub mod timestamp;
pub mod validation;
pub mod watermark;
