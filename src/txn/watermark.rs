use crate::txn::timestamp::Timestamp;
use crate::util::retry::update_word;
use crossbeam::utils::CachePadded;
use enum_map::{Enum, EnumMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// The four watermarks, from the most advanced to the least advanced.
///
/// Every watermark only moves forward, and at every instant
/// `PreTruncate <= PostGc <= PostApply <= PreApply <= PostApply + 1`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, strum_macros::Display, strum_macros::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum WatermarkKind {
    /// Everything up to here has been (or is being) applied to the shared view.
    PreApply,
    /// Everything up to here has been applied to the shared view.
    PostApply,
    /// Every log up to here has been garbage collected.
    PostGc,
    /// Metadata entries strictly behind here may be reclaimed.
    PreTruncate,
}

pub struct Watermarks {
    values: EnumMap<WatermarkKind, CachePadded<AtomicU64>>,
}

impl Watermarks {
    pub fn new() -> Self {
        Watermarks {
            values: EnumMap::default(),
        }
    }

    #[inline]
    pub fn get(&self, kind: WatermarkKind) -> Timestamp {
        Timestamp::new(self.values[kind].load(Ordering::SeqCst))
    }

    /// Move the watermark to `ts`. Returns `false` if the watermark is already at or past `ts`;
    /// a loss to a concurrent advancer that made at least as much progress is not an error.
    pub fn advance(&self, kind: WatermarkKind, ts: Timestamp) -> bool {
        let advanced = update_word(&self.values[kind], |current| {
            (ts.as_u64() > current).then_some(ts.as_u64())
        })
        .is_ok();
        if advanced {
            trace!("Advanced {} to {}", kind, ts);
            probe::probe!(txcore, watermark_advance, kind as usize, ts.as_u64());
        }
        advanced
    }

    /// Read all four watermarks, least advanced first so that the snapshot satisfies the
    /// ordering invariant even while other threads advance them.
    pub fn snapshot(&self) -> EnumMap<WatermarkKind, Timestamp> {
        let pre_truncate = self.get(WatermarkKind::PreTruncate);
        let post_gc = self.get(WatermarkKind::PostGc);
        let post_apply = self.get(WatermarkKind::PostApply);
        let pre_apply = self.get(WatermarkKind::PreApply);
        enum_map::enum_map! {
            WatermarkKind::PreApply => pre_apply,
            WatermarkKind::PostApply => post_apply,
            WatermarkKind::PostGc => post_gc,
            WatermarkKind::PreTruncate => pre_truncate,
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Watermarks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

/// Check the ordering invariant on a snapshot.
pub fn is_well_ordered(snapshot: &EnumMap<WatermarkKind, Timestamp>) -> bool {
    use WatermarkKind::*;
    snapshot[PreTruncate] <= snapshot[PostGc]
        && snapshot[PostGc] <= snapshot[PostApply]
        && snapshot[PostApply] <= snapshot[PreApply]
        && snapshot[PreApply].as_u64() <= snapshot[PostApply].as_u64() + 1
}
