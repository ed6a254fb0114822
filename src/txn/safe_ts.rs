//! Safe timestamps stop metadata truncation from passing entries a worker is still reading.
//!
//! Each registered worker owns an index into the registry and publishes at most one timestamp
//! there. Truncation never advances `PreTruncate` past the lowest published timestamp.
//!
//! Truncation runs in two steps. It first raises the truncation ceiling to its candidate, then
//! rescans the published timestamps and advances `PreTruncate` to the candidate capped by the
//! rescan. A reservation is published first and validated against the ceiling afterwards; if the
//! ceiling already passed it, the reservation fails and the caller has to derive a fresh
//! timestamp. Either the rescan sees the reservation, or the reservation sees the raised ceiling.
//!
//! Every index has two publication slots. A new reservation goes into the slot not holding the
//! current one, so the old reservation stays visible until the new one is validated, and a failed
//! reservation leaves the old one in force.

use crate::txn::timestamp::Timestamp;
use crate::txn::watermark::{WatermarkKind, Watermarks};
use crate::util::bitmap;
use crate::util::retry::{retry, update_word};
use atomic::Atomic;
use crossbeam::utils::CachePadded;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The requested timestamp is behind the truncation ceiling; its metadata may already be gone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SafeTsFailure {
    pub requested: Timestamp,
    pub ceiling: Timestamp,
}

impl fmt::Display for SafeTsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot reserve safe timestamp {}: truncation may already have reached {}",
            self.requested, self.ceiling
        )
    }
}

impl std::error::Error for SafeTsFailure {}

type SafeTsEntry = CachePadded<[Atomic<Timestamp>; 2]>;

const FIRST_TIMESTAMP: Timestamp = Timestamp::new(1);

pub struct SafeTsRegistry {
    entries: Box<[SafeTsEntry]>,
    reserved_indexes: Box<[AtomicU64]>,
    /// Never below `PreTruncate`. Reservations below it fail.
    ceiling: CachePadded<AtomicU64>,
    watermarks: Arc<Watermarks>,
}

impl SafeTsRegistry {
    pub fn new(max_workers: usize, watermarks: Arc<Watermarks>) -> Self {
        SafeTsRegistry {
            entries: (0..max_workers)
                .map(|_| CachePadded::new([Atomic::new(Timestamp::INVALID), Atomic::new(Timestamp::INVALID)]))
                .collect(),
            reserved_indexes: bitmap::new_bitmap(max_workers),
            ceiling: CachePadded::new(AtomicU64::new(0)),
            watermarks,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.entries.len()
    }

    pub fn watermarks(&self) -> &Watermarks {
        &self.watermarks
    }

    /// Claim an index for the calling worker. Returns `None` if every index is taken.
    pub fn register(&self) -> Option<SafeTsSlot<'_>> {
        let index = retry(|| match bitmap::find_first_unset_bit(&self.reserved_indexes, 0, self.max_workers()) {
            None => Some(None),
            Some(index) => bitmap::try_set_bit_value(&self.reserved_indexes, index, true).then_some(Some(index)),
        })?;
        trace!("Reserved safe timestamp index {}", index);
        Some(SafeTsSlot {
            registry: self,
            index,
            values: RefCell::new(vec![]),
        })
    }

    /// The lowest timestamp published by any worker.
    pub fn min_published(&self) -> Option<Timestamp> {
        self.entries
            .iter()
            .flat_map(|entry| entry.iter())
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|ts| ts.is_valid())
            .min()
    }

    /// The furthest `PreTruncate` may advance right now: `PostGc`, capped by every published
    /// safe timestamp.
    pub fn safe_truncation_ts(&self) -> Timestamp {
        let post_gc = self.watermarks.get(WatermarkKind::PostGc);
        match self.min_published() {
            Some(min) => post_gc.min(min),
            None => post_gc,
        }
    }

    /// The lowest timestamp a reservation can still succeed for.
    pub fn ceiling(&self) -> Timestamp {
        Timestamp::new(self.ceiling.load(Ordering::SeqCst))
    }

    /// Advance `PreTruncate` as far as the published timestamps allow, and return its new value.
    /// Entries strictly behind the returned value are no longer protected by anyone.
    pub fn advance_pre_truncate(&self) -> Timestamp {
        let candidate = self.safe_truncation_ts();
        let _ = update_word(&self.ceiling, |current| {
            (candidate.as_u64() > current).then_some(candidate.as_u64())
        });
        // Reservations that published before the ceiling moved are visible now.
        let bound = match self.min_published() {
            Some(min) => candidate.min(min),
            None => candidate,
        };
        self.watermarks.advance(WatermarkKind::PreTruncate, bound);
        self.watermarks.get(WatermarkKind::PreTruncate)
    }

    fn publish(&self, index: usize, ts: Timestamp) -> Result<(), SafeTsFailure> {
        debug_assert!(ts.is_valid());
        let entry = &self.entries[index];
        let first = entry[0].load(Ordering::SeqCst);
        let second = entry[1].load(Ordering::SeqCst);
        debug_assert!(
            !first.is_valid() || !second.is_valid(),
            "Both safe timestamp slots of {} are in use",
            index
        );
        let (new, old) = if first.is_valid() { (1, 0) } else { (0, 1) };

        entry[new].store(ts, Ordering::SeqCst);
        let ceiling = self.ceiling();
        if ts < ceiling {
            entry[new].store(Timestamp::INVALID, Ordering::SeqCst);
            return Err(SafeTsFailure {
                requested: ts,
                ceiling,
            });
        }
        entry[old].store(Timestamp::INVALID, Ordering::SeqCst);
        Ok(())
    }

    fn unpublish(&self, index: usize) {
        for slot in self.entries[index].iter() {
            slot.store(Timestamp::INVALID, Ordering::SeqCst);
        }
    }

    fn release_index(&self, index: usize) {
        self.unpublish(index);
        bitmap::safe_set_bit_value(&self.reserved_indexes, index, false);
        trace!("Released safe timestamp index {}", index);
    }
}

/// A worker's handle on its registry index. Not shareable between threads.
///
/// Guards created by [`SafeTsSlot::protect`] nest: the slot publishes the lowest timestamp any
/// live guard protects.
pub struct SafeTsSlot<'a> {
    registry: &'a SafeTsRegistry,
    index: usize,
    values: RefCell<Vec<Timestamp>>,
}

impl<'a> SafeTsSlot<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publish `ts`, replacing this worker's current reservation. On failure the current
    /// reservation stays in force.
    pub fn reserve(&self, ts: Timestamp) -> Result<(), SafeTsFailure> {
        self.registry.publish(self.index, ts)
    }

    /// Withdraw this worker's reservation. Releasing twice is a no-op.
    pub fn release_safe_ts(&self) {
        self.registry.unpublish(self.index);
    }

    /// Protect `ts` until the returned guard is dropped.
    pub fn protect(&self, ts: Timestamp) -> Result<SafeTs<'_, 'a>, SafeTsFailure> {
        self.protect_unguarded(ts)?;
        Ok(SafeTs { slot: self, ts })
    }

    /// Protect `ts` until a matching [`unprotect`](Self::unprotect). For protections that outlive
    /// a lexical scope, such as a transaction's begin timestamp.
    pub fn protect_unguarded(&self, ts: Timestamp) -> Result<(), SafeTsFailure> {
        let mut values = self.values.borrow_mut();
        let old_min = values.iter().min().copied();
        if old_min.map_or(true, |min| ts < min) {
            self.reserve(ts)?;
        }
        values.push(ts);
        Ok(())
    }

    /// Protect the current value of a watermark, or the truncation ceiling if that is higher
    /// (only ever the case for `PreTruncate`). Cannot fail: if the ceiling passes the value read,
    /// the watermark has moved too, and the fresh value is protected instead.
    pub fn protect_watermark(&self, kind: WatermarkKind) -> SafeTs<'_, 'a> {
        retry(|| {
            let ts = self
                .registry
                .watermarks
                .get(kind)
                .max(self.registry.ceiling())
                .max(FIRST_TIMESTAMP);
            self.protect(ts).ok()
        })
    }

    pub fn unprotect(&self, ts: Timestamp) {
        let mut values = self.values.borrow_mut();
        let position = values.iter().position(|v| *v == ts);
        debug_assert!(position.is_some(), "{} is not protected", ts);
        if let Some(position) = position {
            values.swap_remove(position);
        }
        match values.iter().min() {
            None => self.release_safe_ts(),
            Some(min) if *min > ts => {
                // Raising the reservation cannot fail: the old one held truncation at or below it.
                let result = self.reserve(*min);
                debug_assert!(result.is_ok(), "Failed to raise safe timestamp: {:?}", result);
            }
            Some(_) => {}
        }
    }
}

impl Drop for SafeTsSlot<'_> {
    fn drop(&mut self) {
        self.registry.release_index(self.index);
    }
}

/// Keeps a timestamp published while alive.
pub struct SafeTs<'s, 'a> {
    slot: &'s SafeTsSlot<'a>,
    ts: Timestamp,
}

impl SafeTs<'_, '_> {
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

impl Drop for SafeTs<'_, '_> {
    fn drop(&mut self) {
        self.slot.unprotect(self.ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_workers: usize) -> SafeTsRegistry {
        SafeTsRegistry::new(max_workers, Arc::new(Watermarks::new()))
    }

    #[test]
    fn register_until_full() {
        let registry = registry(2);
        let a = registry.register().unwrap();
        let b = registry.register().unwrap();
        assert_ne!(a.index(), b.index());
        assert!(registry.register().is_none());
        drop(a);
        assert!(registry.register().is_some());
    }

    #[test]
    fn reserve_and_release() {
        let registry = registry(2);
        let slot = registry.register().unwrap();
        assert_eq!(registry.min_published(), None);
        slot.reserve(Timestamp::new(10)).unwrap();
        assert_eq!(registry.min_published(), Some(Timestamp::new(10)));
        // A new reservation replaces the old one.
        slot.reserve(Timestamp::new(20)).unwrap();
        assert_eq!(registry.min_published(), Some(Timestamp::new(20)));
        slot.release_safe_ts();
        assert_eq!(registry.min_published(), None);
        slot.release_safe_ts();
        assert_eq!(registry.min_published(), None);
    }

    fn advance_gc_to(registry: &SafeTsRegistry, ts: u64) {
        use WatermarkKind::*;
        for kind in [PreApply, PostApply, PostGc] {
            registry.watermarks().advance(kind, Timestamp::new(ts));
        }
    }

    #[test]
    fn reserve_behind_ceiling_fails_and_keeps_old() {
        let registry = registry(1);
        let slot = registry.register().unwrap();
        slot.reserve(Timestamp::new(10)).unwrap();
        advance_gc_to(&registry, 8);
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(8));
        let err = slot.reserve(Timestamp::new(5)).unwrap_err();
        assert_eq!(err.requested, Timestamp::new(5));
        assert_eq!(err.ceiling, Timestamp::new(8));
        assert_eq!(registry.min_published(), Some(Timestamp::new(10)));
        // Exactly at the ceiling is still protectable.
        slot.reserve(Timestamp::new(8)).unwrap();
        assert_eq!(registry.min_published(), Some(Timestamp::new(8)));
        slot.release_safe_ts();
    }

    #[test]
    fn pre_truncate_stops_at_reservation() {
        let registry = registry(2);
        let slot = registry.register().unwrap();
        slot.reserve(Timestamp::new(10)).unwrap();
        advance_gc_to(&registry, 1010);
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(10));
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(10));
        slot.release_safe_ts();
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(1010));
    }

    #[test]
    fn safe_truncation_ts_is_capped() {
        let registry = registry(2);
        advance_gc_to(&registry, 100);
        assert_eq!(registry.safe_truncation_ts(), Timestamp::new(100));
        let slot = registry.register().unwrap();
        slot.reserve(Timestamp::new(40)).unwrap();
        assert_eq!(registry.safe_truncation_ts(), Timestamp::new(40));
        slot.release_safe_ts();
        assert_eq!(registry.safe_truncation_ts(), Timestamp::new(100));
    }

    #[test]
    fn nested_guards_publish_minimum() {
        let registry = registry(1);
        let slot = registry.register().unwrap();
        {
            let outer = slot.protect(Timestamp::new(30)).unwrap();
            assert_eq!(outer.timestamp(), Timestamp::new(30));
            {
                let _inner = slot.protect(Timestamp::new(10)).unwrap();
                assert_eq!(registry.min_published(), Some(Timestamp::new(10)));
                {
                    let _innermost = slot.protect(Timestamp::new(50)).unwrap();
                    assert_eq!(registry.min_published(), Some(Timestamp::new(10)));
                }
                assert_eq!(registry.min_published(), Some(Timestamp::new(10)));
            }
            assert_eq!(registry.min_published(), Some(Timestamp::new(30)));
        }
        assert_eq!(registry.min_published(), None);
    }

    #[test]
    fn failed_guard_leaves_outer_guard_in_force() {
        let registry = registry(1);
        let slot = registry.register().unwrap();
        let _outer = slot.protect(Timestamp::new(30)).unwrap();
        advance_gc_to(&registry, 20);
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(20));
        assert!(slot.protect(Timestamp::new(10)).is_err());
        assert_eq!(registry.min_published(), Some(Timestamp::new(30)));
    }

    #[test]
    fn protect_watermark_follows_value() {
        let registry = registry(1);
        let slot = registry.register().unwrap();
        {
            // Timestamp 0 is never allocated; the first real timestamp is protected instead.
            let guard = slot.protect_watermark(WatermarkKind::PostGc);
            assert_eq!(guard.timestamp(), Timestamp::new(1));
            assert_eq!(registry.min_published(), Some(Timestamp::new(1)));
        }
        assert_eq!(registry.min_published(), None);
        advance_gc_to(&registry, 7);
        assert_eq!(registry.advance_pre_truncate(), Timestamp::new(7));
        let guard = slot.protect_watermark(WatermarkKind::PostGc);
        assert_eq!(guard.timestamp(), Timestamp::new(7));
        assert_eq!(registry.min_published(), Some(Timestamp::new(7)));
    }
}
