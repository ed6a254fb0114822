//! Bit vectors stored as slices of `AtomicU64`.
//!
//! Bit `i` lives in word `i / 64` at position `i % 64`. Functions that take a `bit_limit`
//! only look at bits below the limit. Writers that may race with other writers on the same word
//! must use the `try_*` or `safe_*` variants, which go through compare-and-swap. The plain
//! [`set_bit_value`] is reserved for words with a single writer.

use crate::util::constants::{BITS_IN_WORD, LOG_BITS_IN_WORD};
use crate::util::retry::update_word;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocate a zeroed bitmap able to hold `bits` bits.
pub fn new_bitmap(bits: usize) -> Box<[AtomicU64]> {
    (0..words_for_bits(bits)).map(|_| AtomicU64::new(0)).collect()
}

/// The number of words needed to hold `bits` bits.
#[inline(always)]
pub const fn words_for_bits(bits: usize) -> usize {
    (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD
}

#[inline(always)]
fn word_index(bit: usize) -> usize {
    bit >> LOG_BITS_IN_WORD
}

#[inline(always)]
fn bit_mask(bit: usize) -> u64 {
    1u64 << (bit & (BITS_IN_WORD - 1))
}

/// A mask covering bits `[from, to)` of a single word, `0 <= from <= to <= 64`.
#[inline(always)]
fn range_mask(from: usize, to: usize) -> u64 {
    debug_assert!(from <= to && to <= BITS_IN_WORD);
    if to - from == BITS_IN_WORD {
        u64::MAX
    } else {
        ((1u64 << (to - from)) - 1) << from
    }
}

/// The position of the lowest set bit in `word`.
#[inline(always)]
pub fn find_first_set_bit_in_word(word: u64) -> Option<usize> {
    (word != 0).then(|| word.trailing_zeros() as usize)
}

/// The position of the highest set bit in `word`.
#[inline(always)]
pub fn find_last_set_bit_in_word(word: u64) -> Option<usize> {
    (word != 0).then(|| BITS_IN_WORD - 1 - word.leading_zeros() as usize)
}

/// Set or clear the bits of `mask` in `word`.
#[inline(always)]
pub fn apply_mask_to_word(word: u64, mask: u64, value: bool) -> u64 {
    if value {
        word | mask
    } else {
        word & !mask
    }
}

/// One compare-and-swap attempt to set or clear the bits of `mask`, starting from `expected`.
/// Returns `false` if the word no longer holds `expected`.
pub fn try_apply_mask_to_word(word: &AtomicU64, expected: u64, mask: u64, value: bool) -> bool {
    let new = apply_mask_to_word(expected, mask, value);
    word.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Set or clear the bits of `mask`, retrying until the update lands. Bits outside `mask` that
/// other threads set concurrently are preserved.
pub fn safe_apply_mask_to_word(word: &AtomicU64, mask: u64, value: bool) {
    let _ = update_word(word, |old| {
        let new = apply_mask_to_word(old, mask, value);
        (new != old).then_some(new)
    });
}

/// Read one bit.
#[inline]
pub fn is_bit_set(bitmap: &[AtomicU64], bit: usize) -> bool {
    bitmap[word_index(bit)].load(Ordering::SeqCst) & bit_mask(bit) != 0
}

/// Set or clear one bit with a plain read-modify-store. Only for words that no other thread
/// writes concurrently.
#[inline]
pub fn set_bit_value(bitmap: &[AtomicU64], bit: usize, value: bool) {
    let word = &bitmap[word_index(bit)];
    let new = apply_mask_to_word(word.load(Ordering::Relaxed), bit_mask(bit), value);
    word.store(new, Ordering::SeqCst);
}

/// One attempt to flip a bit to `value`. Returns `false` if the bit already holds `value` or if
/// the word changed underneath, so a `true` result means this call made the transition.
pub fn try_set_bit_value(bitmap: &[AtomicU64], bit: usize, value: bool) -> bool {
    let word = &bitmap[word_index(bit)];
    let old = word.load(Ordering::SeqCst);
    let mask = bit_mask(bit);
    if (old & mask != 0) == value {
        return false;
    }
    try_apply_mask_to_word(word, old, mask, value)
}

/// Set or clear one bit, retrying while other bits of the same word change concurrently.
#[inline]
pub fn safe_set_bit_value(bitmap: &[AtomicU64], bit: usize, value: bool) {
    safe_apply_mask_to_word(&bitmap[word_index(bit)], bit_mask(bit), value);
}

/// Set or clear `count` consecutive bits starting at `start`.
pub fn safe_set_bit_range_value(bitmap: &[AtomicU64], start: usize, count: usize, value: bool) {
    if count == 0 {
        return;
    }
    let end = start + count;
    let first_word = word_index(start);
    let last_word = word_index(end - 1);
    for index in first_word..=last_word {
        let from = if index == first_word { start & (BITS_IN_WORD - 1) } else { 0 };
        let to = if index == last_word {
            ((end - 1) & (BITS_IN_WORD - 1)) + 1
        } else {
            BITS_IN_WORD
        };
        safe_apply_mask_to_word(&bitmap[index], range_mask(from, to), value);
    }
}

/// The number of set bits below `bit_limit`.
pub fn count_set_bits(bitmap: &[AtomicU64], bit_limit: usize) -> usize {
    let full_words = word_index(bit_limit);
    let mut count: usize = bitmap[..full_words]
        .iter()
        .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
        .sum();
    let rest = bit_limit & (BITS_IN_WORD - 1);
    if rest != 0 {
        count += (bitmap[full_words].load(Ordering::SeqCst) & range_mask(0, rest)).count_ones()
            as usize;
    }
    count
}

/// The lowest clear bit in `[start, bit_limit)`.
pub fn find_first_unset_bit(bitmap: &[AtomicU64], start: usize, bit_limit: usize) -> Option<usize> {
    let mut bit = start;
    while bit < bit_limit {
        let index = word_index(bit);
        let from = bit & (BITS_IN_WORD - 1);
        let unset = !bitmap[index].load(Ordering::SeqCst) & range_mask(from, BITS_IN_WORD);
        if let Some(pos) = find_first_set_bit_in_word(unset) {
            let found = (index << LOG_BITS_IN_WORD) + pos;
            return (found < bit_limit).then_some(found);
        }
        bit = (index + 1) << LOG_BITS_IN_WORD;
    }
    None
}

/// The highest set bit below `bit_limit`.
pub fn find_last_set_bit(bitmap: &[AtomicU64], bit_limit: usize) -> Option<usize> {
    if bit_limit == 0 {
        return None;
    }
    let last_word = word_index(bit_limit - 1);
    let rest = bit_limit - (last_word << LOG_BITS_IN_WORD);
    (0..=last_word).rev().find_map(|index| {
        let mut word = bitmap[index].load(Ordering::SeqCst);
        if index == last_word {
            word &= range_mask(0, rest);
        }
        find_last_set_bit_in_word(word).map(|pos| (index << LOG_BITS_IN_WORD) + pos)
    })
}
