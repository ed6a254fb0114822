//! Every compare-and-swap loop in the crate goes through [`retry`], which spins with
//! exponential backoff between failed attempts and counts the failures.
//!
//! The loops are practically bounded, not formally bounded: an attempt only fails when another
//! thread made progress on the same word, so under realistic contention a small number of
//! attempts suffices. The counter exists to catch pathological contention in tests.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static RETRIES: AtomicUsize = AtomicUsize::new(0);

/// Run `attempt` until it returns `Some`, and return the value inside.
#[inline]
pub fn retry<T>(mut attempt: impl FnMut() -> Option<T>) -> T {
    let backoff = Backoff::new();
    loop {
        if let Some(value) = attempt() {
            return value;
        }
        RETRIES.fetch_add(1, Ordering::Relaxed);
        backoff.spin();
    }
}

/// Atomically replace the value of `word` with `update(old)`, retrying when the word changes
/// underneath. If `update` returns `None`, the word is left alone and `Err(old)` is returned.
/// On success, `Ok(old)` is returned.
///
/// This is `AtomicU64::fetch_update`, except that the failed attempts are counted.
#[inline]
pub fn update_word(word: &AtomicU64, mut update: impl FnMut(u64) -> Option<u64>) -> Result<u64, u64> {
    let mut current = word.load(Ordering::SeqCst);
    retry(|| match update(current) {
        None => Some(Err(current)),
        Some(new) => match word.compare_exchange_weak(current, new, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) => Some(Ok(old)),
            Err(actual) => {
                current = actual;
                None
            }
        },
    })
}

/// The number of failed attempts across all retry loops since the process started.
pub fn retry_count() -> usize {
    RETRIES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_returns_first_success() {
        let mut attempts = 0;
        let value = retry(|| {
            attempts += 1;
            if attempts == 3 {
                Some(attempts * 10)
            } else {
                None
            }
        });
        assert_eq!(value, 30);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_counts_failures() {
        let before = retry_count();
        let mut attempts = 0;
        retry(|| {
            attempts += 1;
            (attempts > 2).then_some(())
        });
        assert!(retry_count() >= before + 2);
    }

    #[test]
    fn update_word_installs_value() {
        let word = AtomicU64::new(5);
        assert_eq!(update_word(&word, |v| Some(v + 1)), Ok(5));
        assert_eq!(word.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn update_word_declines() {
        let word = AtomicU64::new(5);
        assert_eq!(update_word(&word, |v| (v > 10).then_some(0)), Err(5));
        assert_eq!(word.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn update_word_under_contention() {
        let word = AtomicU64::new(0);
        crossbeam::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..1000 {
                        update_word(&word, |v| Some(v + 1)).unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(word.load(Ordering::SeqCst), 4000);
    }
}
