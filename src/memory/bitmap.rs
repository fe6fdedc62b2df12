//! Lock-free occupancy bitmap, one bit per slot.
//!
//! The bitmap is the only authority on whether a slot is live. Probes race on
//! it with compare-and-swap; exactly one contender wins any given 0→1 or 1→0
//! transition, which is what makes randomized placement safe without a lock.

use crate::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

pub(crate) struct OccupancyBitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl OccupancyBitmap {
    /// Allocate a zeroed bitmap covering `bits` slots.
    pub(crate) fn reserve(bits: usize) -> Self {
        let word_count = bits.div_ceil(BITS_PER_WORD);
        let words = (0..word_count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words, bits }
    }

    /// Clear every bit. Caller must ensure no concurrent probes.
    pub(crate) fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    fn locate(&self, index: usize) -> (&AtomicU64, u64) {
        debug_assert!(index < self.bits, "bit {index} out of range {}", self.bits);
        (&self.words[index / BITS_PER_WORD], 1u64 << (index % BITS_PER_WORD))
    }

    /// Attempt the 0→1 transition on `index`.
    ///
    /// Returns true iff this call set the bit. A false return means some
    /// other caller holds the slot.
    #[inline]
    pub(crate) fn try_set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            if current & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Attempt the 1→0 transition on `index`.
    ///
    /// Returns true iff this call cleared the bit. A false return is the
    /// double-free signal; the caller decides whether to tolerate it.
    #[inline]
    pub(crate) fn reset(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        let mut current = word.load(Ordering::Relaxed);
        loop {
            if current & mask == 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current & !mask,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    #[inline]
    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word, mask) = self.locate(index);
        word.load(Ordering::Relaxed) & mask != 0
    }

    /// Number of set bits. Diagnostic; racy under concurrent mutation.
    pub(crate) fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.bits
    }
}
