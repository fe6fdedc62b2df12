//! Per-thread random source for slot placement and fill scrambling.
//!
//! Each thread owns an independent xorshift128+ stream seeded from the
//! platform entropy source. Streams are never shared, so drawing a random
//! number takes no atomic operations and the placement of one thread's
//! allocations tells an attacker nothing about another's.

use crate::memory::vm::{PlatformVmOps, VmOps};
use std::cell::Cell;

/// Two-word xorshift128+ generator.
///
/// Fast, full 64-bit output, and good enough statistically for placement
/// randomization. Not a CSPRNG on its own; unpredictability comes from the
/// OS-sourced seed.
#[derive(Clone, Copy)]
pub(crate) struct PlacementRng {
    s0: u64,
    s1: u64,
}

impl PlacementRng {
    /// Build a generator from two raw seed words.
    ///
    /// Seeds are passed through a splitmix64 scrambler so that correlated
    /// inputs (e.g. consecutive counter values) still produce well-mixed
    /// state. The all-zero state is a fixed point of the recurrence and is
    /// remapped to a nonzero constant.
    pub(crate) fn from_seed(a: u64, b: u64) -> Self {
        let s0 = splitmix64(a);
        let s1 = splitmix64(b ^ 0x6a09_e667_f3bc_c909);
        if s0 == 0 && s1 == 0 {
            Self {
                s0: 0x9e37_79b9_7f4a_7c15,
                s1: 1,
            }
        } else {
            Self { s0, s1 }
        }
    }

    pub(crate) fn from_entropy() -> Self {
        Self::from_seed(
            PlatformVmOps::random_seed(),
            PlatformVmOps::random_seed(),
        )
    }

    #[inline]
    pub(crate) fn next(&mut self) -> u64 {
        let mut t = self.s0;
        let s = self.s1;
        self.s0 = s;
        t ^= t << 23;
        t ^= t >> 18;
        t ^= s ^ (s >> 5);
        self.s1 = t;
        t.wrapping_add(s)
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

thread_local! {
    // Plain std Cell: the generator is strictly per-thread state.
    static THREAD_RNG: Cell<Option<PlacementRng>> = const { Cell::new(None) };
}

/// Draw one word from the calling thread's stream, seeding it lazily on
/// first use.
#[inline]
pub(crate) fn next_random() -> u64 {
    THREAD_RNG.with(|slot| {
        let mut rng = match slot.get() {
            Some(rng) => rng,
            None => PlacementRng::from_entropy(),
        };
        let word = rng.next();
        slot.set(Some(rng));
        word
    })
}

/// Overwrite `len` bytes at `ptr` with random data.
///
/// Writes two 64-bit words per iteration (the hot path for slot scrambling);
/// the tail is filled byte by byte.
///
/// # Safety
/// `ptr` must be valid for writes of `len` bytes.
pub(crate) unsafe fn fill_random(ptr: *mut u8, len: usize) {
    let mut cursor = ptr;
    let mut remaining = len;
    while remaining >= 16 {
        let lv1 = next_random();
        let lv2 = next_random();
        // Safety: at least 16 writable bytes remain at cursor.
        unsafe {
            cursor.cast::<u64>().write_unaligned(lv1);
            cursor.add(8).cast::<u64>().write_unaligned(lv2);
            cursor = cursor.add(16);
        }
        remaining -= 16;
    }
    if remaining > 0 {
        let mut word = next_random();
        for _ in 0..remaining {
            // Safety: remaining bytes at cursor are writable.
            unsafe {
                cursor.write(word as u8);
                cursor = cursor.add(1);
            }
            word >>= 8;
        }
    }
}
