//! One size class of the randomized heap.
//!
//! A partition owns a contiguous slice of the reserved region, divided into
//! equal slots. Allocation draws random slot indices and races on the
//! occupancy bitmap; because the live count is capped well below the slot
//! count, the expected number of probes stays constant. Freeing validates
//! the pointer against slot geometry and silently ignores anything that does
//! not check out, so corrupted or hostile frees cannot damage metadata.

use crate::memory::bitmap::OccupancyBitmap;
use crate::memory::rng;
use crate::memory::spinlock::SpinLock;
use crate::memory::stats;
use crate::memory::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Give up after this many random probes and let the caller escalate to a
/// larger size class. With occupancy capped at half, the chance of 24
/// consecutive collisions is below one in sixteen million.
const MAX_PROBE_ATTEMPTS: u32 = 24;

/// What a slot's bytes look like when handed out.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FillPolicy {
    /// Fresh slots are zero-filled.
    #[default]
    Zero,
    /// Fresh slots are scrambled with random bytes, so code that reads
    /// uninitialized memory sees different garbage on every run.
    Random,
}

/// Maps a raw random word to a slot index.
///
/// Power-of-two slot counts mask; anything else takes the modulus. Chosen
/// once at construction, so the hot path pays a single branch.
enum SlotIndexer {
    Mask(u64),
    Mod(u64),
}

impl SlotIndexer {
    fn for_count(count: usize) -> Self {
        if count.is_power_of_two() {
            SlotIndexer::Mask(count as u64 - 1)
        } else {
            SlotIndexer::Mod(count as u64)
        }
    }

    #[inline]
    fn pick(&self, word: u64) -> usize {
        match self {
            SlotIndexer::Mask(mask) => (word & mask) as usize,
            SlotIndexer::Mod(count) => (word % count) as usize,
        }
    }
}

pub(crate) struct Partition {
    slot_size: usize,
    base: NonNull<u8>,
    region_len: usize,
    slot_count: usize,
    indexer: SlotIndexer,
    bitmap: OccupancyBitmap,
    /// Hard cap on simultaneously live slots (load factor × slot count).
    threshold: usize,
    /// Live-slot count. In bounded mode this is the admission quota and is
    /// reserved *before* probing; otherwise it is informational.
    occupied: AtomicUsize,
    bounded: bool,
    fill: FillPolicy,
    initialized: AtomicBool,
    init_lock: SpinLock<()>,
}

// Safety: `base` points into a region that outlives the partition and all
// slot access is mediated by the bitmap's atomic transitions.
unsafe impl Send for Partition {}
// Safety: same; shared access races only on atomics.
unsafe impl Sync for Partition {}

impl Partition {
    /// # Safety
    /// `base` must point to at least `region_len` bytes of mapped writable
    /// memory that outlives the partition.
    pub(crate) unsafe fn new(
        slot_size: usize,
        base: NonNull<u8>,
        region_len: usize,
        threshold: usize,
        bounded: bool,
        fill: FillPolicy,
    ) -> Self {
        assert!(slot_size.is_power_of_two(), "slot size must be a power of two");
        let slot_count = region_len / slot_size;
        assert!(slot_count > 0, "region too small for even one slot");
        assert!(threshold > 0, "occupancy threshold must be positive");
        assert!(
            threshold <= slot_count,
            "threshold {threshold} exceeds slot count {slot_count}"
        );

        Self {
            slot_size,
            base,
            region_len,
            slot_count,
            indexer: SlotIndexer::for_count(slot_count),
            bitmap: OccupancyBitmap::reserve(slot_count),
            threshold,
            occupied: AtomicUsize::new(0),
            bounded,
            fill,
            initialized: AtomicBool::new(false),
            init_lock: SpinLock::new(()),
        }
    }

    #[inline]
    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Claim a random free slot, or None if the partition is at its cap or
    /// the probe budget runs out.
    pub(crate) fn alloc_slot(&self) -> Option<NonNull<u8>> {
        self.ensure_region_initialized();

        if self.bounded {
            // Reserve admission before probing so the threshold holds
            // exactly even when allocations race.
            if self
                .occupied
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < self.threshold).then_some(n + 1)
                })
                .is_err()
            {
                return None;
            }
        }

        for _ in 0..MAX_PROBE_ATTEMPTS {
            let index = self.indexer.pick(rng::next_random());
            if self.bitmap.try_set(index) {
                if !self.bounded {
                    self.occupied.fetch_add(1, Ordering::Relaxed);
                }
                // Safety: index < slot_count, so the slot lies inside the
                // mapped region.
                let slot = unsafe { self.base.as_ptr().add(index * self.slot_size) };
                self.scramble(slot);
                stats::SMALL_LIVE.add(1);
                // Safety: slot is derived from a NonNull base by in-bounds add.
                return Some(unsafe { NonNull::new_unchecked(slot) });
            }
        }

        if self.bounded {
            self.occupied.fetch_sub(1, Ordering::Relaxed);
        }
        None
    }

    /// Release a slot. Pointers that are out of range, not on a slot
    /// boundary, or already free are ignored without complaint; a hardened
    /// heap never lets a bad free become a write primitive.
    pub(crate) fn free_slot(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.region_len {
            return;
        }
        let offset = addr - base;
        if offset % self.slot_size != 0 {
            return;
        }
        let index = offset / self.slot_size;
        if !self.bitmap.reset(index) {
            return;
        }

        self.occupied.fetch_sub(1, Ordering::Relaxed);
        stats::SMALL_LIVE.sub(1);

        if self.slot_size >= PlatformVmOps::page_size() {
            // Best effort: give the physical pages back while keeping the
            // range mapped, so stale pointers still dereference (to zeros).
            // Safety: the slot lies inside our mapped region.
            let _ = unsafe { PlatformVmOps::dont_need(ptr, self.slot_size) };
        }
    }

    /// Live slots right now. Racy under concurrent mutation; for tests and
    /// diagnostics.
    pub(crate) fn live_slots(&self) -> usize {
        self.bitmap.count_ones()
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn scramble(&self, slot: *mut u8) {
        match self.fill {
            // Safety (both arms): slot points to slot_size writable bytes.
            FillPolicy::Zero => unsafe {
                std::ptr::write_bytes(slot, 0, self.slot_size);
            },
            FillPolicy::Random => unsafe {
                rng::fill_random(slot, self.slot_size);
            },
        }
    }

    /// First allocation in a partition pays the one-time region setup.
    /// Exactly one thread runs it; latecomers wait on the init lock.
    fn ensure_region_initialized(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.init_lock.lock();
        if self.initialized.load(Ordering::Relaxed) {
            return;
        }
        if self.fill == FillPolicy::Random {
            // Zero fill comes free from the anonymous mapping; random fill
            // has to touch every byte once.
            // Safety: the whole region is mapped and writable.
            unsafe { rng::fill_random(self.base.as_ptr(), self.region_len) };
        }
        self.initialized.store(true, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::{PlatformVmOps, VmOps};
    use std::collections::HashSet;
    use std::sync::Arc;

    struct Region {
        base: NonNull<u8>,
        len: usize,
    }

    impl Region {
        fn map(len: usize) -> Self {
            // Safety: Test code.
            let base = unsafe { PlatformVmOps::map(len).expect("map failed") };
            Self { base, len }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            // Safety: base/len came from map.
            unsafe { PlatformVmOps::unmap(self.base, self.len).expect("unmap failed") };
        }
    }

    fn partition(region: &Region, slot_size: usize, threshold: usize) -> Partition {
        // Safety: Test code; the region outlives the partition in each test.
        unsafe {
            Partition::new(
                slot_size,
                region.base,
                region.len,
                threshold,
                true,
                FillPolicy::Zero,
            )
        }
    }

    #[test]
    #[should_panic(expected = "threshold must be positive")]
    fn test_zero_threshold_panics() {
        let region = Region::map(4096);
        // Safety: Test code.
        let _ = unsafe {
            Partition::new(16, region.base, region.len, 0, true, FillPolicy::Zero)
        };
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_odd_slot_size_panics() {
        let region = Region::map(4096);
        // Safety: Test code.
        let _ = unsafe {
            Partition::new(24, region.base, region.len, 4, true, FillPolicy::Zero)
        };
    }

    #[test]
    #[should_panic(expected = "exceeds slot count")]
    fn test_threshold_above_capacity_panics() {
        let region = Region::map(4096);
        // Safety: Test code.
        let _ = unsafe {
            Partition::new(512, region.base, region.len, 100, true, FillPolicy::Zero)
        };
    }

    #[test]
    fn test_indexer_strategies() {
        let mask = SlotIndexer::for_count(64);
        let modulo = SlotIndexer::for_count(48);
        for word in [0u64, 1, 47, 63, 64, u64::MAX, 0xdead_beef_cafe_f00d] {
            assert!(mask.pick(word) < 64);
            assert!(modulo.pick(word) < 48);
        }
        assert_eq!(mask.pick(64), 0);
        assert_eq!(modulo.pick(48), 0);
        assert_eq!(modulo.pick(49), 1);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let part = partition(&region, 64, 32);

        let before = part.live_slots();
        let ptr = part.alloc_slot().expect("allocation should succeed");
        assert_eq!(part.live_slots(), before + 1);

        part.free_slot(ptr);
        assert_eq!(part.live_slots(), before);
    }

    #[test]
    fn test_threshold_is_a_hard_cap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(64 * 8);
        // 8 slots, cap at 4.
        let part = partition(&region, 64, 4);
        assert_eq!(part.slot_count(), 8);

        let live: Vec<_> = (0..4).map(|_| part.alloc_slot().expect("under cap")).collect();
        assert!(part.alloc_slot().is_none(), "5th allocation must be refused");

        part.free_slot(live[0]);
        assert!(part.alloc_slot().is_some(), "freeing reopens admission");
    }

    #[test]
    fn test_slots_are_distinct_and_aligned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let part = partition(&region, 128, 16);

        let mut seen = HashSet::new();
        for _ in 0..16 {
            let ptr = part.alloc_slot().expect("under cap");
            let offset = ptr.as_ptr() as usize - region.base.as_ptr() as usize;
            assert_eq!(offset % 128, 0, "slot must start on a slot boundary");
            assert!(seen.insert(ptr), "same slot handed out twice");
        }
    }

    #[test]
    fn test_misaligned_free_ignored() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let part = partition(&region, 64, 32);

        let ptr = part.alloc_slot().expect("alloc");
        let live = part.live_slots();

        // Interior pointer: not a slot boundary.
        // Safety: Test code; stays inside the region.
        let interior = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(7)) };
        part.free_slot(interior);
        assert_eq!(part.live_slots(), live, "misaligned free must be a no-op");

        part.free_slot(ptr);
        assert_eq!(part.live_slots(), live - 1);
    }

    #[test]
    fn test_double_free_tolerated() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let part = partition(&region, 64, 32);

        let a = part.alloc_slot().expect("alloc a");
        let b = part.alloc_slot().expect("alloc b");
        let live = part.live_slots();

        part.free_slot(a);
        part.free_slot(a); // second free of the same slot
        assert_eq!(part.live_slots(), live - 1, "double free must not over-release");

        // The other allocation is untouched.
        part.free_slot(b);
        assert_eq!(part.live_slots(), live - 2);
    }

    #[test]
    fn test_out_of_range_free_ignored() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let other = Region::map(4096);
        let part = partition(&region, 64, 32);

        let _held = part.alloc_slot().expect("alloc");
        let live = part.live_slots();

        part.free_slot(other.base);
        assert_eq!(part.live_slots(), live, "foreign pointer must be ignored");
    }

    #[test]
    fn test_zero_fill_policy() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        let part = partition(&region, 256, 8);

        let ptr = part.alloc_slot().expect("alloc");
        // Safety: Test code; slot is 256 writable bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xFF, 256);
        }
        part.free_slot(ptr);

        // Every subsequent handout from this partition must be zeroed, even
        // if it lands on the dirtied slot.
        for _ in 0..8 {
            let p = part.alloc_slot().expect("alloc");
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 256) };
            assert!(bytes.iter().all(|&b| b == 0), "slot must be zero-filled");
        }
    }

    #[test]
    fn test_random_fill_policy_scrambles() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(4096);
        // Safety: Test code.
        let part = unsafe {
            Partition::new(256, region.base, region.len, 8, true, FillPolicy::Random)
        };

        let ptr = part.alloc_slot().expect("alloc");
        // Safety: Test code.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 256) };
        let zeros = bytes.iter().filter(|&&b| b == 0).count();
        assert!(zeros < 64, "randomized slot should not be mostly zero");
    }

    #[test]
    fn test_unbounded_mode_ignores_threshold() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let region = Region::map(64 * 8);
        // Safety: Test code.
        let part = unsafe {
            Partition::new(64, region.base, region.len, 2, false, FillPolicy::Zero)
        };

        // With only the probe budget in the way, filling well past the
        // threshold succeeds with near certainty at 8 slots.
        let mut got = 0;
        for _ in 0..6 {
            if part.alloc_slot().is_some() {
                got += 1;
            }
        }
        assert!(got > 2, "unbounded partition must admit past the threshold");
    }

    #[test]
    fn test_concurrent_allocations_distinct() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        const THREADS: usize = 4;
        const PER_THREAD: usize = 64;

        let region = Region::map(1024 * 64);
        let part = Arc::new(partition(&region, 64, 512));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let part = Arc::clone(&part);
                std::thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| part.alloc_slot().expect("under cap").as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(all.insert(addr), "slot {addr:#x} handed out twice");
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(part.live_slots(), THREADS * PER_THREAD);
    }
}
