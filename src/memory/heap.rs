//! The full randomized heap: a reserved region sliced into per-size-class
//! partitions, plus a locked direct path for everything larger.
//!
//! Partition lookup on free is pure arithmetic (the partition size is a power
//! of two), so the heap keeps no per-object headers an attacker could forge.

use crate::memory::large::LargeObjectTable;
use crate::memory::partition::{FillPolicy, Partition};
use crate::memory::rng;
use crate::memory::spinlock::{CachePadded, SpinLock};
use crate::memory::stats;
use crate::memory::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::OnceLock;
use std::ptr::NonNull;

/// Heap geometry and hardening knobs.
///
/// The defaults reproduce the classic configuration: twelve size classes
/// from 8 bytes to 16 KB, 32 MB per partition, occupancy capped at half.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Bytes of address space per size class. Power of two.
    pub partition_size: usize,
    /// Number of size classes; consecutive classes double in slot size.
    pub class_count: usize,
    /// Slot size of the smallest class. Power of two, at least 8.
    pub min_slot_size: usize,
    /// Load-factor fraction (numerator, denominator) capping partition
    /// occupancy. Must be a proper fraction.
    pub load_factor: (usize, usize),
    /// When true the load-factor cap is enforced exactly; when false only
    /// the probe budget limits occupancy.
    pub bounded_occupancy: bool,
    /// Slot fill policy on hand-out.
    pub fill: FillPolicy,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            partition_size: 32 * 1024 * 1024,
            class_count: 12,
            min_slot_size: 8,
            load_factor: (1, 2),
            bounded_occupancy: true,
            fill: FillPolicy::Zero,
        }
    }
}

impl HeapConfig {
    /// Largest size served from a partition; anything bigger goes direct.
    pub fn max_object_size(&self) -> usize {
        self.min_slot_size << (self.class_count - 1)
    }

    fn validate(&self) {
        assert!(
            self.partition_size.is_power_of_two(),
            "partition size must be a power of two"
        );
        assert!(
            self.min_slot_size.is_power_of_two() && self.min_slot_size >= 8,
            "minimum slot size must be a power of two of at least 8"
        );
        assert!(self.class_count >= 1, "at least one size class required");
        let (num, den) = self.load_factor;
        assert!(num > 0 && num < den, "load factor must be a proper fraction");
        assert!(
            self.partition_size >= self.max_object_size(),
            "partition size must hold at least one slot of the largest class"
        );
        // Even the largest class must admit something.
        assert!(
            (num * self.partition_size) / (den * self.max_object_size()) > 0,
            "load factor rounds the largest class's threshold down to zero"
        );
    }
}

pub struct ScatterHeap {
    base: NonNull<u8>,
    total_size: usize,
    partition_size: usize,
    partition_shift: u32,
    min_slot_log: u32,
    max_object_size: usize,
    fill: FillPolicy,
    partitions: Box<[Partition]>,
    large: CachePadded<SpinLock<LargeObjectTable>>,
}

// Safety: partitions synchronize internally; the large table sits behind a
// spin lock.
unsafe impl Send for ScatterHeap {}
// Safety: same.
unsafe impl Sync for ScatterHeap {}

impl ScatterHeap {
    /// Reserve the whole region and carve it into partitions.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the region cannot be mapped. Invalid
    /// configuration is a programming error and panics.
    pub fn new(config: HeapConfig) -> Result<Self, VmError> {
        config.validate();

        let total_size = config.partition_size * config.class_count;
        // Safety: fresh anonymous mapping of total_size bytes.
        let base = unsafe { PlatformVmOps::map(total_size)? };
        stats::TOTAL_RESERVED.add(total_size);

        let (num, den) = config.load_factor;
        let partitions = (0..config.class_count)
            .map(|class| {
                let slot_size = config.min_slot_size << class;
                let threshold = (num * config.partition_size) / (den * slot_size);
                // Safety: each partition gets a disjoint slice of the region,
                // which lives until Drop.
                unsafe {
                    Partition::new(
                        slot_size,
                        NonNull::new_unchecked(
                            base.as_ptr().add(class * config.partition_size),
                        ),
                        config.partition_size,
                        threshold,
                        config.bounded_occupancy,
                        config.fill,
                    )
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            base,
            total_size,
            partition_size: config.partition_size,
            partition_shift: config.partition_size.trailing_zeros(),
            min_slot_log: config.min_slot_size.trailing_zeros(),
            max_object_size: config.max_object_size(),
            fill: config.fill,
            partitions,
            large: CachePadded(SpinLock::new(LargeObjectTable::new(
                config.max_object_size(),
            ))),
        })
    }

    pub fn max_object_size(&self) -> usize {
        self.max_object_size
    }

    /// Allocate `size` bytes at a randomized address.
    ///
    /// Small requests land in the matching size class; if its partition is
    /// at capacity the request escalates through the larger classes before
    /// falling back to a direct mapping. Returns None only when every path
    /// is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size > self.max_object_size {
            return self.alloc_direct(size);
        }
        for class in self.size_class(size)..self.partitions.len() {
            if let Some(ptr) = self.partitions[class].alloc_slot() {
                return Some(ptr);
            }
        }
        self.alloc_direct(size)
    }

    /// Return an allocation to the heap.
    ///
    /// Never fails and never reports: pointers the heap does not recognize
    /// are ignored, which is the whole point of a hardened free.
    pub fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if self.owns_addr(addr) {
            let class = (addr - self.base.as_ptr() as usize) >> self.partition_shift;
            self.partitions[class].free_slot(ptr);
        } else {
            self.free_direct(ptr);
        }
    }

    /// Usable bytes behind `ptr`, best effort.
    ///
    /// For region pointers this is the distance from `ptr` to the end of its
    /// slot, even for interior pointers and regardless of liveness. Direct
    /// allocations answer only for their exact base. None means the heap has
    /// never seen the address.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        if self.owns_addr(addr) {
            let offset = addr - self.base.as_ptr() as usize;
            let class = offset >> self.partition_shift;
            let slot = self.partitions[class].slot_size();
            return Some(slot - ((offset & (self.partition_size - 1)) % slot));
        }
        self.large.0.lock().lookup(addr).map(|entry| entry.size)
    }

    /// Whether `ptr` falls inside the reserved partition region.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.owns_addr(ptr.as_ptr() as usize)
    }

    /// Whether `ptr` came from this heap at all (region or direct path).
    pub fn allocated_here(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        self.owns_addr(addr) || self.large.0.lock().lookup(addr).is_some()
    }

    #[inline]
    fn owns_addr(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.total_size
    }

    #[inline]
    fn size_class(&self, size: usize) -> usize {
        let rounded = size.max(1usize << self.min_slot_log).next_power_of_two();
        (rounded.trailing_zeros() - self.min_slot_log) as usize
    }

    fn alloc_direct(&self, size: usize) -> Option<NonNull<u8>> {
        // Mappings at least max_object_size long keep the table's coarse
        // address indices collision-free.
        let len = size.max(self.max_object_size);
        let mut table = self.large.0.lock();
        // Safety: fresh anonymous mapping request.
        let ptr = unsafe { PlatformVmOps::map(len) }.ok()?;
        if self.fill == FillPolicy::Random {
            // Safety: the mapping is at least `size` writable bytes.
            unsafe { rng::fill_random(ptr.as_ptr(), size) };
        }
        table.insert(ptr.as_ptr() as usize, size);
        stats::LARGE_MAPPED.add(len);
        stats::LARGE_LIVE.add(1);
        Some(ptr)
    }

    fn free_direct(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let entry = self.large.0.lock().remove(addr);
        let Some(entry) = entry else {
            return; // unknown pointer; tolerated
        };
        let len = entry.size.max(self.max_object_size);
        // Unmapping a range we mapped ourselves cannot meaningfully fail;
        // diagnostics-grade tolerance either way.
        // Safety: the mapping was created by alloc_direct with this length.
        let _ = unsafe { PlatformVmOps::unmap(ptr, len) };
        stats::LARGE_MAPPED.sub(len);
        stats::LARGE_LIVE.sub(1);
    }

    #[cfg(test)]
    pub(crate) fn partition(&self, class: usize) -> &Partition {
        &self.partitions[class]
    }
}

impl Drop for ScatterHeap {
    fn drop(&mut self) {
        // Tear down any direct mappings still live, then the region.
        let entries = self.large.0.lock().drain();
        for entry in entries {
            let len = entry.size.max(self.max_object_size);
            if let Some(ptr) = NonNull::new(entry.base as *mut u8) {
                // Safety: mapping created by alloc_direct with this length.
                let _ = unsafe { PlatformVmOps::unmap(ptr, len) };
                stats::LARGE_MAPPED.sub(len);
                stats::LARGE_LIVE.sub(1);
            }
        }

        // Safety: the region was mapped in `new` with total_size.
        let _ = unsafe { PlatformVmOps::unmap(self.base, self.total_size) };
        stats::TOTAL_RESERVED.sub(self.total_size);
    }
}

static GLOBAL_HEAP: OnceLock<ScatterHeap> = OnceLock::new();

/// Process-wide heap handle.
///
/// The backing [`ScatterHeap`] is created on first use with the default
/// configuration, or explicitly via [`init_with`](Self::init_with). The raw
/// pointer entry points mirror a C allocation surface: null in, null out,
/// and release never fails.
pub struct GlobalScatterHeap;

impl GlobalScatterHeap {
    /// Initialize the global heap with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the heap already exists,
    /// or the mapping error if reservation fails.
    pub fn init_with(config: HeapConfig) -> Result<(), VmError> {
        GLOBAL_HEAP
            .set(ScatterHeap::new(config)?)
            .map_err(|_| VmError::InitializationFailed("already initialized".to_string()))
    }

    /// The global heap, created with defaults on first call if needed.
    ///
    /// # Panics
    ///
    /// Panics if the lazy reservation fails; a process that cannot map its
    /// heap region cannot continue.
    pub fn get() -> &'static ScatterHeap {
        GLOBAL_HEAP.get_or_init(|| match ScatterHeap::new(HeapConfig::default()) {
            Ok(heap) => heap,
            Err(e) => panic!("failed to reserve the global heap region: {e}"),
        })
    }

    /// Allocate `size` bytes; null on exhaustion.
    pub fn allocate(size: usize) -> *mut u8 {
        match Self::get().alloc(size) {
            Some(ptr) => ptr.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    /// Release a pointer. Always reports success: null, foreign, and
    /// already-freed pointers are all tolerated.
    pub fn release(ptr: *mut u8) -> bool {
        if let Some(ptr) = NonNull::new(ptr) {
            // A heap that was never created never handed out pointers;
            // nothing to do then either.
            if let Some(heap) = GLOBAL_HEAP.get() {
                heap.free(ptr);
            }
        }
        true
    }

    /// Usable size behind `ptr`, if the global heap recognizes it.
    pub fn size_of(ptr: *const u8) -> Option<usize> {
        let ptr = NonNull::new(ptr.cast_mut())?;
        GLOBAL_HEAP.get()?.size_of(ptr)
    }

    /// Whether `ptr` came from the global heap.
    pub fn owned(ptr: *const u8) -> bool {
        match (NonNull::new(ptr.cast_mut()), GLOBAL_HEAP.get()) {
            (Some(ptr), Some(heap)) => heap.allocated_here(ptr),
            _ => false,
        }
    }
}

// Safety: follows the GlobalAlloc contract; alignment above the page size is
// refused with null rather than mis-served.
unsafe impl std::alloc::GlobalAlloc for GlobalScatterHeap {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() > PlatformVmOps::page_size() {
            return std::ptr::null_mut();
        }
        // Power-of-two classes align slots to their size (capped at a page),
        // so rounding the request up to the alignment is sufficient.
        GlobalScatterHeap::allocate(layout.size().max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        GlobalScatterHeap::release(ptr);
    }
}
