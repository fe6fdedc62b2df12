use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    AdviseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
            VmError::UnmapFailed(e) => write!(f, "VM unmapping failed: {e}"),
            VmError::AdviseFailed(e) => write!(f, "VM advise failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::UnmapFailed(e) | VmError::AdviseFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Map a readable/writable anonymous region.
    /// Returns a pointer to the start of the mapped range.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a region entirely (after which pointers into it are invalid).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Tell the kernel the physical backing of a range is no longer needed.
    /// The logical mapping survives; the next touch faults in zero pages.
    unsafe fn dont_need(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;

    /// Number of online processors. Consumed by spin-lock backoff tuning.
    fn num_processors() -> usize;

    /// One word of true randomness from the OS.
    ///
    /// Must never fail: if the OS source is unavailable the implementation
    /// falls back to clock/address mixing, which is weaker but still usable
    /// as seed material.
    fn random_seed() -> u64;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use libc;
    use std::io;

    /// Linux: getrandom(2), non-blocking once the pool is initialized.
    #[cfg(target_os = "linux")]
    fn os_random_seed() -> Option<u64> {
        let mut seed: u64 = 0;
        // Safety: FFI call to getrandom; the buffer is a local u64.
        let got = unsafe {
            libc::getrandom(
                std::ptr::addr_of_mut!(seed).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
                0,
            )
        };
        if got == std::mem::size_of::<u64>() as libc::ssize_t {
            Some(seed)
        } else {
            None
        }
    }

    /// macOS: arc4random_buf never fails.
    #[cfg(target_os = "macos")]
    fn os_random_seed() -> Option<u64> {
        let mut seed: u64 = 0;
        // Safety: FFI call to arc4random_buf; the buffer is a local u64.
        unsafe {
            libc::arc4random_buf(
                std::ptr::addr_of_mut!(seed).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            );
        }
        Some(seed)
    }

    /// Last-resort seed: monotonic clock mixed with a stack address (ASLR
    /// contributes entropy to the latter). Only reached if getrandom fails.
    fn fallback_seed() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: FFI call to clock_gettime with a valid out-pointer.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        let clock = (ts.tv_sec as u64).wrapping_mul(1_000_000_000) ^ (ts.tv_nsec as u64);
        let stack_probe = 0u8;
        let addr = std::ptr::addr_of!(stack_probe) as u64;
        splitmix64(clock ^ addr.rotate_left(32))
    }

    fn splitmix64(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    }

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn dont_need(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_DONTNEED on anonymous private mappings drops the physical
            // pages; subsequent touches fault in zero-filled pages. The address
            // range remains valid, so outstanding pointers stay dereferenceable.
            // Safety: FFI call to madvise.
            if unsafe {
                libc::madvise(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::MADV_DONTNEED,
                )
            } != 0
            {
                return Err(VmError::AdviseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }

        fn num_processors() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
                if raw < 1 {
                    1
                } else {
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    {
                        raw as usize
                    }
                }
            })
        }

        fn random_seed() -> u64 {
            os_random_seed().unwrap_or_else(fallback_seed)
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every "mapping"
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`),
// which also matches mmap's zero-fill guarantee.
//
// `dont_need` is an intentional no-op: heap memory has no page-level backing
// to drop, and freed slots must stay dereferenceable just like the real thing.
//
// Seeds come from a process-global counter run through a mixer, so models are
// reproducible without being degenerate (all threads seeing the same stream).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn dont_need(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; heap memory remains accessible
    }

    fn page_size() -> usize {
        4096
    }

    fn num_processors() -> usize {
        2
    }

    fn random_seed() -> u64 {
        // Plain std atomic on purpose: seeding is not a synchronization
        // point loom should explore, and Miri has no loom types anyway.
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0x5eed_0000_0000_0001);
        let mut x = NEXT.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("Map failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformVmOps::unmap(ptr, size).expect("Unmap failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0) };
        assert!(result.is_err(), "Mapping 0 bytes should fail");
    }

    #[test]
    fn test_map_is_zero_filled() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("Map failed");
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(
                slice.iter().all(|&b| b == 0),
                "anonymous mapping must be zero-filled"
            );
            PlatformVmOps::unmap(ptr, size).expect("Unmap failed");
        }
    }

    #[test]
    fn test_dont_need_keeps_range_accessible() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("Map failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 0xAA;

            PlatformVmOps::dont_need(ptr, size).expect("Advise failed");

            // The range must still be dereferenceable; on Linux the touch
            // faults in a fresh zero page.
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 0x42;
            assert_eq!(slice[0], 0x42);

            PlatformVmOps::unmap(ptr, size).expect("Unmap failed");
        }
    }

    #[test]
    fn test_partial_dont_need() {
        let page_size = PlatformVmOps::page_size();
        let total = page_size * 4;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(total).expect("Map failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), total);
            for b in slice.iter_mut() {
                *b = 0x55;
            }

            // Drop only the middle two pages.
            let middle = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();
            PlatformVmOps::dont_need(middle, page_size * 2).expect("Advise failed");

            // Outer pages keep their data.
            assert_eq!(*ptr.as_ptr(), 0x55);
            assert_eq!(*ptr.as_ptr().add(total - 1), 0x55);

            PlatformVmOps::unmap(ptr, total).expect("Unmap failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_num_processors_nonzero() {
        assert!(PlatformVmOps::num_processors() >= 1);
    }

    #[test]
    fn test_map_very_large() {
        // 1GB of untouched anonymous mapping is cheap on 64-bit systems.
        let size = 1024 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size).expect("Failed to map 1GB");
            PlatformVmOps::unmap(ptr, size).expect("Unmap failed");
        }
    }

    #[test]
    fn test_multiple_mappings() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::map(page_size).expect("Map 1 failed");
            let ptr2 = PlatformVmOps::map(page_size).expect("Map 2 failed");

            assert_ne!(ptr1, ptr2);

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            assert_eq!(*(ptr1.as_ptr()), 1);
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::unmap(ptr1, page_size).expect("Unmap 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::unmap(ptr2, page_size).expect("Unmap 2 failed");
        }
    }

    #[test]
    fn test_random_seed_varies() {
        // Two draws colliding is a 2^-64 event; treat it as failure.
        let a = PlatformVmOps::random_seed();
        let b = PlatformVmOps::random_seed();
        assert_ne!(a, b, "consecutive seeds should differ");
    }
}
