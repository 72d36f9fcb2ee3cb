use std::io;
use std::ptr::NonNull;

/// Granularity of explicit huge-page mappings.
pub const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
}

/// Abstract interface for operating-system memory primitives.
///
/// Implementations are zero-sized and selected at compile time; the
/// allocator is generic over them so tests can substitute failure modes
/// (see [`NoHugePageVmOps`]).
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    ///
    /// # Safety
    /// `size` must be non-zero. The range must later be freed with
    /// [`VmOps::release`] using the same size.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages, read/write) a range within a
    /// reservation.
    ///
    /// # Safety
    /// `[ptr, ptr + size)` must lie inside a live reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release a reservation entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr`/`size` must describe a whole range returned by `reserve` or
    /// `alloc_huge`.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;

    /// Supported page sizes, ascending, always including [`VmOps::page_size`].
    fn supported_page_sizes() -> Vec<usize>;

    /// Allocate memory backed by explicit huge pages (reserve + commit).
    ///
    /// Huge page allocations are physically backed immediately. Free with
    /// [`VmOps::release`].
    ///
    /// # Platform Notes
    /// - **Linux**: `MAP_HUGETLB | MAP_HUGE_2MB`. Requires pre-allocated
    ///   hugetlb pages (`/proc/sys/vm/nr_hugepages`).
    /// - **macOS `x86_64`**: XNU superpages (2MB only).
    /// - **macOS `aarch64`**: Not supported.
    /// - **Windows**: `MEM_LARGE_PAGES`. Requires `SeLockMemoryPrivilege`.
    ///
    /// # Safety
    /// `size` must be a non-zero multiple of `huge_page_size`, which must be a
    /// power of two.
    unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError>;

    /// General-purpose aligned allocation for sub-page requests.
    ///
    /// # Safety
    /// `align` must be a power of two and a multiple of the pointer size;
    /// `size` must be non-zero.
    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Free memory obtained from [`VmOps::alloc_aligned`].
    ///
    /// # Safety
    /// `ptr`, `size` and `align` must match the original `alloc_aligned` call.
    unsafe fn free_aligned(ptr: NonNull<u8>, size: usize, align: usize);
}

/// The operating system's VM primitives (heap-backed under loom and Miri).
pub struct PlatformVmOps;

/// Platform VM primitives whose huge pages are listed but never mappable.
///
/// `supported_page_sizes` advertises 2MB while every `alloc_huge` fails with
/// `Unsupported`, which is the empty-hugetlb-pool case on any host.
pub struct NoHugePageVmOps;

impl VmOps for NoHugePageVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded contract.
        unsafe { PlatformVmOps::reserve(size) }
    }

    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { PlatformVmOps::commit(ptr, size) }
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { PlatformVmOps::release(ptr, size) }
    }

    fn page_size() -> usize {
        PlatformVmOps::page_size()
    }

    fn supported_page_sizes() -> Vec<usize> {
        vec![Self::page_size(), PAGE_SIZE_2MB]
    }

    unsafe fn alloc_huge(_size: usize, _huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        Err(VmError::ReservationFailed(io::Error::new(
            io::ErrorKind::Unsupported,
            "huge pages disabled",
        )))
    }

    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded contract.
        unsafe { PlatformVmOps::alloc_aligned(size, align) }
    }

    unsafe fn free_aligned(ptr: NonNull<u8>, size: usize, align: usize) {
        // Safety: forwarded contract.
        unsafe { PlatformVmOps::free_aligned(ptr, size, align) }
    }
}

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PAGE_SIZE_2MB, PlatformVmOps, VmError, VmOps, io};
    use libc::{c_int, c_void};

    const PROT_RW: c_int = libc::PROT_READ | libc::PROT_WRITE;

    /// Extra mmap flags requesting 2MB pages, if the platform has any.
    ///
    /// Linux encodes log2(page size) at `MAP_HUGE_SHIFT` (26); XNU takes
    /// `VM_FLAGS_SUPERPAGE_SIZE_2MB` in the upper 16 bits.
    #[cfg(target_os = "linux")]
    const HUGE_2MB_FLAGS: Option<c_int> = Some(libc::MAP_HUGETLB | (21 << 26));
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    const HUGE_2MB_FLAGS: Option<c_int> = Some(1 << 16);
    #[cfg(all(target_os = "macos", not(target_arch = "x86_64")))]
    const HUGE_2MB_FLAGS: Option<c_int> = None;

    /// Private anonymous mapping of `size` bytes.
    unsafe fn map_anon(size: usize, prot: c_int, flags: c_int) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call; a fresh anonymous mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANON | flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
    }

    /// Page sizes the kernel exposes under /sys/kernel/mm/hugepages. A listed
    /// size can still fail to map when its pool (`nr_hugepages`) is empty.
    #[cfg(target_os = "linux")]
    fn probe_supported_page_sizes() -> Vec<usize> {
        let huge = std::fs::read_dir("/sys/kernel/mm/hugepages")
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let kb = name.to_str()?.strip_prefix("hugepages-")?.strip_suffix("kB")?;
                kb.parse::<usize>().ok().map(|kb| kb * 1024)
            });
        let mut sizes: Vec<usize> = std::iter::once(PlatformVmOps::page_size()).chain(huge).collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    #[cfg(target_os = "macos")]
    fn probe_supported_page_sizes() -> Vec<usize> {
        let mut sizes = vec![PlatformVmOps::page_size()];
        if HUGE_2MB_FLAGS.is_some() {
            sizes.push(PAGE_SIZE_2MB);
        }
        sizes
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: forwarded contract.
            unsafe { map_anon(size, libc::PROT_NONE, 0) }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            let addr = ptr.as_ptr().cast::<c_void>();
            // Safety: caller contract; the range lies in one of our mappings.
            if unsafe { libc::mprotect(addr, size, PROT_RW) } != 0 {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            // Advice is best effort; failures leave ordinary pages behind.
            #[cfg(target_os = "linux")]
            {
                if size >= PAGE_SIZE_2MB {
                    // Safety: same range as above.
                    unsafe { libc::madvise(addr, size, libc::MADV_HUGEPAGE) };
                }
                // Safety: same range as above.
                unsafe { libc::madvise(addr, size, libc::MADV_WILLNEED) };
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller contract; the range is a whole mapping.
            match unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), size) } {
                0 => Ok(()),
                _ => Err(VmError::ReleaseFailed(io::Error::last_os_error())),
            }
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
            })
        }

        fn supported_page_sizes() -> Vec<usize> {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<Vec<usize>> = OnceLock::new();
            CACHED.get_or_init(probe_supported_page_sizes).clone()
        }

        unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                huge_page_size.is_power_of_two() && size != 0 && size.is_multiple_of(huge_page_size),
                "alloc_huge: size {size} is not a non-zero multiple of {huge_page_size}"
            );
            let flags = HUGE_2MB_FLAGS.filter(|_| huge_page_size == PAGE_SIZE_2MB).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no {huge_page_size}-byte huge pages on this platform"),
                ))
            })?;
            // Safety: size is a non-zero multiple of the huge page size.
            unsafe { map_anon(size, PROT_RW, flags) }
        }

        unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let mut out: *mut c_void = std::ptr::null_mut();
            // Safety: caller contract; align is a power-of-two multiple of
            // the pointer size, as posix_memalign requires.
            match unsafe { libc::posix_memalign(&raw mut out, align, size) } {
                0 => NonNull::new(out.cast::<u8>()).ok_or_else(|| {
                    VmError::ReservationFailed(io::Error::other("posix_memalign returned null"))
                }),
                rc => Err(VmError::ReservationFailed(io::Error::from_raw_os_error(rc))),
            }
        }

        unsafe fn free_aligned(ptr: NonNull<u8>, _size: usize, _align: usize) {
            // Safety: caller contract; ptr came from posix_memalign.
            unsafe { libc::free(ptr.as_ptr().cast::<c_void>()) };
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps, io};
    use std::ffi::c_void;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const MEM_LARGE_PAGES: u32 = 0x2000_0000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(address: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(address: *mut c_void, size: usize, kind: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
        /// Minimum large page size, or 0 if large pages are not supported.
        fn GetLargePageMinimum() -> usize;
    }

    /// Null from a Win32 allocator becomes `err(GetLastError())`.
    fn non_null(ptr: *mut c_void, err: fn(io::Error) -> VmError) -> Result<NonNull<u8>, VmError> {
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| err(io::Error::last_os_error()))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call; a fresh reservation aliases nothing.
            let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
            non_null(ptr, VmError::ReservationFailed)
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller contract; the range lies in one of our reservations.
            let ptr = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
            non_null(ptr, VmError::CommitFailed).map(drop)
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE wants size 0 and the reservation base.
            // Safety: caller contract.
            match unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } {
                0 => Err(VmError::ReleaseFailed(io::Error::last_os_error())),
                _ => Ok(()),
            }
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                let mut info = std::mem::MaybeUninit::<SystemInfo>::zeroed();
                // Safety: GetSystemInfo fills the whole struct.
                let info = unsafe {
                    GetSystemInfo(info.as_mut_ptr());
                    info.assume_init()
                };
                info.page_size as usize
            })
        }

        fn supported_page_sizes() -> Vec<usize> {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<Vec<usize>> = OnceLock::new();
            CACHED
                .get_or_init(|| {
                    let base = Self::page_size();
                    // Safety: FFI call without arguments.
                    let large = unsafe { GetLargePageMinimum() };
                    let mut sizes = vec![base];
                    sizes.extend(Some(large).filter(|&l| l > base));
                    sizes
                })
                .clone()
        }

        unsafe fn alloc_huge(size: usize, huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                huge_page_size.is_power_of_two() && size != 0 && size.is_multiple_of(huge_page_size),
                "alloc_huge: size {size} is not a non-zero multiple of {huge_page_size}"
            );
            // Safety: FFI call without arguments.
            if unsafe { GetLargePageMinimum() } != huge_page_size {
                return Err(VmError::ReservationFailed(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("no {huge_page_size}-byte large pages on this system"),
                )));
            }
            // Large pages must be reserved and committed in one call.
            // Safety: FFI call; a fresh allocation aliases nothing.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_RESERVE | MEM_COMMIT | MEM_LARGE_PAGES,
                    PAGE_READWRITE,
                )
            };
            non_null(ptr, VmError::ReservationFailed)
        }

        unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: caller contract; align is a power of two.
            let ptr = unsafe { libc::aligned_malloc(size, align) };
            non_null(ptr.cast(), VmError::ReservationFailed)
        }

        unsafe fn free_aligned(ptr: NonNull<u8>, _size: usize, _align: usize) {
            // Safety: caller contract; ptr came from _aligned_malloc.
            unsafe { libc::aligned_free(ptr.as_ptr().cast()) };
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps for loom and Miri
//
// Under `cfg(loom)` we cannot issue real VM syscalls; Miri cannot model them.
// Every "reservation" is a plain heap allocation and `commit` is a no-op.
// Good enough to test the synchronization logic and unsafe pointer code;
// page-fault and huge-page behaviour is covered by the real implementations.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }

    fn supported_page_sizes() -> Vec<usize> {
        vec![4096]
    }

    unsafe fn alloc_huge(size: usize, _huge_page_size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: caller guarantees size > 0.
        unsafe { Self::reserve(size) }
    }

    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let layout = std::alloc::Layout::from_size_align(size, align)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn free_aligned(ptr: NonNull<u8>, size: usize, align: usize) {
        // Safety: caller passes the layout used by `alloc_aligned`.
        unsafe {
            std::alloc::dealloc(
                ptr.as_ptr(),
                std::alloc::Layout::from_size_align_unchecked(size, align),
            );
        }
    }
}
