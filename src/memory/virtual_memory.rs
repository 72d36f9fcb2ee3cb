//! Thin layer over [`VmOps`] that turns `(size, align)` requests into OS
//! mappings and gives them back again.
//!
//! Three backings, chosen purely by size so `release` can re-derive them:
//!
//! | size                    | backing                                        |
//! |-------------------------|------------------------------------------------|
//! | `< page_size`           | `VmOps::alloc_aligned` (posix_memalign & co.)  |
//! | `page_size .. 2MB`      | reserve + commit, [`AllocationHeader`] in front |
//! | `>= 2MB`                | explicit huge pages, else as above             |
//!
//! Mapped backings over-reserve by `align + HEADER_SIZE`, place the returned
//! pointer at the first suitably aligned address past the header, and record
//! the true mapping base and length in the header.

use std::marker::PhantomData;
use std::ptr::NonNull;

use super::error::{AllocError, CHECKED};
use super::stats;
use super::vm::{PAGE_SIZE_2MB, PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicBool, Ordering};

/// Requests at or above this size try explicit huge pages first.
pub const HUGE_THRESHOLD: usize = PAGE_SIZE_2MB;

/// Alignment substituted for malformed alignments in unchecked builds.
pub const DEFAULT_ALIGN: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct AllocationHeader {
    base: *mut u8,
    /// Mapping length; bit 0 set when backed by explicit huge pages.
    len_and_flags: usize,
}

const HEADER_SIZE: usize = size_of::<AllocationHeader>();
const HUGE_FLAG: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Backing {
    Aligned,
    Pages,
    HugePages,
}

/// Runtime huge-page availability. Starts on when the platform lists a 2MB
/// page size; the first failed `alloc_huge` turns it off for the lifetime of
/// the owning instance.
struct HugePageProbe {
    should_try: AtomicBool,
}

impl HugePageProbe {
    fn new(enabled: bool) -> Self {
        Self {
            should_try: AtomicBool::new(enabled),
        }
    }

    fn should_try(&self) -> bool {
        self.should_try.load(Ordering::Relaxed)
    }

    fn mark_unavailable(&self, err: &VmError) {
        if self.should_try.swap(false, Ordering::Relaxed) {
            #[cfg(debug_assertions)]
            eprintln!(
                "[memory] 2MB huge pages probed unavailable at runtime ({err}); \
                 falling back to standard pages"
            );
            #[cfg(not(debug_assertions))]
            let _ = err;
        }
    }
}

pub struct VirtualMemory<V: VmOps = PlatformVmOps> {
    huge: HugePageProbe,
    _ops: PhantomData<fn() -> V>,
}

impl<V: VmOps> VirtualMemory<V> {
    pub fn new(use_huge_pages: bool) -> Self {
        let listed = use_huge_pages && V::supported_page_sizes().contains(&PAGE_SIZE_2MB);
        Self {
            huge: HugePageProbe::new(listed),
            _ops: PhantomData,
        }
    }

    /// Whether huge-page-eligible requests will still attempt huge pages.
    pub fn huge_pages_available(&self) -> bool {
        self.huge.should_try()
    }

    pub fn page_size() -> usize {
        V::page_size()
    }

    pub(crate) fn backing_for(size: usize) -> Backing {
        if size < V::page_size() {
            Backing::Aligned
        } else if size < HUGE_THRESHOLD {
            Backing::Pages
        } else {
            Backing::HugePages
        }
    }

    /// Map `size` bytes aligned to `align`.
    pub fn reserve(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::invalid("zero-size reservation"));
        }
        let align = normalize_alignment(align)?;

        match Self::backing_for(size) {
            Backing::Aligned => {
                // Safety: size is non-zero and align is a power of two no
                // smaller than a pointer.
                let ptr = unsafe { V::alloc_aligned(size, align) }
                    .map_err(|e| AllocError::oom(size, e))?;
                stats::TOTAL_RESERVED.add(size);
                Ok(ptr)
            }
            Backing::Pages => self.map_with_header(size, align, false),
            Backing::HugePages => self.map_with_header(size, align, true),
        }
    }

    /// Give back a range obtained from [`VirtualMemory::reserve`].
    ///
    /// # Safety
    /// `ptr` must come from `reserve(size, align)` on an instance using the
    /// same `VmOps`, and must not be used afterwards.
    pub unsafe fn release(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        if size == 0 {
            return Err(AllocError::invalid("zero-size release"));
        }
        let align = normalize_alignment(align)?;

        if Self::backing_for(size) == Backing::Aligned {
            // Safety: caller contract; same size and normalized alignment.
            unsafe { V::free_aligned(ptr, size, align) };
            stats::TOTAL_RESERVED.sub(size);
            return Ok(());
        }

        // Safety: mapped backings always have a header right before `ptr`.
        let header = unsafe {
            ptr.as_ptr()
                .sub(HEADER_SIZE)
                .cast::<AllocationHeader>()
                .read()
        };
        let len = header.len_and_flags & !HUGE_FLAG;
        let huge = header.len_and_flags & HUGE_FLAG != 0;

        if CHECKED {
            let base = header.base as usize;
            let user = ptr.as_ptr() as usize;
            let expected_len = mapping_len::<V>(size, align).and_then(|total| {
                if huge {
                    total.checked_next_multiple_of(PAGE_SIZE_2MB)
                } else {
                    Some(total)
                }
            });
            let sane = base != 0
                && base.is_multiple_of(V::page_size())
                && expected_len == Some(len)
                && base
                    .checked_add(HEADER_SIZE)
                    .and_then(|b| b.checked_next_multiple_of(align))
                    == Some(user);
            if !sane {
                return Err(AllocError::invalid(format!(
                    "{ptr:p} (size {size}) was not returned by a page mapping"
                )));
            }
        }

        let Some(base) = NonNull::new(header.base) else {
            return Err(AllocError::corruption(format!(
                "mapping header before {ptr:p} has a null base"
            )));
        };
        // Safety: header written by `map_with_header` for this mapping.
        unsafe { V::release(base, len) }
            .map_err(|e| AllocError::corruption(format!("releasing {ptr:p}: {e}")))?;

        stats::TOTAL_RESERVED.sub(len);
        if huge {
            stats::HUGE_PAGE_MAPPINGS.sub(1);
        }
        Ok(())
    }

    fn map_with_header(
        &self,
        size: usize,
        align: usize,
        huge_eligible: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = mapping_len::<V>(size, align).ok_or_else(|| size_overflow(size))?;

        let mut mapping = None;
        if huge_eligible && self.huge.should_try() {
            let huge_total = total
                .checked_next_multiple_of(PAGE_SIZE_2MB)
                .ok_or_else(|| size_overflow(size))?;
            // Safety: huge_total is a non-zero multiple of the 2MB page size.
            match unsafe { V::alloc_huge(huge_total, PAGE_SIZE_2MB) } {
                Ok(base) => {
                    stats::HUGE_PAGE_MAPPINGS.incr();
                    mapping = Some((base, huge_total | HUGE_FLAG));
                }
                Err(e) => {
                    self.huge.mark_unavailable(&e);
                    stats::HUGE_PAGE_FALLBACKS.incr();
                }
            }
        }

        let (base, len_and_flags) = match mapping {
            Some(m) => m,
            None => (map_pages::<V>(total).map_err(|e| AllocError::oom(size, e))?, total),
        };
        stats::TOTAL_RESERVED.add(len_and_flags & !HUGE_FLAG);

        let offset = user_offset(base.as_ptr() as usize, align);
        // Safety: offset + size <= total by construction of `total`.
        let user = unsafe { base.as_ptr().add(offset) };
        // Safety: offset >= HEADER_SIZE, so the header lies inside the mapping.
        unsafe {
            user.sub(HEADER_SIZE)
                .cast::<AllocationHeader>()
                .write(AllocationHeader {
                    base: base.as_ptr(),
                    len_and_flags,
                });
        }
        // Safety: derived from a non-null mapping base.
        Ok(unsafe { NonNull::new_unchecked(user) })
    }
}

/// Standard-page mapping length for a `(size, align)` request. Huge-page
/// mappings round this up to the next 2MB.
fn mapping_len<V: VmOps>(size: usize, align: usize) -> Option<usize> {
    size.checked_add(align)?
        .checked_add(HEADER_SIZE)?
        .checked_next_multiple_of(V::page_size())
}

/// Distance from a mapping base to the first `align`-aligned address that
/// leaves room for the header.
fn user_offset(base: usize, align: usize) -> usize {
    (base + HEADER_SIZE).next_multiple_of(align) - base
}

fn map_pages<V: VmOps>(len: usize) -> Result<NonNull<u8>, VmError> {
    // Safety: len is a non-zero page multiple.
    let base = unsafe { V::reserve(len) }?;
    // Safety: committing the whole fresh reservation.
    if let Err(e) = unsafe { V::commit(base, len) } {
        // Safety: the reservation is unused.
        let _ = unsafe { V::release(base, len) };
        return Err(e);
    }
    Ok(base)
}

fn size_overflow(size: usize) -> AllocError {
    AllocError::oom(
        size,
        VmError::ReservationFailed(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "request size overflows the address space",
        )),
    )
}

/// Validate and normalize a requested alignment.
///
/// Powers of two are raised to at least pointer size. Anything else is an
/// `InvalidArgument` in checked builds and [`DEFAULT_ALIGN`] otherwise.
pub fn normalize_alignment(align: usize) -> Result<usize, AllocError> {
    if !align.is_power_of_two() {
        if CHECKED {
            return Err(AllocError::invalid(format!(
                "alignment {align} is not a power of two"
            )));
        }
        return Ok(DEFAULT_ALIGN);
    }
    Ok(align.max(size_of::<usize>()))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::vm::NoHugePageVmOps;

    fn touch(ptr: NonNull<u8>, size: usize) {
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().add(size - 1).write(0x5A);
            ptr.as_ptr().write(0xA5);
            assert_eq!(ptr.as_ptr().read(), 0xA5);
            if size > 1 {
                assert_eq!(ptr.as_ptr().add(size - 1).read(), 0x5A);
            }
        }
    }

    #[test]
    fn test_normalize_alignment() {
        assert_eq!(normalize_alignment(1).unwrap(), size_of::<usize>());
        assert_eq!(normalize_alignment(16).unwrap(), 16);
        assert_eq!(normalize_alignment(4096).unwrap(), 4096);
        if CHECKED {
            assert!(matches!(normalize_alignment(0), Err(AllocError::InvalidArgument(_))));
            assert!(matches!(normalize_alignment(24), Err(AllocError::InvalidArgument(_))));
        } else {
            assert_eq!(normalize_alignment(24).unwrap(), DEFAULT_ALIGN);
        }
    }

    #[test]
    fn test_backing_selection() {
        let page = VirtualMemory::<PlatformVmOps>::page_size();
        type Vm = VirtualMemory<PlatformVmOps>;
        assert_eq!(Vm::backing_for(1), Backing::Aligned);
        assert_eq!(Vm::backing_for(page - 1), Backing::Aligned);
        assert_eq!(Vm::backing_for(page), Backing::Pages);
        assert_eq!(Vm::backing_for(HUGE_THRESHOLD - 1), Backing::Pages);
        assert_eq!(Vm::backing_for(HUGE_THRESHOLD), Backing::HugePages);
    }

    #[test]
    fn test_reserve_release_every_backing() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = VirtualMemory::<PlatformVmOps>::new(true);
        let page = VirtualMemory::<PlatformVmOps>::page_size();
        for size in [1, 100, page - 1, page, 3 * page + 5, HUGE_THRESHOLD - 1, HUGE_THRESHOLD, HUGE_THRESHOLD + 1] {
            for align in [16usize, 64, 4096, 64 * 1024] {
                let ptr = vm.reserve(size, align).unwrap();
                assert_eq!(ptr.as_ptr() as usize % align, 0, "size {size} align {align}");
                touch(ptr, size);
                // Safety: Test code.
                unsafe { vm.release(ptr, size, align).unwrap() };
            }
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        let vm = VirtualMemory::<PlatformVmOps>::new(false);
        assert!(matches!(vm.reserve(0, 16), Err(AllocError::InvalidArgument(_))));
    }

    #[test]
    fn test_overflow_is_out_of_memory() {
        let vm = VirtualMemory::<PlatformVmOps>::new(false);
        let err = vm.reserve(usize::MAX - 8, 16).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }), "{err}");
    }

    #[test]
    fn test_huge_failure_falls_back_to_standard_pages() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let vm = VirtualMemory::<NoHugePageVmOps>::new(true);
        assert!(vm.huge_pages_available());

        let before = stats::HUGE_PAGE_FALLBACKS.get();
        let size = 4 * 1024 * 1024;
        let ptr = vm.reserve(size, 16).unwrap();
        touch(ptr, size);
        assert!(!vm.huge_pages_available());
        assert_eq!(stats::HUGE_PAGE_FALLBACKS.get(), before + 1);

        // Probe is sticky: the next request goes straight to standard pages.
        let second = vm.reserve(size, 16).unwrap();
        assert_eq!(stats::HUGE_PAGE_FALLBACKS.get(), before + 1);

        // Safety: Test code.
        unsafe {
            vm.release(ptr, size, 16).unwrap();
            vm.release(second, size, 16).unwrap();
        }
    }

    #[test]
    fn test_probe_starts_from_listed_page_sizes() {
        let listed = PlatformVmOps::supported_page_sizes().contains(&PAGE_SIZE_2MB);
        assert_eq!(VirtualMemory::<PlatformVmOps>::new(true).huge_pages_available(), listed);
        assert!(!VirtualMemory::<PlatformVmOps>::new(false).huge_pages_available());
    }

    #[test]
    fn test_disabled_huge_pages_never_attempted() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let vm = VirtualMemory::<NoHugePageVmOps>::new(false);
        let before = stats::HUGE_PAGE_FALLBACKS.get();
        let ptr = vm.reserve(HUGE_THRESHOLD, 16).unwrap();
        assert_eq!(stats::HUGE_PAGE_FALLBACKS.get(), before);
        // Safety: Test code.
        unsafe { vm.release(ptr, HUGE_THRESHOLD, 16).unwrap() };
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_release_with_wrong_size_is_rejected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let vm = VirtualMemory::<PlatformVmOps>::new(false);
        let page = VirtualMemory::<PlatformVmOps>::page_size();
        let ptr = vm.reserve(page, 16).unwrap();
        // Claiming a far larger size than was mapped must not unmap anything.
        // Safety: Test code.
        let err = unsafe { vm.release(ptr, 64 * page, 16) }.unwrap_err();
        assert!(matches!(err, AllocError::InvalidArgument(_)));
        // Safety: Test code.
        unsafe { vm.release(ptr, page, 16).unwrap() };
    }
}
