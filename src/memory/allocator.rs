//! The allocator facade: routes requests to arenas or straight to the
//! virtual-memory layer.
//!
//! ```text
//! allocate(size, align)
//!   ├─ size == 0                      -> dangling sentinel
//!   ├─ align <= 16, size <= 8 MiB     -> arena of the calling thread
//!   │     ├─ fast list hit            -> pop
//!   │     └─ miss                     -> bin (maybe a new chunk)
//!   └─ otherwise                      -> VirtualMemory::reserve
//! ```

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

use super::arena::{Arena, arena_index, current_thread_id};
use super::bin::ReclaimPolicy;
use super::error::{AllocError, CHECKED};
use super::recorder::{AllocOp, EventSink, NoopSink};
use super::region::{BlockHeader, RegionInfo};
use super::size_class::{CLASS_ALIGN, SIZE_CLASSES, class_of};
use super::stats::{self, MemoryStats};
use super::virtual_memory::{VirtualMemory, normalize_alignment};
use super::vm::{PlatformVmOps, VmError, VmOps};

/// Arena headers store their arena index in a byte.
const MAX_ARENAS: usize = u8::MAX as usize;

#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Number of independent arenas threads are spread over.
    pub arena_count: usize,
    /// Cap on each per-class fast list; `None` is unbounded.
    pub fast_list_limit: Option<usize>,
    /// Fate of regions that become entirely free.
    pub reclaim: ReclaimPolicy,
    /// Try explicit huge pages for mappings of 2 MiB and up.
    pub use_huge_pages: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            arena_count: 8,
            fast_list_limit: None,
            reclaim: ReclaimPolicy::Retain,
            use_huge_pages: true,
        }
    }
}

/// Which part of the allocator serves a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Zero,
    Class(usize),
    Large,
}

#[inline]
fn route(size: usize, align: usize) -> Route {
    if size == 0 {
        return Route::Zero;
    }
    if align > CLASS_ALIGN {
        return Route::Large;
    }
    class_of(size).map_or(Route::Large, Route::Class)
}

#[inline]
fn dangling_for_align(align: usize) -> NonNull<u8> {
    debug_assert!(align.is_power_of_two());
    // Non-dereferenceable pointer used for zero-sized allocations.
    // Safety: align is non-zero (power of two).
    unsafe { NonNull::new_unchecked(std::ptr::without_provenance_mut(align)) }
}

#[inline]
#[track_caller]
fn caller_address() -> usize {
    std::ptr::from_ref(std::panic::Location::caller()) as usize
}

/// Owner of a size-classed block, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockOwner {
    pub arena: usize,
    pub region_id: i64,
    pub block_id: u64,
    pub block_size: usize,
}

/// General-purpose allocator sharded into arenas.
///
/// `V` selects the OS primitives, `S` receives allocation events.
/// All methods take `&self`; share it between threads by reference or `Arc`.
pub struct Allocator<V: VmOps = PlatformVmOps, S: EventSink = NoopSink> {
    vm: VirtualMemory<V>,
    arenas: Box<[Arena]>,
    sink: S,
    config: AllocatorConfig,
}

impl Allocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Never fails for the default configuration; kept fallible for symmetry
    /// with [`Allocator::with_config`].
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(AllocatorConfig::default())
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if `arena_count` is 0 or above 255.
    pub fn with_config(config: AllocatorConfig) -> Result<Self, AllocError> {
        Self::with_sink(config, NoopSink)
    }
}

impl<V: VmOps, S: EventSink> Allocator<V, S> {
    /// Create an allocator reporting to `sink`, over the OS primitives `V`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `arena_count` is 0 or above 255.
    pub fn with_sink(config: AllocatorConfig, sink: S) -> Result<Self, AllocError> {
        if config.arena_count == 0 || config.arena_count > MAX_ARENAS {
            return Err(AllocError::invalid(format!(
                "arena_count must be in 1..={MAX_ARENAS}, got {}",
                config.arena_count
            )));
        }
        let arenas = (0..config.arena_count)
            .map(|id| Arena::new(id as u8, config.fast_list_limit, config.reclaim))
            .collect();
        Ok(Self {
            vm: VirtualMemory::new(config.use_huge_pages),
            arenas,
            sink,
            config,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Arena the calling thread allocates from.
    pub fn current_arena(&self) -> usize {
        arena_index(current_thread_id(), self.arenas.len())
    }

    pub fn huge_pages_available(&self) -> bool {
        self.vm.huge_pages_available()
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// `size == 0` yields a non-null sentinel that must not be dereferenced
    /// and may be passed back to [`Allocator::deallocate`].
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the OS refuses memory; `InvalidArgument` for a
    /// non-power-of-two `align` in checked builds.
    #[track_caller]
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        self.allocate_as(AllocOp::New, size, align)
    }

    /// Allocate room for `count` elements of `elem_size` bytes.
    ///
    /// # Errors
    ///
    /// As [`Allocator::allocate`]; a total size that overflows is
    /// `OutOfMemory`.
    #[track_caller]
    pub fn allocate_array(
        &self,
        count: usize,
        elem_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let size = array_size(count, elem_size)?;
        self.allocate_as(AllocOp::NewArray, size, align)
    }

    /// Free a block, reporting problems instead of aborting.
    ///
    /// # Errors
    ///
    /// `CorruptionDetected` on a double free or damaged metadata (the heap
    /// must be considered lost); `InvalidArgument` in checked builds when the
    /// pointer/size/alignment triple does not match an allocation.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(size, align)` on this allocator.
    #[track_caller]
    pub unsafe fn try_deallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        // Safety: forwarded contract.
        unsafe { self.deallocate_as(AllocOp::Delete, ptr, size, align) }
    }

    /// Free a block. Corruption aborts the process; argument errors (checked
    /// builds only) panic.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(size, align)` on this allocator.
    #[track_caller]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        // Safety: forwarded contract.
        let result = unsafe { self.deallocate_as(AllocOp::Delete, ptr, size, align) };
        fail_hard(result);
    }

    /// Free an array from [`Allocator::allocate_array`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate_array(count, elem_size, align)`.
    #[track_caller]
    pub unsafe fn deallocate_array(
        &self,
        ptr: NonNull<u8>,
        count: usize,
        elem_size: usize,
        align: usize,
    ) {
        let result = array_size(count, elem_size)
            // Safety: forwarded contract.
            .and_then(|size| unsafe { self.deallocate_as(AllocOp::DeleteArray, ptr, size, align) });
        fail_hard(result);
    }

    /// Resize a block, preserving `min(old_size, new_size)` bytes.
    ///
    /// Stays in place when both sizes fall in the same size class.
    ///
    /// # Errors
    ///
    /// As [`Allocator::allocate`]; on error the old block is untouched.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(old_size, align)` on this allocator.
    #[track_caller]
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        align: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let normalized = normalize_alignment(align)?;
        let old_route = route(old_size, normalized);
        if old_route != Route::Large && old_route == route(new_size, normalized) {
            return Ok(ptr);
        }

        let new_ptr = self.allocate_as(AllocOp::New, new_size, align)?;
        let keep = old_size.min(new_size);
        if keep > 0 {
            // Safety: both blocks hold at least `keep` bytes and are distinct.
            unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), keep) };
        }
        // Safety: forwarded contract.
        unsafe { self.deallocate_as(AllocOp::Delete, ptr, old_size, align) }?;
        Ok(new_ptr)
    }

    /// Move every fast-list block of every arena back into its region.
    ///
    /// # Errors
    ///
    /// `CorruptionDetected` if a region rejects one of the blocks.
    pub fn flush(&self) -> Result<usize, AllocError> {
        self.arenas.iter().map(|a| a.flush(&self.vm)).sum()
    }

    /// Flush every arena and unmap regions that are entirely free. Returns
    /// the number of regions released.
    ///
    /// # Errors
    ///
    /// `CorruptionDetected` if metadata is inconsistent.
    pub fn trim(&self) -> Result<usize, AllocError> {
        self.arenas.iter().map(|a| a.trim(&self.vm)).sum()
    }

    /// Process-wide counters.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats::snapshot()
    }

    /// Regions of the class serving `size` in `arena`, lowest address first.
    pub fn regions(&self, arena: usize, size: usize) -> Vec<RegionInfo> {
        match (self.arenas.get(arena), class_of(size)) {
            (Some(a), Some(class)) => a.regions(class),
            _ => Vec::new(),
        }
    }

    /// Blocks parked on the fast list of the class serving `size` in `arena`.
    pub fn fast_list_len(&self, arena: usize, size: usize) -> usize {
        match (self.arenas.get(arena), class_of(size)) {
            (Some(a), Some(class)) => a.fast_list_len(class),
            _ => 0,
        }
    }

    /// Arena, region and block id of a size-classed allocation; `None` for
    /// sentinel and large-path pointers.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(size, align)` on this allocator.
    pub unsafe fn owner_of(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Option<BlockOwner> {
        let Route::Class(class) = route(size, normalize_alignment(align).ok()?) else {
            return None;
        };
        // Safety: caller contract; size-classed pointers carry a header.
        let header = unsafe { BlockHeader::from_payload(ptr) };
        // Safety: as above.
        let block = unsafe { header.as_ref() };
        let arena = self.arenas.get(block.arena())?;
        Some(BlockOwner {
            arena: arena.id(),
            region_id: arena.region_id_of(header, class)?,
            block_id: block.id(),
            block_size: SIZE_CLASSES[class].block_size,
        })
    }

    #[track_caller]
    fn allocate_as(&self, op: AllocOp, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let align = normalize_alignment(align)?;
        let ptr = match route(size, align) {
            Route::Zero => dangling_for_align(align),
            Route::Class(class) => self.arenas[self.current_arena()].allocate(&self.vm, class)?,
            Route::Large => {
                let ptr = self.vm.reserve(size, align)?;
                stats::LARGE_ALLOCS.incr();
                stats::LARGE_LIVE_BYTES.add(size);
                ptr
            }
        };
        if S::ENABLED {
            self.sink
                .record(op, ptr.as_ptr() as usize, size, align, caller_address());
        }
        Ok(ptr)
    }

    #[track_caller]
    unsafe fn deallocate_as(
        &self,
        op: AllocOp,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
    ) -> Result<(), AllocError> {
        let align = normalize_alignment(align)?;
        match route(size, align) {
            Route::Zero => {
                if CHECKED && ptr != dangling_for_align(align) {
                    return Err(AllocError::invalid(format!(
                        "{ptr:p} freed with size 0 but is not a zero-size sentinel"
                    )));
                }
            }
            Route::Class(class) => {
                // Safety: caller contract; size-classed pointers carry a header.
                let header = unsafe { BlockHeader::from_payload(ptr) };
                // Safety: as above.
                let owner = unsafe { header.as_ref() }.arena();
                let Some(arena) = self.arenas.get(owner) else {
                    return Err(AllocError::corruption(format!(
                        "{ptr:p} names arena {owner}, only {} exist",
                        self.arenas.len()
                    )));
                };
                // Safety: the header names this arena as its owner.
                unsafe { arena.deallocate(&self.vm, header, class) }?;
            }
            Route::Large => {
                // Safety: caller contract.
                unsafe { self.vm.release(ptr, size, align) }?;
                stats::LARGE_LIVE_BYTES.sub(size);
            }
        }
        if S::ENABLED {
            self.sink
                .record(op, ptr.as_ptr() as usize, size, align, caller_address());
        }
        Ok(())
    }
}

impl<V: VmOps, S: EventSink> Drop for Allocator<V, S> {
    fn drop(&mut self) {
        for arena in self.arenas.iter() {
            if let Err(e) = arena.release_all(&self.vm) {
                #[cfg(debug_assertions)]
                eprintln!("[memory] releasing arena {} failed: {e}", arena.id());
                #[cfg(not(debug_assertions))]
                let _ = e;
            }
        }
    }
}

fn array_size(count: usize, elem_size: usize) -> Result<usize, AllocError> {
    count.checked_mul(elem_size).ok_or_else(|| {
        AllocError::oom(
            usize::MAX,
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("array of {count} x {elem_size} bytes overflows"),
            )),
        )
    })
}

#[track_caller]
fn fail_hard(result: Result<(), AllocError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_fatal() => abort_on(&e),
        Err(e) => panic!("deallocate: {e}"),
    }
}

fn abort_on(e: &AllocError) -> ! {
    eprintln!("[memory] fatal: {e}");
    std::process::abort()
}

// Safety: `alloc` returns blocks of at least `layout.size()` bytes aligned to
// `layout.align()`, and `dealloc` only accepts what `alloc` returned. The
// allocator's own metadata lives on the system heap, so this impl is for
// explicit use (e.g. through `Allocator` APIs of collections), not as
// `#[global_allocator]`.
unsafe impl<V: VmOps, S: EventSink> GlobalAlloc for Allocator<V, S> {
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout.size(), layout.align())
            .map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: GlobalAlloc contract; ptr came from `alloc(layout)`.
            unsafe { self.deallocate(ptr, layout.size(), layout.align()) };
        }
    }

    #[track_caller]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return std::ptr::null_mut();
        };
        // Safety: GlobalAlloc contract; ptr came from `alloc(layout)`.
        match unsafe { self.reallocate(ptr, layout.size(), layout.align(), new_size) } {
            Ok(p) => p.as_ptr(),
            Err(e) if e.is_fatal() => abort_on(&e),
            Err(_) => std::ptr::null_mut(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::recorder::TraceRecorder;
    use crate::sync::Arc;

    fn fill(ptr: NonNull<u8>, size: usize, byte: u8) {
        // Safety: Test code.
        unsafe { ptr.as_ptr().write_bytes(byte, size) };
    }

    fn check(ptr: NonNull<u8>, size: usize, byte: u8) {
        // Safety: Test code.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == byte));
    }

    #[test]
    fn test_routes() {
        assert_eq!(route(0, 16), Route::Zero);
        assert_eq!(route(1, 8), Route::Class(0));
        assert_eq!(route(64, 16), Route::Class(class_of(64).unwrap()));
        assert_eq!(route(64, 32), Route::Large);
        assert_eq!(route((8 << 20) + 1, 16), Route::Large);
    }

    #[test]
    fn test_invalid_config() {
        for arena_count in [0, 256] {
            let config = AllocatorConfig {
                arena_count,
                ..Default::default()
            };
            assert!(matches!(
                Allocator::with_config(config),
                Err(AllocError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_zero_size_sentinel() {
        let alloc = Allocator::new().unwrap();
        let p = alloc.allocate(0, 64).unwrap();
        assert_eq!(p.as_ptr() as usize, 64);
        // Safety: Test code.
        unsafe { alloc.try_deallocate(p, 0, 64).unwrap() };
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_bad_alignment_rejected_in_checked_builds() {
        let alloc = Allocator::new().unwrap();
        assert!(matches!(alloc.allocate(64, 3), Err(AllocError::InvalidArgument(_))));
        assert!(matches!(alloc.allocate(64, 0), Err(AllocError::InvalidArgument(_))));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "deallocate: invalid argument")]
    fn test_deallocate_panics_on_non_sentinel_zero_size() {
        let alloc = Allocator::new().unwrap();
        let p = alloc.allocate(64, 16).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(p, 0, 16) };
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "deallocate: invalid argument")]
    fn test_deallocate_panics_on_class_block_freed_as_large() {
        let alloc = Allocator::new().unwrap();
        let p = alloc.allocate(64, 16).unwrap();
        // Safety: Test code.
        unsafe { alloc.deallocate(p, 16 << 20, 16) };
    }

    #[test]
    fn test_array_overflow_is_out_of_memory() {
        let alloc = Allocator::new().unwrap();
        let err = alloc.allocate_array(usize::MAX / 2, 3, 8).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
    }

    #[test]
    fn test_reallocate_in_place_and_moving() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = Allocator::new().unwrap();
        let p = alloc.allocate(100, 16).unwrap();
        fill(p, 100, 0x11);

        // 100 and 112 share the 112-byte class.
        // Safety: Test code.
        let same = unsafe { alloc.reallocate(p, 100, 16, 112).unwrap() };
        assert_eq!(same, p);

        // Safety: Test code.
        let grown = unsafe { alloc.reallocate(same, 112, 16, 5000).unwrap() };
        assert_ne!(grown, p);
        check(grown, 100, 0x11);

        // Safety: Test code.
        let huge = unsafe { alloc.reallocate(grown, 5000, 16, 9 << 20).unwrap() };
        check(huge, 100, 0x11);
        // Safety: Test code.
        let shrunk = unsafe { alloc.reallocate(huge, 9 << 20, 16, 8).unwrap() };
        check(shrunk, 8, 0x11);
        // Safety: Test code.
        unsafe { alloc.deallocate(shrunk, 8, 16) };
    }

    #[test]
    fn test_owner_of_reports_current_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = Allocator::new().unwrap();
        let p = alloc.allocate(640, 16).unwrap();
        // Safety: Test code.
        let owner = unsafe { alloc.owner_of(p, 640, 16) }.unwrap();
        assert_eq!(owner.arena, alloc.current_arena());
        assert_eq!(owner.block_size, 640);
        let regions = alloc.regions(owner.arena, 640);
        assert!(regions.iter().any(|r| r.id == owner.region_id));

        let big = alloc.allocate(16 << 20, 16).unwrap();
        // Safety: Test code.
        unsafe {
            assert_eq!(alloc.owner_of(big, 16 << 20, 16), None);
            alloc.deallocate(big, 16 << 20, 16);
            alloc.deallocate(p, 640, 16);
        }
    }

    #[test]
    fn test_events_recorded_with_call_site() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let recorder = Arc::new(TraceRecorder::new());
        let alloc: Allocator<PlatformVmOps, _> =
            Allocator::with_sink(AllocatorConfig::default(), Arc::clone(&recorder)).unwrap();

        let a = alloc.allocate(24, 8).unwrap();
        let b = alloc.allocate_array(10, 4, 4).unwrap();
        // Safety: Test code.
        unsafe {
            alloc.deallocate_array(b, 10, 4, 4);
            alloc.deallocate(a, 24, 8);
        }

        let events = recorder.drain();
        let ops: Vec<AllocOp> = events.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            [AllocOp::New, AllocOp::NewArray, AllocOp::DeleteArray, AllocOp::Delete]
        );
        assert_eq!(events[0].ptr, a.as_ptr() as u64);
        assert_eq!(events[1].size, 40);
        assert_eq!(events[3].ptr, events[0].ptr);
        // Different call sites, different caller addresses.
        assert_ne!(events[0].caller, events[1].caller);
        assert!(events.iter().all(|e| e.caller != 0));
    }

    #[test]
    fn test_global_alloc_impl() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = Allocator::new().unwrap();
        let layout = Layout::from_size_align(300, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let p = GlobalAlloc::alloc(&alloc, layout);
            assert!(!p.is_null());
            p.write_bytes(7, 300);
            let q = GlobalAlloc::realloc(&alloc, p, layout, 3000);
            assert!(!q.is_null());
            assert_eq!(*q.add(299), 7);
            GlobalAlloc::dealloc(&alloc, q, Layout::from_size_align(3000, 8).unwrap());
        }
    }
}
