//! Arenas: independent shards of the heap, each with its own bins.
//!
//! Every arena has two levels:
//! - **Fast lists**: per-class LIFO stacks of freed block headers behind a
//!   spin lock. Allocation pops, deallocation pushes. No region bookkeeping.
//! - **Bins**: the bitmap-tracked regions behind the arena mutex. Reached only
//!   when the fast list is empty (allocation) or full (deallocation with a
//!   `fast_list_limit`), or on explicit flush/trim.
//!
//! A block always returns to the arena that carved it (its header says which),
//! regardless of the freeing thread.

use std::ptr::NonNull;
use std::sync::PoisonError;

use super::bin::{Bin, ReclaimPolicy};
use super::error::{AllocError, CHECKED};
use super::region::{BlockHeader, RegionInfo};
use super::size_class::{NUM_SIZE_CLASSES, SIZE_CLASSES};
use super::stats;
use super::virtual_memory::VirtualMemory;
use super::vm::VmOps;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Mutex, SpinLock};

crate::sync::static_atomic! {
    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
}

/// Sequential id of the calling thread, assigned on first use.
pub fn current_thread_id() -> u64 {
    thread_local! {
        static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

/// Arena serving `thread_id` out of `arena_count`.
#[inline]
pub fn arena_index(thread_id: u64, arena_count: usize) -> usize {
    (thread_id.wrapping_mul(17) % arena_count as u64) as usize
}

struct FastLists {
    lists: Vec<Vec<NonNull<BlockHeader>>>,
}

// Safety: the headers point into chunks owned by the same arena; the lists
// are only touched under the spin lock.
unsafe impl Send for FastLists {}

pub(crate) struct Arena {
    id: u8,
    bins: Mutex<Vec<Bin>>,
    fast: SpinLock<FastLists>,
    fast_list_limit: Option<usize>,
    reclaim: ReclaimPolicy,
}

impl Arena {
    pub(crate) fn new(id: u8, fast_list_limit: Option<usize>, reclaim: ReclaimPolicy) -> Self {
        let bins = SIZE_CLASSES.iter().map(|&class| Bin::new(class, id)).collect();
        let lists = (0..NUM_SIZE_CLASSES).map(|_| Vec::new()).collect();
        Self {
            id,
            bins: Mutex::new(bins),
            fast: SpinLock::new(FastLists { lists }),
            fast_list_limit,
            reclaim,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id as usize
    }

    /// Allocate one block of class `class`.
    pub(crate) fn allocate<V: VmOps>(
        &self,
        vm: &VirtualMemory<V>,
        class: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let popped = self.fast.lock().lists[class].pop();
        let header = match popped {
            Some(header) => {
                stats::FAST_HITS.incr();
                header
            }
            None => {
                stats::SLOW_PATHS.incr();
                self.lock_bins()[class].allocate(vm)?
            }
        };
        // Safety: headers on fast lists and from bins are live block headers.
        unsafe { header.as_ref() }.mark_allocated()?;
        Ok(BlockHeader::payload(header))
    }

    /// Free a block this arena owns.
    ///
    /// # Safety
    /// `header` must be the header of a block carved by this arena for
    /// class `class`.
    pub(crate) unsafe fn deallocate<V: VmOps>(
        &self,
        vm: &VirtualMemory<V>,
        header: NonNull<BlockHeader>,
        class: usize,
    ) -> Result<(), AllocError> {
        // Safety: caller contract.
        let block = unsafe { header.as_ref() };
        debug_assert_eq!(block.arena(), self.id());

        if CHECKED && !self.lock_bins()[class].owns(header) {
            return Err(AllocError::invalid(format!(
                "block {:p} does not belong to size class {} of arena {}",
                BlockHeader::payload(header),
                SIZE_CLASSES[class].block_size,
                self.id
            )));
        }

        block.mark_free()?;

        {
            let mut fast = self.fast.lock();
            let list = &mut fast.lists[class];
            if self.fast_list_limit.is_none_or(|limit| list.len() < limit) {
                list.push(header);
                return Ok(());
            }
        }

        // Fast list full: return the block straight to its region.
        self.lock_bins()[class].deallocate(vm, block, self.reclaim)
    }

    /// Move every fast-list block back into its region.
    pub(crate) fn flush<V: VmOps>(&self, vm: &VirtualMemory<V>) -> Result<usize, AllocError> {
        let drained: Vec<Vec<NonNull<BlockHeader>>> = {
            let mut fast = self.fast.lock();
            fast.lists.iter_mut().map(std::mem::take).collect()
        };
        let mut bins = self.lock_bins();
        let mut moved = 0;
        for (class, list) in drained.into_iter().enumerate() {
            for header in list {
                // Safety: fast-list entries are live, Free block headers.
                bins[class].deallocate(vm, unsafe { header.as_ref() }, self.reclaim)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Flush, then unmap every fully free region that is not active.
    pub(crate) fn trim<V: VmOps>(&self, vm: &VirtualMemory<V>) -> Result<usize, AllocError> {
        self.flush(vm)?;
        let mut released = 0;
        for bin in self.lock_bins().iter_mut() {
            released += bin.trim(vm)?;
        }
        Ok(released)
    }

    /// Unmap all regions. Every outstanding block becomes dangling.
    pub(crate) fn release_all<V: VmOps>(&self, vm: &VirtualMemory<V>) -> Result<(), AllocError> {
        for list in self.fast.lock().lists.iter_mut() {
            list.clear();
        }
        for bin in self.lock_bins().iter_mut() {
            bin.release_all(vm)?;
        }
        Ok(())
    }

    pub(crate) fn regions(&self, class: usize) -> Vec<RegionInfo> {
        self.lock_bins()[class].region_infos()
    }

    pub(crate) fn fast_list_len(&self, class: usize) -> usize {
        self.fast.lock().lists[class].len()
    }

    /// Region id owning `header`, if it is one of ours.
    pub(crate) fn region_id_of(&self, header: NonNull<BlockHeader>, class: usize) -> Option<i64> {
        let bins = self.lock_bins();
        let bin = &bins[class];
        if !bin.owns(header) {
            return None;
        }
        // Safety: `owns` verified the header lies on a slot boundary of a live region.
        bin.region(unsafe { header.as_ref() }.region()).map(|r| r.id())
    }

    fn lock_bins(&self) -> crate::sync::MutexGuard<'_, Vec<Bin>> {
        self.bins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
