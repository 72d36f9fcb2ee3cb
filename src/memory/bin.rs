use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ptr::NonNull;

use super::error::{AllocError, CHECKED};
use super::region::{BlockHeader, Chunk, Region, RegionInfo};
use super::size_class::SizeClass;
use super::virtual_memory::VirtualMemory;
use super::vm::VmOps;

/// What to do with a region once every one of its blocks is free again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Keep it in the spare heap for reuse.
    #[default]
    Retain,
    /// Unmap it on the deallocation slow path (never the active region).
    Release,
}

/// Spare-heap key: lowest base address first, slab index as tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SpareEntry {
    base: usize,
    index: u32,
}

/// All regions of one size class within one arena.
///
/// Regions live in a slab indexed by the `region` field of their block
/// headers. The spare heap may hold stale entries (for regions that were
/// released or re-queued); they are discarded lazily when popped.
pub(crate) struct Bin {
    class: SizeClass,
    arena: u8,
    active: Option<u32>,
    spare: BinaryHeap<Reverse<SpareEntry>>,
    regions: Vec<Option<Region>>,
    vacant: Vec<u32>,
}

impl Bin {
    pub(crate) fn new(class: SizeClass, arena: u8) -> Self {
        Self {
            class,
            arena,
            active: None,
            spare: BinaryHeap::new(),
            regions: Vec::new(),
            vacant: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn class(&self) -> &SizeClass {
        &self.class
    }

    /// Take a free block, growing the bin by one chunk if needed. The block
    /// is still marked Free; the caller claims it.
    pub(crate) fn allocate<V: VmOps>(
        &mut self,
        vm: &VirtualMemory<V>,
    ) -> Result<NonNull<BlockHeader>, AllocError> {
        loop {
            if let Some(idx) = self.active {
                if let Some(header) = self.region_mut(idx).and_then(Region::take) {
                    return Ok(header);
                }
                // Exhausted: it re-enters the spare heap on its next free.
                self.active = None;
            }

            self.active = Some(match self.pop_spare() {
                Some(idx) => idx,
                None => self.grow(vm)?,
            });
        }
    }

    /// Return a block to its region.
    ///
    /// With [`ReclaimPolicy::Release`], a non-active region that becomes
    /// entirely free is unmapped.
    pub(crate) fn deallocate<V: VmOps>(
        &mut self,
        vm: &VirtualMemory<V>,
        header: &BlockHeader,
        reclaim: ReclaimPolicy,
    ) -> Result<(), AllocError> {
        let idx = header.region();
        let is_active = self.active == Some(idx);
        let Some(region) = self.region_mut(idx) else {
            return Err(AllocError::corruption(format!(
                "block {} names missing region {idx}",
                header.id()
            )));
        };
        region.give(header.slot())?;

        if is_active {
            return Ok(());
        }
        if reclaim == ReclaimPolicy::Release && region.is_empty() {
            return self.release_region(vm, idx);
        }
        if !region.queued {
            region.queued = true;
            let entry = SpareEntry {
                base: region.base(),
                index: idx,
            };
            self.spare.push(Reverse(entry));
        }
        Ok(())
    }

    /// Unmap every fully free region except the active one.
    pub(crate) fn trim<V: VmOps>(&mut self, vm: &VirtualMemory<V>) -> Result<usize, AllocError> {
        let empty: Vec<u32> = self
            .regions
            .iter()
            .enumerate()
            .filter(|(i, r)| {
                self.active != Some(*i as u32) && r.as_ref().is_some_and(Region::is_empty)
            })
            .map(|(i, _)| i as u32)
            .collect();
        for &idx in &empty {
            self.release_region(vm, idx)?;
        }
        Ok(empty.len())
    }

    /// Unmap everything. Outstanding blocks become dangling.
    pub(crate) fn release_all<V: VmOps>(&mut self, vm: &VirtualMemory<V>) -> Result<(), AllocError> {
        self.active = None;
        self.spare.clear();
        self.vacant.clear();
        for region in self.regions.drain(..).flatten() {
            // Safety: the bin is being torn down; no block is handed out again.
            unsafe { region.release(vm) }?;
        }
        Ok(())
    }

    /// Checked-build validation that `header` belongs to this bin.
    pub(crate) fn owns(&self, header: NonNull<BlockHeader>) -> bool {
        // Safety: only reads the region index; the caller passed a pointer it
        // claims is a header, and `Region::owns` verifies the address.
        let idx = unsafe { header.as_ref() }.region();
        self.region(idx).is_some_and(|r| r.owns(header))
    }

    pub(crate) fn region(&self, idx: u32) -> Option<&Region> {
        self.regions.get(idx as usize).and_then(Option::as_ref)
    }

    pub(crate) fn region_infos(&self) -> Vec<RegionInfo> {
        let mut infos: Vec<RegionInfo> = self.regions.iter().flatten().map(Region::info).collect();
        infos.sort_by_key(|r| r.base);
        infos
    }

    fn region_mut(&mut self, idx: u32) -> Option<&mut Region> {
        self.regions.get_mut(idx as usize).and_then(Option::as_mut)
    }

    fn pop_spare(&mut self) -> Option<u32> {
        while let Some(Reverse(entry)) = self.spare.pop() {
            let Some(region) = self.region_mut(entry.index) else {
                continue;
            };
            if region.base() != entry.base || !region.queued {
                continue;
            }
            region.queued = false;
            if !region.is_full() {
                return Some(entry.index);
            }
        }
        None
    }

    fn grow<V: VmOps>(&mut self, vm: &VirtualMemory<V>) -> Result<u32, AllocError> {
        let idx = match self.vacant.pop() {
            Some(idx) => idx,
            None => {
                let idx = u32::try_from(self.regions.len())
                    .map_err(|_| AllocError::invalid("too many regions in one bin"))?;
                self.regions.push(None);
                idx
            }
        };
        let chunk = match Chunk::reserve(vm, &self.class) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.vacant.push(idx);
                return Err(e);
            }
        };
        self.regions[idx as usize] = Some(chunk.carve(&self.class, self.arena, idx));
        Ok(idx)
    }

    fn release_region<V: VmOps>(&mut self, vm: &VirtualMemory<V>, idx: u32) -> Result<(), AllocError> {
        let Some(region) = self.regions.get_mut(idx as usize).and_then(Option::take) else {
            return Ok(());
        };
        self.vacant.push(idx);
        if CHECKED {
            region.verify()?;
        }
        // Safety: the region is empty, so no block of it is handed out.
        unsafe { region.release(vm) }
    }
}
