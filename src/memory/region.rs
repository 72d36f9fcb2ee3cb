//! Blocks, chunks and regions.
//!
//! A chunk is one OS mapping. Carving it produces exactly one region: a run
//! of equally sized slots, each laid out as
//!
//! ```text
//! | BlockHeader (16B) | payload (block_size) | BlockHeader | payload | ...
//! ```
//!
//! The header sits at a fixed offset before every payload, so a user pointer
//! leads back to its block, region, slot and owning arena without any lookup.

use std::ptr::NonNull;

use fixedbitset::FixedBitSet;

use super::error::AllocError;
use super::size_class::SizeClass;
use super::stats;
use super::virtual_memory::VirtualMemory;
use super::vm::VmOps;
use crate::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Alignment of chunk mappings.
const CHUNK_ALIGN: usize = 64;

crate::sync::static_atomic! {
    static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);
}
crate::sync::static_atomic! {
    static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free = 1,
    Allocated = 2,
}

impl BlockState {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Free),
            2 => Some(Self::Allocated),
            _ => None,
        }
    }
}

/// Per-block metadata living immediately before the block's payload.
#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    id: u64,
    /// Index of the owning region in its bin.
    region: u32,
    slot: u16,
    arena: u8,
    state: AtomicU8,
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<BlockHeader>() == 16);

/// Distance from a block header to its payload.
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Distance between consecutive slots of a class.
#[inline]
pub(crate) fn stride_of(class: &SizeClass) -> usize {
    HEADER_SIZE + class.block_size
}

impl BlockHeader {
    /// Recover the header from a payload pointer.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer handed out by a region.
    #[inline]
    pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHeader> {
        // Safety: caller contract; the header precedes the payload in the slot.
        unsafe { ptr.sub(HEADER_SIZE).cast() }
    }

    #[inline]
    pub(crate) fn payload(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // Safety: every header is followed by its payload in the same slot.
        unsafe { header.cast::<u8>().add(HEADER_SIZE) }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn region(&self) -> u32 {
        self.region
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }

    pub(crate) fn arena(&self) -> usize {
        self.arena as usize
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Option<BlockState> {
        BlockState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Free -> Allocated. Anything else means the block was handed out twice.
    #[inline]
    pub(crate) fn mark_allocated(&self) -> Result<(), AllocError> {
        self.transition(BlockState::Free, BlockState::Allocated)
    }

    /// Allocated -> Free. Fails on a double free or a foreign pointer.
    #[inline]
    pub(crate) fn mark_free(&self) -> Result<(), AllocError> {
        self.transition(BlockState::Allocated, BlockState::Free)
    }

    fn transition(&self, from: BlockState, to: BlockState) -> Result<(), AllocError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|found| {
                AllocError::corruption(match BlockState::from_raw(found) {
                    Some(BlockState::Free) => format!("block {} freed twice", self.id),
                    Some(BlockState::Allocated) => {
                        format!("block {} handed out while still allocated", self.id)
                    }
                    None => format!("block header {:p} has invalid state {found}", self),
                })
            })
    }
}

/// One OS mapping destined to become a region.
pub(crate) struct Chunk {
    ptr: NonNull<u8>,
    len: usize,
}

impl Chunk {
    /// Map enough memory for one full region of `class`.
    pub(crate) fn reserve<V: VmOps>(
        vm: &VirtualMemory<V>,
        class: &SizeClass,
    ) -> Result<Self, AllocError> {
        let len = (stride_of(class) * class.max_blocks_per_chunk)
            .next_multiple_of(VirtualMemory::<V>::page_size());
        let ptr = vm.reserve(len, CHUNK_ALIGN)?;
        stats::CHUNK_BYTES.add(len);
        Ok(Self { ptr, len })
    }

    /// Turn the chunk into a region with every block free, writing all block
    /// headers up front.
    pub(crate) fn carve(self, class: &SizeClass, arena: u8, region: u32) -> Region {
        let stride = stride_of(class);
        let capacity = (self.len / stride).min(class.max_blocks_per_chunk);
        let first_id = NEXT_BLOCK_ID.fetch_add(capacity as u64, Ordering::Relaxed);

        for slot in 0..capacity {
            // Safety: slot * stride + stride <= len, inside the mapping.
            unsafe {
                self.ptr
                    .add(slot * stride)
                    .cast::<BlockHeader>()
                    .write(BlockHeader {
                        id: first_id + slot as u64,
                        region,
                        // Capacity never exceeds max_blocks_per_chunk <= u16::MAX.
                        slot: slot as u16,
                        arena,
                        state: AtomicU8::new(BlockState::Free as u8),
                    });
            }
        }

        Region {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed).cast_signed(),
            chunk: self,
            stride,
            capacity,
            free: capacity,
            occupancy: FixedBitSet::with_capacity(capacity),
            cursor: 0,
            queued: false,
        }
    }

    /// # Safety
    /// No pointer into the chunk may be used afterwards.
    unsafe fn release<V: VmOps>(self, vm: &VirtualMemory<V>) -> Result<(), AllocError> {
        // Safety: caller contract; ptr/len are exactly what `reserve` returned.
        unsafe { vm.release(self.ptr, self.len, CHUNK_ALIGN) }?;
        stats::CHUNK_BYTES.sub(self.len);
        Ok(())
    }
}

/// Snapshot of a region for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: i64,
    pub base: usize,
    pub free_blocks: usize,
    pub capacity: usize,
}

/// A bitmap-tracked run of equally sized blocks. Set bits are allocated.
pub(crate) struct Region {
    id: i64,
    chunk: Chunk,
    stride: usize,
    capacity: usize,
    free: usize,
    occupancy: FixedBitSet,
    /// No slot below this index is free.
    cursor: usize,
    /// Whether the bin currently holds a spare-heap entry for this region.
    pub(crate) queued: bool,
}

// Safety: a region exclusively owns its chunk; it moves between threads only
// under the arena lock.
unsafe impl Send for Region {}

impl Region {
    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    /// Address of the first slot; orders regions for reuse.
    pub(crate) fn base(&self) -> usize {
        self.chunk.ptr.as_ptr() as usize
    }

    pub(crate) fn free_blocks(&self) -> usize {
        self.free
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free == 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.free == self.capacity
    }

    pub(crate) fn info(&self) -> RegionInfo {
        RegionInfo {
            id: self.id,
            base: self.base(),
            free_blocks: self.free_blocks(),
            capacity: self.capacity(),
        }
    }

    pub(crate) fn header(&self, slot: usize) -> NonNull<BlockHeader> {
        debug_assert!(slot < self.capacity);
        // Safety: slot < capacity keeps the header inside the chunk.
        unsafe { self.chunk.ptr.add(slot * self.stride).cast() }
    }

    /// Whether `header` is the header of one of this region's slots.
    pub(crate) fn owns(&self, header: NonNull<BlockHeader>) -> bool {
        let addr = header.as_ptr() as usize;
        let base = self.base();
        addr >= base
            && addr < base + self.capacity * self.stride
            && (addr - base).is_multiple_of(self.stride)
    }

    /// Claim the lowest free slot.
    pub(crate) fn take(&mut self) -> Option<NonNull<BlockHeader>> {
        if self.free == 0 {
            return None;
        }
        let slot = (self.cursor..self.capacity).find(|&i| !self.occupancy.contains(i))?;
        self.occupancy.insert(slot);
        self.free -= 1;
        self.cursor = slot + 1;
        Some(self.header(slot))
    }

    /// Return a slot to the region.
    pub(crate) fn give(&mut self, slot: usize) -> Result<(), AllocError> {
        if slot >= self.capacity {
            return Err(AllocError::corruption(format!(
                "slot {slot} out of range for region {} ({} slots)",
                self.id, self.capacity
            )));
        }
        if !self.occupancy.contains(slot) {
            return Err(AllocError::corruption(format!(
                "slot {slot} of region {} returned while already free",
                self.id
            )));
        }
        self.occupancy.set(slot, false);
        self.free += 1;
        self.cursor = self.cursor.min(slot);
        Ok(())
    }

    /// Check `free == zero bits`.
    pub(crate) fn verify(&self) -> Result<(), AllocError> {
        let taken = self.occupancy.count_ones(..);
        if self.capacity - taken != self.free {
            return Err(AllocError::corruption(format!(
                "region {}: free count {} but {} clear bits",
                self.id,
                self.free,
                self.capacity - taken
            )));
        }
        Ok(())
    }

    /// Unmap the region.
    ///
    /// # Safety
    /// No block of the region may be reachable from anywhere else.
    pub(crate) unsafe fn release<V: VmOps>(self, vm: &VirtualMemory<V>) -> Result<(), AllocError> {
        for slot in 0..self.capacity {
            // Safety: headers were written by `carve` and are dropped once.
            unsafe { std::ptr::drop_in_place(self.header(slot).as_ptr()) };
        }
        // Safety: caller contract.
        unsafe { self.chunk.release(vm) }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::{SIZE_CLASSES, class_of};
    use crate::memory::vm::PlatformVmOps;

    fn region_for(size: usize) -> (VirtualMemory<PlatformVmOps>, Region, SizeClass) {
        let vm = VirtualMemory::<PlatformVmOps>::new(false);
        let class = SIZE_CLASSES[class_of(size).unwrap()];
        let region = Chunk::reserve(&vm, &class).unwrap().carve(&class, 3, 7);
        (vm, region, class)
    }

    #[test]
    fn test_carve_writes_headers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, region, class) = region_for(64);
        assert_eq!(region.capacity(), class.max_blocks_per_chunk);
        assert!(region.is_empty());

        let mut last_id = 0;
        for slot in 0..region.capacity() {
            // Safety: Test code.
            let h = unsafe { region.header(slot).as_ref() };
            assert_eq!(h.slot(), slot);
            assert_eq!(h.region(), 7);
            assert_eq!(h.arena(), 3);
            assert_eq!(h.state(), Some(BlockState::Free));
            assert!(h.id() > last_id);
            last_id = h.id();
            assert_eq!(BlockHeader::payload(region.header(slot)).as_ptr() as usize % 16, 0);
        }
        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }

    #[test]
    fn test_take_lowest_then_reuse_lowest() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, mut region, _) = region_for(128);
        let a = region.take().unwrap();
        let b = region.take().unwrap();
        let c = region.take().unwrap();
        assert!(a < b && b < c);
        assert_eq!(region.free_blocks(), region.capacity() - 3);

        // Safety: Test code.
        let b_slot = unsafe { b.as_ref().slot() };
        region.give(b_slot).unwrap();
        assert_eq!(region.take(), Some(b));
        region.verify().unwrap();

        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }

    #[test]
    fn test_give_twice_is_corruption() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, mut region, _) = region_for(16);
        let h = region.take().unwrap();
        // Safety: Test code.
        let slot = unsafe { h.as_ref().slot() };
        region.give(slot).unwrap();
        assert!(matches!(region.give(slot), Err(AllocError::CorruptionDetected(_))));
        assert!(matches!(region.give(region.capacity()), Err(AllocError::CorruptionDetected(_))));
        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }

    #[test]
    fn test_exhaust_and_refill() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, mut region, _) = region_for(4096);
        let mut taken = Vec::new();
        while let Some(h) = region.take() {
            assert!(region.owns(h));
            taken.push(h);
        }
        assert!(region.is_full());
        assert_eq!(taken.len(), region.capacity());
        region.verify().unwrap();

        for h in taken.iter().rev() {
            // Safety: Test code.
            region.give(unsafe { h.as_ref().slot() }).unwrap();
        }
        assert!(region.is_empty());
        region.verify().unwrap();
        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }

    #[test]
    fn test_state_transitions() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, mut region, _) = region_for(32);
        let h = region.take().unwrap();
        // Safety: Test code.
        let header = unsafe { h.as_ref() };
        header.mark_allocated().unwrap();
        assert!(header.mark_allocated().is_err());
        header.mark_free().unwrap();
        let err = header.mark_free().unwrap_err();
        assert!(err.is_fatal(), "{err}");
        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }

    #[test]
    fn test_owns_rejects_interior_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let (vm, region, _) = region_for(48);
        let h = region.header(1);
        assert!(region.owns(h));
        // Safety: Test code.
        let inside = unsafe { h.cast::<u8>().add(16).cast::<BlockHeader>() };
        assert!(!region.owns(inside));
        // Safety: Test code.
        unsafe { region.release(&vm).unwrap() };
    }
}
