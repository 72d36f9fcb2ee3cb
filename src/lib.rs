#[cfg(not(target_pointer_width = "64"))]
compile_error!("jalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: internals stay pub(crate); TEST_MUTEX is shared by tests
pub mod memory;

// allocator
pub use memory::allocator::{Allocator, AllocatorConfig, BlockOwner};
pub use memory::bin::ReclaimPolicy;
pub use memory::region::RegionInfo;
pub use memory::size_class::{MAX_CLASS_SIZE, NUM_SIZE_CLASSES, SIZE_CLASSES, SizeClass, class_of};

// virtual memory
pub use memory::virtual_memory::{DEFAULT_ALIGN, HUGE_THRESHOLD, VirtualMemory, normalize_alignment};
pub use memory::vm::{NoHugePageVmOps, PAGE_SIZE_2MB, PlatformVmOps, VmOps};

// tracing
#[cfg(not(loom))]
pub use memory::recorder::Flusher;
pub use memory::recorder::{AllocEvent, AllocOp, EventSink, NoopSink, RECORD_SIZE, TraceRecorder, read_trace};

// stats/errors
pub use memory::error::AllocError;
pub use memory::stats::MemoryStats;
pub use memory::vm::VmError;
