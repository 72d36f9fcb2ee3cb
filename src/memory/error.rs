use super::vm::VmError;

/// Failures reported by the allocator to its callers.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// Malformed request or configuration. Alignment and pointer validation
    /// only run in checked builds; release builds coerce or trust instead.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operating system refused to provide memory.
    #[error("out of memory: request of {size} bytes")]
    OutOfMemory {
        size: usize,
        #[source]
        source: VmError,
    },

    /// Allocator metadata is inconsistent (double free, freeing into the
    /// wrong place, a block in an impossible state). Unrecoverable.
    #[error("heap corruption detected: {0}")]
    CorruptionDetected(String),
}

impl AllocError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::CorruptionDetected(msg.into())
    }

    pub(crate) fn oom(size: usize, source: VmError) -> Self {
        Self::OutOfMemory { size, source }
    }

    /// True for the errors that leave the heap in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptionDetected(_))
    }
}

/// Whether argument validation is compiled in.
pub(crate) const CHECKED: bool = cfg!(any(debug_assertions, feature = "checked"));
