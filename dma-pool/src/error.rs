//! DMA pool errors.

/// Errors from descriptor or region allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// Descriptor table exhausted or backing memory unavailable.
    #[error("out of DMA memory ({size} bytes requested)")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },
}
