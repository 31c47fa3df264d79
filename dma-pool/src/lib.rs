//! DMA descriptor pool for bare-metal virtio drivers.
//!
//! Provides ownership-tracked DMA buffers for safe device communication.
//!
//! # Model
//!
//! ```text
//! DmaAllocator ──regions──> DmaPool ──allocate()──> DmaBuffer ──> driver lists / rings
//!                              ▲                                        │
//!                              └──────────────free()────────────────────┘
//! ```
//!
//! - [`DmaRegion`]: raw device-visible memory (CPU pointer + bus address)
//! - [`DmaBuffer`]: one descriptor, the unit of I/O, with an ownership state
//! - [`DmaPool`]: allocates and frees descriptors and ring regions, keeps
//!   the allocation/free balance
//!
//! # Features
//!
//! - `host-alloc`: [`HeapAllocator`], backed by the global heap, for hosted
//!   simulation of a device

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "host-alloc"))]
extern crate alloc;

pub mod allocator;
pub mod buffer;
pub mod error;
pub mod ownership;
pub mod pool;
pub mod region;

// Re-exports
pub use allocator::DmaAllocator;
#[cfg(any(test, feature = "host-alloc"))]
pub use allocator::HeapAllocator;
pub use buffer::{BufferId, DmaBuffer};
pub use error::DmaError;
pub use ownership::BufferOwnership;
pub use pool::{DmaPool, PoolStats, DEFAULT_MAX_DESCRIPTORS, PAGE_SIZE};
pub use region::DmaRegion;
