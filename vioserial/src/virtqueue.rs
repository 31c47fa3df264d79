//! Ring transport seam.
//!
//! The queue manager never touches descriptor tables or avail/used rings.
//! It hands a [`Virtqueue`] opaque tokens and gets ids back; the transport
//! owns the wire layout. Ring memory itself comes from the same
//! [`DmaPool`](dma_pool::DmaPool) as the payload buffers and is handed to
//! [`VirtioTransport::prepare_queue`].

use dma_pool::{BufferId, DmaBuffer, DmaRegion};
use thiserror::Error;

/// Who writes the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    /// Driver → host (send).
    HostReadable,
    /// Host → driver (receive).
    HostWritable,
}

/// What the ring is given for one submission.
///
/// The ring keeps only this; the descriptor itself stays in a driver list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferToken {
    pub id: BufferId,
    pub addr: u64,
    pub len: u32,
}

impl BufferToken {
    /// Token covering the first `len` bytes of `buffer`.
    pub fn for_buffer(buffer: &DmaBuffer, len: usize) -> Self {
        Self {
            id: buffer.id(),
            addr: buffer.bus_addr(),
            len: len.min(buffer.capacity()) as u32,
        }
    }
}

/// A completion popped from the used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedBuffer {
    pub id: BufferId,
    /// Bytes written by the host (receive) or consumed (send).
    pub len: u32,
}

/// Ring refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("virtqueue full")]
pub struct RingFull;

/// Ring geometry reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAllocation {
    /// Entries in the ring.
    pub size: u16,
    /// Bytes of contiguous DMA memory the ring needs.
    pub alloc_size: usize,
}

/// One split/packed virtqueue, as driven by this crate.
pub trait Virtqueue: Send {
    /// Submit one single-segment buffer.
    fn add_buf(&mut self, token: BufferToken, direction: BufferDirection) -> Result<(), RingFull>;

    /// Pop one completion, if any.
    fn get_buf(&mut self) -> Option<UsedBuffer>;

    /// Notify the host.
    fn kick(&mut self);

    /// Stop the ring. Afterwards the host no longer accesses any buffer
    /// that was submitted to it.
    fn shutdown(&mut self);

    /// Reset a shut-down ring for reuse. Everything previously submitted
    /// is forgotten. Returns `false` if the ring cannot be revived and has
    /// to be rebuilt.
    fn renew(&mut self) -> bool;

    /// Ring capacity.
    fn size(&self) -> u16;
}

/// Device-level queue management.
pub trait VirtioTransport {
    type Queue: Virtqueue;

    /// Ring geometry for queue `index`, `None` if the device lacks it.
    fn query_queue_allocation(&self, index: u16) -> Option<QueueAllocation>;

    /// Construct queue `index` over `region`. On `None` the region is
    /// still the caller's.
    fn prepare_queue(&mut self, index: u16, region: DmaRegion) -> Option<Self::Queue>;

    /// Tear down a shut-down queue, giving its memory back.
    fn delete_queue(&mut self, queue: Self::Queue) -> DmaRegion;
}
