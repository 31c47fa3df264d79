//! Per-slot queue context: rings, descriptor lists and their locks.
//!
//! Each slot owns two independent halves:
//!
//! ```text
//! rx lock: receive ring, posted (submitted, waiting for host data),
//!          ready (completed, waiting for receive())
//! tx lock: send ring, free (idle), in_use (submitted, waiting for completion)
//! ```
//!
//! A descriptor is in exactly one of these lists at any time. The rings
//! only ever see a [`BufferToken`](crate::virtqueue::BufferToken).
//!
//! Locks cover list manipulation and ring calls. Allocation, freeing and
//! payload copies happen with no lock held, and no path holds two locks.

pub mod rx;
pub mod tx;

use alloc::collections::VecDeque;

use dma_pool::{BufferId, DmaAllocator, DmaBuffer, DmaPool};
use spin::Mutex;

use crate::mapper::{Channel, QueueIndexMapper, QueuePair};
use crate::virtqueue::Virtqueue;

pub use rx::RxQueue;
pub use tx::{SendOutcome, TxQueue};

/// FIFO of descriptors owned by one list.
#[derive(Debug, Default)]
pub struct DescriptorList {
    entries: VecDeque<DmaBuffer>,
}

impl DescriptorList {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_back(&mut self, buffer: DmaBuffer) {
        self.entries.push_back(buffer);
    }

    pub fn push_front(&mut self, buffer: DmaBuffer) {
        self.entries.push_front(buffer);
    }

    pub fn pop_front(&mut self) -> Option<DmaBuffer> {
        self.entries.pop_front()
    }

    /// Detach the descriptor a ring cookie refers to.
    pub fn take(&mut self, id: BufferId) -> Option<DmaBuffer> {
        let pos = self.entries.iter().position(|b| b.id() == id)?;
        self.entries.remove(pos)
    }
}

impl IntoIterator for DescriptorList {
    type Item = DmaBuffer;
    type IntoIter = alloc::collections::vec_deque::IntoIter<DmaBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Counters for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStats {
    /// Receive descriptors submitted to the ring.
    pub posted: usize,
    /// Completed receive descriptors not yet fully read.
    pub ready: usize,
    /// Idle send descriptors.
    pub send_free: usize,
    /// Send descriptors waiting for the host.
    pub send_in_use: usize,
    /// Rings currently held (0..=2).
    pub rings: usize,
}

impl PortStats {
    /// Send descriptors this slot owns.
    pub fn send_total(&self) -> usize {
        self.send_free + self.send_in_use
    }
}

/// Queue context of one table slot.
pub struct PortQueues<Q: Virtqueue> {
    slot: usize,
    channel: Channel,
    pair: QueuePair,
    max_receive_buffers: usize,
    buffer_size: usize,
    pub(crate) rx: Mutex<RxQueue<Q>>,
    pub(crate) tx: Mutex<TxQueue<Q>>,
}

impl<Q: Virtqueue> PortQueues<Q> {
    /// Context for `slot` with both rings already constructed.
    pub fn new(
        slot: usize,
        channel: Channel,
        max_receive_buffers: usize,
        buffer_size: usize,
        receive_ring: Q,
        send_ring: Q,
    ) -> Self {
        Self {
            slot,
            channel,
            pair: QueueIndexMapper::pair_for_slot(slot),
            max_receive_buffers,
            buffer_size,
            rx: Mutex::new(RxQueue::new(receive_ring)),
            tx: Mutex::new(TxQueue::new(send_ring)),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn pair(&self) -> QueuePair {
        self.pair
    }

    pub fn max_receive_buffers(&self) -> usize {
        self.max_receive_buffers
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> PortStats {
        let (posted, ready, rx_ring) = {
            let rx = self.rx.lock();
            (rx.posted.len(), rx.ready.len(), rx.ring.is_some())
        };
        let (send_free, send_in_use, tx_ring) = {
            let tx = self.tx.lock();
            (tx.free.len(), tx.in_use.len(), tx.ring.is_some())
        };
        PortStats {
            posted,
            ready,
            send_free,
            send_in_use,
            rings: usize::from(rx_ring) + usize::from(tx_ring),
        }
    }

    /// Shut down both rings. Ring objects and all descriptors stay.
    pub fn shutdown_rings(&mut self) {
        if let Some(ring) = self.rx.get_mut().ring.as_mut() {
            ring.shutdown();
        }
        if let Some(ring) = self.tx.get_mut().ring.as_mut() {
            ring.shutdown();
        }
    }

    /// Release every descriptor this slot holds.
    ///
    /// # Safety
    /// Both rings must have been shut down.
    pub unsafe fn free_all_descriptors<A: DmaAllocator>(&self, pool: &DmaPool<A>) -> usize {
        free_all_from(pool, &self.rx, |rx| &mut rx.posted)
            + free_all_from(pool, &self.rx, |rx| &mut rx.ready)
            + free_all_from(pool, &self.tx, |tx| &mut tx.free)
            + free_all_from(pool, &self.tx, |tx| &mut tx.in_use)
    }
}

/// Detach a whole list under `lock`, then free its descriptors with the lock
/// released. Returns the number freed.
///
/// # Safety
/// Descriptors on the list may still be marked device-owned; the ring they
/// were submitted to must already be shut down.
pub unsafe fn free_all_from<A, T, L, F>(pool: &DmaPool<A>, lock: &Mutex<T>, select: F) -> usize
where
    A: DmaAllocator,
    L: Default + IntoIterator,
    L::Item: Into<DmaBuffer>,
    F: FnOnce(&mut T) -> &mut L,
{
    let detached = {
        let mut guard = lock.lock();
        core::mem::take(select(&mut *guard))
    };

    let mut freed = 0;
    for item in detached {
        pool.free_reclaimed(item.into());
        freed += 1;
    }
    freed
}
