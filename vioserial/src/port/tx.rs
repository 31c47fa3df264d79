//! Send path: free-list, in-use list, completion reclaim.

use alloc::collections::VecDeque;

use dma_pool::{BufferId, DmaAllocator, DmaBuffer, DmaPool};
use log::{debug, info, warn};

use super::{DescriptorList, PortQueues};
use crate::error::SendError;
use crate::virtqueue::{BufferDirection, BufferToken, Virtqueue};

/// A submitted send descriptor and the payload length it was given with.
#[derive(Debug)]
pub struct InFlight {
    buffer: DmaBuffer,
    len: usize,
}

impl From<InFlight> for DmaBuffer {
    fn from(sent: InFlight) -> Self {
        sent.buffer
    }
}

/// Send half of a slot, guarded by the slot's tx lock.
pub struct TxQueue<Q> {
    pub(crate) ring: Option<Q>,
    /// Idle descriptors.
    pub(crate) free: DescriptorList,
    /// Submitted to the ring, not yet completed, oldest first.
    pub(crate) in_use: VecDeque<InFlight>,
}

impl<Q: Virtqueue> TxQueue<Q> {
    pub(crate) fn new(ring: Q) -> Self {
        Self {
            ring: Some(ring),
            free: DescriptorList::new(),
            in_use: VecDeque::new(),
        }
    }

    /// Detach the in-flight entry a ring cookie refers to.
    fn take_in_flight(&mut self, id: BufferId) -> Option<DmaBuffer> {
        let pos = self.in_use.iter().position(|sent| sent.buffer.id() == id)?;
        self.in_use.remove(pos).map(DmaBuffer::from)
    }
}

/// Result of a send that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Payload is on the ring.
    Queued,
    /// Ring refused the submission. The descriptor went back to the
    /// free-list; the caller may retry.
    NotQueued,
}

impl<Q: Virtqueue> PortQueues<Q> {
    /// Fill the send free-list up to the send ring's capacity.
    ///
    /// Descriptors are not submitted. Stops early if the pool runs dry.
    pub fn prepare_transmit_buffers<A: DmaAllocator>(&mut self, pool: &DmaPool<A>) -> usize {
        let slot = self.slot;
        let buffer_size = self.buffer_size;
        let tx = self.tx.get_mut();
        let Some(ring) = tx.ring.as_ref() else {
            return 0;
        };
        let target = usize::from(ring.size());

        let mut added = 0;
        while tx.free.len() + tx.in_use.len() < target {
            match pool.allocate(buffer_size) {
                Ok(buffer) => {
                    tx.free.push_back(buffer);
                    added += 1;
                }
                Err(e) => {
                    warn!("[VIOSER] slot {}: send pool short ({})", slot, e);
                    break;
                }
            }
        }

        info!(
            "[VIOSER] slot {}: {} send buffers ({} new)",
            slot,
            tx.free.len() + tx.in_use.len(),
            added
        );
        added
    }

    /// Copy `data` into a free descriptor and submit it host-readable.
    ///
    /// Never blocks and never truncates. An empty free-list is
    /// backpressure (`InsufficientResources`), not a fault.
    pub fn send(&self, data: &[u8], kick: bool) -> Result<SendOutcome, SendError> {
        let mut buffer = self
            .tx
            .lock()
            .free
            .pop_front()
            .ok_or(SendError::InsufficientResources)?;

        let capacity = buffer.capacity();
        if data.len() > capacity {
            self.tx.lock().free.push_front(buffer);
            return Err(SendError::BufferTooSmall {
                needed: data.len(),
                capacity,
            });
        }

        buffer.fill_from(data);
        let len = data.len();
        let token = BufferToken::for_buffer(&buffer, len);

        let mut tx = self.tx.lock();
        let TxQueue { ring, free, in_use } = &mut *tx;
        let Some(ring) = ring.as_mut() else {
            free.push_front(buffer);
            return Ok(SendOutcome::NotQueued);
        };

        unsafe { buffer.mark_device_owned() };
        match ring.add_buf(token, BufferDirection::HostReadable) {
            Ok(()) => {
                in_use.push_back(InFlight { buffer, len });
                if kick {
                    ring.kick();
                }
                Ok(SendOutcome::Queued)
            }
            Err(e) => {
                unsafe { buffer.mark_driver_owned() };
                free.push_front(buffer);
                warn!("[VIOSER] slot {}: send not queued ({})", self.slot, e);
                Ok(SendOutcome::NotQueued)
            }
        }
    }

    /// Move every completed send descriptor from in-use back to free.
    pub fn collect_send_completions(&self) -> usize {
        let mut tx = self.tx.lock();
        let mut reclaimed = 0;
        loop {
            let Some(used) = tx.ring.as_mut().and_then(|ring| ring.get_buf()) else {
                break;
            };
            match tx.take_in_flight(used.id) {
                Some(mut buffer) => {
                    unsafe { buffer.mark_driver_owned() };
                    tx.free.push_back(buffer);
                    reclaimed += 1;
                }
                None => warn!(
                    "[VIOSER] slot {}: completion for unknown send buffer {}",
                    self.slot, used.id
                ),
            }
        }
        if reclaimed > 0 {
            debug!("[VIOSER] slot {}: reclaimed {} send buffers", self.slot, reclaimed);
        }
        reclaimed
    }

    /// Give the in-use list to a freshly reset ring, oldest first.
    ///
    /// The reset ring has forgotten every earlier submission, so each
    /// payload goes back on it with its original length. A descriptor the
    /// ring refuses, or that has no ring to go to, returns to the free-list
    /// and its payload is dropped.
    pub(crate) fn resubmit_in_use_after_renew(&mut self) -> usize {
        let slot = self.slot;
        let tx = self.tx.get_mut();
        let pending = core::mem::take(&mut tx.in_use);
        let TxQueue { ring, free, in_use } = tx;

        let mut resubmitted = 0;
        let mut dropped = 0;
        for InFlight { mut buffer, len } in pending {
            unsafe { buffer.mark_driver_owned() };
            let Some(ring) = ring.as_mut() else {
                free.push_back(buffer);
                dropped += 1;
                continue;
            };
            let token = BufferToken::for_buffer(&buffer, len);
            unsafe { buffer.mark_device_owned() };
            match ring.add_buf(token, BufferDirection::HostReadable) {
                Ok(()) => {
                    in_use.push_back(InFlight { buffer, len });
                    resubmitted += 1;
                }
                Err(e) => {
                    unsafe { buffer.mark_driver_owned() };
                    free.push_back(buffer);
                    dropped += 1;
                    warn!("[VIOSER] slot {}: pending send not resubmitted ({})", slot, e);
                }
            }
        }

        if resubmitted > 0 {
            if let Some(ring) = ring.as_mut() {
                ring.kick();
            }
            debug!("[VIOSER] slot {}: resubmitted {} pending sends", slot, resubmitted);
        }
        if dropped > 0 {
            warn!("[VIOSER] slot {}: {} pending sends dropped on resume", slot, dropped);
        }
        resubmitted
    }
}
