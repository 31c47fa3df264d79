//! Receive path: ring fill, completion drain, caller reads.

use alloc::collections::VecDeque;

use dma_pool::{DmaAllocator, DmaBuffer, DmaPool};
use log::{debug, info, warn};

use super::{DescriptorList, PortQueues};
use crate::virtqueue::{BufferDirection, BufferToken, Virtqueue};

/// A completed receive descriptor and how much of it has been read.
#[derive(Debug)]
pub struct ReadyBuffer {
    buffer: DmaBuffer,
    len: usize,
    offset: usize,
}

impl ReadyBuffer {
    fn remaining(&self) -> usize {
        self.len - self.offset
    }

    fn unread(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..self.len]
    }

    /// Copy as much unread data as fits into `dest`.
    fn copy_to(&mut self, dest: &mut [u8]) -> usize {
        let n = self.remaining().min(dest.len());
        dest[..n].copy_from_slice(&self.unread()[..n]);
        self.offset += n;
        n
    }
}

impl From<ReadyBuffer> for DmaBuffer {
    fn from(ready: ReadyBuffer) -> Self {
        ready.buffer
    }
}

/// Receive half of a slot, guarded by the slot's rx lock.
pub struct RxQueue<Q> {
    pub(crate) ring: Option<Q>,
    /// Submitted to the ring, waiting for host data.
    pub(crate) posted: DescriptorList,
    /// Completed, waiting to be read.
    pub(crate) ready: VecDeque<ReadyBuffer>,
}

impl<Q: Virtqueue> RxQueue<Q> {
    pub(crate) fn new(ring: Q) -> Self {
        Self {
            ring: Some(ring),
            posted: DescriptorList::new(),
            ready: VecDeque::new(),
        }
    }

    /// Submit a driver-owned descriptor host-writable.
    ///
    /// Returns the descriptor if the ring refused it (or is gone); the
    /// caller frees it after dropping the lock.
    fn submit(&mut self, mut buffer: DmaBuffer) -> Option<DmaBuffer> {
        let Some(ring) = self.ring.as_mut() else {
            return Some(buffer);
        };
        let token = BufferToken::for_buffer(&buffer, buffer.capacity());
        unsafe { buffer.mark_device_owned() };
        match ring.add_buf(token, BufferDirection::HostWritable) {
            Ok(()) => {
                self.posted.push_back(buffer);
                None
            }
            Err(_) => {
                unsafe { buffer.mark_driver_owned() };
                Some(buffer)
            }
        }
    }

    /// Move completions from the ring into the ready list.
    fn drain_ring(&mut self) -> usize {
        let Some(ring) = self.ring.as_mut() else {
            return 0;
        };
        let mut drained = 0;
        while let Some(used) = ring.get_buf() {
            let Some(mut buffer) = self.posted.take(used.id) else {
                warn!("[VIOSER] completion for unknown receive buffer {}", used.id);
                continue;
            };
            unsafe { buffer.mark_driver_owned() };
            let len = (used.len as usize).min(buffer.capacity());
            self.ready.push_back(ReadyBuffer {
                buffer,
                len,
                offset: 0,
            });
            drained += 1;
        }
        drained
    }

    /// Head of the ready list, polling the ring if it is empty.
    fn next_ready(&mut self) -> Option<ReadyBuffer> {
        if self.ready.is_empty() {
            self.drain_ring();
        }
        self.ready.pop_front()
    }
}

impl<Q: Virtqueue> PortQueues<Q> {
    /// Post receive descriptors until the slot holds its maximum.
    ///
    /// Allocation failure or ring rejection ends the fill early; a rejected
    /// descriptor is freed at once. A short pool is degraded, not broken.
    pub fn prepare_receive_buffers<A: DmaAllocator>(&mut self, pool: &DmaPool<A>) -> usize {
        let slot = self.slot;
        let buffer_size = self.buffer_size;
        let max = self.max_receive_buffers;
        let rx = self.rx.get_mut();

        let mut added = 0;
        while rx.posted.len() + rx.ready.len() < max {
            let buffer = match pool.allocate(buffer_size) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!("[VIOSER] slot {}: receive pool short ({})", slot, e);
                    break;
                }
            };
            if let Some(rejected) = rx.submit(buffer) {
                pool.free(rejected);
                warn!("[VIOSER] slot {}: receive ring full after {} buffers", slot, added);
                break;
            }
            added += 1;
        }

        info!(
            "[VIOSER] slot {}: {} of {} receive buffers posted",
            slot,
            rx.posted.len(),
            max
        );
        added
    }

    /// Give the posted list to a freshly reset ring.
    ///
    /// The reset ring has forgotten every earlier submission. Descriptors it
    /// refuses now are freed.
    pub(crate) fn repost_after_renew<A: DmaAllocator>(&mut self, pool: &DmaPool<A>) -> usize {
        let rx = self.rx.get_mut();
        let stale = core::mem::take(&mut rx.posted);

        let mut reposted = 0;
        for mut buffer in stale {
            unsafe { buffer.mark_driver_owned() };
            match rx.submit(buffer) {
                None => reposted += 1,
                Some(rejected) => pool.free(rejected),
            }
        }
        debug!("[VIOSER] slot {}: reposted {} receive buffers", self.slot, reposted);
        reposted
    }

    /// Drain ring completions into the ready list.
    pub fn collect_receive_completions(&self) -> usize {
        self.rx.lock().drain_ring()
    }

    /// Copy the next completed data into `dest`.
    ///
    /// `None` means nothing is waiting. A descriptor with bytes left over
    /// stays at the head of the ready list; a fully read one goes back to
    /// the ring, or to the pool if the ring refuses it.
    ///
    /// One reader per slot. The entry being copied is off the ready list
    /// while the lock is released, so a second concurrent reader could
    /// return the next completion ahead of its remainder.
    pub fn receive<A: DmaAllocator>(&self, pool: &DmaPool<A>, dest: &mut [u8]) -> Option<usize> {
        loop {
            let mut entry = self.rx.lock().next_ready()?;

            // Zero-length completions carry nothing; recycle and look again.
            let empty = entry.remaining() == 0;
            let copied = entry.copy_to(dest);

            let rejected = {
                let mut rx = self.rx.lock();
                if entry.remaining() > 0 {
                    rx.ready.push_front(entry);
                    None
                } else {
                    rx.submit(entry.into())
                }
            };
            if let Some(buffer) = rejected {
                pool.free(buffer);
            }

            if !empty {
                return Some(copied);
            }
        }
    }

    /// Hand every completed message to `f` whole, recycling each descriptor
    /// afterwards. Used for the control channel.
    pub fn drain_messages<A, F>(&self, pool: &DmaPool<A>, mut f: F) -> usize
    where
        A: DmaAllocator,
        F: FnMut(&[u8]),
    {
        let mut handled = 0;
        loop {
            let next = self.rx.lock().next_ready();
            let Some(entry) = next else {
                break;
            };
            f(entry.unread());
            handled += 1;

            let rejected = self.rx.lock().submit(entry.into());
            if let Some(buffer) = rejected {
                pool.free(buffer);
            }
        }
        handled
    }
}
