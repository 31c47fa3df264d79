//! Descriptor pool: allocation, release, and accounting.
//!
//! Every `DmaBuffer` in the system comes from a `DmaPool` and goes back to
//! the same pool. The pool keeps a bounded descriptor table (descriptor
//! slots are a fixed resource on bare metal) and counts every allocation
//! and release so callers can check the balance.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{debug, warn};

use super::allocator::DmaAllocator;
use super::buffer::{BufferId, DmaBuffer};
use super::error::DmaError;
use super::region::DmaRegion;

/// Page size used for buffer and ring alignment.
pub const PAGE_SIZE: usize = 4096;

/// Default bound on simultaneously live descriptors.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 8192;

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Descriptors currently handed out.
    pub live_descriptors: usize,
    /// Descriptors ever allocated.
    pub descriptors_allocated: usize,
    /// Descriptors ever freed.
    pub descriptors_freed: usize,
    /// Contiguous (ring) regions currently handed out.
    pub live_regions: usize,
}

/// Descriptor pool over a [`DmaAllocator`].
///
/// All methods take `&self`: the pool is shared between the request path,
/// the completion path and the lifecycle controller.
pub struct DmaPool<A: DmaAllocator> {
    allocator: A,
    max_descriptors: usize,
    live: AtomicUsize,
    next_id: AtomicU32,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    live_regions: AtomicUsize,
}

impl<A: DmaAllocator> DmaPool<A> {
    /// Pool with the default descriptor limit.
    pub const fn new(allocator: A) -> Self {
        Self::with_descriptor_limit(allocator, DEFAULT_MAX_DESCRIPTORS)
    }

    /// Pool that refuses to hand out more than `max_descriptors` at once.
    pub const fn with_descriptor_limit(allocator: A, max_descriptors: usize) -> Self {
        Self {
            allocator,
            max_descriptors,
            live: AtomicUsize::new(0),
            next_id: AtomicU32::new(0),
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            live_regions: AtomicUsize::new(0),
        }
    }

    /// Allocate a zero-filled, driver-owned descriptor of `size` bytes.
    ///
    /// Fails with `OutOfMemory` if the descriptor table is full or the
    /// backing memory cannot be obtained. In the latter case the reserved
    /// descriptor slot is given back before returning.
    pub fn allocate(&self, size: usize) -> Result<DmaBuffer, DmaError> {
        if !self.reserve_slot() {
            warn!("[DMA] descriptor table full ({} live)", self.max_descriptors);
            return Err(DmaError::OutOfMemory { size });
        }

        let region = match self.allocator.allocate(size, PAGE_SIZE) {
            Some(region) if region.is_valid() => region,
            Some(region) => {
                unsafe { self.allocator.release(region) };
                self.release_slot();
                warn!("[DMA] allocator returned an unusable region for {} bytes", size);
                return Err(DmaError::OutOfMemory { size });
            }
            None => {
                self.release_slot();
                warn!("[DMA] failed to allocate {} byte buffer", size);
                return Err(DmaError::OutOfMemory { size });
            }
        };

        unsafe { region.zero() };

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.allocated.fetch_add(1, Ordering::Relaxed);

        let mut buffer = unsafe { DmaBuffer::new(region, id) };
        unsafe { buffer.mark_allocated() };

        debug!(
            "[DMA] buffer {} v{:p} (p{:#x}) {} bytes",
            id,
            region.cpu_base(),
            region.bus_base(),
            size
        );
        Ok(buffer)
    }

    /// Release a driver-owned descriptor: backing memory first, then the
    /// descriptor slot.
    ///
    /// Consumes the buffer; callers must already have detached it from
    /// every list and ring.
    pub fn free(&self, mut buffer: DmaBuffer) {
        let id = buffer.id();
        unsafe { buffer.mark_free() };
        let region = buffer.region();
        unsafe { self.allocator.release(region) };
        self.release_slot();
        self.freed.fetch_add(1, Ordering::Relaxed);
        debug!("[DMA] freed buffer {}", id);
    }

    /// Release a descriptor that may still be marked device-owned.
    ///
    /// # Safety
    /// The ring the descriptor was submitted to must have been shut down,
    /// so the device can no longer touch it.
    pub unsafe fn free_reclaimed(&self, mut buffer: DmaBuffer) {
        if buffer.is_device_owned() {
            buffer.mark_driver_owned();
        }
        self.free(buffer);
    }

    /// Allocate a zeroed, page-aligned region for ring structures.
    pub fn alloc_contiguous(&self, size: usize) -> Result<DmaRegion, DmaError> {
        let region = self
            .allocator
            .allocate(size, PAGE_SIZE)
            .ok_or(DmaError::OutOfMemory { size })?;
        unsafe { region.zero() };
        self.live_regions.fetch_add(1, Ordering::Relaxed);
        Ok(region)
    }

    /// Return a region obtained from [`alloc_contiguous`](Self::alloc_contiguous).
    ///
    /// # Safety
    /// Nothing may reference `region` afterwards.
    pub unsafe fn free_contiguous(&self, region: DmaRegion) {
        self.allocator.release(region);
        self.live_regions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_descriptors: self.live.load(Ordering::Acquire),
            descriptors_allocated: self.allocated.load(Ordering::Relaxed),
            descriptors_freed: self.freed.load(Ordering::Relaxed),
            live_regions: self.live_regions.load(Ordering::Relaxed),
        }
    }

    pub fn max_descriptors(&self) -> usize {
        self.max_descriptors
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_descriptors).then_some(live + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
