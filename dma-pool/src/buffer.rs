//! DMA buffer descriptor with ownership tracking.

use super::ownership::BufferOwnership;
use super::region::DmaRegion;

/// Pool-unique descriptor id.
///
/// This is the cookie handed to a ring alongside the bus address; the ring
/// gives it back on completion so the driver can find the descriptor again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

impl core::fmt::Display for BufferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single DMA buffer: one block of device-visible memory plus bookkeeping.
///
/// Neither `Clone` nor `Copy`: whichever list holds the value
/// owns the descriptor.
pub struct DmaBuffer {
    /// Backing memory.
    region: DmaRegion,
    /// Ring cookie.
    id: BufferId,
    /// Current ownership state.
    ownership: BufferOwnership,
}

impl DmaBuffer {
    /// Wrap a freshly allocated region.
    ///
    /// # Safety
    /// `region` must be valid DMA memory that nothing else references.
    pub(crate) unsafe fn new(region: DmaRegion, id: BufferId) -> Self {
        Self {
            region,
            id,
            ownership: BufferOwnership::Free,
        }
    }

    /// Get buffer data as slice.
    ///
    /// # Panics
    /// Panics if buffer is not DriverOwned.
    pub fn as_slice(&self) -> &[u8] {
        assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        unsafe { core::slice::from_raw_parts(self.region.cpu_base(), self.region.size()) }
    }

    /// Get buffer data as mutable slice.
    ///
    /// # Panics
    /// Panics if buffer is not DriverOwned.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        unsafe { core::slice::from_raw_parts_mut(self.region.cpu_base(), self.region.size()) }
    }

    /// Zero the whole payload, then copy `data` to its start.
    ///
    /// Returns `false` (and leaves the payload untouched) if `data` does not
    /// fit.
    pub fn fill_from(&mut self, data: &[u8]) -> bool {
        if data.len() > self.capacity() {
            return false;
        }
        let payload = self.as_mut_slice();
        payload.fill(0);
        payload[..data.len()].copy_from_slice(data);
        true
    }

    /// Get the device-visible bus address.
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_base()
    }

    /// Get the CPU pointer.
    pub fn cpu_ptr(&self) -> *mut u8 {
        self.region.cpu_base()
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Get buffer capacity.
    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Get current ownership state.
    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    /// Check if buffer is owned by driver.
    pub fn is_driver_owned(&self) -> bool {
        self.ownership.can_access()
    }

    /// Check if buffer is owned by device.
    pub fn is_device_owned(&self) -> bool {
        self.ownership.is_device_owned()
    }

    /// Mark buffer as allocated (Free -> DriverOwned).
    ///
    /// # Safety
    /// Only call during allocation from pool.
    pub(crate) unsafe fn mark_allocated(&mut self) {
        debug_assert!(self.ownership.is_free(), "Buffer must be free to allocate");
        self.ownership = BufferOwnership::DriverOwned;
    }

    /// Mark buffer as device-owned (DriverOwned -> DeviceOwned).
    ///
    /// # Safety
    /// Only call immediately before submitting to a ring.
    pub unsafe fn mark_device_owned(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "Buffer must be driver-owned before device transfer"
        );
        self.ownership = BufferOwnership::DeviceOwned;
    }

    /// Mark buffer as driver-owned (DeviceOwned -> DriverOwned).
    ///
    /// # Safety
    /// Only call after the ring yielded the buffer back (`get_buf`), after
    /// the ring rejected the submission, or after the ring was shut down.
    pub unsafe fn mark_driver_owned(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DeviceOwned,
            "Buffer must be device-owned before reclaim"
        );
        self.ownership = BufferOwnership::DriverOwned;
    }

    /// Mark buffer as free (DriverOwned -> Free).
    ///
    /// # Safety
    /// Only call during return to pool.
    pub(crate) unsafe fn mark_free(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "Buffer must be driver-owned before freeing"
        );
        self.ownership = BufferOwnership::Free;
    }

    pub(crate) fn region(&self) -> DmaRegion {
        self.region
    }
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("id", &self.id)
            .field("bus_addr", &format_args!("{:#x}", self.region.bus_base()))
            .field("capacity", &self.region.size())
            .field("ownership", &self.ownership)
            .finish()
    }
}
