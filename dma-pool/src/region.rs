//! DMA region abstraction.
//!
//! A block of device-visible memory. Layout within the block is the owner's
//! business: a `DmaBuffer` uses it as one flat payload, a virtqueue uses it
//! for its descriptor table and rings.

/// DMA-capable memory region.
///
/// Contains both CPU-accessible pointer and device-visible bus address.
#[derive(Clone, Copy)]
pub struct DmaRegion {
    cpu_ptr: *mut u8,
    bus_addr: u64,
    size: usize,
}

impl DmaRegion {
    /// Create a new DMA region.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of valid DMA-capable memory
    /// - `bus_addr` must be the corresponding device-visible address
    /// - Memory must be identity-mapped or IOMMU configured
    pub const unsafe fn new(cpu_ptr: *mut u8, bus_addr: u64, size: usize) -> Self {
        Self { cpu_ptr, bus_addr, size }
    }

    /// CPU base pointer.
    #[inline]
    pub const fn cpu_base(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// Bus base address (what devices see).
    #[inline]
    pub const fn bus_base(&self) -> u64 {
        self.bus_addr
    }

    /// Total size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Fill the whole region with zeroes.
    ///
    /// # Safety
    /// No device may be accessing the region.
    pub unsafe fn zero(&self) {
        core::ptr::write_bytes(self.cpu_ptr, 0, self.size);
    }

    /// Check if region is usable (non-null, non-empty).
    pub fn is_valid(&self) -> bool {
        !self.cpu_ptr.is_null() && self.size > 0
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
