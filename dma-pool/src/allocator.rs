//! Backing-memory provider seam.
//!
//! The pool never talks to firmware or a page allocator directly; whoever
//! owns physical memory implements [`DmaAllocator`].

use super::region::DmaRegion;

/// Source of physically contiguous, device-visible memory.
///
/// # Safety
/// Implementors must return regions whose CPU pointer is valid for `size`
/// bytes and whose bus address is what the device must be given to reach
/// that memory. A region must stay valid until passed to `release`.
pub unsafe trait DmaAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align`. `None` on exhaustion.
    fn allocate(&self, size: usize, align: usize) -> Option<DmaRegion>;

    /// Return a region obtained from `allocate`.
    ///
    /// # Safety
    /// `region` must come from this allocator and must not be referenced
    /// by anything (CPU or device) afterwards.
    unsafe fn release(&self, region: DmaRegion);
}

#[cfg(any(test, feature = "host-alloc"))]
pub use heap::HeapAllocator;

#[cfg(any(test, feature = "host-alloc"))]
mod heap {
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};

    use super::{DmaAllocator, DmaRegion};

    /// Alignment every heap region gets, whatever the caller asked for.
    const HEAP_ALIGN: usize = 4096;

    /// Global-heap backed allocator for hosted runs.
    ///
    /// There is no IOMMU in a hosted process, so the bus address is simply
    /// the virtual address. A simulated device can therefore write through
    /// the bus address directly.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HeapAllocator;

    unsafe impl DmaAllocator for HeapAllocator {
        fn allocate(&self, size: usize, align: usize) -> Option<DmaRegion> {
            if size == 0 || align > HEAP_ALIGN {
                return None;
            }
            let layout = Layout::from_size_align(size, HEAP_ALIGN).ok()?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return None;
            }
            Some(unsafe { DmaRegion::new(ptr, ptr as u64, size) })
        }

        unsafe fn release(&self, region: DmaRegion) {
            if let Ok(layout) = Layout::from_size_align(region.size(), HEAP_ALIGN) {
                dealloc(region.cpu_base(), layout);
            }
        }
    }
}
