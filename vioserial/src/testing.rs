//! Simulated host side: rings, transport and a DMA allocator that can run dry.
//!
//! The heap allocator's bus address is the virtual address, so the
//! simulated host reads and writes payloads through the token address the
//! same way a device would through DMA.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dma_pool::{DmaAllocator, DmaRegion, HeapAllocator};
use spin::Mutex;

use crate::virtqueue::{
    BufferDirection, BufferToken, QueueAllocation, RingFull, UsedBuffer, VirtioTransport, Virtqueue,
};

struct RingModel {
    size: u16,
    capacity: usize,
    avail: VecDeque<(BufferToken, BufferDirection)>,
    used: VecDeque<UsedBuffer>,
    shut_down: bool,
    kicks: usize,
    renews: usize,
    renew_fails: bool,
}

/// Host's view of one ring.
#[derive(Clone)]
pub struct RingHandle(Arc<Mutex<RingModel>>);

impl RingHandle {
    fn new(size: u16) -> Self {
        Self(Arc::new(Mutex::new(RingModel {
            size,
            capacity: usize::from(size),
            avail: VecDeque::new(),
            used: VecDeque::new(),
            shut_down: false,
            kicks: 0,
            renews: 0,
            renew_fails: false,
        })))
    }

    /// Buffers submitted and not yet completed.
    pub fn available(&self) -> usize {
        self.0.lock().avail.len()
    }

    pub fn kicks(&self) -> usize {
        self.0.lock().kicks
    }

    pub fn renews(&self) -> usize {
        self.0.lock().renews
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.lock().shut_down
    }

    /// Make the ring accept fewer entries than it reports.
    pub fn set_capacity(&self, capacity: usize) {
        self.0.lock().capacity = capacity;
    }

    /// Make the next `renew` fail.
    pub fn fail_renew(&self) {
        self.0.lock().renew_fails = true;
    }

    /// Complete up to `n` submissions without looking at them.
    pub fn complete(&self, n: usize) -> usize {
        let mut ring = self.0.lock();
        let mut done = 0;
        while done < n {
            let Some((token, _)) = ring.avail.pop_front() else {
                break;
            };
            ring.used.push_back(UsedBuffer {
                id: token.id,
                len: token.len,
            });
            done += 1;
        }
        done
    }

    /// Consume every host-readable submission, returning the payloads.
    pub fn complete_all(&self) -> Vec<Vec<u8>> {
        let mut ring = self.0.lock();
        if ring.shut_down {
            return Vec::new();
        }
        let mut payloads = Vec::new();
        while let Some((token, direction)) = ring.avail.pop_front() {
            assert_eq!(direction, BufferDirection::HostReadable);
            let bytes = unsafe {
                std::slice::from_raw_parts(token.addr as *const u8, token.len as usize)
            };
            payloads.push(bytes.to_vec());
            ring.used.push_back(UsedBuffer {
                id: token.id,
                len: token.len,
            });
        }
        payloads
    }

    /// Write `bytes` into the oldest host-writable submission.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        let mut ring = self.0.lock();
        if ring.shut_down {
            return false;
        }
        let Some((token, direction)) = ring.avail.pop_front() else {
            return false;
        };
        assert_eq!(direction, BufferDirection::HostWritable);
        if bytes.len() > token.len as usize {
            ring.avail.push_front((token, direction));
            return false;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), token.addr as *mut u8, bytes.len());
        }
        ring.used.push_back(UsedBuffer {
            id: token.id,
            len: bytes.len() as u32,
        });
        true
    }
}

/// Driver's handle to a simulated ring.
pub struct MockQueue {
    index: u16,
    region: DmaRegion,
    ring: RingHandle,
}

impl MockQueue {
    /// A ring outside any transport, for exercising a single slot.
    pub fn standalone(size: u16) -> (Self, RingHandle) {
        let ring = RingHandle::new(size);
        let region = unsafe { DmaRegion::new(core::ptr::null_mut(), 0, 0) };
        (
            Self {
                index: u16::MAX,
                region,
                ring: ring.clone(),
            },
            ring,
        )
    }
}

impl Virtqueue for MockQueue {
    fn add_buf(&mut self, token: BufferToken, direction: BufferDirection) -> Result<(), RingFull> {
        let mut ring = self.ring.0.lock();
        if ring.shut_down || ring.avail.len() + ring.used.len() >= ring.capacity {
            return Err(RingFull);
        }
        ring.avail.push_back((token, direction));
        Ok(())
    }

    fn get_buf(&mut self) -> Option<UsedBuffer> {
        let mut ring = self.ring.0.lock();
        if ring.shut_down {
            return None;
        }
        ring.used.pop_front()
    }

    fn kick(&mut self) {
        self.ring.0.lock().kicks += 1;
    }

    fn shutdown(&mut self) {
        self.ring.0.lock().shut_down = true;
    }

    fn renew(&mut self) -> bool {
        let mut ring = self.ring.0.lock();
        if ring.renew_fails {
            return false;
        }
        ring.avail.clear();
        ring.used.clear();
        ring.shut_down = false;
        ring.renews += 1;
        true
    }

    fn size(&self) -> u16 {
        self.ring.0.lock().size
    }
}

#[derive(Default)]
struct HostState {
    rings: BTreeMap<u16, RingHandle>,
    fail_prepare: BTreeSet<u16>,
    prepared: usize,
    deleted: usize,
}

/// Transport whose rings live in a shared [`HostSim`].
pub struct MockTransport {
    ring_size: u16,
    state: Arc<Mutex<HostState>>,
}

impl MockTransport {
    pub fn new(ring_size: u16) -> (Self, HostSim) {
        let state = Arc::new(Mutex::new(HostState::default()));
        (
            Self {
                ring_size,
                state: state.clone(),
            },
            HostSim { state },
        )
    }
}

impl VirtioTransport for MockTransport {
    type Queue = MockQueue;

    fn query_queue_allocation(&self, _index: u16) -> Option<QueueAllocation> {
        Some(QueueAllocation {
            size: self.ring_size,
            alloc_size: usize::from(self.ring_size) * 32,
        })
    }

    fn prepare_queue(&mut self, index: u16, region: DmaRegion) -> Option<MockQueue> {
        let mut state = self.state.lock();
        if state.fail_prepare.contains(&index) {
            return None;
        }
        let ring = RingHandle::new(self.ring_size);
        state.rings.insert(index, ring.clone());
        state.prepared += 1;
        Some(MockQueue {
            index,
            region,
            ring,
        })
    }

    fn delete_queue(&mut self, queue: MockQueue) -> DmaRegion {
        let mut state = self.state.lock();
        state.rings.remove(&queue.index);
        state.deleted += 1;
        queue.region
    }
}

/// Test-side handle onto every ring a [`MockTransport`] built.
#[derive(Clone)]
pub struct HostSim {
    state: Arc<Mutex<HostState>>,
}

impl HostSim {
    /// Ring `index`. Panics if it does not exist.
    pub fn ring(&self, index: u16) -> RingHandle {
        self.state
            .lock()
            .rings
            .get(&index)
            .cloned()
            .unwrap_or_else(|| panic!("ring {} was never prepared", index))
    }

    /// Indices of rings currently alive.
    pub fn live_rings(&self) -> Vec<u16> {
        self.state.lock().rings.keys().copied().collect()
    }

    pub fn fail_prepare(&self, index: u16) {
        self.state.lock().fail_prepare.insert(index);
    }

    pub fn allow_prepare(&self, index: u16) {
        self.state.lock().fail_prepare.remove(&index);
    }

    pub fn prepared(&self) -> usize {
        self.state.lock().prepared
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().deleted
    }
}

/// Heap allocator that serves a fixed number of allocations.
pub struct FlakyAllocator {
    budget: AtomicUsize,
}

impl FlakyAllocator {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: AtomicUsize::new(budget),
        }
    }
}

unsafe impl DmaAllocator for FlakyAllocator {
    fn allocate(&self, size: usize, align: usize) -> Option<DmaRegion> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()?;
        HeapAllocator.allocate(size, align)
    }

    unsafe fn release(&self, region: DmaRegion) {
        HeapAllocator.release(region)
    }
}
