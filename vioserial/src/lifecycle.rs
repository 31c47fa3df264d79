//! Queue lifecycle controller.
//!
//! ```text
//! Uncreated ──create──> Created ──post──> Posted ──suspend──> Suspended
//!     │                                                          │
//!     │                                   Posted <──resume───────┘
//!     │
//!     └─── any state ──destroy──> Destroyed ──create──> Created ...
//! ```
//!
//! Transitions that change ring existence take `&mut self`, so no send,
//! receive or interrupt path can observe a half-built or half-torn-down
//! table.

use alloc::vec::Vec;

use dma_pool::{DmaAllocator, DmaPool};
use log::{debug, error, info, warn};

use crate::config::SerialConfig;
use crate::error::InitError;
use crate::mapper::{Channel, PortId, QueueIndexMapper};
use crate::port::{PortQueues, PortStats};
use crate::virtqueue::{VirtioTransport, Virtqueue};

/// Where the queue table is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing built yet.
    Uncreated,
    /// Rings exist, no buffers.
    Created,
    /// Rings exist and buffers are posted. I/O allowed.
    Posted,
    /// Rings shut down; ring objects and buffers retained.
    Suspended,
    /// Everything released.
    Destroyed,
}

/// What happened to each ring on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeSummary {
    /// Rings reset in place.
    pub renewed: usize,
    /// Rings rebuilt from scratch.
    pub recreated: usize,
    /// Rings that could not be brought back. Their slot stays degraded.
    pub unavailable: usize,
}

/// Owner of the queue table.
pub struct QueueController<Q: Virtqueue> {
    state: QueueState,
    mapper: QueueIndexMapper,
    config: SerialConfig,
    ports: Vec<PortQueues<Q>>,
}

impl<Q: Virtqueue> QueueController<Q> {
    pub fn new(mapper: QueueIndexMapper, config: SerialConfig) -> Self {
        Self {
            state: QueueState::Uncreated,
            mapper,
            config,
            ports: Vec::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn mapper(&self) -> &QueueIndexMapper {
        &self.mapper
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Context of a table slot, if the table is built.
    pub fn slot(&self, slot: usize) -> Option<&PortQueues<Q>> {
        self.ports.get(slot)
    }

    pub fn port(&self, port: PortId) -> Option<&PortQueues<Q>> {
        self.slot(self.mapper.slot_for_port(port)?)
    }

    pub fn control(&self) -> Option<&PortQueues<Q>> {
        self.mapper
            .has_control()
            .then(|| self.slot(crate::mapper::CONTROL_SLOT))
            .flatten()
    }

    pub fn port_stats(&self, port: PortId) -> Option<PortStats> {
        self.port(port).map(PortQueues::stats)
    }

    /// Build every ring in the table.
    ///
    /// All or nothing: if any ring cannot be located, every ring built in
    /// this pass is shut down, deleted and its memory returned.
    pub fn create<T, A>(&mut self, transport: &mut T, pool: &DmaPool<A>) -> Result<(), InitError>
    where
        T: VirtioTransport<Queue = Q>,
        A: DmaAllocator,
    {
        self.check(
            matches!(self.state, QueueState::Uncreated | QueueState::Destroyed),
            QueueState::Created,
        )?;

        let mapper = self.mapper;
        let mut built: Vec<PortQueues<Q>> = Vec::with_capacity(mapper.slot_count());
        for (slot, channel) in mapper.slots() {
            let pair = QueueIndexMapper::pair_for_slot(slot);

            let receive = match find_queue(transport, pool, pair.receive) {
                Some(q) => q,
                None => {
                    unwind(transport, pool, built);
                    return Err(Self::create_failed(pair.receive));
                }
            };
            let send = match find_queue(transport, pool, pair.send) {
                Some(q) => q,
                None => {
                    delete_queue(transport, pool, receive);
                    unwind(transport, pool, built);
                    return Err(Self::create_failed(pair.send));
                }
            };

            let max_rx = match channel {
                Channel::Control => self.config.max_control_rx_buffers,
                Channel::Port(_) => self.config.max_port_rx_buffers,
            };
            built.push(PortQueues::new(
                slot,
                channel,
                max_rx,
                self.config.buffer_size,
                receive,
                send,
            ));
        }

        info!(
            "[VIOSER] created {} rings ({} ports, control {})",
            self.mapper.ring_count(),
            self.mapper.port_count(),
            self.mapper.has_control()
        );
        self.ports = built;
        self.state = QueueState::Created;
        Ok(())
    }

    /// Fill every slot's receive ring and send free-list.
    pub fn post<A: DmaAllocator>(&mut self, pool: &DmaPool<A>) -> Result<(), InitError> {
        self.check(self.state == QueueState::Created, QueueState::Posted)?;

        for port in self.ports.iter_mut() {
            port.prepare_receive_buffers(pool);
            port.prepare_transmit_buffers(pool);
        }
        self.state = QueueState::Posted;
        Ok(())
    }

    /// Shut down every ring, keeping ring objects and buffers.
    ///
    /// Completions the host already posted are collected first: received
    /// data moves to the ready list and finished sends to the free-list.
    pub fn suspend(&mut self) -> Result<(), InitError> {
        self.check(self.state == QueueState::Posted, QueueState::Suspended)?;

        for port in self.ports.iter_mut() {
            port.collect_receive_completions();
            port.collect_send_completions();
            port.shutdown_rings();
        }
        info!("[VIOSER] queues suspended");
        self.state = QueueState::Suspended;
        Ok(())
    }

    /// Bring every ring back and repost buffers.
    ///
    /// Rings that survived are renewed in place and get their posted
    /// receive buffers back. Rings that did not are rebuilt and filled.
    /// Unread receive data is kept and pending sends are submitted again. Best effort: a ring that cannot be
    /// brought back is counted as unavailable and its slot stays degraded.
    pub fn resume<T, A>(&mut self, transport: &mut T, pool: &DmaPool<A>) -> Result<ResumeSummary, InitError>
    where
        T: VirtioTransport<Queue = Q>,
        A: DmaAllocator,
    {
        self.check(self.state == QueueState::Suspended, QueueState::Created)?;
        self.state = QueueState::Created;

        let mut summary = ResumeSummary::default();
        for port in self.ports.iter_mut() {
            let pair = port.pair();

            // Whatever the outcome, the ring no longer holds anything we
            // submitted before the suspend.
            let rx = revive(transport, pool, &mut port.rx.get_mut().ring, pair.receive);
            summary.count(rx);
            port.repost_after_renew(pool);
            if rx == Revival::Recreated {
                port.prepare_receive_buffers(pool);
            }

            let tx = revive(transport, pool, &mut port.tx.get_mut().ring, pair.send);
            summary.count(tx);
            port.resubmit_in_use_after_renew();
            if tx == Revival::Recreated {
                port.prepare_transmit_buffers(pool);
            }
        }

        if summary.unavailable > 0 {
            warn!("[VIOSER] {} rings unavailable after resume", summary.unavailable);
        }
        info!(
            "[VIOSER] queues resumed ({} renewed, {} recreated)",
            summary.renewed, summary.recreated
        );
        self.state = QueueState::Posted;
        Ok(summary)
    }

    /// Release every ring and every descriptor. Never fails; safe to call
    /// in any state, any number of times.
    pub fn destroy<T, A>(&mut self, transport: &mut T, pool: &DmaPool<A>)
    where
        T: VirtioTransport<Queue = Q>,
        A: DmaAllocator,
    {
        let ports = core::mem::take(&mut self.ports);
        let had_rings = !ports.is_empty();

        let mut freed = 0;
        for mut port in ports {
            if let Some(ring) = port.rx.get_mut().ring.take() {
                delete_queue(transport, pool, ring);
            }
            if let Some(ring) = port.tx.get_mut().ring.take() {
                delete_queue(transport, pool, ring);
            }
            // Rings are gone, nothing can touch the descriptors any more.
            freed += unsafe { port.free_all_descriptors(pool) };
        }

        if had_rings {
            info!("[VIOSER] queues destroyed, {} buffers freed", freed);
        }
        self.state = QueueState::Destroyed;
    }

    fn check(&self, allowed: bool, to: QueueState) -> Result<(), InitError> {
        if allowed {
            Ok(())
        } else {
            warn!("[VIOSER] rejected transition {:?} -> {:?}", self.state, to);
            Err(InitError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    fn create_failed(ring_index: u16) -> InitError {
        error!("[VIOSER] could not build ring {}, bring-up aborted", ring_index);
        InitError::InsufficientResources { ring_index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Revival {
    Renewed,
    Recreated,
    Unavailable,
}

impl ResumeSummary {
    fn count(&mut self, revival: Revival) {
        match revival {
            Revival::Renewed => self.renewed += 1,
            Revival::Recreated => self.recreated += 1,
            Revival::Unavailable => self.unavailable += 1,
        }
    }
}

/// Renew a shut-down ring, or rebuild it if renewing fails or it is missing.
fn revive<T, A>(transport: &mut T, pool: &DmaPool<A>, ring: &mut Option<T::Queue>, index: u16) -> Revival
where
    T: VirtioTransport,
    A: DmaAllocator,
{
    if let Some(q) = ring.as_mut() {
        if q.renew() {
            return Revival::Renewed;
        }
        warn!("[VIOSER] ring {} did not renew, rebuilding", index);
        if let Some(stale) = ring.take() {
            delete_queue(transport, pool, stale);
        }
    }

    match find_queue(transport, pool, index) {
        Some(q) => {
            *ring = Some(q);
            Revival::Recreated
        }
        None => Revival::Unavailable,
    }
}

/// Query, allocate and construct ring `index`.
///
/// The ring memory goes back to the pool if construction fails.
fn find_queue<T, A>(transport: &mut T, pool: &DmaPool<A>, index: u16) -> Option<T::Queue>
where
    T: VirtioTransport,
    A: DmaAllocator,
{
    let Some(layout) = transport.query_queue_allocation(index) else {
        warn!("[VIOSER] device has no ring {}", index);
        return None;
    };

    let region = match pool.alloc_contiguous(layout.alloc_size) {
        Ok(region) => region,
        Err(e) => {
            warn!("[VIOSER] ring {}: {}", index, e);
            return None;
        }
    };

    match transport.prepare_queue(index, region) {
        Some(queue) => {
            debug!(
                "[VIOSER] ring {}: {} entries at p{:#x}",
                index,
                layout.size,
                region.bus_base()
            );
            Some(queue)
        }
        None => {
            unsafe { pool.free_contiguous(region) };
            warn!("[VIOSER] ring {}: construction failed", index);
            None
        }
    }
}

/// Shut down, delete and release one ring.
fn delete_queue<T, A>(transport: &mut T, pool: &DmaPool<A>, mut queue: T::Queue)
where
    T: VirtioTransport,
    A: DmaAllocator,
{
    queue.shutdown();
    let region = transport.delete_queue(queue);
    unsafe { pool.free_contiguous(region) };
}

/// Undo a partial create pass. Nothing has been posted yet.
fn unwind<T, A>(transport: &mut T, pool: &DmaPool<A>, built: Vec<PortQueues<T::Queue>>)
where
    T: VirtioTransport,
    A: DmaAllocator,
{
    for mut port in built {
        if let Some(ring) = port.rx.get_mut().ring.take() {
            delete_queue(transport, pool, ring);
        }
        if let Some(ring) = port.tx.get_mut().ring.take() {
            delete_queue(transport, pool, ring);
        }
    }
}
