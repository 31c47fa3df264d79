//! Device front: lifecycle callbacks, port I/O and interrupt dispatch.

use alloc::boxed::Box;

use dma_pool::{DmaAllocator, DmaPool, PoolStats};
use log::{debug, error, info, warn};

use crate::config::{HostFeatures, SerialConfig};
use crate::control::ControlMessage;
use crate::error::{InitError, ReceiveError, SendError};
use crate::lifecycle::{QueueController, QueueState, ResumeSummary};
use crate::mapper::{Channel, PortId, QueueIndexMapper, RingRole};
use crate::port::{PortStats, SendOutcome};
use crate::virtqueue::VirtioTransport;

/// Upper-layer notifications. Called with no queue lock held.
pub trait PortObserver: Send + Sync {
    /// Queues are built and buffers posted.
    fn queues_ready(&self, _port_count: u32) {}

    /// Received data is waiting on `port`.
    fn data_ready(&self, _port: PortId) {}

    /// The host sent a control message.
    fn control_received(&self, _message: ControlMessage) {}
}

/// A virtio-serial device: transport, DMA pool and queue table.
pub struct SerialDevice<T: VirtioTransport, A: DmaAllocator> {
    transport: T,
    pool: DmaPool<A>,
    host: HostFeatures,
    queues: QueueController<T::Queue>,
    observer: Option<Box<dyn PortObserver>>,
}

impl<T: VirtioTransport, A: DmaAllocator> SerialDevice<T, A> {
    /// Set up for the negotiated `host` features. Nothing is built until
    /// [`on_hardware_prepared`](Self::on_hardware_prepared).
    pub fn new(transport: T, pool: DmaPool<A>, config: SerialConfig, host: HostFeatures) -> Self {
        let ports = config.resolve_port_count(&host);
        let mapper = QueueIndexMapper::new(ports, host.multiport);
        Self {
            transport,
            pool,
            host,
            queues: QueueController::new(mapper, config),
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn PortObserver>) {
        self.observer = Some(observer);
    }

    // ═══════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════

    /// Build every ring and post buffers.
    ///
    /// On a multi-port host the driver then announces itself with
    /// `DeviceReady`.
    pub fn on_hardware_prepared(&mut self) -> Result<(), InitError> {
        if let Err(e) = self.queues.create(&mut self.transport, &self.pool) {
            error!("[VIOSER] hardware bring-up failed: {}", e);
            return Err(e);
        }
        self.queues.post(&self.pool)?;

        let ports = self.port_count();
        info!("[VIOSER] {} port(s) ready", ports);
        if let Some(observer) = &self.observer {
            observer.queues_ready(ports);
        }

        if self.host.multiport {
            match self.send_control(ControlMessage::device_ready()) {
                Ok(SendOutcome::Queued) => debug!("[VIOSER] DeviceReady sent"),
                Ok(SendOutcome::NotQueued) => warn!("[VIOSER] DeviceReady not queued"),
                Err(e) => warn!("[VIOSER] DeviceReady failed: {}", e),
            }
        }
        Ok(())
    }

    /// Hardware is going away: release everything.
    pub fn on_hardware_released(&mut self) {
        self.queues.destroy(&mut self.transport, &self.pool);
    }

    pub fn on_enter_low_power(&mut self) -> Result<(), InitError> {
        self.queues.suspend()
    }

    pub fn on_resume(&mut self) -> Result<ResumeSummary, InitError> {
        self.queues.resume(&mut self.transport, &self.pool)
    }

    /// Last call before the device object goes away.
    pub fn on_final_shutdown(&mut self) {
        self.queues.destroy(&mut self.transport, &self.pool);
        let stats = self.pool.stats();
        if stats.live_descriptors != 0 || stats.live_regions != 0 {
            warn!(
                "[VIOSER] {} buffers and {} rings still live at shutdown",
                stats.live_descriptors, stats.live_regions
            );
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Port I/O
    // ═══════════════════════════════════════════════════════════

    /// Queue `data` on `port`'s send ring.
    pub fn send(&self, port: PortId, data: &[u8], kick: bool) -> Result<SendOutcome, SendError> {
        if self.queues.mapper().slot_for_port(port).is_none() {
            return Err(SendError::PortUnavailable(port));
        }
        if self.queues.state() != QueueState::Posted {
            return Err(SendError::QueuesNotReady);
        }
        self.queues
            .port(port)
            .ok_or(SendError::QueuesNotReady)?
            .send(data, kick)
    }

    /// Read waiting data from `port` into `dest`. `Ok(None)` when nothing
    /// is waiting or the queues are not up.
    ///
    /// Safe to call alongside `send` and interrupt servicing, but each port
    /// takes one reader at a time: two concurrent readers may see the pieces
    /// of a partly read completion out of order.
    pub fn receive(&self, port: PortId, dest: &mut [u8]) -> Result<Option<usize>, ReceiveError> {
        if self.queues.mapper().slot_for_port(port).is_none() {
            return Err(ReceiveError::PortUnavailable(port));
        }
        if self.queues.state() != QueueState::Posted {
            return Ok(None);
        }
        Ok(self
            .queues
            .port(port)
            .and_then(|q| q.receive(&self.pool, dest)))
    }

    /// Send a message on the control channel, kicking the host.
    pub fn send_control(&self, message: ControlMessage) -> Result<SendOutcome, SendError> {
        if !self.queues.mapper().has_control() {
            return Err(SendError::ControlChannelInactive);
        }
        if self.queues.state() != QueueState::Posted {
            return Err(SendError::QueuesNotReady);
        }
        self.queues
            .control()
            .ok_or(SendError::QueuesNotReady)?
            .send(&message.to_bytes(), true)
    }

    // ═══════════════════════════════════════════════════════════
    // Interrupts
    // ═══════════════════════════════════════════════════════════

    /// Service every ring in ascending index order. Returns the number of
    /// completions handled.
    pub fn on_ring_interrupt(&self) -> usize {
        if self.queues.state() != QueueState::Posted {
            return 0;
        }
        (0..self.queues.mapper().ring_count())
            .map(|ring| self.service_ring(ring))
            .sum()
    }

    /// Service one ring.
    pub fn service_ring(&self, ring: u16) -> usize {
        if self.queues.state() != QueueState::Posted {
            return 0;
        }
        let mapper = self.queues.mapper();
        let Some((channel, role)) = mapper.channel_for_ring(ring) else {
            return 0;
        };
        let Some(slot) = mapper.slot_for_ring(ring).and_then(|s| self.queues.slot(s)) else {
            return 0;
        };

        match (channel, role) {
            (_, RingRole::Send) => slot.collect_send_completions(),
            (Channel::Port(port), RingRole::Receive) => {
                let completed = slot.collect_receive_completions();
                if completed > 0 {
                    if let Some(observer) = &self.observer {
                        observer.data_ready(port);
                    }
                }
                completed
            }
            (Channel::Control, RingRole::Receive) => {
                slot.drain_messages(&self.pool, |raw| self.handle_control(raw))
            }
        }
    }

    fn handle_control(&self, raw: &[u8]) {
        match ControlMessage::parse(raw) {
            Ok(message) => {
                debug!(
                    "[VIOSER] control {:?} id {} value {}",
                    message.event, message.id, message.value
                );
                if let Some(observer) = &self.observer {
                    observer.control_received(message);
                }
            }
            Err(e) => warn!("[VIOSER] dropped control message: {}", e),
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════

    pub fn port_count(&self) -> u32 {
        self.queues.mapper().port_count()
    }

    pub fn is_control_channel_active(&self) -> bool {
        self.queues.mapper().has_control()
    }

    pub fn host_features(&self) -> HostFeatures {
        self.host
    }

    pub fn state(&self) -> QueueState {
        self.queues.state()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn port_stats(&self, port: PortId) -> Option<PortStats> {
        self.queues.port_stats(port)
    }

    pub fn control_stats(&self) -> Option<PortStats> {
        self.queues.control().map(|q| q.stats())
    }
}

impl<T: VirtioTransport, A: DmaAllocator> Drop for SerialDevice<T, A> {
    fn drop(&mut self) {
        self.queues.destroy(&mut self.transport, &self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlEvent, CONTROL_MESSAGE_LEN, VIRTIO_CONSOLE_BAD_ID};
    use crate::testing::{FlakyAllocator, HostSim, MockTransport};
    use dma_pool::HeapAllocator;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const RING: u16 = 8;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Ready(u32),
        Data(PortId),
        Control(ControlMessage),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<spin::Mutex<Vec<Event>>>);

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            core::mem::take(&mut *self.0.lock())
        }
    }

    impl PortObserver for Recorder {
        fn queues_ready(&self, port_count: u32) {
            self.0.lock().push(Event::Ready(port_count));
        }

        fn data_ready(&self, port: PortId) {
            self.0.lock().push(Event::Data(port));
        }

        fn control_received(&self, message: ControlMessage) {
            self.0.lock().push(Event::Control(message));
        }
    }

    fn config() -> SerialConfig {
        SerialConfig::default().with_buffer_size(512).with_receive_buffers(4, 2)
    }

    fn device(host: HostFeatures) -> (SerialDevice<MockTransport, HeapAllocator>, HostSim, Recorder) {
        let (transport, sim) = MockTransport::new(RING);
        let mut dev = SerialDevice::new(transport, DmaPool::new(HeapAllocator), config(), host);
        let recorder = Recorder::default();
        dev.set_observer(Box::new(recorder.clone()));
        (dev, sim, recorder)
    }

    #[test]
    fn single_port_host() {
        let (mut dev, sim, events) = device(HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();

        assert_eq!(dev.port_count(), 1);
        assert!(!dev.is_control_channel_active());
        assert_eq!(sim.live_rings(), vec![0, 1]);
        assert_eq!(events.take(), vec![Event::Ready(1)]);

        // No DeviceReady on a legacy host.
        assert_eq!(sim.ring(1).available(), 0);
        assert_eq!(
            dev.send_control(ControlMessage::device_ready()),
            Err(SendError::ControlChannelInactive)
        );
        assert_eq!(
            dev.send(PortId(1), b"x", true),
            Err(SendError::PortUnavailable(PortId(1)))
        );

        assert_eq!(dev.send(PortId(0), b"hi", true), Ok(SendOutcome::Queued));
        assert_eq!(sim.ring(1).complete_all(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn three_port_host_routes_by_ring() {
        let (mut dev, sim, events) = device(HostFeatures::multiport(3));
        dev.on_hardware_prepared().unwrap();
        assert_eq!(sim.live_rings(), (0..8).collect::<Vec<_>>());
        events.take();

        // DeviceReady went out on the control send ring.
        let announced = sim.ring(3).complete_all();
        assert_eq!(announced, vec![ControlMessage::device_ready().to_bytes().to_vec()]);

        dev.send(PortId(0), b"zero", true).unwrap();
        dev.send(PortId(1), b"one", true).unwrap();
        dev.send(PortId(2), b"two", true).unwrap();
        assert_eq!(sim.ring(1).complete_all(), vec![b"zero".to_vec()]);
        assert_eq!(sim.ring(5).complete_all(), vec![b"one".to_vec()]);
        assert_eq!(sim.ring(7).complete_all(), vec![b"two".to_vec()]);

        assert!(sim.ring(6).deliver(b"to port 2"));
        assert!(sim.ring(4).deliver(b"to port 1"));
        // 4 send completions (3 data + DeviceReady) and 2 receives.
        assert_eq!(dev.on_ring_interrupt(), 6);
        assert_eq!(events.take(), vec![Event::Data(PortId(1)), Event::Data(PortId(2))]);

        let mut dest = [0u8; 32];
        assert_eq!(dev.receive(PortId(2), &mut dest), Ok(Some(9)));
        assert_eq!(&dest[..9], b"to port 2");
        assert_eq!(dev.receive(PortId(0), &mut dest), Ok(None));
        assert_eq!(
            dev.receive(PortId(3), &mut dest),
            Err(ReceiveError::PortUnavailable(PortId(3)))
        );

        for port in 0..3 {
            assert_eq!(dev.port_stats(PortId(port)).unwrap().send_in_use, 0);
        }
    }

    #[test]
    fn control_messages_reach_the_observer() {
        let (mut dev, sim, events) = device(HostFeatures::multiport(2));
        dev.on_hardware_prepared().unwrap();
        events.take();

        let add = ControlMessage::new(1, ControlEvent::PortAdd, 0);
        let open = ControlMessage::new(1, ControlEvent::PortOpen, 1);
        assert!(sim.ring(2).deliver(&add.to_bytes()));
        assert!(sim.ring(2).deliver(&[0xAB; 3]));
        assert_eq!(dev.service_ring(2), 2);

        // Both buffers were recycled, so the host can keep talking.
        assert!(sim.ring(2).deliver(&open.to_bytes()));
        assert_eq!(dev.service_ring(2), 1);
        assert_eq!(events.take(), vec![Event::Control(add), Event::Control(open)]);
        // Every control buffer went back to the ring, malformed one included.
        assert_eq!(sim.ring(2).available(), 2);
        assert_eq!(dev.control_stats().unwrap().posted, 2);
    }

    #[test]
    fn guest_control_messages_go_out_on_ring_three() {
        let (mut dev, sim, _events) = device(HostFeatures::multiport(2));
        dev.on_hardware_prepared().unwrap();
        sim.ring(3).complete_all();

        let ready = ControlMessage::new(1, ControlEvent::PortReady, 1);
        assert_eq!(dev.send_control(ready), Ok(SendOutcome::Queued));
        let sent = sim.ring(3).complete_all();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), CONTROL_MESSAGE_LEN);
        assert_eq!(ControlMessage::parse(&sent[0]), Ok(ready));
        assert_ne!(ready.id, VIRTIO_CONSOLE_BAD_ID);
    }

    #[test]
    fn send_pool_exhaustion_is_backpressure() {
        let (mut dev, sim, _events) = device(HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();

        for _ in 0..RING {
            assert_eq!(dev.send(PortId(0), b"x", false), Ok(SendOutcome::Queued));
        }
        assert_eq!(dev.send(PortId(0), b"x", false), Err(SendError::InsufficientResources));
        let stats = dev.port_stats(PortId(0)).unwrap();
        assert_eq!((stats.send_free, stats.send_in_use), (0, usize::from(RING)));

        // Host catches up, completions come back, sending works again.
        sim.ring(1).complete_all();
        assert_eq!(dev.service_ring(1), usize::from(RING));
        assert_eq!(dev.send(PortId(0), b"x", false), Ok(SendOutcome::Queued));
    }

    #[test]
    fn io_outside_posted_state() {
        let (mut dev, _sim, _events) = device(HostFeatures::single_port());
        let mut dest = [0u8; 4];
        assert_eq!(dev.send(PortId(0), b"x", true), Err(SendError::QueuesNotReady));
        assert_eq!(dev.receive(PortId(0), &mut dest), Ok(None));
        assert_eq!(dev.on_ring_interrupt(), 0);

        dev.on_hardware_prepared().unwrap();
        dev.on_enter_low_power().unwrap();
        assert_eq!(dev.send(PortId(0), b"x", true), Err(SendError::QueuesNotReady));
        assert_eq!(dev.receive(PortId(0), &mut dest), Ok(None));

        dev.on_resume().unwrap();
        assert_eq!(dev.send(PortId(0), b"x", true), Ok(SendOutcome::Queued));
    }

    #[test]
    fn power_cycle_preserves_pools() {
        let (mut dev, sim, _events) = device(HostFeatures::multiport(2));
        dev.on_hardware_prepared().unwrap();
        let before = dev.pool_stats();
        let prepared = sim.prepared();

        for _ in 0..3 {
            dev.on_enter_low_power().unwrap();
            let summary = dev.on_resume().unwrap();
            assert_eq!(summary.renewed, 6);
        }
        assert_eq!(dev.pool_stats().live_descriptors, before.live_descriptors);
        assert_eq!(dev.pool_stats().live_regions, before.live_regions);
        assert_eq!(sim.prepared(), prepared);
    }

    #[test]
    fn data_completed_before_low_power_is_still_received() {
        let (mut dev, sim, _events) = device(HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();

        assert!(sim.ring(0).deliver(b"before-suspend"));
        dev.on_enter_low_power().unwrap();
        dev.on_resume().unwrap();
        dev.on_ring_interrupt();

        let mut buf = [0u8; 64];
        assert_eq!(dev.receive(PortId(0), &mut buf), Ok(Some(14)));
        assert_eq!(&buf[..14], b"before-suspend");
        let stats = dev.port_stats(PortId(0)).unwrap();
        assert_eq!(stats.posted + stats.ready, 4);
    }

    #[test]
    fn queued_send_reaches_the_host_after_resume() {
        let (mut dev, sim, _events) = device(HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();

        assert_eq!(dev.send(PortId(0), b"queued", true), Ok(SendOutcome::Queued));
        dev.on_enter_low_power().unwrap();
        dev.on_resume().unwrap();

        assert_eq!(sim.ring(1).complete_all(), vec![b"queued".to_vec()]);
        dev.on_ring_interrupt();
        let stats = dev.port_stats(PortId(0)).unwrap();
        assert_eq!((stats.send_free, stats.send_in_use), (usize::from(RING), 0));
    }

    #[test]
    fn send_and_interrupt_paths_run_concurrently() {
        const SENDS: usize = 500;

        let (mut dev, sim, _events) = device(HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();
        let rx_ring = sim.ring(0);
        let tx_ring = sim.ring(1);
        let sender_done = AtomicBool::new(false);

        let (delivered, received) = std::thread::scope(|s| {
            let dev = &dev;
            let sender_done = &sender_done;

            s.spawn(move || {
                let mut queued = 0;
                while queued < SENDS {
                    match dev.send(PortId(0), b"ping", true) {
                        Ok(SendOutcome::Queued) => queued += 1,
                        Ok(SendOutcome::NotQueued) | Err(SendError::InsufficientResources) => {
                            std::thread::yield_now()
                        }
                        Err(e) => panic!("send failed: {e}"),
                    }
                }
                sender_done.store(true, Ordering::Release);
            });

            let host = s.spawn(move || {
                let mut completed = 0;
                let mut delivered = 0;
                let mut received = 0;
                let mut buf = [0u8; 16];
                while !sender_done.load(Ordering::Acquire) || completed < SENDS {
                    for payload in tx_ring.complete_all() {
                        assert_eq!(payload, b"ping");
                        completed += 1;
                    }
                    if rx_ring.deliver(b"pong") {
                        delivered += 4;
                    }
                    dev.on_ring_interrupt();
                    while let Ok(Some(n)) = dev.receive(PortId(0), &mut buf) {
                        assert_eq!(&buf[..n], b"pong");
                        received += n;
                    }
                }
                assert_eq!(completed, SENDS);
                (delivered, received)
            });
            host.join().unwrap()
        });

        dev.on_ring_interrupt();
        let mut buf = [0u8; 16];
        let mut received = received;
        while let Ok(Some(n)) = dev.receive(PortId(0), &mut buf) {
            received += n;
        }
        assert_eq!(received, delivered);

        let stats = dev.port_stats(PortId(0)).unwrap();
        assert_eq!(stats.send_total(), usize::from(RING));
        assert_eq!(stats.send_in_use, 0);
        assert_eq!(stats.posted + stats.ready, 4);

        dev.on_final_shutdown();
        assert_eq!(dev.pool_stats().live_descriptors, 0);
    }

    #[test]
    fn final_teardown_frees_everything() {
        let (mut dev, sim, _events) = device(HostFeatures::multiport(2));
        dev.on_hardware_prepared().unwrap();

        assert!(sim.ring(0).deliver(b"unread"));
        assert!(sim.ring(4).deliver(b"also unread"));
        dev.on_ring_interrupt();
        dev.send(PortId(1), b"in flight", true).unwrap();

        dev.on_final_shutdown();
        let stats = dev.pool_stats();
        assert_eq!(stats.live_descriptors, 0);
        assert_eq!(stats.live_regions, 0);
        assert_eq!(stats.descriptors_allocated, stats.descriptors_freed);
        assert!(sim.live_rings().is_empty());
        assert_eq!(dev.state(), QueueState::Destroyed);

        // A late release after final shutdown is harmless.
        dev.on_hardware_released();
        assert_eq!(dev.pool_stats(), stats);
    }

    #[test]
    fn release_then_prepare_again() {
        let (mut dev, sim, _events) = device(HostFeatures::multiport(1));
        dev.on_hardware_prepared().unwrap();
        dev.on_hardware_released();
        assert!(sim.live_rings().is_empty());

        dev.on_hardware_prepared().unwrap();
        assert_eq!(sim.live_rings(), vec![0, 1, 2, 3]);
        assert_eq!(dev.port_stats(PortId(0)).unwrap().posted, 4);
    }

    #[test]
    fn bring_up_failure_is_reported_and_clean() {
        let (transport, sim) = MockTransport::new(RING);
        sim.fail_prepare(3);
        let mut dev = SerialDevice::new(
            transport,
            DmaPool::new(HeapAllocator),
            config(),
            HostFeatures::multiport(2),
        );
        assert_eq!(
            dev.on_hardware_prepared(),
            Err(InitError::InsufficientResources { ring_index: 3 })
        );
        assert_eq!(dev.state(), QueueState::Uncreated);
        assert_eq!(dev.pool_stats().live_regions, 0);
        assert!(sim.live_rings().is_empty());
    }

    #[test]
    fn short_pools_still_come_up() {
        let (transport, sim) = MockTransport::new(RING);
        // Two rings, then eight buffers: a full receive pool, half a send pool.
        let pool = DmaPool::new(FlakyAllocator::with_budget(10));
        let mut dev = SerialDevice::new(transport, pool, config(), HostFeatures::single_port());
        dev.on_hardware_prepared().unwrap();

        let stats = dev.port_stats(PortId(0)).unwrap();
        assert_eq!(stats.posted, 4);
        assert_eq!(stats.send_free, 4);
        assert_eq!(sim.ring(0).available(), 4);
    }

    #[test]
    fn dropping_the_device_releases_rings() {
        let (mut dev, sim, _events) = device(HostFeatures::multiport(1));
        dev.on_hardware_prepared().unwrap();
        drop(dev);
        assert!(sim.live_rings().is_empty());
        assert_eq!(sim.deleted(), 4);
    }
}
