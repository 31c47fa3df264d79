//! Logical port ↔ ring index mapping.
//!
//! The layout is fixed by the host side and predates multi-port support:
//!
//! ```text
//! ring  0, 1  -> slot 0 -> port 0     (legacy single-port device)
//! ring  2, 3  -> slot 1 -> control    (only with VIRTIO_CONSOLE_F_MULTIPORT)
//! ring  4, 5  -> slot 2 -> port 1
//! ring  6, 7  -> slot 3 -> port 2
//! ...
//! ring 2s, 2s+1 -> slot s -> port s-1   (s >= 2)
//! ```
//!
//! Slot 1 is a reserved hole in the port numbering, not "the next port".
//! Every call site goes through [`QueueIndexMapper`]; nothing else does this
//! arithmetic.

/// Slot of the device-wide control channel.
pub const CONTROL_SLOT: usize = 1;

/// Logical port number as seen by the upper I/O layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u32);

impl core::fmt::Display for PortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// Ring indices owned by one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePair {
    /// Host → guest ring.
    pub receive: u16,
    /// Guest → host ring.
    pub send: u16,
}

/// What a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A data port.
    Port(PortId),
    /// The control channel.
    Control,
}

/// Direction of a single ring within its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    Receive,
    Send,
}

/// Bidirectional mapping for one device's negotiated port layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIndexMapper {
    port_count: u32,
    control: bool,
}

impl QueueIndexMapper {
    /// Layout for `port_count` data ports, with or without the control
    /// channel.
    ///
    /// Without the control channel only the legacy layout (port 0 alone)
    /// exists, so `port_count` is forced to 1.
    pub fn new(port_count: u32, control: bool) -> Self {
        let port_count = if control { port_count.max(1) } else { 1 };
        Self {
            port_count,
            control,
        }
    }

    pub fn port_count(&self) -> u32 {
        self.port_count
    }

    pub fn has_control(&self) -> bool {
        self.control
    }

    /// Slots in the queue table.
    pub fn slot_count(&self) -> usize {
        self.port_count as usize + usize::from(self.control)
    }

    /// Rings the device uses.
    pub fn ring_count(&self) -> u16 {
        (self.slot_count() * 2) as u16
    }

    /// Ring pair of a table slot. Pure function of the slot position.
    #[inline]
    pub const fn pair_for_slot(slot: usize) -> QueuePair {
        let receive = (slot * 2) as u16;
        QueuePair {
            receive,
            send: receive + 1,
        }
    }

    /// Table slot of a data port, `None` if the port does not exist.
    pub fn slot_for_port(&self, port: PortId) -> Option<usize> {
        if port.0 >= self.port_count {
            return None;
        }
        Some(match port.0 {
            0 => 0,
            n => n as usize + 1,
        })
    }

    pub fn pair_for_port(&self, port: PortId) -> Option<QueuePair> {
        self.slot_for_port(port).map(Self::pair_for_slot)
    }

    /// Ring pair of the control channel, if negotiated.
    pub fn control_pair(&self) -> Option<QueuePair> {
        self.control.then(|| Self::pair_for_slot(CONTROL_SLOT))
    }

    /// What a table slot carries.
    pub fn channel_for_slot(&self, slot: usize) -> Option<Channel> {
        if slot >= self.slot_count() {
            return None;
        }
        Some(match slot {
            0 => Channel::Port(PortId(0)),
            CONTROL_SLOT => Channel::Control,
            s => Channel::Port(PortId(s as u32 - 1)),
        })
    }

    /// Table slot holding a ring.
    #[inline]
    pub fn slot_for_ring(&self, ring: u16) -> Option<usize> {
        let slot = usize::from(ring / 2);
        (slot < self.slot_count()).then_some(slot)
    }

    /// Inverse mapping used by interrupt dispatch.
    pub fn channel_for_ring(&self, ring: u16) -> Option<(Channel, RingRole)> {
        let channel = self.channel_for_slot(self.slot_for_ring(ring)?)?;
        let role = if ring % 2 == 0 {
            RingRole::Receive
        } else {
            RingRole::Send
        };
        Some((channel, role))
    }

    /// All slots in ascending ring order.
    pub fn slots(&self) -> impl Iterator<Item = (usize, Channel)> + '_ {
        (0..self.slot_count()).filter_map(move |slot| Some((slot, self.channel_for_slot(slot)?)))
    }
}
