//! Device configuration: buffer sizing and negotiated host facts.

use log::{info, warn};

use dma_pool::PAGE_SIZE;

/// Receive buffers posted per data port.
pub const VIRTIO_SERIAL_MAX_PORT_RECEIVE_BUFFERS: usize = 128;

/// Receive buffers posted on the control channel.
pub const VIRTIO_SERIAL_MAX_CONTROL_RECEIVE_BUFFERS: usize = 16;

/// Queues the transport can address (2 for each of 32 ports).
pub const DEFAULT_MAX_QUEUES: u16 = 64;

/// `VIRTIO_CONSOLE_F_MULTIPORT` host feature bit.
pub const VIRTIO_CONSOLE_F_MULTIPORT: u64 = 1 << 1;

/// Facts resolved during feature negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFeatures {
    /// Host offered (and we accepted) `VIRTIO_CONSOLE_F_MULTIPORT`.
    pub multiport: bool,
    /// `max_nr_ports` from config space (1 when not multi-port).
    pub max_nr_ports: u32,
}

impl HostFeatures {
    /// Legacy single-port host.
    pub const fn single_port() -> Self {
        Self {
            multiport: false,
            max_nr_ports: 1,
        }
    }

    /// Multi-port host advertising `max_nr_ports`.
    pub const fn multiport(max_nr_ports: u32) -> Self {
        Self {
            multiport: true,
            max_nr_ports,
        }
    }

    /// Build from raw host feature bits and the config-space port count.
    ///
    /// Without the multi-port bit the config-space value is not valid and
    /// is ignored.
    pub fn from_feature_bits(host_features: u64, max_nr_ports: u32) -> Self {
        if host_features & VIRTIO_CONSOLE_F_MULTIPORT != 0 {
            Self::multiport(max_nr_ports)
        } else {
            Self::single_port()
        }
    }
}

impl Default for HostFeatures {
    fn default() -> Self {
        Self::single_port()
    }
}

/// Buffer-manager tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    /// Size of every send and receive descriptor.
    pub buffer_size: usize,
    /// Receive buffers per data port.
    pub max_port_rx_buffers: usize,
    /// Receive buffers on the control channel.
    pub max_control_rx_buffers: usize,
    /// Highest queue count the transport supports.
    pub max_queues: u16,
}

impl SerialConfig {
    pub const fn new() -> Self {
        Self {
            buffer_size: PAGE_SIZE,
            max_port_rx_buffers: VIRTIO_SERIAL_MAX_PORT_RECEIVE_BUFFERS,
            max_control_rx_buffers: VIRTIO_SERIAL_MAX_CONTROL_RECEIVE_BUFFERS,
            max_queues: DEFAULT_MAX_QUEUES,
        }
    }

    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub const fn with_receive_buffers(mut self, port: usize, control: usize) -> Self {
        self.max_port_rx_buffers = port;
        self.max_control_rx_buffers = control;
        self
    }

    pub const fn with_max_queues(mut self, max_queues: u16) -> Self {
        self.max_queues = max_queues;
        self
    }

    /// Number of data ports this device will drive.
    ///
    /// Single-port hosts always get exactly one. Multi-port hosts get
    /// `max_nr_ports`, clamped so that every port pair plus the control pair
    /// fits in `max_queues`.
    pub fn resolve_port_count(&self, host: &HostFeatures) -> u32 {
        if !host.multiport {
            return 1;
        }

        info!("[VIOSER] multiport host, max_nr_ports {}", host.max_nr_ports);

        let limit = u32::from(self.max_queues / 2).saturating_sub(1).max(1);
        let mut ports = host.max_nr_ports.max(1);
        if ports > limit {
            warn!("[VIOSER] max_nr_ports limited to {}", limit);
            ports = limit;
        }
        ports
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new()
    }
}
