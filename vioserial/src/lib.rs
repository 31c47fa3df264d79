//! Queue and buffer manager for virtio-serial (multi-port console) devices.
//!
//! Owns the rings of a virtio-serial device and every DMA buffer posted to
//! them, from bring-up through suspend/resume to final teardown.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ SerialDevice: lifecycle callbacks, send/receive, IRQs     │
//! ├───────────────────────────────────────────────────────────┤
//! │ QueueController: queue table and its state machine        │
//! ├──────────────┬──────────────┬──────────────┬──────────────┤
//! │ slot 0       │ slot 1       │ slot 2       │ ...          │
//! │ port 0       │ control      │ port 1       │              │
//! │ rings 0,1    │ rings 2,3    │ rings 4,5    │              │
//! ├──────────────┴──────────────┴──────────────┴──────────────┤
//! │ Virtqueue / VirtioTransport (rings)     DmaPool (buffers) │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let host = HostFeatures::from_feature_bits(features, max_nr_ports);
//! let mut dev = SerialDevice::new(transport, DmaPool::new(alloc), SerialConfig::default(), host);
//! dev.on_hardware_prepared()?;
//!
//! dev.send(PortId(0), b"hello", true)?;
//! dev.on_ring_interrupt();
//! if let Some(n) = dev.receive(PortId(0), &mut buf)? {
//!     // buf[..n]
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod mapper;
pub mod port;
pub mod virtqueue;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::{HostFeatures, SerialConfig};
pub use control::{ControlEvent, ControlMessage};
pub use device::{PortObserver, SerialDevice};
pub use error::{ControlError, InitError, ReceiveError, SendError};
pub use lifecycle::{QueueController, QueueState, ResumeSummary};
pub use mapper::{Channel, PortId, QueueIndexMapper, QueuePair, RingRole};
pub use port::{PortQueues, PortStats, SendOutcome};
pub use virtqueue::{BufferDirection, BufferToken, QueueAllocation, RingFull, UsedBuffer, VirtioTransport, Virtqueue};
