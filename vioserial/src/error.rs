//! Error types for the serial queue manager.

use thiserror::Error;

use crate::lifecycle::QueueState;
use crate::mapper::PortId;

/// Bring-up and state-transition errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    /// A required ring could not be located or its memory obtained.
    #[error("insufficient resources for ring {ring_index}")]
    InsufficientResources { ring_index: u16 },
    /// Lifecycle call made from the wrong state.
    #[error("invalid queue transition {from:?} -> {to:?}")]
    InvalidTransition { from: QueueState, to: QueueState },
}

/// Send-path errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Send free-list is empty. Backpressure, not a fault.
    #[error("no free send descriptor")]
    InsufficientResources,
    /// Payload larger than one descriptor. Never truncated.
    #[error("payload of {needed} bytes exceeds descriptor capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    /// Port does not exist on this device.
    #[error("{0} is not available")]
    PortUnavailable(PortId),
    /// Queues are not in the posted state.
    #[error("queues are not ready")]
    QueuesNotReady,
    /// Control message on a single-port device.
    #[error("control channel not negotiated")]
    ControlChannelInactive,
}

/// Receive-path errors. "No data" is `Ok(None)`, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("{0} is not available")]
    PortUnavailable(PortId),
}

/// Malformed control-channel payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control message truncated ({len} bytes)")]
    Truncated { len: usize },
    #[error("unknown control event {0}")]
    UnknownEvent(u16),
}
