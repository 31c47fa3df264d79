//! Control-channel messages.
//!
//! Layout (little-endian, 8 bytes):
//!
//! ```text
//! 0      4       6       8
//! +------+-------+-------+
//! |  id  | event | value |
//! +------+-------+-------+
//! ```

use crate::error::ControlError;

/// Wire size of a control message header.
pub const CONTROL_MESSAGE_LEN: usize = 8;

/// Port id for device-wide messages.
pub const VIRTIO_CONSOLE_BAD_ID: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlEvent {
    DeviceReady = 0,
    PortAdd = 1,
    PortRemove = 2,
    PortReady = 3,
    ConsolePort = 4,
    Resize = 5,
    PortOpen = 6,
    PortName = 7,
}

impl TryFrom<u16> for ControlEvent {
    type Error = ControlError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::DeviceReady,
            1 => Self::PortAdd,
            2 => Self::PortRemove,
            3 => Self::PortReady,
            4 => Self::ConsolePort,
            5 => Self::Resize,
            6 => Self::PortOpen,
            7 => Self::PortName,
            other => return Err(ControlError::UnknownEvent(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub id: u32,
    pub event: ControlEvent,
    pub value: u16,
}

impl ControlMessage {
    pub const fn new(id: u32, event: ControlEvent, value: u16) -> Self {
        Self { id, event, value }
    }

    /// Driver announcement sent once the queues are up.
    pub const fn device_ready() -> Self {
        Self::new(VIRTIO_CONSOLE_BAD_ID, ControlEvent::DeviceReady, 1)
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_MESSAGE_LEN] {
        let mut out = [0u8; CONTROL_MESSAGE_LEN];
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..6].copy_from_slice(&(self.event as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    /// Decode a message header. Trailing bytes (a port name, for
    /// `PortName`) are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ControlError> {
        let header: &[u8; CONTROL_MESSAGE_LEN] = bytes
            .get(..CONTROL_MESSAGE_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(ControlError::Truncated { len: bytes.len() })?;

        let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let event = ControlEvent::try_from(u16::from_le_bytes([header[4], header[5]]))?;
        let value = u16::from_le_bytes([header[6], header[7]]);
        Ok(Self { id, event, value })
    }
}
