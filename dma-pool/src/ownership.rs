//! Buffer ownership state machine.
//!
//! # State Machine
//! ```text
//!     FREE ──alloc()──> DRIVER_OWNED ──submit()──> DEVICE_OWNED
//!       ▲                     │  ▲                      │
//!       └────free()───────────┘  └───get_buf()/shutdown─┘
//! ```
//!
//! INVARIANT: Touching the payload of a DEVICE_OWNED buffer is a bug.

/// Who may currently touch a buffer's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    /// Not handed out by the pool.
    Free,
    /// Held by the driver; CPU access allowed.
    DriverOwned,
    /// Submitted to a ring; the host may read or write it.
    DeviceOwned,
}

impl BufferOwnership {
    #[inline]
    pub fn is_free(self) -> bool {
        self == BufferOwnership::Free
    }

    /// CPU access is only legal while the driver owns the buffer.
    #[inline]
    pub fn can_access(self) -> bool {
        self == BufferOwnership::DriverOwned
    }

    #[inline]
    pub fn is_device_owned(self) -> bool {
        self == BufferOwnership::DeviceOwned
    }
}
