//! A software USB connection: a virtual host controller wired directly to a virtual device
//! controller, with no hardware in between.
//!
//! Host-side code submits [`Transfer`](transfer::Transfer)s through an [`Hcd`](hcd::Hcd) handle,
//! device-side code queues [`Request`](request::Request)s through a [`Gadget`](gadget::Gadget)
//! handle, and the link moves bytes between the two once per emulated frame while emulating the
//! root hub port, control requests, endpoint halts and stream ids.
//!
//! ```
//! use usb_loopback::prelude::*;
//!
//! let clock = ManualClock::new();
//! let link = LinkBuilder::new(DeviceInstance::dummy(0), HostInstance::dummy(0))
//!     .clock(clock.clone())
//!     .attach()
//!     .unwrap();
//!
//! assert!(link.root_hub(HubSpeed::Usb2).is_some());
//! ```

#[macro_use]
mod macros;

/// A USB stack error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbError {
    /// A malformed call, such as a bad stream id or an attempt to wedge endpoint 0.
    InvalidArgument,

    /// The operation conflicts with work that is still in flight, for example halting an IN
    /// endpoint that still has queued data.
    Busy,

    /// The endpoint, driver or link is already enabled.
    AlreadyEnabled,

    /// A driver with the same name is already registered.
    AlreadyExists,

    /// The request, transfer, endpoint or driver was not found.
    NotFound,

    /// The endpoint is disabled, no driver is bound, or the link has been torn down.
    Shutdown,

    /// The request was cancelled because its endpoint was dequeued or reset.
    ConnectionReset,

    /// The transfer was cancelled by its submitter.
    Cancelled,

    /// The endpoint responded with a STALL handshake.
    Stall,

    /// No endpoint answered the pipe, or the transfer could not be carried out.
    Protocol,

    /// More data was offered than the receiving side asked for.
    Overflow,

    /// Less data arrived than the receiving side required.
    Underflow,

    /// The feature is not available at the current speed class.
    NotSupported,

    /// The device is not connected to the root hub port.
    NotConnected,

    /// The operation is not valid in the current device or port state.
    InvalidState,

    /// Memory for the operation could not be allocated.
    ResourceExhausted,

    /// A setup packet was not exactly 8 bytes long.
    InvalidSetupPacket,

    /// A caller supplied buffer is too small for the response.
    BufferOverflow,
}

impl core::fmt::Display for UsbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            UsbError::InvalidArgument => "invalid argument",
            UsbError::Busy => "resource busy",
            UsbError::AlreadyEnabled => "already enabled",
            UsbError::AlreadyExists => "already exists",
            UsbError::NotFound => "not found",
            UsbError::Shutdown => "endpoint or link shut down",
            UsbError::ConnectionReset => "connection reset",
            UsbError::Cancelled => "cancelled",
            UsbError::Stall => "endpoint stalled",
            UsbError::Protocol => "protocol error",
            UsbError::Overflow => "data overflow",
            UsbError::Underflow => "data underflow",
            UsbError::NotSupported => "not supported",
            UsbError::NotConnected => "not connected",
            UsbError::InvalidState => "invalid state",
            UsbError::ResourceExhausted => "out of memory",
            UsbError::InvalidSetupPacket => "invalid setup packet",
            UsbError::BufferOverflow => "buffer too small",
        };

        f.write_str(s)
    }
}

impl std::error::Error for UsbError {}

/// Result for USB operations.
pub type Result<T> = core::result::Result<T, UsbError>;

/// USB data flow direction.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum UsbDirection {
    /// Host to device (OUT)
    Out = 0x00,
    /// Device to host (IN)
    In = 0x80,
}

impl From<u8> for UsbDirection {
    fn from(value: u8) -> Self {
        if value & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }
}

/// Bus speed of a device or link. Ordered from slowest to fastest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    /// Not negotiated yet.
    Unknown,
    /// USB 1.1 low speed, 1.5 Mbit/s.
    Low,
    /// USB 1.1 full speed, 12 Mbit/s.
    Full,
    /// USB 2.0 high speed, 480 Mbit/s.
    High,
    /// USB 3.0 SuperSpeed, 5 Gbit/s.
    Super,
}

impl UsbSpeed {
    /// Short name used in transfer listings.
    pub fn short_name(self) -> &'static str {
        match self {
            UsbSpeed::Low => "ls",
            UsbSpeed::Full => "fs",
            UsbSpeed::High => "hs",
            UsbSpeed::Super => "ss",
            UsbSpeed::Unknown => "??",
        }
    }
}

/// Speed class of an emulated root hub.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HubSpeed {
    /// USB 2.0 root hub. Serves low, full and high speed devices.
    Usb2,
    /// USB 3.0 root hub. Serves SuperSpeed devices only.
    Usb3,
}

/// Completion status of a device request or a host transfer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Still queued or moving data.
    InProgress,
    /// Completed successfully.
    Success,
    /// Completed with an error.
    Failed(UsbError),
}

impl Status {
    /// Returns true once the status has left [`Status::InProgress`].
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::InProgress)
    }

    /// Converts a terminal status into a `Result`.
    pub fn result(&self) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::Failed(err) => Err(*err),
            Status::InProgress => Err(UsbError::Busy),
        }
    }
}

impl From<UsbError> for Status {
    fn from(err: UsbError) -> Self {
        Status::Failed(err)
    }
}

pub mod clock;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod endpoint;
pub mod gadget;
pub mod hcd;
pub mod hub;
pub mod link;
pub mod registry;
pub mod request;
pub mod transfer;

mod dummy;
mod engine;
mod scheduler;
mod standard_control;

pub use crate::dummy::{DummyHcdDriver, DummyUdcDriver};

/// Prelude for code that wires up a link and plays the host or device role.
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, MonotonicClock};
    pub use crate::config::{HostConfig, LinkBuilder};
    pub use crate::control::{Recipient, RequestType, SetupPacket};
    pub use crate::descriptor::EndpointDescriptor;
    pub use crate::endpoint::{EndpointAddress, EndpointId, EndpointType};
    pub use crate::gadget::{Gadget, GadgetDriver};
    pub use crate::hcd::{Hcd, HostDriver};
    pub use crate::link::Link;
    pub use crate::registry::{DeviceInstance, DriverRegistry, HostInstance};
    pub use crate::request::{Request, RequestHandle};
    pub use crate::transfer::{Pipe, Transfer, TransferHandle};
    pub use crate::{HubSpeed, Status, UsbDirection, UsbError, UsbSpeed};
}
