//! Endpoint addressing and the device-side endpoint table.

use crate::descriptor::EndpointDescriptor;
use crate::request::Request;
use crate::{Result, UsbDirection, UsbError, UsbSpeed};
use std::collections::VecDeque;

/// Maximum number of endpoints a device controller can declare, endpoint 0 included.
pub const MAX_ENDPOINTS: usize = 32;

/// Endpoint names of the default device controller. Fixed-function endpoints come first; the
/// suffix fixes the transfer type and the `in`/`out` infix fixes the direction.
pub const DEFAULT_ENDPOINT_NAMES: &[&str] = &[
    "ep0",
    "ep1in-bulk",
    "ep2out-bulk",
    "ep3in-iso",
    "ep4out-iso",
    "ep5in-int",
    "ep6in-bulk",
    "ep7out-bulk",
    "ep8in-iso",
    "ep9out-iso",
    "ep10in-int",
    "ep11in-bulk",
    "ep12out-bulk",
    "ep13in-iso",
    "ep14out-iso",
    "ep15in-int",
    "ep1out-bulk",
    "ep2in-bulk",
    "ep3out",
    "ep4in",
    "ep5out",
    "ep6out",
    "ep7in",
    "ep8out",
    "ep9in",
    "ep10out",
    "ep11out",
    "ep12in",
    "ep13out",
    "ep14in",
    "ep15out",
];

/// USB endpoint address that contains a direction and number.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointAddress(u8);

impl From<u8> for EndpointAddress {
    #[inline]
    fn from(addr: u8) -> EndpointAddress {
        EndpointAddress(addr)
    }
}

impl From<EndpointAddress> for u8 {
    #[inline]
    fn from(addr: EndpointAddress) -> u8 {
        addr.0
    }
}

impl EndpointAddress {
    const INBITS: u8 = UsbDirection::In as u8;

    /// Constructs a new EndpointAddress with the given number and direction.
    #[inline]
    pub fn from_parts(number: u8, dir: UsbDirection) -> Self {
        EndpointAddress((number & 0x0f) | dir as u8)
    }

    /// Gets the direction part of the address.
    #[inline]
    pub fn direction(&self) -> UsbDirection {
        if (self.0 & Self::INBITS) != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    /// Returns true if the direction is IN, otherwise false.
    #[inline]
    pub fn is_in(&self) -> bool {
        (self.0 & Self::INBITS) != 0
    }

    /// Gets the number part of the endpoint address.
    #[inline]
    pub fn number(&self) -> u8 {
        self.0 & 0x0f
    }

    /// Index into per-endpoint tables: `number * 2 + direction`.
    #[inline]
    pub(crate) fn index(&self) -> usize {
        (self.number() as usize) << 1 | self.is_in() as usize
    }
}

/// USB endpoint transfer type. The values of this enum can be directly cast into `u8` to get the
/// transfer bmAttributes transfer type bits.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointType {
    /// Control endpoint. Used for device management. Only the host can initiate requests. Usually
    /// used only endpoint 0.
    Control = 0b00,
    /// Isochronous endpoint. Used for time-critical unreliable data.
    Isochronous = 0b01,
    /// Bulk endpoint. Used for large amounts of best-effort reliable data.
    Bulk = 0b10,
    /// Interrupt endpoint. Used for small amounts of time-critical reliable data.
    Interrupt = 0b11,
}

impl EndpointType {
    /// Decodes the transfer type bits of `bmAttributes`.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0b11 {
            0b00 => EndpointType::Control,
            0b01 => EndpointType::Isochronous,
            0b10 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }

    /// Periodic endpoints are scheduled against a reserved per-interval allowance.
    pub fn is_periodic(&self) -> bool {
        matches!(self, EndpointType::Isochronous | EndpointType::Interrupt)
    }

    /// Suffix used in endpoint names and transfer listings.
    pub(crate) fn suffix(&self) -> &'static str {
        match self {
            EndpointType::Control => "",
            EndpointType::Isochronous => "-iso",
            EndpointType::Bulk => "-bulk",
            EndpointType::Interrupt => "-int",
        }
    }
}

/// Index of an endpoint in a device's endpoint table.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct EndpointId(pub(crate) usize);

impl EndpointId {
    /// The default control endpoint.
    pub const EP0: EndpointId = EndpointId(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

/// What an endpoint name restricts: its number, direction and transfer type.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct EndpointCaps {
    pub number: Option<u8>,
    pub direction: Option<UsbDirection>,
    pub ep_type: Option<EndpointType>,
}

impl EndpointCaps {
    /// Parses names like `ep1in-bulk`, `ep3out` or `ep0`.
    pub fn from_name(name: &str) -> Result<EndpointCaps> {
        let rest = name.strip_prefix("ep").ok_or(UsbError::InvalidArgument)?;

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let number = match digits {
            0 => None,
            _ => Some(
                rest[..digits]
                    .parse::<u8>()
                    .ok()
                    .filter(|n| *n < 16)
                    .ok_or(UsbError::InvalidArgument)?,
            ),
        };
        let rest = &rest[digits..];

        let (direction, rest) = if let Some(rest) = rest.strip_prefix("in") {
            (Some(UsbDirection::In), rest)
        } else if let Some(rest) = rest.strip_prefix("out") {
            (Some(UsbDirection::Out), rest)
        } else {
            (None, rest)
        };

        let ep_type = match rest {
            "" => None,
            "-bulk" => Some(EndpointType::Bulk),
            "-iso" => Some(EndpointType::Isochronous),
            "-int" => Some(EndpointType::Interrupt),
            _ => return Err(UsbError::InvalidArgument),
        };

        let ep_type = if number == Some(0) {
            Some(EndpointType::Control)
        } else {
            ep_type
        };

        Ok(EndpointCaps {
            number,
            direction,
            ep_type,
        })
    }

    /// Whether a descriptor could be placed on this endpoint.
    pub fn accepts(&self, desc: &EndpointDescriptor) -> bool {
        self.number.map_or(true, |n| n == desc.address.number())
            && self.direction.map_or(true, |d| d == desc.address.direction())
            && self.ep_type.map_or(true, |t| t == desc.ep_type)
    }
}

/// One emulated endpoint of the device controller.
pub(crate) struct Endpoint {
    pub name: &'static str,
    pub caps: EndpointCaps,
    pub desc: Option<EndpointDescriptor>,
    pub max_packet: u16,
    pub halted: bool,
    pub wedged: bool,
    pub already_seen: bool,
    pub setup_stage: bool,
    pub stream_en: bool,
    pub queue: VecDeque<Request>,
}

impl Endpoint {
    pub fn new(name: &'static str, caps: EndpointCaps) -> Self {
        Endpoint {
            name,
            caps,
            desc: None,
            max_packet: 0,
            halted: false,
            wedged: false,
            already_seen: false,
            setup_stage: false,
            stream_en: false,
            queue: VecDeque::new(),
        }
    }

    pub fn is_in(&self) -> bool {
        self.desc.map_or(false, |d| d.address.is_in())
    }

    /// Resets per-connection state. The queue is left to the caller to drain.
    pub fn reset(&mut self) {
        self.halted = false;
        self.wedged = false;
        self.already_seen = false;
        self.setup_stage = false;
    }
}

pub(crate) type EndpointTable = heapless::Vec<Endpoint, MAX_ENDPOINTS>;

/// Builds the endpoint table of a device controller from its endpoint names.
pub(crate) fn build_table(names: &[&'static str]) -> Result<EndpointTable> {
    if names.first() != Some(&"ep0") {
        return Err(UsbError::InvalidArgument);
    }

    let mut table = EndpointTable::new();

    for name in names {
        let caps = EndpointCaps::from_name(name)?;
        table
            .push(Endpoint::new(name, caps))
            .map_err(|_| UsbError::ResourceExhausted)?;
    }

    Ok(table)
}

/// Checks an endpoint descriptor against the endpoint's fixed function and the negotiated
/// device speed.
pub(crate) fn validate_descriptor(
    ep: &Endpoint,
    desc: &EndpointDescriptor,
    speed: UsbSpeed,
) -> Result<()> {
    let max = desc.max_packet();

    if max == 0 || desc.address.number() == 0 || !ep.caps.accepts(desc) {
        return Err(UsbError::InvalidArgument);
    }

    let valid = match desc.ep_type {
        EndpointType::Bulk => match speed {
            UsbSpeed::Super => max == 1024,
            UsbSpeed::High => max == 512,
            UsbSpeed::Full => matches!(max, 8 | 16 | 32 | 64),
            _ => false,
        },
        EndpointType::Interrupt => match speed {
            UsbSpeed::Super | UsbSpeed::High => max <= 1024,
            UsbSpeed::Full => max <= 64,
            UsbSpeed::Low => max <= 8,
            UsbSpeed::Unknown => false,
        },
        EndpointType::Isochronous => match speed {
            UsbSpeed::Super | UsbSpeed::High => max <= 1024,
            UsbSpeed::Full => max <= 1023,
            _ => false,
        },
        EndpointType::Control => false,
    };

    if !valid {
        usb_warn!(
            "{}: max packet {} invalid for {:?} at {:?}",
            ep.name,
            max,
            desc.ep_type,
            speed
        );
        return Err(UsbError::InvalidArgument);
    }

    if desc.max_streams > 0 && desc.ep_type != EndpointType::Bulk {
        return Err(UsbError::InvalidArgument);
    }

    Ok(())
}
