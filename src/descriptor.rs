//! Descriptor encoding: endpoint descriptors handed to the link by device drivers, and the hub and
//! BOS descriptors reported by the emulated root hubs.

use crate::endpoint::{EndpointAddress, EndpointType};
use crate::{Result, UsbError};

/// Standard descriptor types
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const BOS: u8 = 15;
    pub const CAPABILITY: u8 = 16;
    pub const HUB: u8 = 0x29;
    pub const SS_HUB: u8 = 0x2a;
    pub const SS_ENDPOINT_COMPANION: u8 = 48;
}

/// USB capability types
#[allow(missing_docs)]
pub mod capability_type {
    pub const SS_USB_DEVICE: u8 = 3;
}

/// Maximum streams per endpoint the link can track.
pub const MAX_STREAMS: u16 = 16;

/// Writes into a caller buffer, one descriptor at a time.
pub struct DescriptorWriter<'a> {
    buf: &'a mut [u8],
    position: usize,
}

impl DescriptorWriter<'_> {
    pub(crate) fn new(buf: &mut [u8]) -> DescriptorWriter<'_> {
        DescriptorWriter { buf, position: 0 }
    }

    /// Gets the current position in the buffer, i.e. the number of bytes written so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Writes an arbitrary (usually class-specific) descriptor.
    pub fn write(&mut self, descriptor_type: u8, descriptor: &[u8]) -> Result<()> {
        let length = descriptor.len();

        if (self.position + 2 + length) > self.buf.len() || (length + 2) > 255 {
            return Err(UsbError::BufferOverflow);
        }

        self.buf[self.position] = (length + 2) as u8;
        self.buf[self.position + 1] = descriptor_type;

        let start = self.position + 2;

        self.buf[start..start + length].copy_from_slice(descriptor);

        self.position = start + length;

        Ok(())
    }

    /// Overwrites already written bytes, for length fields that are known only at the end.
    pub(crate) fn insert(&mut self, index: usize, data: &[u8]) {
        self.buf[index..index + data.len()].copy_from_slice(data);
    }
}

/// USB endpoint descriptor information, plus the stream count of an optional SuperSpeed
/// companion descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointDescriptor {
    /// Endpoint address.
    pub address: EndpointAddress,

    /// Endpoint transfer type.
    pub ep_type: EndpointType,

    /// Raw `wMaxPacketSize`. Bits 11..12 carry the high-bandwidth multiplier.
    pub max_packet_size: u16,

    /// Poll interval for interrupt and isochronous endpoints.
    pub interval: u8,

    /// Number of bulk streams from the SuperSpeed companion descriptor. Zero when the endpoint
    /// does not support streams.
    pub max_streams: u16,
}

impl EndpointDescriptor {
    /// A descriptor without streams.
    pub fn new(address: u8, ep_type: EndpointType, max_packet_size: u16) -> Self {
        EndpointDescriptor {
            address: address.into(),
            ep_type,
            max_packet_size,
            interval: 0,
            max_streams: 0,
        }
    }

    /// Sets the poll interval.
    pub fn with_interval(mut self, interval: u8) -> Self {
        self.interval = interval;
        self
    }

    /// Declares bulk stream support as a SuperSpeed companion descriptor would.
    pub fn with_streams(mut self, max_streams: u16) -> Self {
        self.max_streams = max_streams;
        self
    }

    /// Payload size of one packet, without the high-bandwidth multiplier bits.
    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & 0x7ff
    }

    /// High-bandwidth additional transactions per microframe (0..=2).
    pub fn mult(&self) -> u16 {
        (self.max_packet_size >> 11) & 0x3
    }

    /// Parses a 7 byte endpoint descriptor, optionally followed by a 6 byte SuperSpeed endpoint
    /// companion descriptor.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 || buf[0] < 7 || buf[1] != descriptor_type::ENDPOINT {
            return Err(UsbError::InvalidArgument);
        }

        let mut desc = EndpointDescriptor {
            address: buf[2].into(),
            ep_type: EndpointType::from_attributes(buf[3]),
            max_packet_size: u16::from_le_bytes([buf[4], buf[5]]),
            interval: buf[6],
            max_streams: 0,
        };

        let companion = &buf[buf[0] as usize..];
        if companion.len() >= 6 && companion[1] == descriptor_type::SS_ENDPOINT_COMPANION {
            // bmAttributes holds log2 of the stream count for bulk endpoints.
            let exponent = companion[3] & 0x1f;
            if desc.ep_type == EndpointType::Bulk && exponent > 0 {
                desc.max_streams = 1u16.checked_shl(exponent as u32).unwrap_or(u16::MAX);
            }
        }

        Ok(desc)
    }
}

/// Characteristics: individual port power switching, ganged overcurrent.
const HUB_CHARACTERISTICS: u16 = 0x0001;

/// USB 2.0 root hub descriptor, 9 bytes.
pub(crate) fn write_hub_descriptor(writer: &mut DescriptorWriter) -> Result<()> {
    let ch = HUB_CHARACTERISTICS.to_le_bytes();

    writer.write(
        descriptor_type::HUB,
        &[
            1, // bNbrPorts
            ch[0],
            ch[1], // wHubCharacteristics
            0,     // bPwrOn2PwrGood
            0,     // bHubContrCurrent
            0xff,  // DeviceRemovable
            0xff,  // PortPwrCtrlMask
        ],
    )
}

/// USB 3.0 root hub descriptor, 12 bytes.
pub(crate) fn write_ss_hub_descriptor(writer: &mut DescriptorWriter) -> Result<()> {
    let ch = HUB_CHARACTERISTICS.to_le_bytes();
    let removable = 0xffffu16.to_le_bytes();

    writer.write(
        descriptor_type::SS_HUB,
        &[
            1, // bNbrPorts
            ch[0],
            ch[1], // wHubCharacteristics
            0,     // bPwrOn2PwrGood
            0,     // bHubContrCurrent
            0x04,  // bHubHdrDecLat
            0,
            0, // wHubDelay
            removable[0],
            removable[1], // DeviceRemovable
        ],
    )
}

/// `wSpeedSupported` bit for 5 Gbit/s operation.
const SPEED_5GBPS_OPERATION: u16 = 0x0008;

/// BOS descriptor with a single SuperSpeed device capability, 15 bytes.
pub(crate) fn write_bos_descriptor(writer: &mut DescriptorWriter) -> Result<()> {
    let start = writer.position();

    writer.write(
        descriptor_type::BOS,
        &[
            0, 0, // wTotalLength (placeholder)
            1, // bNumDeviceCaps
        ],
    )?;

    let speeds = SPEED_5GBPS_OPERATION.to_le_bytes();

    writer.write(
        descriptor_type::CAPABILITY,
        &[
            capability_type::SS_USB_DEVICE, // bDevCapabilityType
            0,                              // bmAttributes
            speeds[0],
            speeds[1], // wSpeedSupported
            SPEED_5GBPS_OPERATION.trailing_zeros() as u8, // bFunctionalitySupport
            0,                                            // bU1DevExitLat
            0,
            0, // wU2DevExitLat
        ],
    )?;

    let total = ((writer.position() - start) as u16).to_le_bytes();
    writer.insert(start + 2, &total);

    Ok(())
}
