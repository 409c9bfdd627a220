//! Setup packets and the request, feature and status codes the link understands.

use crate::{Result, UsbDirection, UsbError};
use num_enum::{FromPrimitive, TryFromPrimitive};

/// Control request type.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    /// Request is a USB standard request. Usually handled by the link or the device driver.
    Standard = 0,
    /// Request is intended for a USB class.
    Class = 1,
    /// Request is vendor-specific.
    Vendor = 2,
    /// Reserved.
    Reserved = 3,
}

impl RequestType {
    /// Decodes the type bits 5..6 of `bmRequestType`.
    pub(crate) fn from_bits(request_type: u8) -> RequestType {
        match (request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }
}

/// Control request recipient.
#[derive(Copy, Clone, Eq, PartialEq, Debug, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Recipient {
    /// Request is intended for the entire device.
    Device = 0,
    /// Request is intended for an interface. Generally, the `index` field of the request specifies
    /// the interface number.
    Interface = 1,
    /// Request is intended for an endpoint. Generally, the `index` field of the request specifies
    /// the endpoint address.
    Endpoint = 2,
    /// None of the above.
    Other = 3,
    /// Reserved recipient value, kept as received.
    #[num_enum(catch_all)]
    Reserved(u8),
}

impl From<Recipient> for u8 {
    fn from(recipient: Recipient) -> u8 {
        match recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved(raw) => raw & 0b11111,
        }
    }
}

/// A control request read from a SETUP packet.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// Direction of the request.
    pub direction: UsbDirection,
    /// Type of the request.
    pub request_type: RequestType,
    /// Recipient of the request.
    pub recipient: Recipient,
    /// Request code. The meaning of the value depends on the previous fields.
    pub request: u8,
    /// Request value. The meaning of the value depends on the previous fields.
    pub value: u16,
    /// Request index. The meaning of the value depends on the previous fields.
    pub index: u16,
    /// Length of the DATA stage. For control OUT transfers this is the exact length of the data
    /// the host sent. For control IN transfers this is the maximum length of data the device
    /// should return.
    pub length: u16,
}

impl SetupPacket {
    /// Parses a USB control request from a byte array.
    pub fn parse(buf: &[u8]) -> Result<SetupPacket> {
        if buf.len() != 8 {
            return Err(UsbError::InvalidSetupPacket);
        }

        Ok(SetupPacket::new(
            buf[0],
            buf[1],
            u16::from_le_bytes([buf[2], buf[3]]),
            u16::from_le_bytes([buf[4], buf[5]]),
            u16::from_le_bytes([buf[6], buf[7]]),
        ))
    }

    /// Builds a setup packet from its raw fields.
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        SetupPacket {
            direction: request_type.into(),
            request_type: RequestType::from_bits(request_type),
            recipient: Recipient::from(request_type & 0b11111),
            request,
            value,
            index,
            length,
        }
    }

    /// Gets the `bmRequestType` byte of the request.
    pub fn request_type_byte(&self) -> u8 {
        (self.direction as u8) | ((self.request_type as u8) << 5) | u8::from(self.recipient)
    }

    /// Encodes the request back into its 8 byte wire form.
    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();

        [
            self.request_type_byte(),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Hub class requests are dispatched on `bmRequestType << 8 | bRequest`.
    pub(crate) fn type_req(&self) -> u16 {
        ((self.request_type_byte() as u16) << 8) | self.request as u16
    }
}

/// Standard request codes.
#[allow(unused)]
pub mod standard_request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_DESCRIPTOR: u8 = 7;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
    pub const SYNCH_FRAME: u8 = 12;
}

/// `bmRequestType` values of the standard requests interpreted by the link.
pub mod request_type {
    pub const DEVICE_OUT: u8 = 0x00;
    pub const ENDPOINT_OUT: u8 = 0x02;
    pub const DEVICE_IN: u8 = 0x80;
    pub const INTERFACE_IN: u8 = 0x81;
    pub const ENDPOINT_IN: u8 = 0x82;
}

/// Device feature selectors for SET_FEATURE and CLEAR_FEATURE.
#[repr(u16)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceFeature {
    SelfPowered = 0,
    RemoteWakeup = 1,
    TestMode = 2,
    BHnpEnable = 3,
    AHnpSupport = 4,
    AAltHnpSupport = 5,
    U1Enable = 48,
    U2Enable = 49,
    LtmEnable = 50,
}

/// Endpoint feature selector for SET_FEATURE and CLEAR_FEATURE.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

/// Bits of the device GET_STATUS word.
pub mod device_status {
    pub const SELF_POWERED: u16 = 0;
    pub const REMOTE_WAKEUP: u16 = 1;
    pub const U1_ENABLED: u16 = 2;
    pub const U2_ENABLED: u16 = 3;
    pub const LTM_ENABLED: u16 = 4;
}
