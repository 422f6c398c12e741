//! In-memory URB model shared by the sender pipeline and the receiver's
//! virtual devices.

use std::sync::OnceLock;
use std::time::Instant;

pub const ENDPOINT_DIR_IN: u8 = 0x80;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0F;

pub const USB_CLASS_MASS_STORAGE: u8 = 0x08;

pub const REQUEST_TYPE_MASK: u8 = 0x60;
pub const REQUEST_TYPE_STANDARD: u8 = 0x00;
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
pub const REQUEST_TYPE_VENDOR: u8 = 0x40;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

/// Mass-storage class requests (recipient: interface).
pub const MSC_REQUEST_BULK_ONLY_RESET: u8 = 0xFF;
pub const MSC_REQUEST_GET_MAX_LUN: u8 = 0xFE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Control),
            1 => Some(Self::Isochronous),
            2 => Some(Self::Bulk),
            3 => Some(Self::Interrupt),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Out),
            1 => Some(Self::In),
            _ => None,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl core::fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SetupPacket")
            .field("request_type", &format_args!("{:#04x}", self.request_type))
            .field("request", &format_args!("{:#04x}", self.request))
            .field("value", &format_args!("{:#06x}", self.value))
            .field("index", &format_args!("{:#06x}", self.index))
            .field("length", &self.length)
            .finish()
    }
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn is_device_to_host(self) -> bool {
        (self.request_type & ENDPOINT_DIR_IN) != 0
    }
}

/// One unit of USB traffic.
///
/// `id` doubles as the USB/IP seqnum so submit and response correlate across
/// the wire. For control transfers `setup` holds the 8 setup bytes verbatim
/// and `endpoint` is 0; for every other type `setup` is ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbUrb {
    pub id: u32,
    pub transfer_type: TransferType,
    pub direction: Direction,
    /// Endpoint address: number in the low nibble, direction in bit 7.
    pub endpoint: u8,
    pub flags: u32,
    pub data: Vec<u8>,
    pub setup: [u8; 8],
    /// 0 on success, negative on failure.
    pub status: i32,
    pub actual_length: u32,
    pub timestamp_us: u64,
}

impl UsbUrb {
    pub fn setup_packet(&self) -> SetupPacket {
        SetupPacket::parse(self.setup)
    }

    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & ENDPOINT_NUMBER_MASK
    }
}

/// Resolves the transfer type of a non-control endpoint.
///
/// The wire encoding does not carry the transfer type, so inbound URBs on
/// non-zero endpoints need the endpoint descriptor to classify bulk vs
/// interrupt vs isochronous. Hosts that know the descriptors implement this;
/// [`BulkDefault`] preserves the bulk fallback for those that do not.
pub trait EndpointClassifier {
    fn classify(&self, endpoint: u8) -> TransferType;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BulkDefault;

impl EndpointClassifier for BulkDefault {
    fn classify(&self, _endpoint: u8) -> TransferType {
        TransferType::Bulk
    }
}

/// Microseconds since the first call in this process, from a monotonic clock.
pub fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_packet_round_trips_little_endian_fields() {
        let bytes = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = SetupPacket::parse(bytes);
        assert_eq!(setup.request_type, 0x80);
        assert_eq!(setup.request, USB_REQUEST_GET_DESCRIPTOR);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0);
        assert_eq!(setup.length, 18);
        assert!(setup.is_device_to_host());
        assert_eq!(setup.to_bytes(), bytes);
    }

    #[test]
    fn endpoint_number_strips_the_direction_bit() {
        let urb = UsbUrb {
            id: 1,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
            endpoint: 0x81,
            flags: 0,
            data: Vec::new(),
            setup: [0; 8],
            status: 0,
            actual_length: 0,
            timestamp_us: 0,
        };
        assert_eq!(urb.endpoint_number(), 1);
    }

    #[test]
    fn monotonic_micros_does_not_go_backwards() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }
}
