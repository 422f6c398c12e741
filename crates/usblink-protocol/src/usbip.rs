//! USB/IP-style payload encoding.
//!
//! Two payload families ride inside [`crate::frame`] messages:
//!
//! - the device-list reply: `op (4) | status (4) | count (4)` followed by
//!   `count` fixed 312-byte device records;
//! - URB transport: `CMD_SUBMIT` (48 bytes, OUT data appended) inside
//!   URB_SUBMIT messages and `RET_SUBMIT` (40 bytes, response data appended)
//!   inside URB_RESPONSE messages.
//!
//! All integer fields are big-endian; `path` and `busid` are zero-padded
//! fixed-size strings; the 8 setup bytes travel verbatim.

use crate::urb::{monotonic_micros, Direction, EndpointClassifier, TransferType, UsbUrb};
use crate::Error;

pub const OP_REQUEST: u32 = 0x8000_0000;
pub const OP_REPLY: u32 = 0x0000_0000;
pub const OP_DEVLIST: u32 = 0x0000_0005;
pub const OP_IMPORT: u32 = 0x0000_0003;

pub const USBIP_VERSION: u16 = 0x0111;

pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

pub const DEVICE_PATH_LEN: usize = 256;
pub const DEVICE_BUSID_LEN: usize = 32;
pub const DEVICE_RECORD_LEN: usize = 312;

pub const USBIP_HEADER_LEN: usize = 20;
pub const CMD_SUBMIT_LEN: usize = 48;
pub const RET_SUBMIT_LEN: usize = 40;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UsbSpeed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Super => 4,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Super,
            _ => Self::Unknown,
        }
    }
}

/// One fixed-layout device record in the device-list reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbipDeviceInfo {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbipDeviceInfo {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        put_padded(out, &self.path, DEVICE_PATH_LEN);
        put_padded(out, &self.busid, DEVICE_BUSID_LEN);
        out.extend_from_slice(&self.busnum.to_be_bytes());
        out.extend_from_slice(&self.devnum.to_be_bytes());
        out.extend_from_slice(&self.speed.to_be_bytes());
        out.extend_from_slice(&self.id_vendor.to_be_bytes());
        out.extend_from_slice(&self.id_product.to_be_bytes());
        out.extend_from_slice(&self.bcd_device.to_be_bytes());
        out.push(self.device_class);
        out.push(self.device_subclass);
        out.push(self.device_protocol);
        out.push(self.configuration_value);
        out.push(self.num_configurations);
        out.push(self.num_interfaces);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut r = Reader::new(buf, "device record");
        Ok(Self {
            path: read_padded(r.bytes(DEVICE_PATH_LEN)?),
            busid: read_padded(r.bytes(DEVICE_BUSID_LEN)?),
            busnum: r.u32()?,
            devnum: r.u32()?,
            speed: r.u32()?,
            id_vendor: r.u16()?,
            id_product: r.u16()?,
            bcd_device: r.u16()?,
            device_class: r.u8()?,
            device_subclass: r.u8()?,
            device_protocol: r.u8()?,
            configuration_value: r.u8()?,
            num_configurations: r.u8()?,
            num_interfaces: r.u8()?,
        })
    }
}

pub fn encode_device_list(devices: &[UsbipDeviceInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + devices.len() * DEVICE_RECORD_LEN);
    out.extend_from_slice(&(OP_REPLY | OP_DEVLIST).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // status: ok
    out.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for device in devices {
        device.encode_into(&mut out);
    }
    out
}

/// Returns the reply status and the decoded records.
pub fn decode_device_list(buf: &[u8]) -> Result<(u32, Vec<UsbipDeviceInfo>), Error> {
    let mut r = Reader::new(buf, "device list reply");
    let op = r.u32()?;
    if op != (OP_REPLY | OP_DEVLIST) {
        return Err(Error::InvalidOpCode {
            expected: OP_REPLY | OP_DEVLIST,
            got: op,
        });
    }
    let status = r.u32()?;
    let count = r.u32()?;

    let mut devices = Vec::new();
    for decoded in 0..count {
        let Ok(record) = r.bytes(DEVICE_RECORD_LEN) else {
            return Err(Error::DeviceCountMismatch {
                declared: count,
                decoded,
            });
        };
        devices.push(UsbipDeviceInfo::decode(record)?);
    }
    Ok((status, devices))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsbipHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UsbipHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&self.devid.to_be_bytes());
        out.extend_from_slice(&self.direction.to_be_bytes());
        out.extend_from_slice(&self.ep.to_be_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, Error> {
        Ok(Self {
            command: r.u32()?,
            seqnum: r.u32()?,
            devid: r.u32()?,
            direction: r.u32()?,
            ep: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: UsbipHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

impl CmdSubmit {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(CMD_SUBMIT_LEN + data.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.transfer_flags.to_be_bytes());
        out.extend_from_slice(&self.transfer_buffer_length.to_be_bytes());
        out.extend_from_slice(&self.start_frame.to_be_bytes());
        out.extend_from_slice(&self.number_of_packets.to_be_bytes());
        out.extend_from_slice(&self.interval.to_be_bytes());
        out.extend_from_slice(&self.setup);
        out.extend_from_slice(data);
        out
    }

    /// Decodes the 48-byte header; the remainder of `buf` is the transfer
    /// buffer.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut r = Reader::new(buf, "CMD_SUBMIT");
        let cmd = Self {
            header: UsbipHeader::decode(&mut r)?,
            transfer_flags: r.u32()?,
            transfer_buffer_length: r.i32()?,
            start_frame: r.i32()?,
            number_of_packets: r.i32()?,
            interval: r.i32()?,
            setup: r
                .bytes(8)?
                .try_into()
                .expect("reader returned 8 bytes"),
        };
        Ok((cmd, r.rest()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: UsbipHeader,
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl RetSubmit {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(RET_SUBMIT_LEN + data.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&self.actual_length.to_be_bytes());
        out.extend_from_slice(&self.start_frame.to_be_bytes());
        out.extend_from_slice(&self.number_of_packets.to_be_bytes());
        out.extend_from_slice(&self.error_count.to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut r = Reader::new(buf, "RET_SUBMIT");
        let ret = Self {
            header: UsbipHeader::decode(&mut r)?,
            status: r.i32()?,
            actual_length: r.i32()?,
            start_frame: r.i32()?,
            number_of_packets: r.i32()?,
            error_count: r.i32()?,
        };
        Ok((ret, r.rest()))
    }
}

/// Encodes a captured URB as a URB_SUBMIT payload. The transfer buffer is
/// appended for OUT transfers only.
pub fn encode_urb_submit(urb: &UsbUrb, devid: u32) -> Vec<u8> {
    let cmd = CmdSubmit {
        header: UsbipHeader {
            command: USBIP_CMD_SUBMIT,
            seqnum: urb.id,
            devid,
            direction: urb.direction as u32,
            ep: u32::from(urb.endpoint_number()),
        },
        transfer_flags: urb.flags,
        transfer_buffer_length: urb.data.len() as i32,
        start_frame: 0,
        number_of_packets: 0,
        interval: 0,
        setup: if urb.transfer_type == TransferType::Control {
            urb.setup
        } else {
            [0; 8]
        },
    };
    let data: &[u8] = if urb.direction == Direction::Out {
        &urb.data
    } else {
        &[]
    };
    cmd.encode(data)
}

/// Decodes a URB_SUBMIT payload into a URB.
///
/// Endpoint 0 means control (the setup bytes are meaningful); other endpoints
/// are classified through `classifier`, which defaults to bulk when the host
/// has no endpoint descriptors to consult.
pub fn decode_urb_submit(
    payload: &[u8],
    classifier: &dyn EndpointClassifier,
) -> Result<UsbUrb, Error> {
    let (cmd, trailing) = CmdSubmit::decode(payload)?;

    let direction = Direction::from_u32(cmd.header.direction).unwrap_or(Direction::Out);
    let ep_number = cmd.header.ep as u8 & 0x0F;
    let endpoint = if ep_number == 0 || direction == Direction::Out {
        ep_number
    } else {
        ep_number | 0x80
    };
    let transfer_type = if ep_number == 0 {
        TransferType::Control
    } else {
        classifier.classify(endpoint)
    };

    let data = if direction == Direction::Out && cmd.transfer_buffer_length > 0 {
        let want = cmd.transfer_buffer_length as usize;
        if trailing.len() < want {
            return Err(Error::ShortBuffer {
                context: "CMD_SUBMIT transfer buffer",
                need: want,
                got: trailing.len(),
            });
        }
        trailing[..want].to_vec()
    } else {
        Vec::new()
    };

    let actual_length = data.len() as u32;
    Ok(UsbUrb {
        id: cmd.header.seqnum,
        transfer_type,
        direction,
        endpoint,
        flags: cmd.transfer_flags,
        data,
        setup: if transfer_type == TransferType::Control {
            cmd.setup
        } else {
            [0; 8]
        },
        status: 0,
        actual_length,
        timestamp_us: monotonic_micros(),
    })
}

/// Encodes a response URB as a URB_RESPONSE payload. The transfer buffer is
/// appended whenever the response carries data.
pub fn encode_urb_response(urb: &UsbUrb, devid: u32) -> Vec<u8> {
    let ret = RetSubmit {
        header: UsbipHeader {
            command: USBIP_RET_SUBMIT,
            seqnum: urb.id,
            devid,
            direction: urb.direction as u32,
            ep: u32::from(urb.endpoint_number()),
        },
        status: urb.status,
        actual_length: urb.actual_length as i32,
        start_frame: 0,
        number_of_packets: 0,
        error_count: 0,
    };
    ret.encode(&urb.data)
}

pub fn decode_urb_response(payload: &[u8]) -> Result<UsbUrb, Error> {
    let (ret, trailing) = RetSubmit::decode(payload)?;

    let direction = Direction::from_u32(ret.header.direction).unwrap_or(Direction::In);
    let ep_number = ret.header.ep as u8 & 0x0F;
    let transfer_type = if ep_number == 0 {
        TransferType::Control
    } else {
        TransferType::Bulk
    };

    Ok(UsbUrb {
        id: ret.header.seqnum,
        transfer_type,
        direction,
        endpoint: ep_number,
        flags: 0,
        data: trailing.to_vec(),
        setup: [0; 8],
        status: ret.status,
        actual_length: ret.actual_length.max(0) as u32,
        timestamp_us: monotonic_micros(),
    })
}

fn put_padded(out: &mut Vec<u8>, value: &str, len: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(len);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (len - take), 0);
}

fn read_padded(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() - self.pos < n {
            return Err(Error::ShortBuffer {
                context: self.context,
                need: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(self.u32()? as i32)
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::urb::BulkDefault;

    use super::*;

    fn sample_device() -> UsbipDeviceInfo {
        UsbipDeviceInfo {
            path: "/dev/bus/usb/001/002".to_owned(),
            busid: "1-2".to_owned(),
            busnum: 1,
            devnum: 2,
            speed: UsbSpeed::High.as_u32(),
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 0x08,
            device_subclass: 0x06,
            device_protocol: 0x50,
            configuration_value: 1,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }

    #[test]
    fn device_record_is_fixed_size() {
        let mut out = Vec::new();
        sample_device().encode_into(&mut out);
        assert_eq!(out.len(), DEVICE_RECORD_LEN);
    }

    #[test]
    fn device_list_round_trips() {
        let devices = vec![sample_device()];
        let encoded = encode_device_list(&devices);
        assert_eq!(encoded.len(), 12 + DEVICE_RECORD_LEN);

        let (status, decoded) = decode_device_list(&encoded).unwrap();
        assert_eq!(status, 0);
        assert_eq!(decoded, devices);
        assert_eq!(decoded[0].id_vendor, 0x1234);
        assert_eq!(decoded[0].device_class, 0x08);
    }

    #[test]
    fn device_list_with_truncated_record_reports_mismatch() {
        let encoded = encode_device_list(&[sample_device()]);
        let err = decode_device_list(&encoded[..encoded.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            Error::DeviceCountMismatch {
                declared: 1,
                decoded: 0
            }
        );
    }

    #[test]
    fn control_submit_round_trips_with_setup() {
        let urb = UsbUrb {
            id: 42,
            transfer_type: TransferType::Control,
            direction: Direction::In,
            endpoint: 0,
            flags: 0,
            data: Vec::new(),
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
            status: 0,
            actual_length: 0,
            timestamp_us: 0,
        };

        let payload = encode_urb_submit(&urb, 0);
        assert_eq!(payload.len(), CMD_SUBMIT_LEN);

        let decoded = decode_urb_submit(&payload, &BulkDefault).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.transfer_type, TransferType::Control);
        assert_eq!(decoded.direction, Direction::In);
        assert_eq!(decoded.setup, urb.setup);
    }

    #[test]
    fn bulk_out_submit_carries_its_data() {
        let urb = UsbUrb {
            id: 7,
            transfer_type: TransferType::Bulk,
            direction: Direction::Out,
            endpoint: 0x02,
            flags: 0,
            data: vec![0x55, 0x53, 0x42, 0x43],
            setup: [0; 8],
            status: 0,
            actual_length: 4,
            timestamp_us: 0,
        };

        let payload = encode_urb_submit(&urb, 0);
        assert_eq!(payload.len(), CMD_SUBMIT_LEN + 4);

        let decoded = decode_urb_submit(&payload, &BulkDefault).unwrap();
        assert_eq!(decoded.transfer_type, TransferType::Bulk);
        assert_eq!(decoded.endpoint, 0x02);
        assert_eq!(decoded.data, urb.data);
    }

    #[test]
    fn bulk_in_submit_carries_no_data() {
        let urb = UsbUrb {
            id: 8,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
            endpoint: 0x81,
            flags: 0,
            data: vec![1, 2, 3],
            setup: [0; 8],
            status: 0,
            actual_length: 3,
            timestamp_us: 0,
        };

        let payload = encode_urb_submit(&urb, 0);
        assert_eq!(payload.len(), CMD_SUBMIT_LEN);

        let decoded = decode_urb_submit(&payload, &BulkDefault).unwrap();
        assert_eq!(decoded.endpoint, 0x81);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn classifier_hook_refines_non_control_endpoints() {
        struct InterruptOn81;
        impl EndpointClassifier for InterruptOn81 {
            fn classify(&self, endpoint: u8) -> TransferType {
                if endpoint == 0x81 {
                    TransferType::Interrupt
                } else {
                    TransferType::Bulk
                }
            }
        }

        let urb = UsbUrb {
            id: 9,
            transfer_type: TransferType::Interrupt,
            direction: Direction::In,
            endpoint: 0x81,
            flags: 0,
            data: Vec::new(),
            setup: [0; 8],
            status: 0,
            actual_length: 0,
            timestamp_us: 0,
        };
        let payload = encode_urb_submit(&urb, 0);
        let decoded = decode_urb_submit(&payload, &InterruptOn81).unwrap();
        assert_eq!(decoded.transfer_type, TransferType::Interrupt);
    }

    #[test]
    fn urb_response_round_trips_data_and_status() {
        let urb = UsbUrb {
            id: 42,
            transfer_type: TransferType::Control,
            direction: Direction::Out,
            endpoint: 0,
            flags: 0,
            data: vec![0x12, 0x01, 0x00, 0x02],
            setup: [0; 8],
            status: 0,
            actual_length: 4,
            timestamp_us: 0,
        };

        let payload = encode_urb_response(&urb, 0);
        assert_eq!(payload.len(), RET_SUBMIT_LEN + 4);

        let decoded = decode_urb_response(&payload).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.status, 0);
        assert_eq!(decoded.actual_length, 4);
        assert_eq!(decoded.data, urb.data);
    }

    #[test]
    fn short_submit_payload_is_rejected() {
        let err = decode_urb_submit(&[0; 20], &BulkDefault).unwrap_err();
        assert!(matches!(err, Error::ShortBuffer { .. }));
    }
}
