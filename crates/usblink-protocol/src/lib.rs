#![forbid(unsafe_code)]

//! Wire protocol for usblink.
//!
//! Three layers live here, all encoded byte-by-byte so host memory layout
//! never leaks onto the wire:
//!
//! - [`frame`]: the outer message framing (magic, type, length, sequence,
//!   checksum) that cuts a TCP byte stream into typed messages and
//!   resynchronises after corruption.
//! - [`usbip`]: USB/IP-style payloads carried inside frames: the device-list
//!   reply and the CMD_SUBMIT / RET_SUBMIT URB encodings.
//! - [`msc`]: the USB mass-storage bulk-only transport structs (CBW / CSW)
//!   and the SCSI opcodes carried inside them.
//!
//! [`urb`] holds the in-memory URB model shared by both peers.

use core::fmt;

pub mod frame;
pub mod msc;
pub mod urb;
pub mod usbip;

pub use frame::{Frame, FrameDecoder, FrameEncoder, MessageType};
pub use msc::{CommandBlockWrapper, CommandStatusWrapper, CswStatus};
pub use urb::{BulkDefault, Direction, EndpointClassifier, SetupPacket, TransferType, UsbUrb};
pub use usbip::{CmdSubmit, RetSubmit, UsbipDeviceInfo, UsbipHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    PayloadTooLarge {
        len: usize,
        max: usize,
    },
    /// A fixed-layout structure was decoded from a buffer shorter than its
    /// wire size.
    ShortBuffer {
        context: &'static str,
        need: usize,
        got: usize,
    },
    InvalidOpCode {
        expected: u32,
        got: u32,
    },
    DeviceCountMismatch {
        declared: u32,
        decoded: u32,
    },
    InvalidUtf8 {
        context: &'static str,
    },
    InvalidCbwSignature {
        got: u32,
    },
    InvalidCbLength {
        got: u8,
    },
    InvalidCswSignature {
        got: u32,
    },
    InvalidCswStatus {
        got: u8,
    },
    CswTagMismatch {
        expected: u32,
        got: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PayloadTooLarge { len, max } => {
                write!(f, "payload too large: {len} > {max}")
            }
            Error::ShortBuffer { context, need, got } => {
                write!(f, "{context}: need {need} bytes, got {got}")
            }
            Error::InvalidOpCode { expected, got } => {
                write!(f, "invalid op code: expected {expected:#010x}, got {got:#010x}")
            }
            Error::DeviceCountMismatch { declared, decoded } => {
                write!(f, "device list declares {declared} records, holds {decoded}")
            }
            Error::InvalidUtf8 { context } => write!(f, "invalid UTF-8 in {context}"),
            Error::InvalidCbwSignature { got } => {
                write!(f, "invalid CBW signature {got:#010x}")
            }
            Error::InvalidCbLength { got } => write!(f, "invalid CBW command length {got}"),
            Error::InvalidCswSignature { got } => {
                write!(f, "invalid CSW signature {got:#010x}")
            }
            Error::InvalidCswStatus { got } => write!(f, "invalid CSW status {got}"),
            Error::CswTagMismatch { expected, got } => {
                write!(f, "CSW tag mismatch: expected {expected:#010x}, got {got:#010x}")
            }
        }
    }
}

impl std::error::Error for Error {}
