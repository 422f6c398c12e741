//! USB mass-storage bulk-only transport wire structs.
//!
//! The CBW (31 bytes) and CSW (13 bytes) are little-endian, per the USB
//! mass-storage class specification:
//!
//! ```text
//! CBW: sig(4)=0x43425355 | tag(4) | data_len(4) | flags(1) | lun(1)
//!      | cb_len(1) | cb(16)
//! CSW: sig(4)=0x53425355 | tag(4) | residue(4) | status(1)
//! ```
//!
//! Bit 7 of the CBW flags selects the data direction (set = device-to-host).

use crate::Error;

pub const CBW_SIGNATURE: u32 = 0x4342_5355; // "USBC"
pub const CSW_SIGNATURE: u32 = 0x5342_5355; // "USBS"

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

pub const CBW_FLAG_DATA_IN: u8 = 0x80;

/// SCSI opcodes carried inside CBW command blocks.
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const READ_CAPACITY_16: u8 = 0x9E;
    /// Service action selecting READ CAPACITY (16) under opcode 0x9E.
    pub const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb_length: u8,
    pub cb: [u8; 16],
}

impl CommandBlockWrapper {
    pub fn new(tag: u32, data_transfer_length: u32, flags: u8, cb: &[u8]) -> Self {
        debug_assert!(cb.len() <= 16, "CBW command block is at most 16 bytes");
        let mut block = [0u8; 16];
        block[..cb.len()].copy_from_slice(cb);
        Self {
            tag,
            data_transfer_length,
            flags,
            lun: 0,
            cb_length: cb.len() as u8,
            cb: block,
        }
    }

    pub fn is_data_in(&self) -> bool {
        (self.flags & CBW_FLAG_DATA_IN) != 0
    }

    pub fn opcode(&self) -> u8 {
        self.cb[0]
    }

    pub fn to_bytes(&self) -> [u8; CBW_LEN] {
        let mut out = [0u8; CBW_LEN];
        out[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        out[12] = self.flags;
        out[13] = self.lun;
        out[14] = self.cb_length;
        out[15..31].copy_from_slice(&self.cb);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CBW_LEN {
            return Err(Error::ShortBuffer {
                context: "CBW",
                need: CBW_LEN,
                got: buf.len(),
            });
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CBW_SIGNATURE {
            return Err(Error::InvalidCbwSignature { got: signature });
        }
        let cb_length = buf[14];
        if cb_length > 16 {
            return Err(Error::InvalidCbLength { got: cb_length });
        }
        let mut cb = [0u8; 16];
        cb.copy_from_slice(&buf[15..31]);
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_transfer_length: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[12],
            lun: buf[13],
            cb_length,
            cb,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

impl CswStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Passed),
            1 => Some(Self::Failed),
            2 => Some(Self::PhaseError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl CommandStatusWrapper {
    pub fn success(tag: u32) -> Self {
        Self {
            tag,
            data_residue: 0,
            status: CswStatus::Passed as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; CSW_LEN] {
        let mut out = [0u8; CSW_LEN];
        out[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        out[4..8].copy_from_slice(&self.tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        out[12] = self.status;
        out
    }

    /// Validates the signature and the status range; tag correlation is the
    /// caller's contract (it knows which CBW is in flight).
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CSW_LEN {
            return Err(Error::ShortBuffer {
                context: "CSW",
                need: CSW_LEN,
                got: buf.len(),
            });
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return Err(Error::InvalidCswSignature { got: signature });
        }
        let status = buf[12];
        if CswStatus::from_u8(status).is_none() {
            return Err(Error::InvalidCswStatus { got: status });
        }
        Ok(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cbw_round_trips() {
        let cbw = CommandBlockWrapper::new(0x1122_3344, 36, CBW_FLAG_DATA_IN, &[scsi::INQUIRY, 0, 0, 0, 36, 0]);
        let bytes = cbw.to_bytes();
        assert_eq!(bytes.len(), CBW_LEN);
        assert_eq!(&bytes[0..4], b"USBC");

        let parsed = CommandBlockWrapper::parse(&bytes).unwrap();
        assert_eq!(parsed, cbw);
        assert!(parsed.is_data_in());
        assert_eq!(parsed.opcode(), scsi::INQUIRY);
        assert_eq!(parsed.cb_length, 6);
    }

    #[test]
    fn cbw_with_bad_signature_is_rejected() {
        let mut bytes = CommandBlockWrapper::new(1, 0, 0, &[0]).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            CommandBlockWrapper::parse(&bytes),
            Err(Error::InvalidCbwSignature { .. })
        ));
    }

    #[test]
    fn cbw_with_oversize_command_block_is_rejected() {
        let mut bytes = CommandBlockWrapper::new(1, 0, 0, &[0]).to_bytes();
        bytes[14] = 17;
        assert_eq!(
            CommandBlockWrapper::parse(&bytes),
            Err(Error::InvalidCbLength { got: 17 })
        );
    }

    #[test]
    fn csw_round_trips() {
        let csw = CommandStatusWrapper::success(0xDEAD_BEEF);
        let bytes = csw.to_bytes();
        assert_eq!(&bytes[0..4], b"USBS");

        let parsed = CommandStatusWrapper::parse(&bytes).unwrap();
        assert_eq!(parsed, csw);
        assert_eq!(CswStatus::from_u8(parsed.status), Some(CswStatus::Passed));
    }

    #[test]
    fn csw_status_outside_the_range_is_rejected() {
        let mut bytes = CommandStatusWrapper::success(1).to_bytes();
        bytes[12] = 3;
        assert_eq!(
            CommandStatusWrapper::parse(&bytes),
            Err(Error::InvalidCswStatus { got: 3 })
        );
    }
}
