//! Mass-storage bulk-only transport emulation.
//!
//! Tracks the command stage across bulk URBs: an OUT URB carrying a CBW runs
//! the SCSI command and stages any device-to-host data; subsequent IN URBs
//! drain the staged data and then the CSW, which echoes the CBW's tag.

use tracing::{debug, warn};
use usblink_protocol::msc::{scsi, CommandBlockWrapper, CommandStatusWrapper, CswStatus, CBW_LEN};

/// Virtual medium geometry reported by READ CAPACITY (10).
const LAST_BLOCK: u32 = 1023;
const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    Idle,
    /// Device-to-host data staged for the next bulk IN.
    DataIn { tag: u32, data: Vec<u8> },
    /// Host-to-device data phase still owed by the peer.
    DataOut { tag: u32 },
    /// Command complete; the next bulk IN collects the CSW.
    Status { tag: u32 },
}

#[derive(Debug)]
pub struct MassStorageEmulator {
    stage: Stage,
}

impl MassStorageEmulator {
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    /// BULK-ONLY-MASS-STORAGE-RESET drops any half-finished command.
    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
    }

    /// Handles a bulk OUT URB. The response payload is always empty (the
    /// host only needs the ACK); state advances per the transport stage.
    pub fn handle_out(&mut self, data: &[u8]) -> Vec<u8> {
        if let Stage::DataOut { tag } = self.stage {
            // Data phase of a host-to-device command; accept and discard.
            self.stage = Stage::Status { tag };
            return Vec::new();
        }

        if data.len() < CBW_LEN {
            warn!(len = data.len(), "bulk OUT shorter than a CBW, ignored");
            return Vec::new();
        }

        let cbw = match CommandBlockWrapper::parse(data) {
            Ok(cbw) => cbw,
            Err(err) => {
                warn!(%err, "bulk OUT is not a valid CBW, ignored");
                return Vec::new();
            }
        };

        debug!(
            opcode = format_args!("{:#04x}", cbw.opcode()),
            tag = cbw.tag,
            "SCSI command"
        );
        if cbw.is_data_in() {
            let mut response = process_command(&cbw);
            response.truncate(cbw.data_transfer_length as usize);
            self.stage = if response.is_empty() {
                Stage::Status { tag: cbw.tag }
            } else {
                Stage::DataIn {
                    tag: cbw.tag,
                    data: response,
                }
            };
        } else if cbw.data_transfer_length > 0 {
            self.stage = Stage::DataOut { tag: cbw.tag };
        } else {
            self.stage = Stage::Status { tag: cbw.tag };
        }
        Vec::new()
    }

    /// Handles a bulk IN URB: staged data first, then the CSW.
    pub fn handle_in(&mut self) -> Vec<u8> {
        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::DataIn { tag, data } => {
                self.stage = Stage::Status { tag };
                data
            }
            Stage::Status { tag } => CommandStatusWrapper::success(tag).to_bytes().to_vec(),
            Stage::DataOut { tag } => {
                // An IN while the data-out phase is owed is a phase error.
                let csw = CommandStatusWrapper {
                    tag,
                    data_residue: 0,
                    status: CswStatus::PhaseError as u8,
                };
                csw.to_bytes().to_vec()
            }
            Stage::Idle => CommandStatusWrapper::success(0).to_bytes().to_vec(),
        }
    }
}

impl Default for MassStorageEmulator {
    fn default() -> Self {
        Self::new()
    }
}

fn process_command(cbw: &CommandBlockWrapper) -> Vec<u8> {
    match cbw.opcode() {
        scsi::INQUIRY => inquiry_data(),
        scsi::READ_CAPACITY_10 => read_capacity_data(),
        opcode => {
            // Every other opcode succeeds with no data.
            debug!(opcode = format_args!("{opcode:#04x}"), "SCSI opcode not emulated");
            Vec::new()
        }
    }
}

fn inquiry_data() -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = 0x00; // direct-access device
    data[1] = 0x80; // removable medium
    data[2] = 0x04; // SCSI-2
    data[3] = 0x02; // response data format
    data[4] = 31; // additional length
    data[8..16].copy_from_slice(b"Virtual ");
    data[16..31].copy_from_slice(b"Mass Storage   ");
    data
}

fn read_capacity_data() -> Vec<u8> {
    let mut data = vec![0u8; 8];
    data[0..4].copy_from_slice(&LAST_BLOCK.to_be_bytes());
    data[4..8].copy_from_slice(&BLOCK_SIZE.to_be_bytes());
    data
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use usblink_protocol::msc::CBW_FLAG_DATA_IN;

    use super::*;

    fn cbw_bytes(tag: u32, transfer_length: u32, flags: u8, cb: &[u8]) -> Vec<u8> {
        CommandBlockWrapper::new(tag, transfer_length, flags, cb)
            .to_bytes()
            .to_vec()
    }

    #[test]
    fn inquiry_stages_data_then_csw() {
        let mut emu = MassStorageEmulator::new();

        let out = emu.handle_out(&cbw_bytes(7, 36, CBW_FLAG_DATA_IN, &[scsi::INQUIRY, 0, 0, 0, 36, 0]));
        assert!(out.is_empty());

        let data = emu.handle_in();
        assert_eq!(data.len(), 36);
        assert_eq!(data[1], 0x80);
        assert_eq!(&data[8..16], b"Virtual ");
        assert_eq!(&data[16..31], b"Mass Storage   ");

        let csw = CommandStatusWrapper::parse(&emu.handle_in()).unwrap();
        assert_eq!(csw.tag, 7);
        assert_eq!(csw.status, 0);
    }

    #[test]
    fn read_capacity_reports_1024_blocks_of_512() {
        let mut emu = MassStorageEmulator::new();
        emu.handle_out(&cbw_bytes(
            1,
            8,
            CBW_FLAG_DATA_IN,
            &[scsi::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        ));

        let data = emu.handle_in();
        assert_eq!(&data[0..4], &1023u32.to_be_bytes());
        assert_eq!(&data[4..8], &512u32.to_be_bytes());
    }

    #[test]
    fn staged_data_is_truncated_to_the_transfer_length() {
        let mut emu = MassStorageEmulator::new();
        emu.handle_out(&cbw_bytes(1, 8, CBW_FLAG_DATA_IN, &[scsi::INQUIRY, 0, 0, 0, 8, 0]));
        assert_eq!(emu.handle_in().len(), 8);
    }

    #[test]
    fn unsupported_opcode_still_passes() {
        let mut emu = MassStorageEmulator::new();
        emu.handle_out(&cbw_bytes(3, 0, 0, &[0xA5]));
        let csw = CommandStatusWrapper::parse(&emu.handle_in()).unwrap();
        assert_eq!(csw.tag, 3);
        assert_eq!(csw.status, 0);
    }

    #[test]
    fn write_command_absorbs_its_data_phase() {
        let mut emu = MassStorageEmulator::new();
        emu.handle_out(&cbw_bytes(4, 512, 0, &[scsi::WRITE_10, 0, 0, 0, 0, 0, 0, 0, 1, 0]));
        // Data phase is not a CBW; it must not be parsed as one.
        assert!(emu.handle_out(&[0xAB; 512]).is_empty());

        let csw = CommandStatusWrapper::parse(&emu.handle_in()).unwrap();
        assert_eq!(csw.tag, 4);
        assert_eq!(csw.status, 0);
    }

    #[test]
    fn in_during_owed_data_phase_is_a_phase_error() {
        let mut emu = MassStorageEmulator::new();
        emu.handle_out(&cbw_bytes(5, 512, 0, &[scsi::WRITE_10]));
        let csw = CommandStatusWrapper::parse(&emu.handle_in()).unwrap();
        assert_eq!(csw.status, CswStatus::PhaseError as u8);
    }

    #[test]
    fn garbage_out_is_ignored() {
        let mut emu = MassStorageEmulator::new();
        assert!(emu.handle_out(&[0xFF; 31]).is_empty());
        // Still idle: an IN produces the idle CSW with tag 0.
        let csw = CommandStatusWrapper::parse(&emu.handle_in()).unwrap();
        assert_eq!(csw.tag, 0);
    }
}
