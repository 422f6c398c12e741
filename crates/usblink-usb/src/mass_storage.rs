//! Bulk-only mass-storage driver.
//!
//! Speaks the CBW/CSW transport over the device's bulk endpoint pair and
//! fabricates a URB per transfer phase for the capture pipeline. One command
//! is in flight at a time; the tag counter is owned by the driver instance.

use std::sync::Arc;

use tracing::{debug, info, warn};
use usblink_protocol::msc::{
    scsi, CommandBlockWrapper, CommandStatusWrapper, CBW_FLAG_DATA_IN, CBW_LEN, CSW_LEN,
};
use usblink_protocol::urb::{
    monotonic_micros, Direction, SetupPacket, TransferType, UsbUrb, ENDPOINT_DIR_IN,
    MSC_REQUEST_BULK_ONLY_RESET, MSC_REQUEST_GET_MAX_LUN, USB_CLASS_MASS_STORAGE,
    USB_DESCRIPTOR_TYPE_ENDPOINT, USB_DESCRIPTOR_TYPE_INTERFACE,
};
use thiserror::Error;

use crate::capture::UrbSink;
use crate::io::{DeviceIo, DeviceSummary, UsbIoError, DEFAULT_TRANSFER_TIMEOUT};

#[derive(Debug, Error)]
pub enum MscError {
    #[error(transparent)]
    Io(#[from] UsbIoError),

    #[error(transparent)]
    Wire(#[from] usblink_protocol::Error),

    #[error("no mass-storage interface with bulk IN and OUT endpoints")]
    NoBulkEndpoints,

    #[error("device is not initialized")]
    NotInitialized,

    #[error("short transfer: {got} of {need} bytes")]
    ShortTransfer { need: usize, got: usize },

    #[error("command failed with CSW status {status}")]
    CommandFailed { status: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
}

pub struct MassStorageDevice {
    io: Box<dyn DeviceIo>,
    sink: Option<Arc<dyn UrbSink>>,
    initialized: bool,
    capturing: bool,
    interface_number: Option<u8>,
    bulk_in: Option<EndpointInfo>,
    bulk_out: Option<EndpointInfo>,
    next_tag: u32,
    total_blocks: u64,
    block_size: u32,
}

impl MassStorageDevice {
    pub fn new(io: Box<dyn DeviceIo>) -> Self {
        Self {
            io,
            sink: None,
            initialized: false,
            capturing: false,
            interface_number: None,
            bulk_in: None,
            bulk_out: None,
            next_tag: 1,
            total_blocks: 0,
            block_size: 512,
        }
    }

    pub fn summary(&self) -> &DeviceSummary {
        self.io.summary()
    }

    pub fn bus_id(&self) -> &str {
        &self.io.summary().bus_id
    }

    /// `(total_blocks, block_size)` as discovered during initialization.
    pub fn capacity(&self) -> (u64, u32) {
        (self.total_blocks, self.block_size)
    }

    pub fn set_urb_sink(&mut self, sink: Arc<dyn UrbSink>) {
        self.sink = Some(sink);
    }

    /// Opens the device, locates the mass-storage interface and its bulk
    /// endpoint pair, claims the interface, issues a best-effort bulk-only
    /// reset, and discovers the capacity. Idempotent.
    pub fn initialize(&mut self) -> Result<(), MscError> {
        if self.initialized {
            return Ok(());
        }

        self.io.open()?;
        let config = self.io.config_descriptor()?;
        let (interface, bulk_in, bulk_out) = find_bulk_endpoints(&config)?;
        self.io.claim_interface(interface)?;
        self.interface_number = Some(interface);
        self.bulk_in = Some(bulk_in);
        self.bulk_out = Some(bulk_out);
        debug!(
            interface,
            bulk_in = format_args!("{:#04x}", bulk_in.address),
            bulk_out = format_args!("{:#04x}", bulk_out.address),
            "mass-storage endpoints"
        );

        if let Err(err) = self.bulk_only_reset() {
            warn!(%err, "bulk-only reset failed, continuing");
        }

        match self.discover_capacity() {
            Ok((blocks, block_size)) => {
                self.total_blocks = blocks;
                self.block_size = block_size;
                info!(blocks, block_size, "mass-storage capacity");
            }
            Err(err) => warn!(%err, "capacity discovery failed"),
        }

        self.initialized = true;
        info!(path = %self.io.summary().path, "mass-storage device initialized");
        Ok(())
    }

    pub fn cleanup(&mut self) {
        self.capturing = false;
        if self.initialized {
            if let Some(interface) = self.interface_number {
                let _ = self.io.release_interface(interface);
            }
            self.io.close();
            self.initialized = false;
        }
    }

    pub fn start_capture(&mut self) -> Result<(), MscError> {
        if !self.initialized {
            return Err(MscError::NotInitialized);
        }
        self.capturing = true;
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        self.capturing = false;
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Class request BULK-ONLY-MASS-STORAGE-RESET on the claimed interface.
    pub fn bulk_only_reset(&mut self) -> Result<(), MscError> {
        let interface = self.interface_number.ok_or(MscError::NotInitialized)?;
        self.io.control_out(
            0x21,
            MSC_REQUEST_BULK_ONLY_RESET,
            0,
            u16::from(interface),
            &[],
            DEFAULT_TRANSFER_TIMEOUT,
        )?;
        self.publish_control(0x21, MSC_REQUEST_BULK_ONLY_RESET, 0, u16::from(interface), &[]);
        Ok(())
    }

    pub fn get_max_lun(&mut self) -> Result<u8, MscError> {
        let interface = self.interface_number.ok_or(MscError::NotInitialized)?;
        let mut lun = [0u8; 1];
        let n = self.io.control_in(
            0xA1,
            MSC_REQUEST_GET_MAX_LUN,
            0,
            u16::from(interface),
            &mut lun,
            DEFAULT_TRANSFER_TIMEOUT,
        )?;
        if n != 1 {
            return Err(MscError::ShortTransfer { need: 1, got: n });
        }
        self.publish_control(0xA1, MSC_REQUEST_GET_MAX_LUN, 0, u16::from(interface), &lun);
        Ok(lun[0])
    }

    pub fn inquiry(&mut self) -> Result<Vec<u8>, MscError> {
        let cb = [scsi::INQUIRY, 0, 0, 0, 36, 0];
        let (data, csw) = self.execute(&cb, 36, None)?;
        check_csw(&csw)?;
        Ok(data)
    }

    pub fn test_unit_ready(&mut self) -> Result<bool, MscError> {
        let cb = [scsi::TEST_UNIT_READY, 0, 0, 0, 0, 0];
        let (_, csw) = self.execute(&cb, 0, None)?;
        Ok(csw.status == 0)
    }

    pub fn request_sense(&mut self) -> Result<Vec<u8>, MscError> {
        let cb = [scsi::REQUEST_SENSE, 0, 0, 0, 18, 0];
        let (data, csw) = self.execute(&cb, 18, None)?;
        check_csw(&csw)?;
        Ok(data)
    }

    pub fn read_blocks(&mut self, lba: u32, count: u16) -> Result<Vec<u8>, MscError> {
        let mut cb = [0u8; 10];
        cb[0] = scsi::READ_10;
        cb[2..6].copy_from_slice(&lba.to_be_bytes());
        cb[7..9].copy_from_slice(&count.to_be_bytes());
        let len = u32::from(count) * self.block_size;
        let (data, csw) = self.execute(&cb, len, None)?;
        check_csw(&csw)?;
        Ok(data)
    }

    pub fn write_blocks(&mut self, lba: u32, count: u16, data: &[u8]) -> Result<(), MscError> {
        let mut cb = [0u8; 10];
        cb[0] = scsi::WRITE_10;
        cb[2..6].copy_from_slice(&lba.to_be_bytes());
        cb[7..9].copy_from_slice(&count.to_be_bytes());
        let (_, csw) = self.execute(&cb, 0, Some(data))?;
        check_csw(&csw)?;
        Ok(())
    }

    fn discover_capacity(&mut self) -> Result<(u64, u32), MscError> {
        match self.read_capacity_16() {
            Ok(capacity) => Ok(capacity),
            Err(err) => {
                warn!(%err, "READ CAPACITY (16) failed, trying READ CAPACITY (10)");
                self.read_capacity_10()
            }
        }
    }

    fn read_capacity_16(&mut self) -> Result<(u64, u32), MscError> {
        let mut cb = [0u8; 16];
        cb[0] = scsi::READ_CAPACITY_16;
        cb[1] = scsi::SERVICE_ACTION_READ_CAPACITY_16;
        cb[10..14].copy_from_slice(&32u32.to_be_bytes());

        let (data, csw) = self.execute(&cb, 32, None)?;
        check_csw(&csw)?;
        if data.len() < 12 {
            return Err(MscError::ShortTransfer {
                need: 32,
                got: data.len(),
            });
        }
        let last_block = u64::from_be_bytes(data[0..8].try_into().expect("length checked"));
        let block_size = u32::from_be_bytes(data[8..12].try_into().expect("length checked"));
        Ok((last_block + 1, block_size))
    }

    fn read_capacity_10(&mut self) -> Result<(u64, u32), MscError> {
        let mut cb = [0u8; 10];
        cb[0] = scsi::READ_CAPACITY_10;

        let (data, csw) = self.execute(&cb, 8, None)?;
        check_csw(&csw)?;
        if data.len() < 8 {
            return Err(MscError::ShortTransfer {
                need: 8,
                got: data.len(),
            });
        }
        let last_block = u32::from_be_bytes(data[0..4].try_into().expect("length checked"));
        let block_size = u32::from_be_bytes(data[4..8].try_into().expect("length checked"));
        Ok((u64::from(last_block) + 1, block_size))
    }

    /// Runs one full CBW / data / CSW cycle. `&mut self` keeps a single CBW
    /// in flight per device.
    fn execute(
        &mut self,
        cb: &[u8],
        data_in_len: u32,
        data_out: Option<&[u8]>,
    ) -> Result<(Vec<u8>, CommandStatusWrapper), MscError> {
        let tag = self.alloc_tag();
        let (flags, transfer_length) = if data_in_len > 0 {
            (CBW_FLAG_DATA_IN, data_in_len)
        } else {
            (0, data_out.map_or(0, |d| d.len() as u32))
        };
        let cbw = CommandBlockWrapper::new(tag, transfer_length, flags, cb);

        self.send_cbw(&cbw)?;

        let mut data = Vec::new();
        if data_in_len > 0 {
            data = self.read_data(data_in_len as usize)?;
        } else if let Some(out) = data_out {
            if !out.is_empty() {
                self.write_data(out)?;
            }
        }

        let csw = self.receive_csw(tag)?;
        Ok((data, csw))
    }

    fn send_cbw(&mut self, cbw: &CommandBlockWrapper) -> Result<(), MscError> {
        let endpoint = self.bulk_out.ok_or(MscError::NotInitialized)?.address;
        let bytes = cbw.to_bytes();
        let sent = self.io.bulk_out(endpoint, &bytes, DEFAULT_TRANSFER_TIMEOUT)?;
        if sent != CBW_LEN {
            return Err(MscError::ShortTransfer {
                need: CBW_LEN,
                got: sent,
            });
        }
        self.publish_bulk(endpoint, Direction::Out, bytes.to_vec());
        Ok(())
    }

    fn read_data(&mut self, len: usize) -> Result<Vec<u8>, MscError> {
        let endpoint = self.bulk_in.ok_or(MscError::NotInitialized)?.address;
        let mut buf = vec![0u8; len];
        let got = self.io.bulk_in(endpoint, &mut buf, DEFAULT_TRANSFER_TIMEOUT)?;
        buf.truncate(got);
        self.publish_bulk(endpoint, Direction::In, buf.clone());
        Ok(buf)
    }

    fn write_data(&mut self, data: &[u8]) -> Result<(), MscError> {
        let endpoint = self.bulk_out.ok_or(MscError::NotInitialized)?.address;
        let sent = self.io.bulk_out(endpoint, data, DEFAULT_TRANSFER_TIMEOUT)?;
        if sent != data.len() {
            return Err(MscError::ShortTransfer {
                need: data.len(),
                got: sent,
            });
        }
        self.publish_bulk(endpoint, Direction::Out, data.to_vec());
        Ok(())
    }

    fn receive_csw(&mut self, expected_tag: u32) -> Result<CommandStatusWrapper, MscError> {
        let endpoint = self.bulk_in.ok_or(MscError::NotInitialized)?.address;
        let mut buf = [0u8; CSW_LEN];
        let got = self.io.bulk_in(endpoint, &mut buf, DEFAULT_TRANSFER_TIMEOUT)?;
        let csw = CommandStatusWrapper::parse(&buf[..got])?;
        if csw.tag != expected_tag {
            return Err(usblink_protocol::Error::CswTagMismatch {
                expected: expected_tag,
                got: csw.tag,
            }
            .into());
        }
        self.publish_bulk(endpoint, Direction::In, buf.to_vec());
        Ok(csw)
    }

    fn alloc_tag(&mut self) -> u32 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        tag
    }

    fn publish_bulk(&mut self, endpoint: u8, direction: Direction, data: Vec<u8>) {
        if !self.capturing {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let actual_length = data.len() as u32;
        sink.on_urb(UsbUrb {
            id: self.alloc_tag(),
            transfer_type: TransferType::Bulk,
            direction,
            endpoint,
            flags: 0,
            data,
            setup: [0; 8],
            status: 0,
            actual_length,
            timestamp_us: monotonic_micros(),
        });
    }

    fn publish_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) {
        if !self.capturing {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let setup = SetupPacket {
            request_type,
            request,
            value,
            index,
            length: data.len() as u16,
        };
        let direction = if (request_type & ENDPOINT_DIR_IN) != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        sink.on_urb(UsbUrb {
            id: self.alloc_tag(),
            transfer_type: TransferType::Control,
            direction,
            endpoint: 0,
            flags: 0,
            data: data.to_vec(),
            setup: setup.to_bytes(),
            status: 0,
            actual_length: data.len() as u32,
            timestamp_us: monotonic_micros(),
        });
    }
}

impl Drop for MassStorageDevice {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn check_csw(csw: &CommandStatusWrapper) -> Result<(), MscError> {
    if csw.status != 0 {
        return Err(MscError::CommandFailed { status: csw.status });
    }
    Ok(())
}

/// Walks a raw configuration descriptor chain for the first interface of
/// class 0x08 and its bulk IN/OUT endpoint pair.
fn find_bulk_endpoints(config: &[u8]) -> Result<(u8, EndpointInfo, EndpointInfo), MscError> {
    let mut interface: Option<u8> = None;
    let mut in_msc_interface = false;
    let mut bulk_in: Option<EndpointInfo> = None;
    let mut bulk_out: Option<EndpointInfo> = None;

    let mut offset = 0;
    while offset + 2 <= config.len() {
        let len = usize::from(config[offset]);
        let descriptor_type = config[offset + 1];
        if len == 0 || offset + len > config.len() {
            break;
        }

        match descriptor_type {
            USB_DESCRIPTOR_TYPE_INTERFACE if len >= 9 => {
                let number = config[offset + 2];
                let class = config[offset + 5];
                if class == USB_CLASS_MASS_STORAGE && interface.is_none() {
                    interface = Some(number);
                    in_msc_interface = true;
                } else {
                    in_msc_interface = false;
                }
            }
            USB_DESCRIPTOR_TYPE_ENDPOINT if len >= 7 && in_msc_interface => {
                let address = config[offset + 2];
                let attributes = config[offset + 3];
                if attributes & 0x03 == TransferType::Bulk as u8 {
                    let info = EndpointInfo {
                        address,
                        max_packet_size: u16::from_le_bytes([
                            config[offset + 4],
                            config[offset + 5],
                        ]),
                    };
                    if address & ENDPOINT_DIR_IN != 0 {
                        bulk_in.get_or_insert(info);
                    } else {
                        bulk_out.get_or_insert(info);
                    }
                }
            }
            _ => {}
        }
        offset += len;
    }

    match (interface, bulk_in, bulk_out) {
        (Some(interface), Some(bulk_in), Some(bulk_out)) => Ok((interface, bulk_in, bulk_out)),
        _ => Err(MscError::NoBulkEndpoints),
    }
}
