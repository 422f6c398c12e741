//! Virtual USB device state machine.
//!
//! Lifecycle: `Fresh -> Created -> Attached -> Detached -> Destroyed`.
//! URBs are accepted only while `Attached`; each accepted URB produces
//! exactly one response URB that keeps the request id, flips the direction,
//! and reports its payload length.

use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};
use usblink_protocol::urb::{
    monotonic_micros, SetupPacket, TransferType, UsbUrb, MSC_REQUEST_BULK_ONLY_RESET,
    MSC_REQUEST_GET_MAX_LUN, REQUEST_TYPE_CLASS, REQUEST_TYPE_MASK, REQUEST_TYPE_STANDARD,
    REQUEST_TYPE_VENDOR, USB_CLASS_MASS_STORAGE, USB_DESCRIPTOR_TYPE_CONFIGURATION,
    USB_DESCRIPTOR_TYPE_DEVICE, USB_DESCRIPTOR_TYPE_STRING, USB_REQUEST_GET_CONFIGURATION,
    USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_SET_CONFIGURATION,
};
use usblink_protocol::{Direction, UsbipDeviceInfo};

use crate::ports::PortBinder;
use crate::scsi_emu::MassStorageEmulator;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Fresh,
    Created,
    Attached,
    Detached,
    Destroyed,
}

#[derive(Debug, Error)]
pub enum VdevError {
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        state: DeviceState,
        action: &'static str,
    },

    #[error("port binder failed: {0}")]
    Binder(#[from] io::Error),
}

pub struct VirtualUsbDevice {
    info: UsbipDeviceInfo,
    state: DeviceState,
    port: Option<usize>,
    current_configuration: u8,
    device_descriptor: Vec<u8>,
    config_descriptor: Vec<u8>,
    string_descriptors: Vec<Vec<u8>>,
    msc: MassStorageEmulator,
}

impl VirtualUsbDevice {
    pub fn new(info: UsbipDeviceInfo) -> Self {
        Self {
            info,
            state: DeviceState::Fresh,
            port: None,
            current_configuration: 0,
            device_descriptor: Vec::new(),
            config_descriptor: Vec::new(),
            string_descriptors: Vec::new(),
            msc: MassStorageEmulator::new(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn port(&self) -> Option<usize> {
        self.port
    }

    pub fn info(&self) -> &UsbipDeviceInfo {
        &self.info
    }

    pub fn bus_id(&self) -> &str {
        &self.info.busid
    }

    pub fn current_configuration(&self) -> u8 {
        self.current_configuration
    }

    /// Synthesises the descriptors and takes ownership of an acquired port.
    pub fn create(&mut self, port: usize) -> Result<(), VdevError> {
        if self.state != DeviceState::Fresh {
            return Err(VdevError::InvalidState {
                state: self.state,
                action: "create",
            });
        }
        self.port = Some(port);
        self.build_descriptors();
        self.state = DeviceState::Created;
        info!(port, busid = %self.info.busid, "virtual device created");
        Ok(())
    }

    pub fn attach(&mut self, binder: &dyn PortBinder) -> Result<(), VdevError> {
        if self.state != DeviceState::Created {
            return Err(VdevError::InvalidState {
                state: self.state,
                action: "attach",
            });
        }
        let port = self.port.expect("created device always holds a port");
        binder.attach(port, &self.info.busid)?;
        self.state = DeviceState::Attached;
        info!(port, busid = %self.info.busid, "virtual device attached");
        Ok(())
    }

    pub fn detach(&mut self, binder: &dyn PortBinder) -> Result<(), VdevError> {
        if self.state != DeviceState::Attached {
            return Err(VdevError::InvalidState {
                state: self.state,
                action: "detach",
            });
        }
        let port = self.port.expect("attached device always holds a port");
        binder.detach(port)?;
        self.state = DeviceState::Detached;
        info!(port, busid = %self.info.busid, "virtual device detached");
        Ok(())
    }

    /// Tears the device down and yields the port back for release.
    pub fn destroy(&mut self) -> Option<usize> {
        self.state = DeviceState::Destroyed;
        let port = self.port.take();
        if let Some(port) = port {
            info!(port, busid = %self.info.busid, "virtual device destroyed");
        }
        port
    }

    /// Dispatches one inbound URB. Returns `None` (and warns) unless the
    /// device is attached; otherwise returns the response URB.
    pub fn handle_urb(&mut self, urb: &UsbUrb) -> Option<UsbUrb> {
        if self.state != DeviceState::Attached {
            warn!(
                state = ?self.state,
                id = urb.id,
                "URB received while not attached, discarded"
            );
            return None;
        }

        debug!(
            id = urb.id,
            transfer_type = ?urb.transfer_type,
            endpoint = format_args!("{:#04x}", urb.endpoint),
            direction = ?urb.direction,
            len = urb.data.len(),
            "URB"
        );

        let response = match urb.transfer_type {
            TransferType::Control => self.handle_control(urb),
            TransferType::Bulk => self.handle_bulk(urb),
            TransferType::Interrupt | TransferType::Isochronous => self.echo(urb),
        };
        Some(response)
    }

    fn handle_control(&mut self, urb: &UsbUrb) -> UsbUrb {
        let setup = urb.setup_packet();
        let mut data = match setup.request_type & REQUEST_TYPE_MASK {
            REQUEST_TYPE_STANDARD => self.handle_standard_request(setup),
            REQUEST_TYPE_CLASS => self.handle_class_request(setup),
            REQUEST_TYPE_VENDOR => Vec::new(),
            _ => Vec::new(),
        };
        data.truncate(usize::from(setup.length));
        self.response(urb, data)
    }

    fn handle_standard_request(&mut self, setup: SetupPacket) -> Vec<u8> {
        match setup.request {
            USB_REQUEST_GET_DESCRIPTOR => {
                let descriptor_type = (setup.value >> 8) as u8;
                let index = (setup.value & 0xFF) as u8;
                match descriptor_type {
                    USB_DESCRIPTOR_TYPE_DEVICE => self.device_descriptor.clone(),
                    USB_DESCRIPTOR_TYPE_CONFIGURATION => self.config_descriptor.clone(),
                    USB_DESCRIPTOR_TYPE_STRING => self.string_descriptor(index),
                    _ => Vec::new(),
                }
            }
            USB_REQUEST_SET_CONFIGURATION => {
                self.current_configuration = (setup.value & 0xFF) as u8;
                debug!(configuration = self.current_configuration, "SET_CONFIGURATION");
                Vec::new()
            }
            USB_REQUEST_GET_CONFIGURATION => vec![self.current_configuration],
            _ => Vec::new(),
        }
    }

    fn handle_class_request(&mut self, setup: SetupPacket) -> Vec<u8> {
        if self.info.device_class != USB_CLASS_MASS_STORAGE {
            return Vec::new();
        }
        match setup.request {
            MSC_REQUEST_BULK_ONLY_RESET => {
                debug!("bulk-only mass-storage reset");
                self.msc.reset();
                Vec::new()
            }
            MSC_REQUEST_GET_MAX_LUN => vec![0],
            _ => Vec::new(),
        }
    }

    fn handle_bulk(&mut self, urb: &UsbUrb) -> UsbUrb {
        if self.info.device_class != USB_CLASS_MASS_STORAGE {
            return self.echo(urb);
        }
        let data = match urb.direction {
            Direction::Out => self.msc.handle_out(&urb.data),
            Direction::In => self.msc.handle_in(),
        };
        self.response(urb, data)
    }

    /// Non-mass-storage bulk, interrupt, and isochronous URBs are echoed:
    /// OUT gets an empty acknowledgement, IN gets a fixed test pattern.
    fn echo(&self, urb: &UsbUrb) -> UsbUrb {
        let data = match urb.direction {
            Direction::Out => Vec::new(),
            Direction::In => vec![0x00, 0x01, 0x02, 0x03],
        };
        self.response(urb, data)
    }

    fn response(&self, urb: &UsbUrb, data: Vec<u8>) -> UsbUrb {
        let actual_length = data.len() as u32;
        UsbUrb {
            id: urb.id,
            transfer_type: urb.transfer_type,
            direction: urb.direction.flipped(),
            endpoint: urb.endpoint,
            flags: urb.flags,
            data,
            setup: urb.setup,
            status: 0,
            actual_length,
            timestamp_us: monotonic_micros(),
        }
    }

    fn build_descriptors(&mut self) {
        self.device_descriptor = self.build_device_descriptor();
        self.config_descriptor = self.build_config_descriptor();
        self.string_descriptors = vec![
            vec![0x04, USB_DESCRIPTOR_TYPE_STRING, 0x09, 0x04], // en-US
            string_descriptor_utf16le("usblink"),
            string_descriptor_utf16le("Virtual Mass Storage"),
            string_descriptor_utf16le("123456789"),
        ];
    }

    fn build_device_descriptor(&self) -> Vec<u8> {
        let mut d = Vec::with_capacity(18);
        d.push(18); // bLength
        d.push(USB_DESCRIPTOR_TYPE_DEVICE);
        d.extend_from_slice(&0x0200u16.to_le_bytes()); // bcdUSB 2.0
        d.push(self.info.device_class);
        d.push(self.info.device_subclass);
        d.push(self.info.device_protocol);
        d.push(64); // bMaxPacketSize0
        d.extend_from_slice(&self.info.id_vendor.to_le_bytes());
        d.extend_from_slice(&self.info.id_product.to_le_bytes());
        d.extend_from_slice(&self.info.bcd_device.to_le_bytes());
        d.push(1); // iManufacturer
        d.push(2); // iProduct
        d.push(3); // iSerialNumber
        d.push(1); // bNumConfigurations
        d
    }

    /// Configuration + one mass-storage interface + its bulk endpoint pair.
    fn build_config_descriptor(&self) -> Vec<u8> {
        let mut d = Vec::with_capacity(32);
        d.extend_from_slice(&[9, USB_DESCRIPTOR_TYPE_CONFIGURATION]);
        d.extend_from_slice(&32u16.to_le_bytes()); // wTotalLength
        d.push(1); // bNumInterfaces
        d.push(1); // bConfigurationValue
        d.push(0); // iConfiguration
        d.push(0x80); // bus powered
        d.push(50); // 100 mA

        // Interface: mass storage, SCSI transparent, bulk-only.
        d.extend_from_slice(&[9, 0x04, 0, 0, 2, USB_CLASS_MASS_STORAGE, 0x06, 0x50, 0]);

        // Bulk IN 0x81 and bulk OUT 0x02, 512-byte packets.
        d.extend_from_slice(&[7, 0x05, 0x81, 0x02, 0x00, 0x02, 0]);
        d.extend_from_slice(&[7, 0x05, 0x02, 0x02, 0x00, 0x02, 0]);
        d
    }

    fn string_descriptor(&self, index: u8) -> Vec<u8> {
        self.string_descriptors
            .get(usize::from(index))
            .cloned()
            .unwrap_or_default()
    }
}

fn string_descriptor_utf16le(value: &str) -> Vec<u8> {
    let mut d = vec![0, USB_DESCRIPTOR_TYPE_STRING];
    for unit in value.encode_utf16() {
        d.extend_from_slice(&unit.to_le_bytes());
    }
    d[0] = d.len() as u8;
    d
}
