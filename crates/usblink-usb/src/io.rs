//! Device-I/O capability.
//!
//! Everything above this module (the mass-storage driver, the capture
//! pipeline, the sender session) talks to USB hardware exclusively through
//! these traits, so tests substitute scripted fakes and the libusb binding
//! stays confined to [`crate::rusb_backend`].

use std::time::Duration;

use thiserror::Error;

/// Device-level synchronous transfers time out after this long.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UsbIoError {
    #[error("USB subsystem init failed: {0}")]
    Init(rusb::Error),

    #[error("failed to open device: {0}")]
    Open(rusb::Error),

    #[error("device is not open")]
    NotOpen,

    #[error("failed to claim interface {interface}: {source}")]
    Claim { interface: u8, source: rusb::Error },

    #[error("failed to release interface {interface}: {source}")]
    Release { interface: u8, source: rusb::Error },

    #[error("transfer on endpoint {endpoint:#04x} failed: {source}")]
    Transfer { endpoint: u8, source: rusb::Error },

    #[error("control transfer failed: {0}")]
    Control(rusb::Error),

    #[error("failed to read descriptor: {0}")]
    Descriptor(rusb::Error),

    #[error("device not found")]
    NotFound,

    #[error("hotplug is not supported by this libusb")]
    HotplugUnsupported,
}

/// Identity of one enumerated device, stable for the lifetime of its
/// connection. Carried in hotplug events so removal names the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSummary {
    /// `/dev/bus/usb/BBB/DDD`.
    pub path: String,
    /// `bus-address`, e.g. `"1-2"`.
    pub bus_id: String,
    pub bus_number: u32,
    pub device_number: u32,
    /// USB/IP speed code (0 unknown, 1 low, 2 full, 3 high, 4 super).
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub num_configurations: u8,
}

/// Synchronous access to one USB device.
pub trait DeviceIo: Send {
    fn as_any(&self) -> &dyn std::any::Any;

    fn summary(&self) -> &DeviceSummary;

    fn open(&mut self) -> Result<(), UsbIoError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbIoError>;
    fn release_interface(&mut self, interface: u8) -> Result<(), UsbIoError>;

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError>;

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError>;

    fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
        -> Result<usize, UsbIoError>;
    fn bulk_out(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, UsbIoError>;

    fn interrupt_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError>;
    fn interrupt_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError>;

    /// Raw bytes of the active configuration descriptor, including the
    /// interface and endpoint descriptors that follow it.
    fn config_descriptor(&mut self) -> Result<Vec<u8>, UsbIoError>;

    fn string_descriptor(&mut self, index: u8) -> Result<String, UsbIoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub device: DeviceSummary,
    pub connected: bool,
}

pub trait HotplugSink: Send + Sync {
    fn on_hotplug(&self, event: HotplugEvent);
}

/// Enumeration and hotplug over the whole bus.
pub trait DeviceEnumerator: Send {
    fn enumerate(&self) -> Result<Vec<Box<dyn DeviceIo>>, UsbIoError>;

    fn find_by_vidpid(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Option<Box<dyn DeviceIo>>, UsbIoError> {
        Ok(self.enumerate()?.into_iter().find(|dev| {
            let s = dev.summary();
            s.vendor_id == vendor_id && s.product_id == product_id
        }))
    }

    fn find_by_path(&self, path: &str) -> Result<Option<Box<dyn DeviceIo>>, UsbIoError> {
        Ok(self
            .enumerate()?
            .into_iter()
            .find(|dev| dev.summary().path == path))
    }

    fn start_hotplug(&self, sink: std::sync::Arc<dyn HotplugSink>) -> Result<(), UsbIoError>;
    fn stop_hotplug(&self);
}
