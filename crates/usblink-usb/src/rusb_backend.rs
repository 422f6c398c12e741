//! libusb-backed implementation of the device-I/O capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusb::UsbContext;
use tracing::{debug, warn};

use crate::io::{
    DeviceEnumerator, DeviceIo, DeviceSummary, HotplugEvent, HotplugSink, UsbIoError,
    DEFAULT_TRANSFER_TIMEOUT,
};

const HOTPLUG_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct RusbEnumerator {
    context: rusb::Context,
    hotplug: Mutex<Option<HotplugRunner>>,
}

struct HotplugRunner {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RusbEnumerator {
    pub fn new() -> Result<Self, UsbIoError> {
        let context = rusb::Context::new().map_err(UsbIoError::Init)?;
        Ok(Self {
            context,
            hotplug: Mutex::new(None),
        })
    }
}

impl Drop for RusbEnumerator {
    fn drop(&mut self) {
        self.stop_hotplug();
    }
}

impl DeviceEnumerator for RusbEnumerator {
    fn enumerate(&self) -> Result<Vec<Box<dyn DeviceIo>>, UsbIoError> {
        let list = self.context.devices().map_err(UsbIoError::Init)?;
        let mut out: Vec<Box<dyn DeviceIo>> = Vec::new();
        for device in list.iter() {
            match summarize(&device) {
                Ok(summary) => out.push(Box::new(RusbDevice {
                    device,
                    summary,
                    handle: None,
                    claimed: Vec::new(),
                })),
                Err(err) => {
                    // Devices that vanish mid-enumeration or refuse their
                    // descriptor are skipped, not fatal.
                    debug!(%err, "skipping unreadable device");
                }
            }
        }
        Ok(out)
    }

    fn start_hotplug(&self, sink: Arc<dyn HotplugSink>) -> Result<(), UsbIoError> {
        if !rusb::has_hotplug() {
            return Err(UsbIoError::HotplugUnsupported);
        }

        let mut slot = self.hotplug.lock().expect("hotplug lock never poisoned");
        if slot.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let context = self.context.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || hotplug_loop(context, sink, &stop))
        };
        *slot = Some(HotplugRunner { stop, thread });
        Ok(())
    }

    fn stop_hotplug(&self) {
        let runner = self
            .hotplug
            .lock()
            .expect("hotplug lock never poisoned")
            .take();
        if let Some(runner) = runner {
            runner.stop.store(true, Ordering::SeqCst);
            let _ = runner.thread.join();
        }
    }
}

struct HotplugListener {
    sink: Arc<dyn HotplugSink>,
}

impl rusb::Hotplug<rusb::Context> for HotplugListener {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        match summarize(&device) {
            Ok(summary) => self.sink.on_hotplug(HotplugEvent {
                device: summary,
                connected: true,
            }),
            Err(err) => debug!(%err, "ignoring unreadable hotplugged device"),
        }
    }

    fn device_left(&mut self, device: rusb::Device<rusb::Context>) {
        match summarize(&device) {
            Ok(summary) => self.sink.on_hotplug(HotplugEvent {
                device: summary,
                connected: false,
            }),
            Err(err) => debug!(%err, "ignoring unreadable removed device"),
        }
    }
}

fn hotplug_loop(context: rusb::Context, sink: Arc<dyn HotplugSink>, stop: &AtomicBool) {
    // The registration must live for as long as events are pumped; it is
    // created and dropped on this thread.
    let registration = rusb::HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(HotplugListener { sink }));
    let _registration = match registration {
        Ok(reg) => reg,
        Err(err) => {
            warn!(%err, "hotplug registration failed");
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        if let Err(err) = context.handle_events(Some(HOTPLUG_EVENT_TIMEOUT)) {
            warn!(%err, "hotplug event pump failed");
            break;
        }
    }
}

fn summarize(device: &rusb::Device<rusb::Context>) -> Result<DeviceSummary, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let bus = device.bus_number();
    let address = device.address();
    let version = descriptor.device_version();
    let bcd_device = (u16::from(version.major()) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor());

    Ok(DeviceSummary {
        path: format!("/dev/bus/usb/{bus:03}/{address:03}"),
        bus_id: format!("{bus}-{address}"),
        bus_number: u32::from(bus),
        device_number: u32::from(address),
        speed: speed_code(device.speed()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_device,
        device_class: descriptor.class_code(),
        device_subclass: descriptor.sub_class_code(),
        device_protocol: descriptor.protocol_code(),
        num_configurations: descriptor.num_configurations(),
    })
}

fn speed_code(speed: rusb::Speed) -> u32 {
    match speed {
        rusb::Speed::Low => 1,
        rusb::Speed::Full => 2,
        rusb::Speed::High => 3,
        rusb::Speed::Super | rusb::Speed::SuperPlus => 4,
        _ => 0,
    }
}

pub struct RusbDevice {
    device: rusb::Device<rusb::Context>,
    summary: DeviceSummary,
    handle: Option<rusb::DeviceHandle<rusb::Context>>,
    claimed: Vec<u8>,
}

impl RusbDevice {
    fn handle(&self) -> Result<&rusb::DeviceHandle<rusb::Context>, UsbIoError> {
        self.handle.as_ref().ok_or(UsbIoError::NotOpen)
    }
}

impl DeviceIo for RusbDevice {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn summary(&self) -> &DeviceSummary {
        &self.summary
    }

    fn open(&mut self) -> Result<(), UsbIoError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.device.open().map_err(UsbIoError::Open)?;
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            debug!(%err, "auto-detach of kernel driver unavailable");
        }
        self.handle = Some(handle);
        debug!(path = %self.summary.path, "device opened");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            for interface in self.claimed.drain(..) {
                let _ = handle.release_interface(interface);
            }
            debug!(path = %self.summary.path, "device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), UsbIoError> {
        self.handle()?
            .claim_interface(interface)
            .map_err(|source| UsbIoError::Claim { interface, source })?;
        if !self.claimed.contains(&interface) {
            self.claimed.push(interface);
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), UsbIoError> {
        self.handle()?
            .release_interface(interface)
            .map_err(|source| UsbIoError::Release { interface, source })?;
        self.claimed.retain(|&claimed| claimed != interface);
        Ok(())
    }

    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(UsbIoError::Control)
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(UsbIoError::Control)
    }

    fn bulk_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .read_bulk(endpoint, buf, timeout)
            .map_err(|source| UsbIoError::Transfer { endpoint, source })
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .write_bulk(endpoint, data, timeout)
            .map_err(|source| UsbIoError::Transfer { endpoint, source })
    }

    fn interrupt_in(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .read_interrupt(endpoint, buf, timeout)
            .map_err(|source| UsbIoError::Transfer { endpoint, source })
    }

    fn interrupt_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbIoError> {
        self.handle()?
            .write_interrupt(endpoint, data, timeout)
            .map_err(|source| UsbIoError::Transfer { endpoint, source })
    }

    fn config_descriptor(&mut self) -> Result<Vec<u8>, UsbIoError> {
        // GET_DESCRIPTOR(CONFIGURATION, 0): read the 9-byte header for
        // wTotalLength, then the full descriptor chain.
        let handle = self.handle()?;
        let mut header = [0u8; 9];
        let n = handle
            .read_control(
                0x80,
                0x06,
                0x0200,
                0,
                &mut header,
                DEFAULT_TRANSFER_TIMEOUT,
            )
            .map_err(UsbIoError::Descriptor)?;
        if n < 4 {
            return Err(UsbIoError::Descriptor(rusb::Error::Io));
        }
        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));

        let mut buf = vec![0u8; total.max(header.len())];
        let n = handle
            .read_control(0x80, 0x06, 0x0200, 0, &mut buf, DEFAULT_TRANSFER_TIMEOUT)
            .map_err(UsbIoError::Descriptor)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn string_descriptor(&mut self, index: u8) -> Result<String, UsbIoError> {
        self.handle()?
            .read_string_descriptor_ascii(index)
            .map_err(UsbIoError::Descriptor)
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        self.close();
    }
}
