//! Composition of the port pool and the live virtual devices.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};
use usblink_protocol::{UsbUrb, UsbipDeviceInfo};
use usblink_vdev::{
    DeviceState, PortAllocator, PortBinder, PortError, VdevError, VirtualUsbDevice,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Device(#[from] VdevError),
}

/// Owns the receiver's virtual devices. One instance is composed at startup
/// and injected wherever device access is needed.
pub struct VirtualDeviceManager {
    ports: PortAllocator,
    binder: Arc<dyn PortBinder>,
    devices: Mutex<Vec<Arc<Mutex<VirtualUsbDevice>>>>,
}

impl VirtualDeviceManager {
    pub fn new(binder: Arc<dyn PortBinder>) -> Self {
        Self {
            ports: PortAllocator::default(),
            binder,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn has_bus_id(&self, bus_id: &str) -> bool {
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .iter()
            .any(|device| {
                device
                    .lock()
                    .expect("device lock never poisoned")
                    .bus_id()
                    == bus_id
            })
    }

    pub fn device_count(&self) -> usize {
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .len()
    }

    /// Acquires a port, creates the virtual device, and attaches it. The
    /// port is returned to the pool if any step fails.
    pub fn create_and_attach(
        &self,
        info: UsbipDeviceInfo,
    ) -> Result<Arc<Mutex<VirtualUsbDevice>>, ManagerError> {
        let port = self.ports.acquire()?;
        let mut device = VirtualUsbDevice::new(info);
        if let Err(err) = device.create(port).and_then(|()| device.attach(self.binder.as_ref())) {
            self.ports.release(port);
            return Err(err.into());
        }

        let device = Arc::new(Mutex::new(device));
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .push(Arc::clone(&device));
        Ok(device)
    }

    /// Routes one inbound URB to the first attached device and returns its
    /// response.
    pub fn handle_urb(&self, urb: &UsbUrb) -> Option<UsbUrb> {
        let devices = self
            .devices
            .lock()
            .expect("device list lock never poisoned")
            .clone();
        for device in devices {
            let mut device = device.lock().expect("device lock never poisoned");
            if device.state() == DeviceState::Attached {
                return device.handle_urb(urb);
            }
        }
        warn!(id = urb.id, "no attached virtual device for URB");
        None
    }

    /// Detaches and destroys the device imported under `bus_id`.
    pub fn remove_by_bus_id(&self, bus_id: &str) {
        let mut devices = self
            .devices
            .lock()
            .expect("device list lock never poisoned");
        devices.retain(|device| {
            let mut device = device.lock().expect("device lock never poisoned");
            if device.bus_id() != bus_id {
                return true;
            }
            self.teardown(&mut device);
            false
        });
    }

    /// Detaches and destroys every device, returning all ports.
    pub fn shutdown(&self) {
        let mut devices = self
            .devices
            .lock()
            .expect("device list lock never poisoned");
        for device in devices.drain(..) {
            let mut device = device.lock().expect("device lock never poisoned");
            self.teardown(&mut device);
        }
        info!("virtual devices shut down");
    }

    fn teardown(&self, device: &mut VirtualUsbDevice) {
        if device.state() == DeviceState::Attached {
            if let Err(err) = device.detach(self.binder.as_ref()) {
                warn!(bus_id = %device.bus_id(), %err, "detach failed");
            }
        }
        if let Some(port) = device.destroy() {
            self.ports.release(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use usblink_vdev::NoopPortBinder;

    use super::*;

    fn info(busid: &str) -> UsbipDeviceInfo {
        UsbipDeviceInfo {
            busid: busid.to_owned(),
            device_class: 0x08,
            ..UsbipDeviceInfo::default()
        }
    }

    #[test]
    fn create_remove_returns_the_port() {
        let manager = VirtualDeviceManager::new(Arc::new(NoopPortBinder));

        let first = manager.create_and_attach(info("1-1")).unwrap();
        assert_eq!(first.lock().unwrap().port(), Some(0));
        assert_eq!(manager.device_count(), 1);

        manager.remove_by_bus_id("1-1");
        assert_eq!(manager.device_count(), 0);

        // The released port is handed out again.
        let second = manager.create_and_attach(info("1-2")).unwrap();
        assert_eq!(second.lock().unwrap().port(), Some(0));
    }

    #[test]
    fn pool_exhaustion_surfaces_as_an_error() {
        let manager = VirtualDeviceManager::new(Arc::new(NoopPortBinder));
        for i in 0..8 {
            manager.create_and_attach(info(&format!("1-{i}"))).unwrap();
        }
        assert!(matches!(
            manager.create_and_attach(info("2-0")),
            Err(ManagerError::Port(PortError::Exhausted))
        ));
    }

    #[test]
    fn shutdown_destroys_every_device() {
        let manager = VirtualDeviceManager::new(Arc::new(NoopPortBinder));
        let device = manager.create_and_attach(info("1-1")).unwrap();
        manager.shutdown();
        assert_eq!(manager.device_count(), 0);
        assert_eq!(device.lock().unwrap().state(), DeviceState::Destroyed);
    }
}
