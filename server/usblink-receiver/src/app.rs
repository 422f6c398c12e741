//! Glue between the protocol client and the virtual-device manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};
use usblink_protocol::urb::USB_CLASS_MASS_STORAGE;
use usblink_protocol::{UsbUrb, UsbipDeviceInfo};

use crate::client::{ClientEvents, ReceiverClient};
use crate::manager::VirtualDeviceManager;

/// The receiver application: reacts to session events by importing devices
/// and answering URBs. Waiters ([`ReceiverApp::wait_for_device_list`],
/// [`ReceiverApp::wait_for_import_result`]) serve the one-shot CLI modes.
pub struct ReceiverApp {
    client: ReceiverClient,
    manager: VirtualDeviceManager,
    /// When set, every mass-storage device in a device list is imported.
    auto_import: AtomicBool,
    replies: Mutex<Replies>,
    cond: Condvar,
}

#[derive(Default)]
struct Replies {
    device_list: Option<Vec<UsbipDeviceInfo>>,
    import_result: Option<(bool, Option<String>)>,
}

impl ReceiverApp {
    /// Wires the client's events to a new app instance.
    pub fn new(client: ReceiverClient, manager: VirtualDeviceManager) -> Arc<Self> {
        let app = Arc::new(Self {
            client: client.clone(),
            manager,
            auto_import: AtomicBool::new(true),
            replies: Mutex::new(Replies::default()),
            cond: Condvar::new(),
        });
        client.set_events(Arc::clone(&app) as Arc<dyn ClientEvents>);
        app
    }

    pub fn client(&self) -> &ReceiverClient {
        &self.client
    }

    pub fn manager(&self) -> &VirtualDeviceManager {
        &self.manager
    }

    pub fn set_auto_import(&self, enabled: bool) {
        self.auto_import.store(enabled, Ordering::SeqCst);
    }

    pub fn wait_for_device_list(&self, timeout: Duration) -> Option<Vec<UsbipDeviceInfo>> {
        let guard = self.replies.lock().expect("replies lock never poisoned");
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |replies| replies.device_list.is_none())
            .expect("replies lock never poisoned");
        guard.device_list.clone()
    }

    pub fn wait_for_import_result(&self, timeout: Duration) -> Option<(bool, Option<String>)> {
        let guard = self.replies.lock().expect("replies lock never poisoned");
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |replies| replies.import_result.is_none())
            .expect("replies lock never poisoned");
        guard.import_result.clone()
    }

    /// Builds the local virtual device, then asks the sender for the import.
    /// The virtual device is torn back down if the request cannot be sent.
    pub fn import(&self, info: UsbipDeviceInfo) -> bool {
        let bus_id = info.busid.clone();
        if self.manager.has_bus_id(&bus_id) {
            // Already imported; a reconnect replays the device list.
            return true;
        }
        match self.manager.create_and_attach(info) {
            Ok(_) => {}
            Err(err) => {
                warn!(%bus_id, %err, "failed to create virtual device");
                return false;
            }
        }
        if let Err(err) = self.client.import_device(&bus_id) {
            warn!(%bus_id, %err, "import request failed");
            self.manager.remove_by_bus_id(&bus_id);
            return false;
        }
        true
    }
}

impl ClientEvents for ReceiverApp {
    fn on_device_list(&self, devices: &[UsbipDeviceInfo]) {
        for (index, device) in devices.iter().enumerate() {
            info!(
                index,
                busid = %device.busid,
                vendor = format_args!("{:04x}", device.id_vendor),
                product = format_args!("{:04x}", device.id_product),
                class = device.device_class,
                "remote device"
            );
        }

        self.replies
            .lock()
            .expect("replies lock never poisoned")
            .device_list = Some(devices.to_vec());
        self.cond.notify_all();

        if self.auto_import.load(Ordering::SeqCst) {
            for device in devices {
                if device.device_class == USB_CLASS_MASS_STORAGE {
                    info!(busid = %device.busid, "auto-importing mass-storage device");
                    self.import(device.clone());
                }
            }
        }
    }

    fn on_import_response(&self, success: bool, error: Option<&str>) {
        self.replies
            .lock()
            .expect("replies lock never poisoned")
            .import_result = Some((success, error.map(str::to_owned)));
        self.cond.notify_all();
    }

    fn on_urb(&self, urb: UsbUrb) {
        if let Some(response) = self.manager.handle_urb(&urb) {
            if let Err(err) = self.client.send_urb_response(&response) {
                warn!(id = response.id, %err, "failed to send URB response");
            }
        }
    }

    fn on_device_disconnect(&self, bus_id: &str) {
        self.manager.remove_by_bus_id(bus_id);
    }

    fn on_connection(&self, connected: bool) {
        if !connected {
            // The main loop reconnects; imported devices stay attached so a
            // quick reconnect resumes URB flow without re-enumeration.
            warn!("session interrupted");
        }
    }
}
