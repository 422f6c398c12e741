#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use usblink_protocol::usbip::UsbipDeviceInfo;
use usblink_sender::{Config, ReverseClient, SenderSession};
use usblink_usb::rusb_backend::RusbEnumerator;
use usblink_usb::{
    DeviceEnumerator, DeviceIo, HotplugEvent, HotplugSink, MassStorageDevice, UrbCapture,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        error!(%err, "sender failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cfg = Config::from_env();
    info!(bind = %cfg.bind, "starting usblink sender");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("failed to install SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("failed to install SIGTERM handler")?;

    // USB subsystem init failure is fatal.
    let enumerator = Arc::new(RusbEnumerator::new().context("USB subsystem init failed")?);

    let session = SenderSession::start(&cfg.bind)
        .with_context(|| format!("failed to listen on {}", cfg.bind))?;

    let capture = Arc::new(UrbCapture::new());
    capture.set_urb_sink(Arc::new(session.clone()));

    let scanner = Arc::new(DeviceScanner {
        enumerator: Arc::clone(&enumerator),
        capture: Arc::clone(&capture),
        session: session.clone(),
        known: Mutex::new(HashSet::new()),
    });
    scanner.scan();
    capture.start();

    // Device arrivals only flag a rescan; the libusb event thread must not
    // open devices itself.
    let rescan = Arc::new(AtomicBool::new(false));
    let hotplug_sink = Arc::new(Hotplug {
        scanner: Arc::clone(&scanner),
        rescan: Arc::clone(&rescan),
    });
    match enumerator.start_hotplug(hotplug_sink) {
        Ok(()) => info!("hotplug monitoring started"),
        Err(err) => warn!(%err, "hotplug monitoring unavailable"),
    }

    // Reverse mode: dial out to a receiver that cannot reach this host. The
    // reverse link runs the same session dialog as accepted connections.
    let reverse = cfg.reverse_host.as_ref().map(|host| {
        let client = ReverseClient::new();
        session.attach_reverse(&client);
        if let Err(err) = client.connect(host, cfg.reverse_port) {
            warn!(%err, %host, "initial reverse connection failed");
        }
        client.enable_auto_reconnect(cfg.reconnect_interval);
        client
    });

    info!("usblink sender running");
    let mut last_stats = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));

        if rescan.swap(false, Ordering::SeqCst) {
            scanner.scan();
        }

        if last_stats.elapsed() >= cfg.stats_interval {
            last_stats = Instant::now();
            let stats = capture.statistics();
            if stats.total > 0 {
                info!(
                    total = stats.total,
                    control = stats.control,
                    bulk = stats.bulk,
                    bytes = stats.bytes_transferred,
                    errors = stats.errors,
                    "URB statistics"
                );
            }
        }
    }

    info!("shutting down");
    if let Some(reverse) = reverse {
        reverse.disconnect();
    }
    enumerator.stop_hotplug();
    capture.stop();
    session.stop();
    Ok(())
}

/// Tracks which bus ids are already being served, so hotplug-triggered
/// rescans add only new devices.
struct DeviceScanner {
    enumerator: Arc<RusbEnumerator>,
    capture: Arc<UrbCapture>,
    session: SenderSession,
    known: Mutex<HashSet<String>>,
}

impl DeviceScanner {
    fn scan(&self) {
        let devices = match self.enumerator.enumerate() {
            Ok(devices) => devices,
            Err(err) => {
                warn!(%err, "device enumeration failed");
                return;
            }
        };

        let mut added = 0usize;
        for io in devices {
            if !mass_storage_candidate(io.as_ref()) {
                continue;
            }
            let summary = io.summary().clone();
            {
                let known = self.known.lock().expect("known set lock never poisoned");
                if known.contains(&summary.bus_id) {
                    continue;
                }
            }

            let mut device = MassStorageDevice::new(io);
            match device.initialize() {
                Ok(()) => {
                    self.session.add_device(device_record(&device));
                    self.capture.add_device(Arc::new(Mutex::new(device)));
                    self.known
                        .lock()
                        .expect("known set lock never poisoned")
                        .insert(summary.bus_id.clone());
                    added += 1;
                    info!(path = %summary.path, "serving mass-storage device");
                }
                Err(err) => warn!(path = %summary.path, %err, "device skipped"),
            }
        }
        if added > 0 {
            info!(added, "mass-storage scan complete");
        }
    }

    fn remove(&self, bus_id: &str) {
        let was_known = self
            .known
            .lock()
            .expect("known set lock never poisoned")
            .remove(bus_id);
        if was_known {
            self.capture.remove_device(bus_id);
            self.session.remove_device(bus_id);
        }
    }
}

/// Class 0x08 at the device level, or composite (class 0) where the
/// interface descriptor decides during initialization.
fn mass_storage_candidate(io: &dyn DeviceIo) -> bool {
    matches!(io.summary().device_class, 0x00 | 0x08)
}

fn device_record(device: &MassStorageDevice) -> UsbipDeviceInfo {
    let summary = device.summary();
    UsbipDeviceInfo {
        path: summary.path.clone(),
        busid: summary.bus_id.clone(),
        busnum: summary.bus_number,
        devnum: summary.device_number,
        speed: summary.speed,
        id_vendor: summary.vendor_id,
        id_product: summary.product_id,
        bcd_device: summary.bcd_device,
        device_class: summary.device_class,
        device_subclass: summary.device_subclass,
        device_protocol: summary.device_protocol,
        configuration_value: 1,
        num_configurations: summary.num_configurations,
        num_interfaces: 1,
    }
}

struct Hotplug {
    scanner: Arc<DeviceScanner>,
    rescan: Arc<AtomicBool>,
}

impl HotplugSink for Hotplug {
    fn on_hotplug(&self, event: HotplugEvent) {
        if event.connected {
            info!(bus_id = %event.device.bus_id, "device connected");
            self.rescan.store(true, Ordering::SeqCst);
        } else {
            info!(bus_id = %event.device.bus_id, "device removed");
            self.scanner.remove(&event.device.bus_id);
        }
    }
}
