//! URB capture pipeline.
//!
//! Producers (mass-storage drivers, tests via [`UrbCapture::inject_urb`])
//! enqueue URBs; a single consumer thread drains the queue in FIFO order,
//! updates the statistics, and hands each URB to the registered [`UrbSink`].
//! Statistics are updated exactly once per URB, before the sink runs, and no
//! lock is held across the sink call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};
use usblink_protocol::{TransferType, UsbUrb};

use crate::mass_storage::MassStorageDevice;

/// Receives URBs, one call per URB, in queue order.
pub trait UrbSink: Send + Sync {
    fn on_urb(&self, urb: UsbUrb);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub total: u64,
    pub control: u64,
    pub bulk: u64,
    pub interrupt: u64,
    pub isochronous: u64,
    pub bytes_transferred: u64,
    pub errors: u64,
}

struct CaptureShared {
    queue: Mutex<VecDeque<UsbUrb>>,
    queue_cv: Condvar,
    stats: Mutex<CaptureStats>,
    sink: Mutex<Option<Arc<dyn UrbSink>>>,
    capturing: AtomicBool,
    should_stop: AtomicBool,
}

/// Enqueues into the capture queue on behalf of attached devices.
struct QueueSink {
    shared: Arc<CaptureShared>,
}

impl UrbSink for QueueSink {
    fn on_urb(&self, urb: UsbUrb) {
        if !self.shared.capturing.load(Ordering::SeqCst) {
            return;
        }
        self.shared
            .queue
            .lock()
            .expect("capture queue lock never poisoned")
            .push_back(urb);
        self.shared.queue_cv.notify_one();
    }
}

pub struct UrbCapture {
    shared: Arc<CaptureShared>,
    devices: Mutex<Vec<Arc<Mutex<MassStorageDevice>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UrbCapture {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CaptureShared {
                queue: Mutex::new(VecDeque::new()),
                queue_cv: Condvar::new(),
                stats: Mutex::new(CaptureStats::default()),
                sink: Mutex::new(None),
                capturing: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
            }),
            devices: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
        }
    }

    /// The consumer delivers every captured URB to `sink`.
    pub fn set_urb_sink(&self, sink: Arc<dyn UrbSink>) {
        *self.shared.sink.lock().expect("sink lock never poisoned") = Some(sink);
    }

    /// Registers a device and wires its URB output into the queue. Devices
    /// added while the pipeline runs start capturing immediately.
    pub fn add_device(&self, device: Arc<Mutex<MassStorageDevice>>) {
        {
            let mut guard = device.lock().expect("device lock never poisoned");
            guard.set_urb_sink(Arc::new(QueueSink {
                shared: Arc::clone(&self.shared),
            }));
            if self.is_capturing() {
                if let Err(err) = guard.start_capture() {
                    warn!(path = %guard.summary().path, %err, "device capture failed to start");
                }
            }
            info!(path = %guard.summary().path, "device added to URB capture");
        }
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .push(device);
    }

    /// Drops the device with the given bus id from the capture set.
    pub fn remove_device(&self, bus_id: &str) {
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .retain(|device| {
                device
                    .lock()
                    .expect("device lock never poisoned")
                    .bus_id()
                    != bus_id
            });
    }

    pub fn remove_all_devices(&self) {
        self.devices
            .lock()
            .expect("device list lock never poisoned")
            .clear();
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    /// Starts the consumer thread and every attached device. Idempotent.
    pub fn start(&self) {
        if self.shared.capturing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.should_stop.store(false, Ordering::SeqCst);

        let worker = {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || consume_loop(&shared))
        };
        *self.worker.lock().expect("worker lock never poisoned") = Some(worker);

        let devices = self
            .devices
            .lock()
            .expect("device list lock never poisoned")
            .clone();
        for device in devices {
            let mut guard = device.lock().expect("device lock never poisoned");
            if let Err(err) = guard.start_capture() {
                warn!(path = %guard.summary().path, %err, "device capture failed to start");
            }
        }
        info!("URB capture started");
    }

    /// Stops the devices, wakes the consumer, and joins it once the queue has
    /// drained. Idempotent.
    pub fn stop(&self) {
        if !self.shared.capturing.swap(false, Ordering::SeqCst) {
            return;
        }

        let devices = self
            .devices
            .lock()
            .expect("device list lock never poisoned")
            .clone();
        for device in devices {
            device
                .lock()
                .expect("device lock never poisoned")
                .stop_capture();
        }

        self.shared.should_stop.store(true, Ordering::SeqCst);
        self.shared.queue_cv.notify_all();
        if let Some(worker) = self
            .worker
            .lock()
            .expect("worker lock never poisoned")
            .take()
        {
            let _ = worker.join();
        }
        info!("URB capture stopped");
    }

    /// Manual injection path, used by tests and by the session controller's
    /// self-generated traffic.
    pub fn inject_urb(&self, urb: UsbUrb) {
        if !self.is_capturing() {
            return;
        }
        self.shared
            .queue
            .lock()
            .expect("capture queue lock never poisoned")
            .push_back(urb);
        self.shared.queue_cv.notify_one();
    }

    pub fn statistics(&self) -> CaptureStats {
        *self
            .shared
            .stats
            .lock()
            .expect("stats lock never poisoned")
    }

    pub fn reset_statistics(&self) {
        *self
            .shared
            .stats
            .lock()
            .expect("stats lock never poisoned") = CaptureStats::default();
        debug!("capture statistics reset");
    }
}

impl Default for UrbCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UrbCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume_loop(shared: &CaptureShared) {
    debug!("URB consumer thread started");
    loop {
        let urb = {
            let mut queue = shared
                .queue
                .lock()
                .expect("capture queue lock never poisoned");
            while queue.is_empty() && !shared.should_stop.load(Ordering::SeqCst) {
                queue = shared
                    .queue_cv
                    .wait(queue)
                    .expect("capture queue lock never poisoned");
            }
            // Drain whatever is queued before honoring the stop flag so
            // nothing enqueued before stop() is lost.
            match queue.pop_front() {
                Some(urb) => urb,
                None => break,
            }
        };

        update_stats(shared, &urb);

        let sink = shared
            .sink
            .lock()
            .expect("sink lock never poisoned")
            .clone();
        if let Some(sink) = sink {
            sink.on_urb(urb);
        }
    }
    debug!("URB consumer thread stopped");
}

fn update_stats(shared: &CaptureShared, urb: &UsbUrb) {
    let mut stats = shared.stats.lock().expect("stats lock never poisoned");
    stats.total += 1;
    stats.bytes_transferred += u64::from(urb.actual_length);
    if urb.status != 0 {
        stats.errors += 1;
    }
    match urb.transfer_type {
        TransferType::Control => stats.control += 1,
        TransferType::Bulk => stats.bulk += 1,
        TransferType::Interrupt => stats.interrupt += 1,
        TransferType::Isochronous => stats.isochronous += 1,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Condvar as StdCondvar;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use usblink_protocol::Direction;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        urbs: Mutex<Vec<UsbUrb>>,
        cv: StdCondvar,
    }

    impl RecordingSink {
        fn wait_for(&self, count: usize) -> Vec<UsbUrb> {
            let urbs = self.urbs.lock().unwrap();
            let (urbs, timeout) = self
                .cv
                .wait_timeout_while(urbs, Duration::from_secs(5), |u| u.len() < count)
                .unwrap();
            assert!(!timeout.timed_out(), "timed out waiting for {count} URBs");
            urbs.clone()
        }
    }

    impl UrbSink for RecordingSink {
        fn on_urb(&self, urb: UsbUrb) {
            self.urbs.lock().unwrap().push(urb);
            self.cv.notify_all();
        }
    }

    fn urb(id: u32, transfer_type: TransferType, len: usize, status: i32) -> UsbUrb {
        UsbUrb {
            id,
            transfer_type,
            direction: Direction::In,
            endpoint: 0x81,
            flags: 0,
            data: vec![0; len],
            setup: [0; 8],
            status,
            actual_length: len as u32,
            timestamp_us: 0,
        }
    }

    #[test]
    fn urbs_flow_fifo_and_stats_count_each_type_once() {
        let capture = UrbCapture::new();
        let sink = Arc::new(RecordingSink::default());
        capture.set_urb_sink(sink.clone());
        capture.start();

        capture.inject_urb(urb(1, TransferType::Control, 8, 0));
        capture.inject_urb(urb(2, TransferType::Bulk, 512, 0));
        capture.inject_urb(urb(3, TransferType::Interrupt, 4, -32));
        capture.inject_urb(urb(4, TransferType::Isochronous, 0, 0));

        let seen = sink.wait_for(4);
        assert_eq!(
            seen.iter().map(|u| u.id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let stats = capture.statistics();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.control, 1);
        assert_eq!(stats.bulk, 1);
        assert_eq!(stats.interrupt, 1);
        assert_eq!(stats.isochronous, 1);
        assert_eq!(stats.bytes_transferred, 8 + 512 + 4);
        assert_eq!(stats.errors, 1);

        capture.stop();
    }

    #[test]
    fn stop_drains_pending_urbs_before_joining() {
        let capture = UrbCapture::new();
        let sink = Arc::new(RecordingSink::default());
        capture.set_urb_sink(sink.clone());
        capture.start();

        for id in 0..100 {
            capture.inject_urb(urb(id, TransferType::Bulk, 1, 0));
        }
        capture.stop();

        let seen = sink.urbs.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert_eq!(capture.statistics().total, 100);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let capture = UrbCapture::new();
        capture.start();
        capture.start();
        capture.stop();
        capture.stop();
        assert!(!capture.is_capturing());
    }

    #[test]
    fn inject_is_ignored_while_stopped() {
        let capture = UrbCapture::new();
        capture.inject_urb(urb(1, TransferType::Bulk, 1, 0));
        capture.start();
        capture.stop();
        assert_eq!(capture.statistics().total, 0);
    }

    #[test]
    fn reset_clears_all_counters() {
        let capture = UrbCapture::new();
        let sink = Arc::new(RecordingSink::default());
        capture.set_urb_sink(sink.clone());
        capture.start();
        capture.inject_urb(urb(1, TransferType::Bulk, 16, 0));
        sink.wait_for(1);
        capture.stop();

        assert_ne!(capture.statistics(), CaptureStats::default());
        capture.reset_statistics();
        assert_eq!(capture.statistics(), CaptureStats::default());
    }
}
