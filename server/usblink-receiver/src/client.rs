//! Client side of the peer protocol.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use usblink_net::{ConnectionEvents, NetError, TcpConnection};
use usblink_protocol::frame::{
    bus_id_payload, parse_bus_id, parse_import_response, Frame, FrameDecoder, FrameEncoder,
    MessageType,
};
use usblink_protocol::urb::EndpointClassifier;
use usblink_protocol::usbip::{decode_device_list, decode_urb_submit, encode_urb_response};
use usblink_protocol::{BulkDefault, UsbUrb, UsbipDeviceInfo};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Session-level callbacks, fired from the connection's receive thread.
pub trait ClientEvents: Send + Sync {
    fn on_device_list(&self, devices: &[UsbipDeviceInfo]);
    fn on_import_response(&self, success: bool, error: Option<&str>);
    fn on_urb(&self, urb: UsbUrb);
    fn on_device_disconnect(&self, _bus_id: &str) {}
    fn on_connection(&self, _connected: bool) {}
}

struct ClientShared {
    decoder: Mutex<FrameDecoder>,
    encoder: Mutex<FrameEncoder>,
    conn: Mutex<Option<TcpConnection>>,
    connected: AtomicBool,
    events: Mutex<Option<Arc<dyn ClientEvents>>>,
    /// Set while this side originates the periodic heartbeat; an incoming
    /// heartbeat is then the peer's ack and must not be answered again, or
    /// the two peers would echo each other forever.
    heartbeat_active: AtomicBool,
    classifier: Box<dyn EndpointClassifier + Send + Sync>,
}

#[derive(Clone)]
pub struct ReceiverClient {
    shared: Arc<ClientShared>,
    heartbeat: Arc<Mutex<Option<HeartbeatRunner>>>,
}

struct HeartbeatRunner {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ReceiverClient {
    pub fn new() -> Self {
        Self::with_classifier(Box::new(BulkDefault))
    }

    /// Hosts that know the imported device's endpoint descriptors can refine
    /// the transfer type of non-control URBs.
    pub fn with_classifier(classifier: Box<dyn EndpointClassifier + Send + Sync>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                decoder: Mutex::new(FrameDecoder::new()),
                encoder: Mutex::new(FrameEncoder::new()),
                conn: Mutex::new(None),
                connected: AtomicBool::new(false),
                events: Mutex::new(None),
                heartbeat_active: AtomicBool::new(false),
                classifier,
            }),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_events(&self, events: Arc<dyn ClientEvents>) {
        *self
            .shared
            .events
            .lock()
            .expect("events lock never poisoned") = Some(events);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        if self.is_connected() {
            return Ok(());
        }
        info!(host, port, "connecting to sender");
        let conn = TcpConnection::connect(
            host,
            port,
            Arc::clone(&self.shared) as Arc<dyn ConnectionEvents>,
        )?;
        *self.shared.conn.lock().expect("conn lock never poisoned") = Some(conn);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.stop_heartbeat();
        let conn = self
            .shared
            .conn
            .lock()
            .expect("conn lock never poisoned")
            .take();
        if let Some(conn) = conn {
            conn.close();
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    pub fn request_device_list(&self) -> Result<(), NetError> {
        debug!("requesting device list");
        self.shared.send(MessageType::DeviceListRequest, &[])
    }

    pub fn import_device(&self, bus_id: &str) -> Result<(), NetError> {
        info!(bus_id, "requesting device import");
        self.shared
            .send(MessageType::DeviceImportRequest, &bus_id_payload(bus_id))
    }

    pub fn send_urb_response(&self, urb: &UsbUrb) -> Result<(), NetError> {
        self.shared
            .send(MessageType::UrbResponse, &encode_urb_response(urb, 0))
    }

    /// Starts the periodic heartbeat. Idempotent.
    pub fn start_heartbeat(&self, interval: Duration) {
        let mut slot = self.heartbeat.lock().expect("heartbeat lock never poisoned");
        if slot.is_some() {
            return;
        }
        self.shared.heartbeat_active.store(true, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            thread::spawn(move || heartbeat_loop(&shared, &stop, interval))
        };
        *slot = Some(HeartbeatRunner { stop, thread });
        info!(interval_secs = interval.as_secs(), "heartbeat started");
    }

    pub fn stop_heartbeat(&self) {
        let runner = self
            .heartbeat
            .lock()
            .expect("heartbeat lock never poisoned")
            .take();
        if let Some(runner) = runner {
            runner.stop.store(true, Ordering::SeqCst);
            let _ = runner.thread.join();
        }
        self.shared.heartbeat_active.store(false, Ordering::SeqCst);
    }
}

impl Default for ReceiverClient {
    fn default() -> Self {
        Self::new()
    }
}

fn heartbeat_loop(shared: &ClientShared, stop: &AtomicBool, interval: Duration) {
    loop {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
        if shared.connected.load(Ordering::SeqCst) {
            debug!("heartbeat");
            let _ = shared.send(MessageType::Heartbeat, &[]);
        }
    }
}

impl ClientShared {
    fn send(&self, kind: MessageType, payload: &[u8]) -> Result<(), NetError> {
        let bytes = self
            .encoder
            .lock()
            .expect("encoder lock never poisoned")
            .encode(kind, payload)
            .map_err(|err| {
                error!(%err, "failed to encode message");
                NetError::NotConnected
            })?;
        let conn = self.conn.lock().expect("conn lock never poisoned");
        match conn.as_ref() {
            Some(conn) => conn.send(&bytes),
            None => Err(NetError::NotConnected),
        }
    }

    fn events(&self) -> Option<Arc<dyn ClientEvents>> {
        self.events.lock().expect("events lock never poisoned").clone()
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.kind() {
            Some(MessageType::DeviceListResponse) => match decode_device_list(&frame.payload) {
                Ok((0, devices)) => {
                    info!(count = devices.len(), "device list received");
                    if let Some(events) = self.events() {
                        events.on_device_list(&devices);
                    }
                }
                Ok((status, _)) => warn!(status, "device list reply carries an error status"),
                Err(err) => warn!(%err, "undecodable device list"),
            },
            Some(MessageType::DeviceImportResponse) => {
                match parse_import_response(&frame.payload) {
                    Ok((success, error)) => {
                        if success {
                            info!("device import succeeded");
                        } else {
                            warn!(error = error.as_deref(), "device import failed");
                        }
                        if let Some(events) = self.events() {
                            events.on_import_response(success, error.as_deref());
                        }
                    }
                    Err(err) => warn!(%err, "undecodable import response"),
                }
            }
            Some(MessageType::UrbSubmit) => {
                match decode_urb_submit(&frame.payload, self.classifier.as_ref()) {
                    Ok(urb) => {
                        if let Some(events) = self.events() {
                            events.on_urb(urb);
                        }
                    }
                    Err(err) => warn!(%err, "undecodable URB submit"),
                }
            }
            Some(MessageType::DeviceDisconnect) => match parse_bus_id(&frame.payload) {
                Ok(bus_id) => {
                    info!(%bus_id, "sender disconnected a device");
                    if let Some(events) = self.events() {
                        events.on_device_disconnect(&bus_id);
                    }
                }
                Err(err) => warn!(%err, "undecodable device disconnect"),
            },
            Some(MessageType::Heartbeat) => {
                debug!("heartbeat from sender");
                if !self.heartbeat_active.load(Ordering::SeqCst) {
                    let _ = self.send(MessageType::Heartbeat, &[]);
                }
            }
            Some(other) => warn!(?other, "unexpected message type"),
            None => warn!(msg_type = frame.msg_type, "unknown message type"),
        }
    }
}

impl ConnectionEvents for ClientShared {
    fn on_data(&self, data: &[u8]) {
        let frames = self
            .decoder
            .lock()
            .expect("decoder lock never poisoned")
            .push(data);
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn on_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            info!("connected to sender");
        } else {
            info!("connection to sender lost");
        }
        if let Some(events) = self.events() {
            events.on_connection(connected);
        }
    }

    fn on_error(&self, error: &io::Error) {
        error!(%error, "transport error");
        self.connected.store(false, Ordering::SeqCst);
    }
}
