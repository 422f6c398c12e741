//! Server side of the peer protocol.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};
use usblink_net::{ConnectionEvents, NetError, TcpServer};
use usblink_protocol::frame::{
    bus_id_payload, import_response_payload, parse_bus_id, Frame, FrameDecoder, FrameEncoder,
    MessageType,
};
use usblink_protocol::usbip::{decode_urb_response, encode_device_list, encode_urb_submit};
use usblink_protocol::{UsbUrb, UsbipDeviceInfo};
use usblink_usb::UrbSink;

use crate::reverse::{FrameHandler, ReverseClient, ReverseSender};

struct SenderShared {
    decoder: Mutex<FrameDecoder>,
    encoder: Mutex<FrameEncoder>,
    devices: Mutex<Vec<UsbipDeviceInfo>>,
    server: Mutex<Option<TcpServer>>,
    reverse: Mutex<Option<ReverseSender>>,
    response_sink: Mutex<Option<Arc<dyn UrbSink>>>,
}

/// Accepts receiver connections and answers the session dialog. Captured
/// URBs are published to every connected receiver through [`UrbSink`].
#[derive(Clone)]
pub struct SenderSession {
    shared: Arc<SenderShared>,
}

impl SenderSession {
    /// Binds the server and starts accepting receivers.
    pub fn start(bind: &str) -> Result<Self, NetError> {
        let shared = Arc::new(SenderShared {
            decoder: Mutex::new(FrameDecoder::new()),
            encoder: Mutex::new(FrameEncoder::new()),
            devices: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            reverse: Mutex::new(None),
            response_sink: Mutex::new(None),
        });

        let server = TcpServer::bind(bind, Arc::clone(&shared) as Arc<dyn ConnectionEvents>)?;
        info!(bind, "sender session listening");
        *shared.server.lock().expect("server slot lock never poisoned") = Some(server);
        Ok(Self { shared })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .server
            .lock()
            .expect("server slot lock never poisoned")
            .as_ref()
            .and_then(|server| server.local_addr().ok())
    }

    /// Number of currently connected receivers.
    pub fn client_count(&self) -> usize {
        self.shared
            .server
            .lock()
            .expect("server slot lock never poisoned")
            .as_ref()
            .map_or(0, |server| server.client_count())
    }

    /// Replaces the device records served to DEVICE_LIST_REQUEST.
    pub fn set_devices(&self, devices: Vec<UsbipDeviceInfo>) {
        *self
            .shared
            .devices
            .lock()
            .expect("device records lock never poisoned") = devices;
    }

    pub fn add_device(&self, device: UsbipDeviceInfo) {
        self.shared
            .devices
            .lock()
            .expect("device records lock never poisoned")
            .push(device);
    }

    /// Removes a device record and notifies connected receivers.
    pub fn remove_device(&self, bus_id: &str) {
        self.shared
            .devices
            .lock()
            .expect("device records lock never poisoned")
            .retain(|device| device.busid != bus_id);
        self.shared
            .broadcast(MessageType::DeviceDisconnect, &bus_id_payload(bus_id));
    }

    /// Runs the same session dialog over an outbound reverse link: frames
    /// arriving there are dispatched like accepted-connection frames, with
    /// replies going back out the reverse link, and published URBs reach the
    /// reverse peer too.
    pub fn attach_reverse(&self, reverse: &ReverseClient) {
        *self
            .shared
            .reverse
            .lock()
            .expect("reverse slot lock never poisoned") = Some(reverse.sender());
        reverse.set_frame_handler(Arc::new(ReverseDialog {
            shared: Arc::downgrade(&self.shared),
        }));
    }

    /// Delivers decoded URB_RESPONSE messages, correlated by URB id.
    pub fn set_urb_response_sink(&self, sink: Arc<dyn UrbSink>) {
        *self
            .shared
            .response_sink
            .lock()
            .expect("response sink lock never poisoned") = Some(sink);
    }

    /// Publishes one captured URB as a URB_SUBMIT message on every active
    /// transport.
    pub fn publish_urb(&self, urb: &UsbUrb) {
        self.shared
            .broadcast(MessageType::UrbSubmit, &encode_urb_submit(urb, 0));
    }

    pub fn stop(&self) {
        let server = self
            .shared
            .server
            .lock()
            .expect("server slot lock never poisoned")
            .take();
        if let Some(server) = server {
            server.close();
        }
    }
}

impl UrbSink for SenderSession {
    fn on_urb(&self, urb: UsbUrb) {
        self.publish_urb(&urb);
    }
}

impl SenderShared {
    fn send(&self, kind: MessageType, payload: &[u8]) {
        let bytes = match self
            .encoder
            .lock()
            .expect("encoder lock never poisoned")
            .encode(kind, payload)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(?kind, %err, "failed to encode message");
                return;
            }
        };
        let server = self.server.lock().expect("server slot lock never poisoned");
        if let Some(server) = server.as_ref() {
            server.send_to_all(&bytes);
        }
    }

    fn send_reverse(&self, kind: MessageType, payload: &[u8]) {
        let reverse = self
            .reverse
            .lock()
            .expect("reverse slot lock never poisoned")
            .clone();
        if let Some(reverse) = reverse {
            if reverse.is_connected() {
                if let Err(err) = reverse.send(kind, payload) {
                    warn!(?kind, %err, "send over reverse link failed");
                }
            }
        }
    }

    /// Sends on the accepting server and the reverse link alike.
    fn broadcast(&self, kind: MessageType, payload: &[u8]) {
        self.send(kind, payload);
        self.send_reverse(kind, payload);
    }

    /// Dispatches one inbound frame; the returned message, if any, is the
    /// reply to send back on the link the frame arrived on.
    fn handle_frame(&self, frame: &Frame) -> Option<(MessageType, Vec<u8>)> {
        match frame.kind() {
            Some(MessageType::DeviceListRequest) => Some(self.handle_device_list_request()),
            Some(MessageType::DeviceImportRequest) => Some(self.handle_import_request(frame)),
            Some(MessageType::Heartbeat) => {
                debug!("heartbeat from receiver");
                Some((MessageType::Heartbeat, Vec::new()))
            }
            Some(MessageType::UrbResponse) => {
                self.handle_urb_response(frame);
                None
            }
            Some(other) => {
                warn!(?other, "unexpected message type");
                None
            }
            None => {
                warn!(msg_type = frame.msg_type, "unknown message type");
                None
            }
        }
    }

    fn handle_device_list_request(&self) -> (MessageType, Vec<u8>) {
        let devices = self
            .devices
            .lock()
            .expect("device records lock never poisoned")
            .clone();
        info!(count = devices.len(), "device list requested");
        (MessageType::DeviceListResponse, encode_device_list(&devices))
    }

    fn handle_import_request(&self, frame: &Frame) -> (MessageType, Vec<u8>) {
        let bus_id = match parse_bus_id(&frame.payload) {
            Ok(bus_id) => bus_id,
            Err(err) => {
                warn!(%err, "malformed import request");
                return (
                    MessageType::DeviceImportResponse,
                    import_response_payload(false, "malformed bus id"),
                );
            }
        };

        let found = self
            .devices
            .lock()
            .expect("device records lock never poisoned")
            .iter()
            .any(|device| device.busid == bus_id);
        info!(%bus_id, found, "device import requested");

        let payload = if found {
            import_response_payload(true, "")
        } else {
            import_response_payload(false, "device not found")
        };
        (MessageType::DeviceImportResponse, payload)
    }

    fn handle_urb_response(&self, frame: &Frame) {
        match decode_urb_response(&frame.payload) {
            Ok(urb) => {
                debug!(
                    id = urb.id,
                    status = urb.status,
                    actual_length = urb.actual_length,
                    "URB response"
                );
                let sink = self
                    .response_sink
                    .lock()
                    .expect("response sink lock never poisoned")
                    .clone();
                if let Some(sink) = sink {
                    sink.on_urb(urb);
                }
            }
            Err(err) => warn!(%err, "undecodable URB response"),
        }
    }
}

impl ConnectionEvents for SenderShared {
    fn on_data(&self, data: &[u8]) {
        let frames = self
            .decoder
            .lock()
            .expect("decoder lock never poisoned")
            .push(data);
        for frame in frames {
            if let Some((kind, payload)) = self.handle_frame(&frame) {
                self.send(kind, &payload);
            }
        }
    }

    fn on_connected(&self, connected: bool) {
        if connected {
            info!("receiver connected");
        } else {
            info!("receiver disconnected");
        }
    }

    fn on_error(&self, error: &io::Error) {
        error!(%error, "transport error");
    }
}

/// Frame handler for the reverse link: the same dialog, replying back out
/// the reverse connection.
struct ReverseDialog {
    shared: Weak<SenderShared>,
}

impl FrameHandler for ReverseDialog {
    fn on_frame(&self, frame: &Frame) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some((kind, payload)) = shared.handle_frame(frame) {
            shared.send_reverse(kind, &payload);
        }
    }

    fn on_connected(&self, connected: bool) {
        if connected {
            info!("reverse receiver connected");
        } else {
            info!("reverse receiver disconnected");
        }
    }
}
