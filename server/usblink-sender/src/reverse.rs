//! Reverse-mode client: the sender dials out to a receiver that cannot reach
//! it, with auto-reconnect until told to stop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use usblink_net::{ConnectionEvents, NetError, TcpConnection};
use usblink_protocol::frame::{Frame, FrameDecoder, FrameEncoder, MessageType};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives decoded frames and connection transitions from the reverse link.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &Frame);
    fn on_connected(&self, _connected: bool) {}
}

struct ReverseShared {
    decoder: Mutex<FrameDecoder>,
    encoder: Mutex<FrameEncoder>,
    conn: Mutex<Option<TcpConnection>>,
    connected: AtomicBool,
    should_stop: AtomicBool,
    handler: Mutex<Option<Arc<dyn FrameHandler>>>,
    target: Mutex<(String, u16)>,
}

pub struct ReverseClient {
    shared: Arc<ReverseShared>,
    reconnector: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap sending handle onto the reverse link, for components that publish
/// frames but do not manage the connection.
#[derive(Clone)]
pub struct ReverseSender {
    shared: Arc<ReverseShared>,
}

impl ReverseSender {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn send(&self, kind: MessageType, payload: &[u8]) -> Result<(), NetError> {
        self.shared.send_frame(kind, payload)
    }
}

impl ReverseClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ReverseShared {
                decoder: Mutex::new(FrameDecoder::new()),
                encoder: Mutex::new(FrameEncoder::new()),
                conn: Mutex::new(None),
                connected: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                handler: Mutex::new(None),
                target: Mutex::new((String::new(), 0)),
            }),
            reconnector: Mutex::new(None),
        }
    }

    pub fn set_frame_handler(&self, handler: Arc<dyn FrameHandler>) {
        *self
            .shared
            .handler
            .lock()
            .expect("handler lock never poisoned") = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<(), NetError> {
        *self
            .shared
            .target
            .lock()
            .expect("target lock never poisoned") = (host.to_owned(), port);
        self.shared.dial()
    }

    pub fn send(&self, kind: MessageType, payload: &[u8]) -> Result<(), NetError> {
        self.shared.send_frame(kind, payload)
    }

    /// Hands out a sending handle for use by the session controller.
    pub fn sender(&self) -> ReverseSender {
        ReverseSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Redials every `interval` while disconnected, until [`Self::disconnect`].
    pub fn enable_auto_reconnect(&self, interval: Duration) {
        let mut slot = self
            .reconnector
            .lock()
            .expect("reconnector lock never poisoned");
        if slot.is_some() {
            return;
        }
        self.shared.should_stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *slot = Some(thread::spawn(move || reconnect_loop(&shared, interval)));
        info!(interval_secs = interval.as_secs(), "auto-reconnect enabled");
    }

    pub fn disconnect(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .reconnector
            .lock()
            .expect("reconnector lock never poisoned")
            .take()
        {
            let _ = handle.join();
        }
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
}

impl Default for ReverseClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReverseClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ReverseShared {
    fn send_frame(&self, kind: MessageType, payload: &[u8]) -> Result<(), NetError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NetError::NotConnected);
        }
        let bytes = self
            .encoder
            .lock()
            .expect("encoder lock never poisoned")
            .encode(kind, payload)
            .map_err(|_| NetError::NotConnected)?;
        let conn = self.conn.lock().expect("conn lock never poisoned");
        match conn.as_ref() {
            Some(conn) => conn.send(&bytes),
            None => Err(NetError::NotConnected),
        }
    }

    fn dial(self: &Arc<Self>) -> Result<(), NetError> {
        let (host, port) = self
            .target
            .lock()
            .expect("target lock never poisoned")
            .clone();
        let conn = TcpConnection::connect(&host, port, Arc::clone(self) as Arc<dyn ConnectionEvents>)?;
        *self.conn.lock().expect("conn lock never poisoned") = Some(conn);
        Ok(())
    }
}

impl ConnectionEvents for ReverseShared {
    fn on_data(&self, data: &[u8]) {
        let frames = self
            .decoder
            .lock()
            .expect("decoder lock never poisoned")
            .push(data);
        if frames.is_empty() {
            return;
        }
        let handler = self
            .handler
            .lock()
            .expect("handler lock never poisoned")
            .clone();
        if let Some(handler) = handler {
            for frame in &frames {
                handler.on_frame(frame);
            }
        }
    }

    fn on_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            info!("reverse link established");
        } else {
            info!("reverse link lost");
        }
        let handler = self
            .handler
            .lock()
            .expect("handler lock never poisoned")
            .clone();
        if let Some(handler) = handler {
            handler.on_connected(connected);
        }
    }

    fn on_error(&self, error: &io::Error) {
        warn!(%error, "reverse link error");
    }
}

fn reconnect_loop(shared: &Arc<ReverseShared>, interval: Duration) {
    while !shared.should_stop.load(Ordering::SeqCst) {
        if !shared.connected.load(Ordering::SeqCst) {
            info!("reconnecting to receiver");
            // Drop the dead connection before dialing again.
            let stale = shared.conn.lock().expect("conn lock never poisoned").take();
            if let Some(stale) = stale {
                stale.close();
            }
            if let Err(err) = shared.dial() {
                warn!(%err, "reconnect attempt failed");
            }
        }

        // Sleep in short steps so a stop request is honored promptly.
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shared.should_stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}
