#![forbid(unsafe_code)]

//! Thread-based TCP transport.
//!
//! [`TcpConnection`] is one connected socket with a dedicated receive thread;
//! [`TcpServer`] accepts connections and gives each its own receive thread.
//! Both report through a shared [`ConnectionEvents`] implementation and tear
//! down by flipping a stop flag, waking the blocked thread, and joining it.
//! No event method is ever invoked while a transport lock is held.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

const RECV_BUFFER_LEN: usize = 8192;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("send on a disconnected socket")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(io::Error),
}

/// Callbacks from a connection's receive thread and from send failures.
///
/// `on_data` runs on the receive thread for every chunk read off the socket,
/// in order. `on_connected(false)` fires exactly once per connection when the
/// peer closes or the read loop errors out; it may fire once after a stop was
/// requested, never after the owning handle's `close` returns.
pub trait ConnectionEvents: Send + Sync {
    fn on_data(&self, data: &[u8]);
    fn on_connected(&self, _connected: bool) {}
    fn on_error(&self, _error: &io::Error) {}
}

struct ConnShared {
    stream: TcpStream,
    connected: AtomicBool,
    should_stop: AtomicBool,
    send_lock: Mutex<()>,
    events: Arc<dyn ConnectionEvents>,
}

/// One connected TCP socket. Reads happen on an owned background thread;
/// sends are serialised by an internal mutex and may come from any thread.
pub struct TcpConnection {
    shared: Arc<ConnShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnection {
    /// Connects to `host:port` and starts the receive thread. Fires
    /// `on_connected(true)` before returning.
    pub fn connect(
        host: &str,
        port: u16,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self, NetError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr).map_err(|source| NetError::Connect {
            addr: addr.clone(),
            source,
        })?;
        debug!(%addr, "connected");
        Ok(Self::from_stream(stream, events))
    }

    /// Wraps an already-connected stream (server side of an accept).
    pub fn from_stream(stream: TcpStream, events: Arc<dyn ConnectionEvents>) -> Self {
        let shared = Arc::new(ConnShared {
            stream,
            connected: AtomicBool::new(true),
            should_stop: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            events,
        });

        let receiver = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || receive_loop(&shared))
        };

        shared.events.on_connected(true);
        Self {
            shared,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.shared.stream.peer_addr()
    }

    /// Writes all of `data`, retrying transient errors. Any other error is
    /// reported through `on_error` and returned.
    pub fn send(&self, data: &[u8]) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }

        let _guard = self
            .shared
            .send_lock
            .lock()
            .expect("send lock never poisoned");
        let mut stream = &self.shared.stream;
        let mut sent = 0;
        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    self.shared.events.on_error(&err);
                    return Err(NetError::Send(err));
                }
                Ok(n) => sent += n,
                Err(err)
                    if err.kind() == io::ErrorKind::Interrupted
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(err) => {
                    self.shared.events.on_error(&err);
                    return Err(NetError::Send(err));
                }
            }
        }
        Ok(())
    }

    /// Stops the receive thread and waits for it. Idempotent.
    pub fn close(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.shared.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self
            .receiver
            .lock()
            .expect("receiver handle lock never poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(shared: &ConnShared) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    let mut stream = &shared.stream;
    loop {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => break, // peer closed
            Ok(n) => shared.events.on_data(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if !shared.should_stop.load(Ordering::SeqCst) {
                    shared.events.on_error(&err);
                }
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
    shared.events.on_connected(false);
}

struct ServerShared {
    listener: TcpListener,
    should_stop: AtomicBool,
    clients: Mutex<Vec<TcpConnection>>,
    events: Arc<dyn ConnectionEvents>,
}

/// Accepting TCP server. Every accepted connection funnels its received data
/// into the same [`ConnectionEvents`] instance, in per-connection order.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn bind(addr: &str, events: Arc<dyn ConnectionEvents>) -> Result<Self, NetError> {
        let listener = bind_reusable(addr).map_err(|source| NetError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
        // The accept loop polls so a stop request is observed promptly.
        listener
            .set_nonblocking(true)
            .map_err(|source| NetError::Bind {
                addr: addr.to_owned(),
                source,
            })?;

        let shared = Arc::new(ServerShared {
            listener,
            should_stop: AtomicBool::new(false),
            clients: Mutex::new(Vec::new()),
            events,
        });

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || accept_loop(&shared))
        };

        Ok(Self {
            shared,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.shared
            .clients
            .lock()
            .expect("client list lock never poisoned")
            .len()
    }

    /// Sends `data` to every connected client, pruning dead connections.
    /// Returns how many clients accepted the full write.
    pub fn send_to_all(&self, data: &[u8]) -> usize {
        let mut clients = self
            .shared
            .clients
            .lock()
            .expect("client list lock never poisoned");
        clients.retain(|client| client.is_connected());

        let mut delivered = 0;
        for client in clients.iter() {
            match client.send(data) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(%err, "skipping undeliverable client"),
            }
        }
        delivered
    }

    /// Stops accepting, closes every client, and joins the accept thread.
    pub fn close(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self
            .acceptor
            .lock()
            .expect("acceptor handle lock never poisoned")
            .take()
        {
            let _ = handle.join();
        }
        let clients = std::mem::take(
            &mut *self
                .shared
                .clients
                .lock()
                .expect("client list lock never poisoned"),
        );
        for client in &clients {
            client.close();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(shared: &ServerShared) {
    loop {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }
        match shared.listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "client connected");
                // Accepted sockets read blocking; only the listener polls.
                if let Err(err) = stream.set_nonblocking(false) {
                    shared.events.on_error(&err);
                    continue;
                }
                let conn = TcpConnection::from_stream(stream, Arc::clone(&shared.events));
                shared
                    .clients
                    .lock()
                    .expect("client list lock never poisoned")
                    .push(conn);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                if !shared.should_stop.load(Ordering::SeqCst) {
                    shared.events.on_error(&err);
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn bind_reusable(addr: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket address"))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    Ok(socket.into())
}
