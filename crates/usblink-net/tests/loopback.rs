use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use usblink_net::{ConnectionEvents, TcpConnection, TcpServer};

/// Accumulates received bytes and connection transitions for assertions.
#[derive(Default)]
struct Recorder {
    state: Mutex<RecorderState>,
    cond: Condvar,
}

#[derive(Default)]
struct RecorderState {
    data: Vec<u8>,
    disconnects: usize,
}

impl Recorder {
    fn wait_for_bytes(&self, want: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let (state, timeout) = self
            .cond
            .wait_timeout_while(state, Duration::from_secs(5), |s| s.data.len() < want)
            .unwrap();
        assert!(!timeout.timed_out(), "timed out waiting for {want} bytes");
        state.data.clone()
    }

    fn wait_for_disconnect(&self) {
        let state = self.state.lock().unwrap();
        let (_state, timeout) = self
            .cond
            .wait_timeout_while(state, Duration::from_secs(5), |s| s.disconnects == 0)
            .unwrap();
        assert!(!timeout.timed_out(), "timed out waiting for disconnect");
    }
}

impl ConnectionEvents for Recorder {
    fn on_data(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.data.extend_from_slice(data);
        self.cond.notify_all();
    }

    fn on_connected(&self, connected: bool) {
        if !connected {
            let mut state = self.state.lock().unwrap();
            state.disconnects += 1;
            self.cond.notify_all();
        }
    }

    fn on_error(&self, _error: &io::Error) {}
}

#[test]
fn client_to_server_and_back() {
    let server_events = Arc::new(Recorder::default());
    let server = TcpServer::bind("127.0.0.1:0", server_events.clone()).unwrap();
    let port = server.local_addr().unwrap().port();

    let client_events = Arc::new(Recorder::default());
    let client = TcpConnection::connect("127.0.0.1", port, client_events.clone()).unwrap();

    client.send(&[0x01, 0x02, 0x03, 0x04, 0x05]).unwrap();
    assert_eq!(
        server_events.wait_for_bytes(5),
        vec![0x01, 0x02, 0x03, 0x04, 0x05]
    );
    assert_eq!(server.client_count(), 1);

    assert_eq!(server.send_to_all(&[0xAA, 0xBB]), 1);
    assert_eq!(client_events.wait_for_bytes(2), vec![0xAA, 0xBB]);

    client.close();
    server.close();
}

#[test]
fn peer_close_fires_disconnect_callback() {
    let server_events = Arc::new(Recorder::default());
    let server = TcpServer::bind("127.0.0.1:0", server_events.clone()).unwrap();
    let port = server.local_addr().unwrap().port();

    let client_events = Arc::new(Recorder::default());
    let client = TcpConnection::connect("127.0.0.1", port, client_events.clone()).unwrap();
    assert!(client.is_connected());

    server.close();
    client_events.wait_for_disconnect();
    assert!(!client.is_connected());
    client.close();
}

#[test]
fn send_on_closed_connection_fails() {
    let server_events = Arc::new(Recorder::default());
    let server = TcpServer::bind("127.0.0.1:0", server_events).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpConnection::connect("127.0.0.1", port, Arc::new(Recorder::default())).unwrap();
    client.close();
    assert!(client.send(&[1]).is_err());
    server.close();
}
