//! Session dialog over the reverse (dialed-out) link.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use usblink_net::{ConnectionEvents, TcpServer};
use usblink_protocol::frame::{bus_id_payload, Frame, FrameDecoder, FrameEncoder, MessageType};
use usblink_protocol::urb::BulkDefault;
use usblink_protocol::usbip::{decode_device_list, decode_urb_submit, UsbipDeviceInfo};
use usblink_protocol::{Direction, TransferType, UsbUrb};
use usblink_sender::{ReverseClient, SenderSession};

/// The remote receiver end of the reverse link: a raw accepting peer that
/// decodes frames and lets the test wait for a message of a given type.
#[derive(Default)]
struct ReceiverPeer {
    decoder: Mutex<FrameDecoder>,
    frames: Mutex<Vec<Frame>>,
    cond: Condvar,
}

impl ReceiverPeer {
    fn wait_for(&self, kind: MessageType) -> Frame {
        let frames = self.frames.lock().unwrap();
        let (frames, timeout) = self
            .cond
            .wait_timeout_while(frames, Duration::from_secs(5), |frames| {
                !frames.iter().any(|f| f.kind() == Some(kind))
            })
            .unwrap();
        assert!(!timeout.timed_out(), "timed out waiting for {kind:?}");
        frames
            .iter()
            .find(|f| f.kind() == Some(kind))
            .cloned()
            .expect("frame present")
    }

    fn count_of(&self, kind: MessageType) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.kind() == Some(kind))
            .count()
    }
}

impl ConnectionEvents for ReceiverPeer {
    fn on_data(&self, data: &[u8]) {
        let decoded = self.decoder.lock().unwrap().push(data);
        if decoded.is_empty() {
            return;
        }
        self.frames.lock().unwrap().extend(decoded);
        self.cond.notify_all();
    }
}

fn sample_device() -> UsbipDeviceInfo {
    UsbipDeviceInfo {
        path: "/dev/bus/usb/001/002".to_owned(),
        busid: "1-2".to_owned(),
        busnum: 1,
        devnum: 2,
        speed: 3,
        id_vendor: 0x1234,
        id_product: 0x5678,
        bcd_device: 0x0100,
        device_class: 0x08,
        device_subclass: 0x06,
        device_protocol: 0x50,
        configuration_value: 1,
        num_configurations: 1,
        num_interfaces: 1,
    }
}

/// Sender session plus a reverse link dialed into a raw receiver peer.
fn start_reverse_pair() -> (
    SenderSession,
    ReverseClient,
    TcpServer,
    Arc<ReceiverPeer>,
    FrameEncoder,
) {
    let peer = Arc::new(ReceiverPeer::default());
    let peer_server = TcpServer::bind("127.0.0.1:0", peer.clone()).unwrap();
    let peer_addr = peer_server.local_addr().unwrap();

    let session = SenderSession::start("127.0.0.1:0").unwrap();
    session.set_devices(vec![sample_device()]);

    let reverse = ReverseClient::new();
    session.attach_reverse(&reverse);
    reverse
        .connect(&peer_addr.ip().to_string(), peer_addr.port())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while peer_server.client_count() == 0 {
        assert!(Instant::now() < deadline, "reverse link never accepted");
        std::thread::sleep(Duration::from_millis(10));
    }

    (session, reverse, peer_server, peer, FrameEncoder::new())
}

#[test]
fn device_list_request_is_answered_over_the_reverse_link() {
    let (session, reverse, peer_server, peer, mut encoder) = start_reverse_pair();

    let request = encoder.encode(MessageType::DeviceListRequest, &[]).unwrap();
    assert_eq!(peer_server.send_to_all(&request), 1);

    let frame = peer.wait_for(MessageType::DeviceListResponse);
    let (status, devices) = decode_device_list(&frame.payload).unwrap();
    assert_eq!(status, 0);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id_vendor, 0x1234);
    assert_eq!(devices[0].busid, "1-2");

    reverse.disconnect();
    session.stop();
    peer_server.close();
}

#[test]
fn import_request_is_answered_over_the_reverse_link() {
    let (session, reverse, peer_server, peer, mut encoder) = start_reverse_pair();

    let request = encoder
        .encode(MessageType::DeviceImportRequest, &bus_id_payload("1-2"))
        .unwrap();
    assert_eq!(peer_server.send_to_all(&request), 1);

    let frame = peer.wait_for(MessageType::DeviceImportResponse);
    assert_eq!(frame.payload[0], 0x01);

    reverse.disconnect();
    session.stop();
    peer_server.close();
}

#[test]
fn heartbeat_is_echoed_over_the_reverse_link() {
    let (session, reverse, peer_server, peer, mut encoder) = start_reverse_pair();

    let heartbeat = encoder.encode(MessageType::Heartbeat, &[]).unwrap();
    assert_eq!(peer_server.send_to_all(&heartbeat), 1);

    let frame = peer.wait_for(MessageType::Heartbeat);
    assert!(frame.payload.is_empty());

    reverse.disconnect();
    session.stop();
    peer_server.close();
}

#[test]
fn published_urbs_reach_the_reverse_peer() {
    let (session, reverse, peer_server, peer, _) = start_reverse_pair();

    let urb = UsbUrb {
        id: 91,
        transfer_type: TransferType::Bulk,
        direction: Direction::Out,
        endpoint: 0x02,
        flags: 0,
        data: vec![9, 8, 7],
        setup: [0; 8],
        status: 0,
        actual_length: 3,
        timestamp_us: 0,
    };
    session.publish_urb(&urb);

    let frame = peer.wait_for(MessageType::UrbSubmit);
    let decoded = decode_urb_submit(&frame.payload, &BulkDefault).unwrap();
    assert_eq!(decoded.id, 91);
    assert_eq!(decoded.data, vec![9, 8, 7]);
    // Exactly once: the accepting server has no clients, so only the reverse
    // link carries the publication.
    assert_eq!(peer.count_of(MessageType::UrbSubmit), 1);

    reverse.disconnect();
    session.stop();
    peer_server.close();
}
