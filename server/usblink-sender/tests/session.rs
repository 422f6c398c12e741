use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use usblink_net::{ConnectionEvents, TcpConnection};
use usblink_protocol::frame::{bus_id_payload, Frame, FrameDecoder, FrameEncoder, MessageType};
use usblink_protocol::urb::BulkDefault;
use usblink_protocol::usbip::{decode_device_list, decode_urb_submit, UsbipDeviceInfo};
use usblink_protocol::{Direction, TransferType, UsbUrb};
use usblink_sender::SenderSession;

/// Raw protocol peer: decodes frames off the wire and lets tests wait for a
/// message of a given type.
#[derive(Default)]
struct FramePeer {
    decoder: Mutex<FrameDecoder>,
    frames: Mutex<Vec<Frame>>,
    cond: Condvar,
}

impl FramePeer {
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
}

impl ConnectionEvents for FramePeer {
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

fn start_session() -> (SenderSession, TcpConnection, Arc<FramePeer>, FrameEncoder) {
    let session = SenderSession::start("127.0.0.1:0").unwrap();
    session.set_devices(vec![sample_device()]);

    let peer = Arc::new(FramePeer::default());
    let addr = session.local_addr().unwrap();
    let conn = TcpConnection::connect(&addr.ip().to_string(), addr.port(), peer.clone()).unwrap();
    (session, conn, peer, FrameEncoder::new())
}

#[test]
fn device_list_request_reports_the_served_device() {
    let (session, conn, peer, mut encoder) = start_session();

    conn.send(&encoder.encode(MessageType::DeviceListRequest, &[]).unwrap())
        .unwrap();

    let frame = peer.wait_for(MessageType::DeviceListResponse);
    let (status, devices) = decode_device_list(&frame.payload).unwrap();
    assert_eq!(status, 0);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id_vendor, 0x1234);
    assert_eq!(devices[0].device_class, 0x08);
    assert_eq!(devices[0].busid, "1-2");

    conn.close();
    session.stop();
}

#[test]
fn import_of_known_bus_id_succeeds() {
    let (session, conn, peer, mut encoder) = start_session();

    conn.send(
        &encoder
            .encode(MessageType::DeviceImportRequest, &bus_id_payload("1-2"))
            .unwrap(),
    )
    .unwrap();

    let frame = peer.wait_for(MessageType::DeviceImportResponse);
    assert_eq!(frame.payload[0], 0x01);

    conn.close();
    session.stop();
}

#[test]
fn import_of_unknown_bus_id_fails_with_a_message() {
    let (session, conn, peer, mut encoder) = start_session();

    conn.send(
        &encoder
            .encode(MessageType::DeviceImportRequest, &bus_id_payload("9-9"))
            .unwrap(),
    )
    .unwrap();

    let frame = peer.wait_for(MessageType::DeviceImportResponse);
    assert_eq!(frame.payload[0], 0x00);
    assert_eq!(&frame.payload[1..], b"device not found");

    conn.close();
    session.stop();
}

#[test]
fn heartbeat_is_echoed() {
    let (session, conn, peer, mut encoder) = start_session();

    conn.send(&encoder.encode(MessageType::Heartbeat, &[]).unwrap())
        .unwrap();
    let frame = peer.wait_for(MessageType::Heartbeat);
    assert!(frame.payload.is_empty());

    conn.close();
    session.stop();
}

#[test]
fn published_urbs_arrive_as_urb_submit() {
    let (session, conn, peer, _) = start_session();

    // Published URBs go to connected receivers only; wait for the accept.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while session.client_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "client never accepted");
        std::thread::sleep(Duration::from_millis(10));
    }

    let urb = UsbUrb {
        id: 77,
        transfer_type: TransferType::Bulk,
        direction: Direction::Out,
        endpoint: 0x02,
        flags: 0,
        data: vec![1, 2, 3],
        setup: [0; 8],
        status: 0,
        actual_length: 3,
        timestamp_us: 0,
    };
    session.publish_urb(&urb);

    let frame = peer.wait_for(MessageType::UrbSubmit);
    let decoded = decode_urb_submit(&frame.payload, &BulkDefault).unwrap();
    assert_eq!(decoded.id, 77);
    assert_eq!(decoded.data, vec![1, 2, 3]);

    conn.close();
    session.stop();
}
