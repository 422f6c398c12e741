//! Message framing.
//!
//! Wire format (all integer fields big-endian):
//!
//! ```text
//! 0       4       8       12      16      20
//! +-------+-------+-------+-------+-------+
//! | magic | type  | length| seq   | cksum |  header (20 bytes)
//! +-------+-------+-------+-------+-------+
//! | payload (length bytes)                |
//! +---------------------------------------+
//! ```
//!
//! `magic` is the constant `0x55534249` ("USBI"). `cksum` is the wrapping
//! u32 sum of the payload bytes; an empty payload has checksum 0. The decoder
//! resynchronises on corruption by scanning for the next magic and validates
//! the checksum before delivering a frame.

use crate::Error;

pub const FRAME_MAGIC: u32 = 0x5553_4249; // "USBI"
pub const FRAME_HEADER_LEN: usize = 20;
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const MAGIC_BYTES: [u8; 4] = FRAME_MAGIC.to_be_bytes();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    DeviceListRequest = 1,
    DeviceListResponse = 2,
    DeviceImportRequest = 3,
    DeviceImportResponse = 4,
    UrbSubmit = 5,
    UrbResponse = 6,
    DeviceDisconnect = 7,
    Heartbeat = 8,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::DeviceListRequest),
            2 => Some(Self::DeviceListResponse),
            3 => Some(Self::DeviceImportRequest),
            4 => Some(Self::DeviceImportResponse),
            5 => Some(Self::UrbSubmit),
            6 => Some(Self::UrbResponse),
            7 => Some(Self::DeviceDisconnect),
            8 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded message. Unknown `msg_type` values are delivered as-is so the
/// session layer can log them; only framing and checksum are enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }
}

/// Wrapping u32 sum of the payload bytes.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// Serialises frames, assigning strictly increasing sequence numbers.
#[derive(Debug)]
pub struct FrameEncoder {
    next_sequence: u32,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::with_start_sequence(1)
    }

    /// Tests inject a start value for deterministic sequences.
    pub fn with_start_sequence(start: u32) -> Self {
        Self {
            next_sequence: start,
        }
    }

    pub fn encode(&mut self, kind: MessageType, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&MAGIC_BYTES);
        out.extend_from_slice(&(kind as u32).to_be_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&payload_checksum(payload).to_be_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental frame parser over arbitrary chunk boundaries.
///
/// Recovery rules, in order:
/// - head does not start with the magic: discard up to the next occurrence of
///   the magic, or the whole buffer if there is none;
/// - well-formed header with an oversize length: discard exactly the header
///   and re-scan;
/// - checksum mismatch on a complete frame: skip the frame without delivering
///   it.
///
/// Incomplete frames stay buffered until more input arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered but not yet consumed by a delivered or discarded frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let magic = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if magic != FRAME_MAGIC {
                match find_magic(&self.buf[1..]) {
                    Some(pos) => {
                        self.buf.drain(..pos + 1);
                    }
                    None => self.buf.clear(),
                }
                continue;
            }

            let msg_type =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
            let length =
                u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize;
            let sequence =
                u32::from_be_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]]);
            let checksum =
                u32::from_be_bytes([self.buf[16], self.buf[17], self.buf[18], self.buf[19]]);

            if length > MAX_PAYLOAD_LEN {
                // The header itself cannot be trusted; its payload was never
                // taken to be valid.
                self.buf.drain(..FRAME_HEADER_LEN);
                continue;
            }

            let total = FRAME_HEADER_LEN + length;
            if self.buf.len() < total {
                break;
            }

            let payload = &self.buf[FRAME_HEADER_LEN..total];
            if payload_checksum(payload) == checksum {
                frames.push(Frame {
                    msg_type,
                    sequence,
                    payload: payload.to_vec(),
                });
            }
            self.buf.drain(..total);
        }
        frames
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC_BYTES.len())
        .position(|window| window == MAGIC_BYTES)
}

/// UTF-8 bus-id payload used by DEVICE_IMPORT_REQUEST and DEVICE_DISCONNECT.
pub fn bus_id_payload(bus_id: &str) -> Vec<u8> {
    bus_id.as_bytes().to_vec()
}

pub fn parse_bus_id(payload: &[u8]) -> Result<String, Error> {
    core::str::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidUtf8 { context: "bus-id" })
}

/// DEVICE_IMPORT_RESPONSE payload: a success byte, followed by a UTF-8 error
/// message when the byte is 0.
pub fn import_response_payload(success: bool, error: &str) -> Vec<u8> {
    let mut out = vec![u8::from(success)];
    if !success {
        out.extend_from_slice(error.as_bytes());
    }
    out
}

pub fn parse_import_response(payload: &[u8]) -> Result<(bool, Option<String>), Error> {
    let Some((&flag, rest)) = payload.split_first() else {
        return Err(Error::ShortBuffer {
            context: "import response",
            need: 1,
            got: 0,
        });
    };
    let success = flag != 0;
    if success || rest.is_empty() {
        return Ok((success, None));
    }
    let message = core::str::from_utf8(rest)
        .map_err(|_| Error::InvalidUtf8 {
            context: "import response error message",
        })?
        .to_owned();
    Ok((false, Some(message)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn heartbeat_round_trip() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode(MessageType::Heartbeat, &[]).unwrap();

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageType::Heartbeat));
        assert!(frames[0].payload.is_empty());
        assert_eq!(payload_checksum(&frames[0].payload), 0);
    }

    #[test]
    fn resync_through_leading_noise() {
        let mut enc = FrameEncoder::new();
        let frame = enc.encode(MessageType::Heartbeat, &[]).unwrap();

        let mut feed = vec![0xFF, 0xFF, 0xFF];
        feed.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&feed);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageType::Heartbeat));
    }

    #[test]
    fn payload_round_trip_with_known_checksum() {
        let payload = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode(MessageType::Heartbeat, &payload).unwrap();

        // 0xAA + 0xBB + 0xCC + 0xDD.
        let wire_checksum = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert_eq!(wire_checksum, 0x02D2);

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn corrupted_payload_byte_drops_the_frame() {
        let mut enc = FrameEncoder::new();
        let mut bytes = enc.encode(MessageType::UrbSubmit, &[1, 2, 3, 4]).unwrap();
        bytes[FRAME_HEADER_LEN + 2] ^= 0x01;

        let mut dec = FrameDecoder::new();
        assert!(dec.push(&bytes).is_empty());

        // The stream recovers: the next well-formed frame still decodes.
        let good = enc.encode(MessageType::Heartbeat, &[]).unwrap();
        let frames = dec.push(&good);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageType::Heartbeat));
    }

    #[test]
    fn oversize_length_discards_exactly_the_header() {
        // A spurious magic followed by 16 bytes of 0xFF parses as a header
        // whose length field exceeds the limit.
        let mut feed = FRAME_MAGIC.to_be_bytes().to_vec();
        feed.extend_from_slice(&[0xFF; 16]);
        let mut enc = FrameEncoder::new();
        let frame = enc.encode(MessageType::Heartbeat, &[]).unwrap();
        feed.extend_from_slice(&frame);

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&feed);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), Some(MessageType::Heartbeat));
    }

    #[test]
    fn incomplete_frame_waits_for_more_input() {
        let mut enc = FrameEncoder::new();
        let bytes = enc.encode(MessageType::UrbSubmit, &[9; 40]).unwrap();

        let mut dec = FrameDecoder::new();
        assert!(dec.push(&bytes[..25]).is_empty());
        let frames = dec.push(&bytes[25..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![9; 40]);
    }

    #[test]
    fn garbage_without_magic_clears_the_buffer() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(&[0x01; 64]).is_empty());
        assert_eq!(dec.pending_len(), 0);

        let mut enc = FrameEncoder::new();
        let frames = dec.push(&enc.encode(MessageType::Heartbeat, &[]).unwrap());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn multiple_frames_in_one_chunk_decode_in_order() {
        let mut enc = FrameEncoder::new();
        let mut feed = enc.encode(MessageType::DeviceListRequest, &[]).unwrap();
        feed.extend_from_slice(&enc.encode(MessageType::Heartbeat, &[]).unwrap());

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&feed);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind(), Some(MessageType::DeviceListRequest));
        assert_eq!(frames[1].kind(), Some(MessageType::Heartbeat));
    }

    #[test]
    fn encoder_sequences_strictly_increase() {
        let mut enc = FrameEncoder::with_start_sequence(7);
        let a = enc.encode(MessageType::Heartbeat, &[]).unwrap();
        let b = enc.encode(MessageType::Heartbeat, &[]).unwrap();

        let mut dec = FrameDecoder::new();
        let mut frames = dec.push(&a);
        frames.extend(dec.push(&b));
        assert_eq!(frames[0].sequence, 7);
        assert_eq!(frames[1].sequence, 8);
        assert!(frames[1].sequence > frames[0].sequence);
    }

    #[test]
    fn unknown_message_type_is_delivered() {
        let payload = [0x42];
        let mut bytes = FRAME_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&99u32.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&payload_checksum(&payload).to_be_bytes());
        bytes.extend_from_slice(&payload);

        let mut dec = FrameDecoder::new();
        let frames = dec.push(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, 99);
        assert_eq!(frames[0].kind(), None);
    }

    #[test]
    fn oversize_payload_refused_at_encode_time() {
        let mut enc = FrameEncoder::new();
        let err = enc
            .encode(MessageType::UrbSubmit, &vec![0; MAX_PAYLOAD_LEN + 1])
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
    }

    #[test]
    fn import_response_payload_round_trips() {
        let ok = import_response_payload(true, "");
        assert_eq!(parse_import_response(&ok).unwrap(), (true, None));

        let failed = import_response_payload(false, "device not found");
        assert_eq!(
            parse_import_response(&failed).unwrap(),
            (false, Some("device not found".to_owned()))
        );
    }
}
