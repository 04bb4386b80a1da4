//! HTTP/3 framing (C14): unidirectional control/QPACK streams and the
//! per-request bidirectional HEADERS/DATA state machine, per RFC 9114.
//!
//! This layer never touches QUIC packets or frames directly — it only
//! consumes and produces the byte streams a [`crate::Connection`]'s
//! stream API already exposes, the same boundary `tls.rs` keeps between
//! CRYPTO bytes and the handshake engine. A caller drives it by routing
//! `Event::StreamData` for the relevant stream IDs in and queuing the
//! returned bytes back out via `Connection::stream_write`.

pub mod qpack;

use crate::varint;
use thiserror::Error;

/// RFC 9114 §8.1 HTTP/3 error codes (the subset this client can raise or
/// must recognise).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Http3Error {
    #[error("buffer too short to decode an HTTP/3 value")]
    Truncated,
    #[error("frame did not consume exactly its declared length")]
    FrameEncoding,
    #[error("DATA frame received before HEADERS on a request stream")]
    FrameUnexpected,
    #[error("more than one control/QPACK stream of the same type")]
    StreamCreationError,
    #[error("control stream closed or its first frame was not SETTINGS")]
    MissingSettings,
    #[error("a setting identifier was present more than once")]
    SettingsError,
    #[error("QPACK field-section decompression failed")]
    QpackDecompressionFailed,
    #[error("generic HTTP/3 protocol violation")]
    GeneralProtocolError,
}

impl Http3Error {
    /// Maps to the RFC 9114 §8.1 error code carried in `H3_*`/`CONNECTION_CLOSE`.
    pub fn code(&self) -> u64 {
        match self {
            Http3Error::Truncated | Http3Error::FrameEncoding => 0x106, // H3_FRAME_ERROR
            Http3Error::FrameUnexpected => 0x105,                       // H3_FRAME_UNEXPECTED
            Http3Error::StreamCreationError => 0x102,                   // H3_STREAM_CREATION_ERROR
            Http3Error::MissingSettings => 0x10a,                       // H3_MISSING_SETTINGS
            Http3Error::SettingsError => 0x109,                         // H3_SETTINGS_ERROR
            Http3Error::QpackDecompressionFailed => 0x200,              // QPACK_DECOMPRESSION_FAILED
            Http3Error::GeneralProtocolError => 0x101,                  // H3_GENERAL_PROTOCOL_ERROR
        }
    }
}

/// Stream types that may open a unidirectional stream, per RFC 9114 §6.2
/// and RFC 9204 §4.2. Unknown types are valid (GREASE) and must be
/// tolerated, not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    PushStream,
    QpackEncoder,
    QpackDecoder,
    Unknown(u64),
}

impl StreamType {
    pub fn from_id(id: u64) -> Self {
        match id {
            0x00 => StreamType::Control,
            0x01 => StreamType::PushStream,
            0x02 => StreamType::QpackEncoder,
            0x03 => StreamType::QpackDecoder,
            other => StreamType::Unknown(other),
        }
    }

    pub fn id(self) -> u64 {
        match self {
            StreamType::Control => 0x00,
            StreamType::PushStream => 0x01,
            StreamType::QpackEncoder => 0x02,
            StreamType::QpackDecoder => 0x03,
            StreamType::Unknown(id) => id,
        }
    }
}

const FRAME_DATA: u64 = 0x00;
const FRAME_HEADERS: u64 = 0x01;
const FRAME_CANCEL_PUSH: u64 = 0x03;
const FRAME_SETTINGS: u64 = 0x04;
const FRAME_PUSH_PROMISE: u64 = 0x05;
const FRAME_GOAWAY: u64 = 0x07;
const FRAME_MAX_PUSH_ID: u64 = 0x0d;

pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTINGS_MAX_FIELD_SECTION_SIZE: u64 = 0x06;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;

/// The wire frame catalog of §4.14: a varint type tag, a varint length,
/// then exactly that many payload bytes — the same shape `Frame` in
/// `frame.rs` uses for QUIC frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { data: Vec<u8> },
    Headers { field_section: Vec<u8> },
    CancelPush { push_id: u64 },
    Settings { entries: Vec<(u64, u64)> },
    PushPromise { push_id: u64, field_section: Vec<u8> },
    GoAway { id: u64 },
    MaxPushId { push_id: u64 },
    /// An unrecognised frame type, carried through unparsed so a request
    /// stream can skip it (GREASE tolerance, §4.14).
    Unknown { frame_type: u64, payload: Vec<u8> },
}

impl Frame {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        let frame_type = match self {
            Frame::Data { data } => {
                payload.extend_from_slice(data);
                FRAME_DATA
            }
            Frame::Headers { field_section } => {
                payload.extend_from_slice(field_section);
                FRAME_HEADERS
            }
            Frame::CancelPush { push_id } => {
                varint::encode(*push_id, &mut payload).unwrap();
                FRAME_CANCEL_PUSH
            }
            Frame::Settings { entries } => {
                for &(id, value) in entries {
                    varint::encode(id, &mut payload).unwrap();
                    varint::encode(value, &mut payload).unwrap();
                }
                FRAME_SETTINGS
            }
            Frame::PushPromise { push_id, field_section } => {
                varint::encode(*push_id, &mut payload).unwrap();
                payload.extend_from_slice(field_section);
                FRAME_PUSH_PROMISE
            }
            Frame::GoAway { id } => {
                varint::encode(*id, &mut payload).unwrap();
                FRAME_GOAWAY
            }
            Frame::MaxPushId { push_id } => {
                varint::encode(*push_id, &mut payload).unwrap();
                FRAME_MAX_PUSH_ID
            }
            Frame::Unknown { frame_type, payload: p } => {
                payload.extend_from_slice(p);
                *frame_type
            }
        };
        varint::encode(frame_type, out).unwrap();
        varint::encode(payload.len() as u64, out).unwrap();
        out.extend_from_slice(&payload);
    }

    /// Decodes one frame from `buf` at `*pos`, advancing it. Returns
    /// `Ok(None)` if the buffer doesn't yet hold a complete frame (the
    /// caller should wait for more bytes rather than treat this as an
    /// error, since HTTP/3 frames can straddle stream-data deliveries).
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Option<Frame>, Http3Error> {
        let start = *pos;
        let mut cursor = *pos;
        let frame_type = match varint::decode_at(buf, &mut cursor) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let len = match varint::decode_at(buf, &mut cursor) {
            Ok(v) => v as usize,
            Err(_) => return Ok(None),
        };
        let Some(payload) = buf.get(cursor..cursor + len) else {
            return Ok(None);
        };
        cursor += len;
        *pos = cursor;

        let frame = match frame_type {
            FRAME_DATA => Frame::Data { data: payload.to_vec() },
            FRAME_HEADERS => Frame::Headers { field_section: payload.to_vec() },
            FRAME_CANCEL_PUSH => {
                let mut p = 0;
                Frame::CancelPush { push_id: varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)? }
            }
            FRAME_SETTINGS => {
                let mut entries = Vec::new();
                let mut p = 0;
                while p < payload.len() {
                    let id = varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)?;
                    let value = varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)?;
                    entries.push((id, value));
                }
                Frame::Settings { entries }
            }
            FRAME_PUSH_PROMISE => {
                let mut p = 0;
                let push_id = varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)?;
                Frame::PushPromise { push_id, field_section: payload[p..].to_vec() }
            }
            FRAME_GOAWAY => {
                let mut p = 0;
                Frame::GoAway { id: varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)? }
            }
            FRAME_MAX_PUSH_ID => {
                let mut p = 0;
                Frame::MaxPushId { push_id: varint::decode_at(payload, &mut p).map_err(|_| Http3Error::FrameEncoding)? }
            }
            other => Frame::Unknown { frame_type: other, payload: payload.to_vec() },
        };
        debug_assert!(*pos > start);
        Ok(Some(frame))
    }
}

/// This client's outgoing SETTINGS: dynamic-table capacity pinned to 0
/// (§4.14) and no limit on blocked streams since none can ever occur.
pub fn default_settings_frame() -> Frame {
    Frame::Settings {
        entries: vec![(SETTINGS_QPACK_MAX_TABLE_CAPACITY, 0), (SETTINGS_QPACK_BLOCKED_STREAMS, 0)],
    }
}

/// Builds the leading stream-type byte plus first frame a unidirectional
/// stream must carry when opened, per §4.14.
pub fn control_stream_preface() -> Vec<u8> {
    let mut out = Vec::new();
    varint::encode(StreamType::Control.id(), &mut out).unwrap();
    default_settings_frame().encode(&mut out);
    out
}

pub fn qpack_encoder_stream_preface() -> Vec<u8> {
    let mut out = Vec::new();
    varint::encode(StreamType::QpackEncoder.id(), &mut out).unwrap();
    out
}

pub fn qpack_decoder_stream_preface() -> Vec<u8> {
    let mut out = Vec::new();
    varint::encode(StreamType::QpackDecoder.id(), &mut out).unwrap();
    out
}

/// Encodes a full request (HEADERS, then an optional body as one DATA
/// frame) ready to be written to a freshly opened client-initiated
/// bidirectional stream, per §4.14.
pub fn encode_request(headers: &[(&str, &str)], body: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    Frame::Headers { field_section: qpack::encode_field_section(headers) }.encode(&mut out);
    if let Some(body) = body {
        Frame::Data { data: body.to_vec() }.encode(&mut out);
    }
    out
}

/// One event produced by decoding a request (or response) stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Event {
    Headers(Vec<qpack::Header>),
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStreamState {
    ExpectHeaders,
    Body,
}

/// Decodes one bidirectional request/response stream's byte sequence
/// into frame-level events, per the small state machine in §1.1:
/// HEADERS, then any number of DATA, then an optional trailing HEADERS.
pub struct RequestStreamDecoder {
    state: RequestStreamState,
    buffer: Vec<u8>,
    saw_trailers: bool,
}

impl Default for RequestStreamDecoder {
    fn default() -> Self {
        Self { state: RequestStreamState::ExpectHeaders, buffer: Vec::new(), saw_trailers: false }
    }
}

impl RequestStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly received stream bytes, returning every event the new
    /// bytes completed. Buffers any trailing partial frame internally.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<Vec<H3Event>, Http3Error> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut pos = 0usize;
        loop {
            let before = pos;
            let Some(frame) = Frame::decode(&self.buffer, &mut pos)? else {
                break;
            };
            debug_assert!(pos > before);
            match frame {
                Frame::Data { data } => {
                    if self.state != RequestStreamState::Body || self.saw_trailers {
                        return Err(Http3Error::FrameUnexpected);
                    }
                    events.push(H3Event::Data(data));
                }
                Frame::Headers { field_section } => {
                    let headers = qpack::decode_field_section(&field_section)?;
                    match self.state {
                        RequestStreamState::ExpectHeaders => {
                            self.state = RequestStreamState::Body;
                        }
                        RequestStreamState::Body => {
                            self.saw_trailers = true;
                        }
                    }
                    events.push(H3Event::Headers(headers));
                }
                // Unknown frame types are skipped on request streams (GREASE
                // tolerance, §4.14); CANCEL_PUSH/GOAWAY/MAX_PUSH_ID/PUSH_PROMISE
                // never appear on a request stream and are ignored the same way.
                _ => {}
            }
        }
        self.buffer.drain(..pos);
        Ok(events)
    }
}

/// Decodes the control stream: the very first frame must be SETTINGS
/// (§4.14); everything after is tolerated GREASE unless it's a frame
/// type forbidden on the control stream.
pub struct ControlStreamDecoder {
    buffer: Vec<u8>,
    settings_seen: bool,
    pub peer_settings: Vec<(u64, u64)>,
}

impl Default for ControlStreamDecoder {
    fn default() -> Self {
        Self { buffer: Vec::new(), settings_seen: false, peer_settings: Vec::new() }
    }
}

impl ControlStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<(), Http3Error> {
        self.buffer.extend_from_slice(bytes);
        let mut pos = 0usize;
        loop {
            let Some(frame) = Frame::decode(&self.buffer, &mut pos)? else {
                break;
            };
            match frame {
                Frame::Settings { entries } => {
                    if self.settings_seen {
                        return Err(Http3Error::FrameUnexpected);
                    }
                    let mut seen_ids = std::collections::HashSet::new();
                    for &(id, _) in &entries {
                        if !seen_ids.insert(id) {
                            return Err(Http3Error::SettingsError);
                        }
                    }
                    self.peer_settings = entries;
                    self.settings_seen = true;
                }
                Frame::GoAway { .. } | Frame::MaxPushId { .. } | Frame::CancelPush { .. } => {
                    if !self.settings_seen {
                        return Err(Http3Error::MissingSettings);
                    }
                }
                Frame::Data { .. } | Frame::Headers { .. } | Frame::PushPromise { .. } => {
                    return Err(Http3Error::FrameUnexpected);
                }
                Frame::Unknown { .. } => {
                    if !self.settings_seen {
                        return Err(Http3Error::MissingSettings);
                    }
                }
            }
        }
        self.buffer.drain(..pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_frame_round_trips() {
        let mut buf = Vec::new();
        default_settings_frame().encode(&mut buf);
        let mut pos = 0;
        let frame = Frame::decode(&buf, &mut pos).unwrap().unwrap();
        match frame {
            Frame::Settings { entries } => {
                assert!(entries.contains(&(SETTINGS_QPACK_MAX_TABLE_CAPACITY, 0)));
            }
            _ => panic!("expected SETTINGS"),
        }
    }

    #[test]
    fn request_stream_accepts_headers_then_data() {
        let request = encode_request(&[(":method", "GET"), (":path", "/")], Some(b"body"));
        let mut decoder = RequestStreamDecoder::new();
        let events = decoder.on_bytes(&request).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], H3Event::Headers(_)));
        assert_eq!(events[1], H3Event::Data(b"body".to_vec()));
    }

    #[test]
    fn data_before_headers_is_frame_unexpected() {
        let mut buf = Vec::new();
        Frame::Data { data: b"oops".to_vec() }.encode(&mut buf);
        let mut decoder = RequestStreamDecoder::new();
        assert_eq!(decoder.on_bytes(&buf), Err(Http3Error::FrameUnexpected));
    }

    #[test]
    fn unknown_frame_type_is_skipped_on_request_stream() {
        let mut buf = Vec::new();
        Frame::Headers { field_section: qpack::encode_field_section(&[(":method", "GET")]) }.encode(&mut buf);
        Frame::Unknown { frame_type: 0x21, payload: vec![1, 2, 3] }.encode(&mut buf);
        Frame::Data { data: b"x".to_vec() }.encode(&mut buf);
        let mut decoder = RequestStreamDecoder::new();
        let events = decoder.on_bytes(&buf).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn partial_frame_is_buffered_until_complete() {
        let request = encode_request(&[(":method", "GET")], None);
        let mut decoder = RequestStreamDecoder::new();
        let (head, tail) = request.split_at(request.len() - 2);
        assert!(decoder.on_bytes(head).unwrap().is_empty());
        let events = decoder.on_bytes(tail).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn control_stream_requires_settings_first() {
        let mut buf = Vec::new();
        Frame::GoAway { id: 0 }.encode(&mut buf);
        let mut decoder = ControlStreamDecoder::new();
        assert_eq!(decoder.on_bytes(&buf), Err(Http3Error::MissingSettings));
    }

    #[test]
    fn control_stream_rejects_request_frames() {
        let mut buf = Vec::new();
        default_settings_frame().encode(&mut buf);
        Frame::Data { data: vec![1] }.encode(&mut buf);
        let mut decoder = ControlStreamDecoder::new();
        assert_eq!(decoder.on_bytes(&buf), Err(Http3Error::FrameUnexpected));
    }
}
