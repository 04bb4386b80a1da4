//! Frame codec (C5): the full RFC 9000 frame set, plus DATAGRAM (RFC 9221).
//!
//! Every frame parses from and serialises to exactly its encoded length;
//! a short trailing read is a [`WireError::FrameEncoding`], which the
//! caller turns into `FRAME_ENCODING_ERROR` (§7a). [`EncryptionLevel`] and
//! [`Frame::allowed_at`] enforce the per-level restriction from §4.5.

use crate::error::WireError;
use crate::varint;

/// The four contexts frame permissions are checked against. Distinct from
/// [`crate::crypto::Level`], which only tracks key material (0-RTT and
/// 1-RTT share Application keys but have different frame permissions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Padding { length: usize },
    Ping,
    Ack { largest_ack: u64, ack_delay: u64, ranges: Vec<(u64, u64)>, ecn: Option<EcnCounts> },
    ResetStream { stream_id: u64, error_code: u64, final_size: u64 },
    StopSending { stream_id: u64, error_code: u64 },
    Crypto { offset: u64, data: Vec<u8> },
    NewToken { token: Vec<u8> },
    Stream { stream_id: u64, offset: u64, data: Vec<u8>, fin: bool },
    MaxData { max: u64 },
    MaxStreamData { stream_id: u64, max: u64 },
    MaxStreamsBidi { max: u64 },
    MaxStreamsUni { max: u64 },
    DataBlocked { limit: u64 },
    StreamDataBlocked { stream_id: u64, limit: u64 },
    StreamsBlockedBidi { limit: u64 },
    StreamsBlockedUni { limit: u64 },
    NewConnectionId { seq: u64, retire_prior_to: u64, cid: Vec<u8>, stateless_reset_token: [u8; 16] },
    RetireConnectionId { seq: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse { data: [u8; 8] },
    ConnectionCloseTransport { error_code: u64, frame_type: u64, reason: String },
    ConnectionCloseApp { error_code: u64, reason: String },
    HandshakeDone,
    Datagram { data: Vec<u8> },
}

const TYPE_PADDING: u64 = 0x00;
const TYPE_PING: u64 = 0x01;
const TYPE_ACK: u64 = 0x02;
const TYPE_ACK_ECN: u64 = 0x03;
const TYPE_RESET_STREAM: u64 = 0x04;
const TYPE_STOP_SENDING: u64 = 0x05;
const TYPE_CRYPTO: u64 = 0x06;
const TYPE_NEW_TOKEN: u64 = 0x07;
const TYPE_STREAM_BASE: u64 = 0x08; // 0x08..=0x0f, low 3 bits OFF/LEN/FIN
const TYPE_MAX_DATA: u64 = 0x10;
const TYPE_MAX_STREAM_DATA: u64 = 0x11;
const TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
const TYPE_MAX_STREAMS_UNI: u64 = 0x13;
const TYPE_DATA_BLOCKED: u64 = 0x14;
const TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
const TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
const TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;
const TYPE_NEW_CONNECTION_ID: u64 = 0x18;
const TYPE_RETIRE_CONNECTION_ID: u64 = 0x19;
const TYPE_PATH_CHALLENGE: u64 = 0x1a;
const TYPE_PATH_RESPONSE: u64 = 0x1b;
const TYPE_CONNECTION_CLOSE_TRANSPORT: u64 = 0x1c;
const TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
const TYPE_HANDSHAKE_DONE: u64 = 0x1e;
const TYPE_DATAGRAM_NO_LEN: u64 = 0x30;
const TYPE_DATAGRAM_LEN: u64 = 0x31;

impl Frame {
    /// §4.5 / §7c: the allowed-per-level table.
    pub fn allowed_at(&self, level: EncryptionLevel) -> bool {
        use EncryptionLevel::*;
        match level {
            Initial | Handshake => matches!(
                self,
                Frame::Crypto { .. } | Frame::Ack { .. } | Frame::Padding { .. } | Frame::Ping
                    | Frame::ConnectionCloseTransport { .. }
            ),
            ZeroRtt => !matches!(self, Frame::PathResponse { .. } | Frame::NewToken { .. } | Frame::Ack { .. } | Frame::ConnectionCloseApp { .. } | Frame::HandshakeDone),
            OneRtt => true,
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack { .. } | Frame::Padding { .. } | Frame::ConnectionCloseTransport { .. } | Frame::ConnectionCloseApp { .. })
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            Frame::Padding { length } => {
                out.resize(out.len() + length, 0);
            }
            Frame::Ping => varint::encode(TYPE_PING, out)?,
            Frame::Ack { largest_ack, ack_delay, ranges, ecn } => {
                varint::encode(if ecn.is_some() { TYPE_ACK_ECN } else { TYPE_ACK }, out)?;
                encode_ack_payload(*largest_ack, *ack_delay, ranges, out)?;
                if let Some(ecn) = ecn {
                    varint::encode(ecn.ect0, out)?;
                    varint::encode(ecn.ect1, out)?;
                    varint::encode(ecn.ce, out)?;
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                varint::encode(TYPE_RESET_STREAM, out)?;
                varint::encode(*stream_id, out)?;
                varint::encode(*error_code, out)?;
                varint::encode(*final_size, out)?;
            }
            Frame::StopSending { stream_id, error_code } => {
                varint::encode(TYPE_STOP_SENDING, out)?;
                varint::encode(*stream_id, out)?;
                varint::encode(*error_code, out)?;
            }
            Frame::Crypto { offset, data } => {
                varint::encode(TYPE_CRYPTO, out)?;
                varint::encode(*offset, out)?;
                varint::encode(data.len() as u64, out)?;
                out.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                varint::encode(TYPE_NEW_TOKEN, out)?;
                varint::encode(token.len() as u64, out)?;
                out.extend_from_slice(token);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let mut ty = TYPE_STREAM_BASE | 0x04 /* OFF */ | 0x02 /* LEN */;
                if *fin {
                    ty |= 0x01;
                }
                varint::encode(ty, out)?;
                varint::encode(*stream_id, out)?;
                varint::encode(*offset, out)?;
                varint::encode(data.len() as u64, out)?;
                out.extend_from_slice(data);
            }
            Frame::MaxData { max } => {
                varint::encode(TYPE_MAX_DATA, out)?;
                varint::encode(*max, out)?;
            }
            Frame::MaxStreamData { stream_id, max } => {
                varint::encode(TYPE_MAX_STREAM_DATA, out)?;
                varint::encode(*stream_id, out)?;
                varint::encode(*max, out)?;
            }
            Frame::MaxStreamsBidi { max } => {
                varint::encode(TYPE_MAX_STREAMS_BIDI, out)?;
                varint::encode(*max, out)?;
            }
            Frame::MaxStreamsUni { max } => {
                varint::encode(TYPE_MAX_STREAMS_UNI, out)?;
                varint::encode(*max, out)?;
            }
            Frame::DataBlocked { limit } => {
                varint::encode(TYPE_DATA_BLOCKED, out)?;
                varint::encode(*limit, out)?;
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                varint::encode(TYPE_STREAM_DATA_BLOCKED, out)?;
                varint::encode(*stream_id, out)?;
                varint::encode(*limit, out)?;
            }
            Frame::StreamsBlockedBidi { limit } => {
                varint::encode(TYPE_STREAMS_BLOCKED_BIDI, out)?;
                varint::encode(*limit, out)?;
            }
            Frame::StreamsBlockedUni { limit } => {
                varint::encode(TYPE_STREAMS_BLOCKED_UNI, out)?;
                varint::encode(*limit, out)?;
            }
            Frame::NewConnectionId { seq, retire_prior_to, cid, stateless_reset_token } => {
                varint::encode(TYPE_NEW_CONNECTION_ID, out)?;
                varint::encode(*seq, out)?;
                varint::encode(*retire_prior_to, out)?;
                out.push(cid.len() as u8);
                out.extend_from_slice(cid);
                out.extend_from_slice(stateless_reset_token);
            }
            Frame::RetireConnectionId { seq } => {
                varint::encode(TYPE_RETIRE_CONNECTION_ID, out)?;
                varint::encode(*seq, out)?;
            }
            Frame::PathChallenge { data } => {
                varint::encode(TYPE_PATH_CHALLENGE, out)?;
                out.extend_from_slice(data);
            }
            Frame::PathResponse { data } => {
                varint::encode(TYPE_PATH_RESPONSE, out)?;
                out.extend_from_slice(data);
            }
            Frame::ConnectionCloseTransport { error_code, frame_type, reason } => {
                varint::encode(TYPE_CONNECTION_CLOSE_TRANSPORT, out)?;
                varint::encode(*error_code, out)?;
                varint::encode(*frame_type, out)?;
                varint::encode(reason.len() as u64, out)?;
                out.extend_from_slice(reason.as_bytes());
            }
            Frame::ConnectionCloseApp { error_code, reason } => {
                varint::encode(TYPE_CONNECTION_CLOSE_APP, out)?;
                varint::encode(*error_code, out)?;
                varint::encode(reason.len() as u64, out)?;
                out.extend_from_slice(reason.as_bytes());
            }
            Frame::HandshakeDone => varint::encode(TYPE_HANDSHAKE_DONE, out)?,
            Frame::Datagram { data } => {
                varint::encode(TYPE_DATAGRAM_LEN, out)?;
                varint::encode(data.len() as u64, out)?;
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }

    /// Decodes one frame from `buf` starting at `*pos`, advancing it past
    /// exactly the bytes consumed.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Frame, WireError> {
        let start = *pos;
        let ty = varint::decode_at(buf, pos)?;
        match ty {
            TYPE_PADDING => {
                let mut len = 1;
                while buf.get(*pos).copied() == Some(0) {
                    *pos += 1;
                    len += 1;
                }
                Ok(Frame::Padding { length: len })
            }
            TYPE_PING => Ok(Frame::Ping),
            TYPE_ACK | TYPE_ACK_ECN => {
                let (largest_ack, ack_delay, ranges) = decode_ack_payload(buf, pos)?;
                let ecn = if ty == TYPE_ACK_ECN {
                    Some(EcnCounts {
                        ect0: varint::decode_at(buf, pos)?,
                        ect1: varint::decode_at(buf, pos)?,
                        ce: varint::decode_at(buf, pos)?,
                    })
                } else {
                    None
                };
                Ok(Frame::Ack { largest_ack, ack_delay, ranges, ecn })
            }
            TYPE_RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: varint::decode_at(buf, pos)?,
                error_code: varint::decode_at(buf, pos)?,
                final_size: varint::decode_at(buf, pos)?,
            }),
            TYPE_STOP_SENDING => Ok(Frame::StopSending {
                stream_id: varint::decode_at(buf, pos)?,
                error_code: varint::decode_at(buf, pos)?,
            }),
            TYPE_CRYPTO => {
                let offset = varint::decode_at(buf, pos)?;
                let len = varint::decode_at(buf, pos)? as usize;
                let data = take(buf, pos, len)?;
                Ok(Frame::Crypto { offset, data })
            }
            TYPE_NEW_TOKEN => {
                let len = varint::decode_at(buf, pos)? as usize;
                Ok(Frame::NewToken { token: take(buf, pos, len)? })
            }
            t if (TYPE_STREAM_BASE..=TYPE_STREAM_BASE + 0x07).contains(&t) => {
                let off_bit = t & 0x04 != 0;
                let len_bit = t & 0x02 != 0;
                let fin = t & 0x01 != 0;
                let stream_id = varint::decode_at(buf, pos)?;
                let offset = if off_bit { varint::decode_at(buf, pos)? } else { 0 };
                let data = if len_bit {
                    let len = varint::decode_at(buf, pos)? as usize;
                    take(buf, pos, len)?
                } else {
                    let rest = buf.get(*pos..).ok_or(WireError::ShortBuffer)?.to_vec();
                    *pos = buf.len();
                    rest
                };
                Ok(Frame::Stream { stream_id, offset, data, fin })
            }
            TYPE_MAX_DATA => Ok(Frame::MaxData { max: varint::decode_at(buf, pos)? }),
            TYPE_MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: varint::decode_at(buf, pos)?,
                max: varint::decode_at(buf, pos)?,
            }),
            TYPE_MAX_STREAMS_BIDI => Ok(Frame::MaxStreamsBidi { max: varint::decode_at(buf, pos)? }),
            TYPE_MAX_STREAMS_UNI => Ok(Frame::MaxStreamsUni { max: varint::decode_at(buf, pos)? }),
            TYPE_DATA_BLOCKED => Ok(Frame::DataBlocked { limit: varint::decode_at(buf, pos)? }),
            TYPE_STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: varint::decode_at(buf, pos)?,
                limit: varint::decode_at(buf, pos)?,
            }),
            TYPE_STREAMS_BLOCKED_BIDI => Ok(Frame::StreamsBlockedBidi { limit: varint::decode_at(buf, pos)? }),
            TYPE_STREAMS_BLOCKED_UNI => Ok(Frame::StreamsBlockedUni { limit: varint::decode_at(buf, pos)? }),
            TYPE_NEW_CONNECTION_ID => {
                let seq = varint::decode_at(buf, pos)?;
                let retire_prior_to = varint::decode_at(buf, pos)?;
                let cid_len = *buf.get(*pos).ok_or(WireError::ShortBuffer)? as usize;
                *pos += 1;
                let cid = take(buf, pos, cid_len)?;
                let token_bytes = take(buf, pos, 16)?;
                let mut stateless_reset_token = [0u8; 16];
                stateless_reset_token.copy_from_slice(&token_bytes);
                Ok(Frame::NewConnectionId { seq, retire_prior_to, cid, stateless_reset_token })
            }
            TYPE_RETIRE_CONNECTION_ID => {
                Ok(Frame::RetireConnectionId { seq: varint::decode_at(buf, pos)? })
            }
            TYPE_PATH_CHALLENGE => {
                let bytes = take(buf, pos, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&bytes);
                Ok(Frame::PathChallenge { data })
            }
            TYPE_PATH_RESPONSE => {
                let bytes = take(buf, pos, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&bytes);
                Ok(Frame::PathResponse { data })
            }
            TYPE_CONNECTION_CLOSE_TRANSPORT => {
                let error_code = varint::decode_at(buf, pos)?;
                let frame_type = varint::decode_at(buf, pos)?;
                let len = varint::decode_at(buf, pos)? as usize;
                let bytes = take(buf, pos, len)?;
                let reason = String::from_utf8_lossy(&bytes).into_owned();
                Ok(Frame::ConnectionCloseTransport { error_code, frame_type, reason })
            }
            TYPE_CONNECTION_CLOSE_APP => {
                let error_code = varint::decode_at(buf, pos)?;
                let len = varint::decode_at(buf, pos)? as usize;
                let bytes = take(buf, pos, len)?;
                let reason = String::from_utf8_lossy(&bytes).into_owned();
                Ok(Frame::ConnectionCloseApp { error_code, reason })
            }
            TYPE_HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            TYPE_DATAGRAM_NO_LEN => {
                let rest = buf.get(*pos..).ok_or(WireError::ShortBuffer)?.to_vec();
                *pos = buf.len();
                Ok(Frame::Datagram { data: rest })
            }
            TYPE_DATAGRAM_LEN => {
                let len = varint::decode_at(buf, pos)? as usize;
                Ok(Frame::Datagram { data: take(buf, pos, len)? })
            }
            other => {
                *pos = start;
                Err(WireError::UnknownFrame(other))
            }
        }
    }
}

fn take(buf: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>, WireError> {
    let slice = buf.get(*pos..*pos + len).ok_or(WireError::ShortBuffer)?;
    *pos += len;
    Ok(slice.to_vec())
}

fn encode_ack_payload(largest_ack: u64, ack_delay: u64, ranges: &[(u64, u64)], out: &mut Vec<u8>) -> Result<(), WireError> {
    varint::encode(largest_ack, out)?;
    varint::encode(ack_delay, out)?;
    varint::encode((ranges.len() - 1) as u64, out)?;
    // First range is implicit: largest_ack - first_ack_range == smallest of
    // the first (highest) range.
    let (first_low, first_high) = ranges[0];
    varint::encode(first_high - first_low, out)?;
    let mut prev_low = first_low;
    for &(low, high) in &ranges[1..] {
        let gap = prev_low - high - 2;
        varint::encode(gap, out)?;
        varint::encode(high - low, out)?;
        prev_low = low;
    }
    Ok(())
}

/// Returns `(largest_ack, ack_delay, ranges)` where `ranges` is a list of
/// `(low, high)` inclusive packet-number ranges, highest range first.
fn decode_ack_payload(buf: &[u8], pos: &mut usize) -> Result<(u64, u64, Vec<(u64, u64)>), WireError> {
    let largest_ack = varint::decode_at(buf, pos)?;
    let ack_delay = varint::decode_at(buf, pos)?;
    let range_count = varint::decode_at(buf, pos)?;
    let first_ack_range = varint::decode_at(buf, pos)?;
    let mut ranges = Vec::with_capacity(range_count as usize + 1);
    let mut high = largest_ack;
    let low = high
        .checked_sub(first_ack_range)
        .ok_or(WireError::ProtocolViolation("ack range underflows packet number"))?;
    ranges.push((low, high));
    let mut next_high_bound = low;
    for _ in 0..range_count {
        let gap = varint::decode_at(buf, pos)?;
        let ack_range_len = varint::decode_at(buf, pos)?;
        high = next_high_bound
            .checked_sub(gap + 2)
            .ok_or(WireError::ProtocolViolation("ack gap underflows packet number"))?;
        let low = high
            .checked_sub(ack_range_len)
            .ok_or(WireError::ProtocolViolation("ack range underflows packet number"))?;
        ranges.push((low, high));
        next_high_bound = low;
    }
    Ok((largest_ack, ack_delay, ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        let mut pos = 0;
        let decoded = Frame::decode(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len(), "frame did not consume exactly its bytes");
        decoded
    }

    #[test]
    fn stream_frame_round_trips() {
        let f = Frame::Stream { stream_id: 4, offset: 100, data: vec![1, 2, 3, 4], fin: true };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn ack_frame_with_single_range_round_trips() {
        let f = Frame::Ack { largest_ack: 100, ack_delay: 25, ranges: vec![(90, 100)], ecn: None };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn ack_frame_with_multiple_ranges_and_ecn_round_trips() {
        let f = Frame::Ack {
            largest_ack: 1000,
            ack_delay: 5,
            ranges: vec![(950, 1000), (900, 920), (0, 10)],
            ecn: Some(EcnCounts { ect0: 3, ect1: 0, ce: 1 }),
        };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn connection_close_transport_round_trips() {
        let f = Frame::ConnectionCloseTransport { error_code: 0x0a, frame_type: 0x06, reason: "bad crypto".into() };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn new_connection_id_round_trips() {
        let f = Frame::NewConnectionId {
            seq: 3,
            retire_prior_to: 1,
            cid: vec![9, 9, 9, 9],
            stateless_reset_token: [7u8; 16],
        };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn datagram_round_trips() {
        let f = Frame::Datagram { data: b"unreliable payload".to_vec() };
        assert_eq!(round_trip(f.clone()), f);
    }

    #[test]
    fn short_trailing_read_is_frame_encoding_error() {
        let mut buf = Vec::new();
        Frame::Crypto { offset: 0, data: vec![1, 2, 3] }.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let mut pos = 0;
        assert!(Frame::decode(&buf, &mut pos).is_err());
    }

    #[test]
    fn per_level_restrictions_match_rfc9000_table() {
        let crypto = Frame::Crypto { offset: 0, data: vec![] };
        assert!(crypto.allowed_at(EncryptionLevel::Initial));
        assert!(crypto.allowed_at(EncryptionLevel::Handshake));

        let stream = Frame::Stream { stream_id: 0, offset: 0, data: vec![], fin: false };
        assert!(!stream.allowed_at(EncryptionLevel::Initial));
        assert!(stream.allowed_at(EncryptionLevel::OneRtt));

        let path_response = Frame::PathResponse { data: [0; 8] };
        assert!(!path_response.allowed_at(EncryptionLevel::ZeroRtt));
        assert!(path_response.allowed_at(EncryptionLevel::OneRtt));

        let new_token = Frame::NewToken { token: vec![] };
        assert!(!new_token.allowed_at(EncryptionLevel::ZeroRtt));
    }

    proptest::proptest! {
        #[test]
        fn prop_padding_round_trips(len in 1usize..200) {
            let f = Frame::Padding { length: len };
            let mut buf = Vec::new();
            f.encode(&mut buf).unwrap();
            proptest::prop_assert_eq!(buf.len(), len);
            let mut pos = 0;
            let decoded = Frame::decode(&buf, &mut pos).unwrap();
            proptest::prop_assert_eq!(decoded, Frame::Padding { length: len });
        }
    }
}
