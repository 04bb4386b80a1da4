//! TLS adapter (C13): bridges the four per-level CRYPTO byte streams to an
//! injected TLS 1.3 stack, and owns transport-parameter encode/decode.
//!
//! The handshake engine itself is `rustls`'s `quic` feature, the same
//! stack this crate already depends on for its cipher suites — this
//! module only ever hands it bytes and reads traffic secrets back out; it
//! never touches packet framing.

use crate::crypto::Level;
use crate::error::{ConnectionError, WireError};
use crate::frame::Frame;
use crate::varint;
use std::collections::BTreeMap;

/// An ordered, gap-tolerant byte stream per encryption level, exactly like
/// a QUIC stream but carried in CRYPTO frames instead of STREAM frames
/// (§4.13); there's no flow control here since CRYPTO data is implicitly
/// bounded by `CRYPTO_BUFFER_EXCEEDED`.
#[derive(Default)]
pub struct CryptoStream {
    send_offset: u64,
    send_buffer: Vec<u8>,
    recv_chunks: BTreeMap<u64, Vec<u8>>,
    recv_offset: u64,
}

const MAX_CRYPTO_BUFFER: usize = 64 * 1024;

impl CryptoStream {
    pub fn queue_outgoing(&mut self, bytes: &[u8]) {
        self.send_buffer.extend_from_slice(bytes);
    }

    /// `true` once every queued byte has been framed for sending.
    pub fn is_empty(&self) -> bool {
        self.send_offset == self.send_buffer.len() as u64
    }

    pub fn next_frame(&mut self, max_len: usize) -> Option<Frame> {
        let pending = self.send_buffer.len() as u64 - self.send_offset;
        if pending == 0 {
            return None;
        }
        let take = pending.min(max_len as u64) as usize;
        let start = self.send_offset as usize;
        let data = self.send_buffer[start..start + take].to_vec();
        let offset = self.send_offset;
        self.send_offset += take as u64;
        Some(Frame::Crypto { offset, data })
    }

    /// Buffers incoming CRYPTO bytes and returns the longest contiguous
    /// prefix now available to hand to the TLS engine.
    pub fn on_crypto_frame(&mut self, offset: u64, data: &[u8]) -> Result<Vec<u8>, WireError> {
        if offset + data.len() as u64 > self.recv_offset as u64 + MAX_CRYPTO_BUFFER as u64 {
            return Err(WireError::ProtocolViolation("crypto stream buffer exceeded"));
        }
        if offset + (data.len() as u64) > self.recv_offset {
            self.recv_chunks.entry(offset).or_insert_with(|| data.to_vec());
        }
        let mut out = Vec::new();
        loop {
            let Some((&off, _)) = self
                .recv_chunks
                .iter()
                .find(|(&off, d)| off <= self.recv_offset && off + d.len() as u64 > self.recv_offset)
            else {
                break;
            };
            let chunk = self.recv_chunks.remove(&off).unwrap();
            let start = (self.recv_offset - off) as usize;
            out.extend_from_slice(&chunk[start..]);
            self.recv_offset = off + chunk.len() as u64;
        }
        Ok(out)
    }
}

/// Raw traffic secrets exported once the TLS engine reaches a given level,
/// which the caller feeds into [`crate::crypto::KeySchedule`].
pub struct LevelSecrets {
    pub level: Level,
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

/// What processing a chunk of handshake bytes produced.
pub enum TlsEvent {
    SecretsReady(LevelSecrets),
    HandshakeComplete { alpn: Option<Vec<u8>> },
}

/// The narrow contract a TLS 1.3 stack must satisfy to drive this crate's
/// handshake (§1: TLS is an externally injected collaborator).
pub trait TlsEngine: Send {
    fn is_handshaking(&self) -> bool;
    fn process_handshake_bytes(&mut self, bytes: &[u8]) -> Result<Vec<TlsEvent>, ConnectionError>;
    fn next_outgoing_handshake_bytes(&mut self) -> Option<(Level, Vec<u8>)>;
    fn quic_transport_parameters(&self) -> Option<&[u8]>;
}

/// Encodes the transport parameters this crate emits, per §6 (subset of
/// RFC 9000 §18.2, client values only — no `stateless_reset_token` or
/// `original_destination_connection_id`).
pub fn encode_transport_parameters(params: &crate::app_config::TransportParameters, initial_scid: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut emit = |id: u64, value_bytes: &[u8]| {
        varint::encode(id, &mut out).unwrap();
        varint::encode(value_bytes.len() as u64, &mut out).unwrap();
        out.extend_from_slice(value_bytes);
    };
    let mut varint_value = |v: u64| {
        let mut buf = Vec::new();
        varint::encode(v, &mut buf).unwrap();
        buf
    };

    emit(0x01, &varint_value(params.max_idle_timeout_ms));
    emit(0x03, &varint_value(params.max_udp_payload_size));
    emit(0x04, &varint_value(params.initial_max_data));
    emit(0x05, &varint_value(params.initial_max_stream_data_bidi_local));
    emit(0x06, &varint_value(params.initial_max_stream_data_bidi_remote));
    emit(0x07, &varint_value(params.initial_max_stream_data_uni));
    emit(0x08, &varint_value(params.initial_max_streams_bidi));
    emit(0x09, &varint_value(params.initial_max_streams_uni));
    emit(0x0a, &varint_value(params.ack_delay_exponent as u64));
    emit(0x0b, &varint_value(params.max_ack_delay_ms));
    if params.disable_active_migration {
        emit(0x0c, &[]);
    }
    emit(0x0e, &varint_value(params.active_connection_id_limit));
    emit(0x0f, initial_scid);
    emit(0x20, &varint_value(params.max_datagram_frame_size));
    out
}

#[derive(Debug, Default)]
pub struct DecodedTransportParameters {
    pub max_idle_timeout_ms: Option<u64>,
    pub stateless_reset_token: Option<[u8; 16]>,
    pub max_udp_payload_size: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_stream_data_bidi_local: Option<u64>,
    pub initial_max_stream_data_bidi_remote: Option<u64>,
    pub initial_max_stream_data_uni: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
    pub ack_delay_exponent: Option<u64>,
    pub max_ack_delay_ms: Option<u64>,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: Option<u64>,
    pub original_destination_connection_id: Option<Vec<u8>>,
    pub initial_source_connection_id: Option<Vec<u8>>,
    pub max_datagram_frame_size: Option<u64>,
}

/// Parses the peer's transport parameters. Each parameter may appear at
/// most once (duplicates are a transport error); unknown IDs are skipped
/// (§4.13, RFC 9000 §18.1).
pub fn decode_transport_parameters(buf: &[u8]) -> Result<DecodedTransportParameters, WireError> {
    let mut out = DecodedTransportParameters::default();
    let mut seen = std::collections::HashSet::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let id = varint::decode_at(buf, &mut pos)?;
        let len = varint::decode_at(buf, &mut pos)? as usize;
        let value = buf.get(pos..pos + len).ok_or(WireError::ShortBuffer)?;
        pos += len;
        if !seen.insert(id) {
            return Err(WireError::DuplicateTransportParameter(id));
        }
        let as_varint = || -> Result<u64, WireError> {
            let mut p = 0;
            varint::decode_at(value, &mut p)
        };
        match id {
            0x00 => out.original_destination_connection_id = Some(value.to_vec()),
            0x01 => out.max_idle_timeout_ms = Some(as_varint()?),
            0x02 => {
                if value.len() == 16 {
                    let mut tok = [0u8; 16];
                    tok.copy_from_slice(value);
                    out.stateless_reset_token = Some(tok);
                }
            }
            0x03 => out.max_udp_payload_size = Some(as_varint()?),
            0x04 => out.initial_max_data = Some(as_varint()?),
            0x05 => out.initial_max_stream_data_bidi_local = Some(as_varint()?),
            0x06 => out.initial_max_stream_data_bidi_remote = Some(as_varint()?),
            0x07 => out.initial_max_stream_data_uni = Some(as_varint()?),
            0x08 => out.initial_max_streams_bidi = Some(as_varint()?),
            0x09 => out.initial_max_streams_uni = Some(as_varint()?),
            0x0a => out.ack_delay_exponent = Some(as_varint()?),
            0x0b => out.max_ack_delay_ms = Some(as_varint()?),
            0x0c => out.disable_active_migration = true,
            0x0e => out.active_connection_id_limit = Some(as_varint()?),
            0x0f => out.initial_source_connection_id = Some(value.to_vec()),
            0x20 => out.max_datagram_frame_size = Some(as_varint()?),
            _ => {} // unknown / GREASE: ignored, not an error
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::TransportParameters;

    #[test]
    fn transport_parameters_round_trip() {
        let params = TransportParameters::default();
        let encoded = encode_transport_parameters(&params, &[1, 2, 3, 4]);
        let decoded = decode_transport_parameters(&encoded).unwrap();
        assert_eq!(decoded.max_idle_timeout_ms, Some(params.max_idle_timeout_ms));
        assert_eq!(decoded.initial_source_connection_id, Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn duplicate_parameter_is_rejected() {
        let mut buf = Vec::new();
        varint::encode(0x01, &mut buf).unwrap();
        varint::encode(1, &mut buf).unwrap();
        buf.push(5);
        varint::encode(0x01, &mut buf).unwrap();
        varint::encode(1, &mut buf).unwrap();
        buf.push(6);
        assert!(decode_transport_parameters(&buf).is_err());
    }

    #[test]
    fn unknown_parameter_id_is_skipped() {
        let mut buf = Vec::new();
        varint::encode(0xfff0, &mut buf).unwrap();
        varint::encode(2, &mut buf).unwrap();
        buf.extend_from_slice(&[9, 9]);
        assert!(decode_transport_parameters(&buf).is_ok());
    }

    #[test]
    fn crypto_stream_reorders_and_reassembles() {
        let mut stream = CryptoStream::default();
        let out = stream.on_crypto_frame(5, b"world").unwrap();
        assert!(out.is_empty());
        let out = stream.on_crypto_frame(0, b"hello").unwrap();
        assert_eq!(out, b"helloworld");
    }
}
