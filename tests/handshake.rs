//! End-to-end exercise of the client connection state machine against a
//! hand-built peer: since this crate is explicitly client-only (§1
//! Non-goals exclude server-side QUIC), there is no server-role
//! `Connection` to pair with. Instead these tests play the server's part
//! directly at the wire level, using the same packet/frame codec and key
//! schedule the client itself uses, and a scripted [`FakeTlsEngine`]
//! standing in for the real TLS 1.3 stack (an externally injected
//! collaborator per §1, never implemented inside this crate).

use quicfuscate_core::connection::{Config, Connection, ConnectionState};
use quicfuscate_core::crypto::keys::Level as KeyLevel;
use quicfuscate_core::crypto::{AeadAlgorithm, KeySchedule, Version};
use quicfuscate_core::error::ConnectionError;
use quicfuscate_core::events::Event;
use quicfuscate_core::frame::Frame;
use quicfuscate_core::packet::{self, ConnectionId, LongHeaderFields, LongPacketType};
use quicfuscate_core::stream::Direction;
use quicfuscate_core::tls::{LevelSecrets, TlsEngine, TlsEvent};
use std::net::SocketAddr;
use std::time::Instant;

/// A scripted TLS stand-in: on receiving the first (arbitrary) handshake
/// bytes, it hands back Handshake and Application secrets plus a
/// handshake-complete signal, all in one shot — enough to drive
/// `Connection`'s state machine without a real TLS 1.3 implementation.
struct FakeTlsEngine {
    queued: Vec<(KeyLevel, Vec<u8>)>,
    done: bool,
}

impl FakeTlsEngine {
    fn new() -> Self {
        Self { queued: vec![(KeyLevel::Initial, b"client-hello".to_vec())], done: false }
    }
}

impl TlsEngine for FakeTlsEngine {
    fn is_handshaking(&self) -> bool {
        !self.done
    }

    fn process_handshake_bytes(&mut self, bytes: &[u8]) -> Result<Vec<TlsEvent>, ConnectionError> {
        if bytes.is_empty() || self.done {
            return Ok(Vec::new());
        }
        self.done = true;
        Ok(vec![
            TlsEvent::SecretsReady(LevelSecrets {
                level: KeyLevel::Handshake,
                client: vec![0x11; 32],
                server: vec![0x22; 32],
            }),
            TlsEvent::SecretsReady(LevelSecrets {
                level: KeyLevel::Application,
                client: vec![0x33; 32],
                server: vec![0x44; 32],
            }),
            TlsEvent::HandshakeComplete { alpn: Some(b"h3".to_vec()) },
        ])
    }

    fn next_outgoing_handshake_bytes(&mut self) -> Option<(KeyLevel, Vec<u8>)> {
        self.queued.pop()
    }

    fn quic_transport_parameters(&self) -> Option<&[u8]> {
        None
    }
}

/// Pulls the cleartext Destination Connection ID out of a long-header
/// packet (RFC 9000 §17.2 — connection IDs are never protected).
fn dcid_from_long_header(packet: &[u8]) -> Vec<u8> {
    let dcid_len = packet[5] as usize;
    packet[6..6 + dcid_len].to_vec()
}

fn test_addrs() -> (SocketAddr, SocketAddr) {
    ("127.0.0.1:4433".parse().unwrap(), "127.0.0.1:4434".parse().unwrap())
}

fn connect_client() -> Connection {
    let (local, remote) = test_addrs();
    Connection::connect(Config::new("example.test"), local, remote, Box::new(FakeTlsEngine::new()), Instant::now())
        .unwrap()
}

#[test]
fn initial_packet_is_padded_to_minimum_size() {
    let mut conn = connect_client();
    let packets = conn.poll_transmit(Instant::now());
    assert!(!packets.is_empty());
    assert!(packets[0].len() >= packet::MIN_INITIAL_SIZE);
}

#[test]
fn handshake_completes_on_first_crypto_frame_from_peer() {
    let mut conn = connect_client();
    let initial_packets = conn.poll_transmit(Instant::now());
    let dcid_bytes = dcid_from_long_header(&initial_packets[0]);

    let mut server_keys = KeySchedule::new(Version::V1, AeadAlgorithm::Aes128Gcm);
    server_keys.install_initial(&dcid_bytes).unwrap();

    let mut payload = Vec::new();
    Frame::Crypto { offset: 0, data: b"server-hello".to_vec() }.encode(&mut payload).unwrap();
    if payload.len() < packet::MIN_INITIAL_SIZE {
        let pad = packet::MIN_INITIAL_SIZE - payload.len();
        Frame::Padding { length: pad }.encode(&mut payload).unwrap();
        payload.resize(packet::MIN_INITIAL_SIZE, 0);
    }

    let fields = LongHeaderFields {
        packet_type: LongPacketType::Initial,
        version: Version::V1.wire(),
        dcid: ConnectionId::new(&dcid_bytes).unwrap(),
        scid: ConnectionId::new(&[0xaa; 8]).unwrap(),
        token: Vec::new(),
    };
    let initial = server_keys.level(KeyLevel::Initial).unwrap();
    let server_packet = packet::encode_long(&fields, 0, None, &payload, &initial.server).unwrap();

    assert_eq!(conn.state(), ConnectionState::Handshaking);
    conn.on_datagram_received(&server_packet, Instant::now()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    let events = conn.events();
    let mut saw_handshake_complete = false;
    while let Some(event) = events.poll() {
        if let Event::HandshakeComplete { alpn } = event {
            assert_eq!(alpn, b"h3".to_vec());
            saw_handshake_complete = true;
        }
    }
    assert!(saw_handshake_complete);
}

#[test]
fn stream_write_and_read_round_trip_locally() {
    let mut conn = connect_client();
    let id = conn.open_stream(Direction::Bidi).unwrap();
    conn.stream_write(id, b"GET / HTTP/3", true).unwrap();
    // Nothing has been acked yet; a fresh write is still queued for send,
    // so a local read sees nothing (reads observe *received* data, never
    // a stream's own unsent outbound buffer).
    let (data, fin) = conn.stream_read(id).unwrap();
    assert!(data.is_empty());
    assert!(!fin);
}

#[test]
fn key_update_flips_phase_and_is_refused_before_the_handshake_completes() {
    let mut conn = connect_client();
    assert!(matches!(conn.initiate_key_update(Instant::now()), Err(ConnectionError::Closed)));

    let initial_packets = conn.poll_transmit(Instant::now());
    let dcid_bytes = dcid_from_long_header(&initial_packets[0]);
    let mut server_keys = KeySchedule::new(Version::V1, AeadAlgorithm::Aes128Gcm);
    server_keys.install_initial(&dcid_bytes).unwrap();
    let mut payload = Vec::new();
    Frame::Crypto { offset: 0, data: b"server-hello".to_vec() }.encode(&mut payload).unwrap();
    if payload.len() < packet::MIN_INITIAL_SIZE {
        let pad = packet::MIN_INITIAL_SIZE - payload.len();
        Frame::Padding { length: pad }.encode(&mut payload).unwrap();
        payload.resize(packet::MIN_INITIAL_SIZE, 0);
    }
    let fields = LongHeaderFields {
        packet_type: LongPacketType::Initial,
        version: Version::V1.wire(),
        dcid: ConnectionId::new(&dcid_bytes).unwrap(),
        scid: ConnectionId::new(&[0xaa; 8]).unwrap(),
        token: Vec::new(),
    };
    let initial = server_keys.level(KeyLevel::Initial).unwrap();
    let server_packet = packet::encode_long(&fields, 0, None, &payload, &initial.server).unwrap();
    conn.on_datagram_received(&server_packet, Instant::now()).unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.initiate_key_update(Instant::now()).unwrap();
}

#[test]
fn unknown_stream_read_is_rejected() {
    let mut conn = connect_client();
    assert!(matches!(conn.stream_read(999), Err(ConnectionError::UnknownStream(999))));
}

#[test]
fn opening_a_stream_beyond_the_peer_cap_is_refused_locally() {
    let mut conn = connect_client();
    // Default cap is 100 per `AppConfig`'s transport defaults; drain it.
    for _ in 0..100 {
        conn.open_stream(Direction::Bidi).unwrap();
    }
    assert!(matches!(conn.open_stream(Direction::Bidi), Err(ConnectionError::StreamLimitReached)));
}

#[test]
fn close_emits_a_closing_packet_and_state() {
    let mut conn = connect_client();
    conn.close(0, "done");
    assert_eq!(conn.state(), ConnectionState::Closing);
    // Closing still needs application keys installed to emit a 1-RTT
    // CONNECTION_CLOSE; before the handshake completes there is nothing
    // to send yet, so `poll_transmit` legitimately returns nothing.
    let packets = conn.poll_transmit(Instant::now());
    assert!(packets.is_empty());
}
