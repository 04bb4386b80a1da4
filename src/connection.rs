//! Connection state machine (C12): orchestrates the handshake, owns the
//! single active path, and drives every other component from one place.
//!
//! This is a client-only implementation (§1 Non-goals exclude server-side
//! QUIC), driven synchronously by a caller that owns the event loop — the
//! async/await-everywhere pattern the spec flags for redesign (§9) is
//! replaced by an explicit `poll_transmit`/`on_datagram_received`/
//! `next_timeout`/`on_timeout` quadruple, matching the suspension points in
//! §5. A small `tokio`-backed driver in `main.rs` is the only place that
//! actually awaits anything.

use crate::app_config::AppConfig;
use crate::congestion::{self, CongestionController};
use crate::crypto::keys::Level as KeyLevel;
use crate::crypto::{KeySchedule, Version};
use crate::error::{ConnectionError, WireError};
use crate::events::{Event, EventQueue};
use crate::flow_control::{effective_send_budget, ReceiveFlowControl, SendFlowControl};
use crate::frame::{EncryptionLevel, Frame};
use crate::packet::{self, ConnectionId, DecodedLong, DecodedShort, LongHeaderFields, LongPacketType};
use crate::pacer::Pacer;
use crate::pnspace::{PacketNumberSpace, Space};
use crate::recovery::{LossRecovery, SentPacket};
use crate::stats::Stats;
use crate::stream::{self, Direction, Initiator, Scheduler, Stream};
use crate::tls::{CryptoStream, TlsEngine, TlsEvent};
use log::{debug, info, trace, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_UDP_PAYLOAD: usize = 1452;
const MAX_PACKETS_PER_TRANSMIT: usize = 4;

/// User-facing configuration: transport parameters, congestion algorithm,
/// and the handful of knobs a caller sets before dialing (§6).
#[derive(Clone)]
pub struct Config {
    pub app: AppConfig,
    pub server_name: String,
    pub alpn: Vec<Vec<u8>>,
}

impl Config {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self { app: AppConfig::default(), server_name: server_name.into(), alpn: vec![b"h3".to_vec()] }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Connected,
    Closing,
    Draining,
    Closed,
}

struct Path {
    local: SocketAddr,
    remote: SocketAddr,
    validated: bool,
    anti_amplification_credit: usize,
    challenge_sent: Option<[u8; 8]>,
}

impl Path {
    /// §4.12: until validated, at most 3x what's been received may be sent.
    fn note_received(&mut self, bytes: usize) {
        if !self.validated {
            self.anti_amplification_credit += 3 * bytes;
        }
    }

    fn may_send(&self, bytes: usize) -> bool {
        self.validated || bytes <= self.anti_amplification_credit
    }

    fn note_sent(&mut self, bytes: usize) {
        if !self.validated {
            self.anti_amplification_credit = self.anti_amplification_credit.saturating_sub(bytes);
        }
    }
}

struct CloseState {
    error_code: u64,
    reason: String,
    is_app: bool,
    frame_type: u64,
    deadline: Instant,
}

/// One QUIC client connection. Not `Sync`: the caller serialises all
/// access through a single task or an external mutex, per §5.
pub struct Connection {
    state: ConnectionState,
    version: Version,
    scid: ConnectionId,
    dcid: ConnectionId,
    keys: KeySchedule,
    tls: Box<dyn TlsEngine>,
    crypto_streams: HashMap<KeyLevel, CryptoStream>,

    initial_space: PacketNumberSpace,
    handshake_space: PacketNumberSpace,
    app_space: PacketNumberSpace,
    recovery: LossRecovery,
    congestion: Box<dyn CongestionController>,
    pacer: Pacer,

    streams: HashMap<u64, Stream>,
    scheduler: Scheduler,
    next_bidi_stream: u64,
    next_uni_stream: u64,
    conn_recv_flow: ReceiveFlowControl,
    conn_send_flow: SendFlowControl,
    peer_initial_max_stream_data_bidi_remote: u64,
    peer_initial_max_stream_data_uni: u64,
    peer_max_streams_bidi: u64,
    peer_max_streams_uni: u64,

    pending_datagrams: Vec<Vec<u8>>,
    pending_path_response: Option<[u8; 8]>,
    pending_resets: Vec<(u64, u64, u64)>, // (stream_id, error_code, final_size)
    pending_max_data: Option<u64>,
    pto_pending: bool,
    key_update_deadline: Option<Instant>,

    path: Path,
    config: Config,
    close: Option<CloseState>,
    handshake_deadline: Instant,
    idle_deadline: Instant,
    max_idle_timeout: Duration,

    events: Arc<EventQueue>,
    stats: Stats,
}

impl Connection {
    /// Dials out: generates random SCID/DCID and installs Initial keys. The
    /// caller is expected to have constructed `tls` already primed with
    /// this crate's encoded transport parameters (`tls::encode_transport_
    /// parameters`) — `TlsEngine` is an externally injected collaborator,
    /// so wiring a concrete `rustls`-backed engine to them is its job, not
    /// this one's.
    pub fn connect(
        config: Config,
        local: SocketAddr,
        remote: SocketAddr,
        tls: Box<dyn TlsEngine>,
        now: Instant,
    ) -> Result<Self, ConnectionError> {
        let mut rng = rand::thread_rng();
        let mut scid_bytes = [0u8; 8];
        let mut dcid_bytes = [0u8; 8];
        rng.fill_bytes(&mut scid_bytes);
        rng.fill_bytes(&mut dcid_bytes);
        let scid = ConnectionId::new(&scid_bytes)?;
        let dcid = ConnectionId::new(&dcid_bytes)?;

        let mut keys = KeySchedule::new(Version::V1, crate::crypto::AeadAlgorithm::Aes128Gcm);
        keys.install_initial(dcid.as_slice())?;

        let algorithm = config.app.congestion_algorithm().map_err(|_| {
            ConnectionError::Wire(WireError::ProtocolViolation("unknown congestion_control algorithm"))
        })?;
        let transport = config.app.transport.clone();

        let mut conn = Self {
            state: ConnectionState::Handshaking,
            version: Version::V1,
            scid,
            dcid,
            keys,
            tls,
            crypto_streams: HashMap::from([
                (KeyLevel::Initial, CryptoStream::default()),
                (KeyLevel::Handshake, CryptoStream::default()),
                (KeyLevel::Application, CryptoStream::default()),
            ]),
            initial_space: PacketNumberSpace::new(Space::Initial, Duration::from_millis(transport.max_ack_delay_ms)),
            handshake_space: PacketNumberSpace::new(Space::Handshake, Duration::from_millis(transport.max_ack_delay_ms)),
            app_space: PacketNumberSpace::new(Space::Application, Duration::from_millis(transport.max_ack_delay_ms)),
            recovery: LossRecovery::new(Duration::from_millis(transport.max_ack_delay_ms)),
            congestion: congestion::new_controller(algorithm),
            pacer: Pacer::new(now),
            streams: HashMap::new(),
            scheduler: Scheduler::new(),
            next_bidi_stream: 0,
            next_uni_stream: 0,
            conn_recv_flow: ReceiveFlowControl::new(transport.initial_max_data),
            conn_send_flow: SendFlowControl::new(0), // raised once the handshake completes
            peer_initial_max_stream_data_bidi_remote: 0,
            peer_initial_max_stream_data_uni: 0,
            peer_max_streams_bidi: transport.initial_max_streams_bidi,
            peer_max_streams_uni: transport.initial_max_streams_uni,
            pending_datagrams: Vec::new(),
            pending_path_response: None,
            pending_resets: Vec::new(),
            pending_max_data: None,
            pto_pending: false,
            key_update_deadline: None,
            path: Path { local, remote, validated: false, anti_amplification_credit: 0, challenge_sent: None },
            config,
            close: None,
            handshake_deadline: now + HANDSHAKE_TIMEOUT,
            idle_deadline: now + Duration::from_millis(transport.max_idle_timeout_ms),
            max_idle_timeout: Duration::from_millis(transport.max_idle_timeout_ms),
            events: Arc::new(EventQueue::new()),
            stats: Stats::default(),
        };
        conn.pump_tls();
        Ok(conn)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> Stats {
        let mut s = self.stats;
        s.rtt = self.recovery.rtt().smoothed_rtt();
        s.bytes_in_flight = self.recovery.bytes_in_flight();
        s.cwnd = self.congestion.cwnd();
        s.pacing_rate = self.congestion.pacing_rate(self.recovery.rtt().smoothed_rtt());
        s.stream_count = self.streams.len();
        s
    }

    pub fn events(&self) -> Arc<EventQueue> {
        self.events.clone()
    }

    // ---- Stream API (§6) ----

    pub fn open_stream(&mut self, direction: Direction) -> Result<u64, ConnectionError> {
        if self.close.is_some() {
            return Err(ConnectionError::Closed);
        }
        let cap = match direction {
            Direction::Bidi => self.peer_max_streams_bidi,
            Direction::Uni => self.peer_max_streams_uni,
        };
        let n = match direction {
            Direction::Bidi => &mut self.next_bidi_stream,
            Direction::Uni => &mut self.next_uni_stream,
        };
        if *n >= cap {
            return Err(ConnectionError::StreamLimitReached);
        }
        let id = stream::client_stream_id(*n, direction);
        *n += 1;
        let send_window = match direction {
            Direction::Bidi => self.peer_initial_max_stream_data_bidi_remote,
            Direction::Uni => self.peer_initial_max_stream_data_uni,
        };
        let recv_window = self.config.app.transport.initial_max_stream_data_bidi_local;
        self.streams.insert(id, Stream::new(id, recv_window, send_window));
        self.scheduler.register(id);
        Ok(id)
    }

    pub fn stream_write(&mut self, id: u64, bytes: &[u8], fin: bool) -> Result<usize, ConnectionError> {
        let stream = self.streams.get_mut(&id).ok_or(ConnectionError::UnknownStream(id))?;
        stream.write(bytes, fin)?;
        self.scheduler.register(id);
        Ok(bytes.len())
    }

    pub fn stream_read(&mut self, id: u64) -> Result<(Vec<u8>, bool), ConnectionError> {
        let stream = self.streams.get_mut(&id).ok_or(ConnectionError::UnknownStream(id))?;
        stream.read()
    }

    /// Queues a `RESET_STREAM` for the next outgoing application packet,
    /// carrying the final size already written so far (§4.11).
    pub fn reset_stream(&mut self, id: u64, error_code: u64) -> Result<(), ConnectionError> {
        let stream = self.streams.get(&id).ok_or(ConnectionError::UnknownStream(id))?;
        let final_size = stream.total_written();
        self.pending_resets.push((id, error_code, final_size));
        self.scheduler.unregister(id);
        Ok(())
    }

    /// Advances this endpoint's own Application key-update phase (§4.3 /
    /// RFC 9001 §6): derives the next generation via `quic ku`, starts
    /// sending under it immediately, and schedules the retained previous
    /// generation to be dropped after one PTO, once reordered packets sent
    /// under it have had time to arrive.
    pub fn initiate_key_update(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::Closed);
        }
        let app_keys = self.keys.application_mut().ok_or(ConnectionError::Closed)?;
        app_keys.update()?;
        let pto = self.recovery.rtt().pto(Duration::from_millis(self.config.app.transport.max_ack_delay_ms));
        self.key_update_deadline = Some(now + pto);
        info!("initiated application key update");
        Ok(())
    }

    pub fn send_datagram(&mut self, bytes: Vec<u8>) -> bool {
        if bytes.len() as u64 > self.config.app.transport.max_datagram_frame_size {
            return false;
        }
        self.pending_datagrams.push(bytes);
        true
    }

    pub fn close(&mut self, error_code: u64, reason: impl Into<String>) {
        if self.close.is_some() {
            return;
        }
        let pto = self.recovery.rtt().pto(Duration::from_millis(self.config.app.transport.max_ack_delay_ms));
        self.close = Some(CloseState {
            error_code,
            reason: reason.into(),
            is_app: true,
            frame_type: 0,
            deadline: Instant::now() + pto * 3,
        });
        self.state = ConnectionState::Closing;
    }

    // ---- Receive path ----

    pub fn on_datagram_received(&mut self, buf: &[u8], now: Instant) -> Result<(), ConnectionError> {
        self.path.note_received(buf.len());
        self.stats.bytes_received += buf.len() as u64;
        crate::telemetry::BYTES_RECEIVED.inc_by(buf.len() as u64);
        self.idle_deadline = now + self.max_idle_timeout;

        if self.state == ConnectionState::Draining || self.state == ConnectionState::Closed {
            return Ok(());
        }

        let Some(&first_byte) = buf.first() else { return Ok(()) };
        let result = if first_byte & 0x80 != 0 { self.on_long_header(buf, now) } else { self.on_short_header(buf, now) };

        match result {
            Ok(()) => Ok(()),
            Err(ConnectionError::Wire(WireError::AeadFailure)) => {
                // §7(b): a failed decrypt is dropped silently, as if the packet never existed.
                trace!("dropped undecryptable packet");
                Ok(())
            }
            Err(_) if self.state == ConnectionState::Closing => {
                // Closing: any incoming packet just keeps the close retransmit timer alive.
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Ok(())
            }
        }
    }

    fn on_long_header(&mut self, buf: &[u8], now: Instant) -> Result<(), ConnectionError> {
        let version = u32::from_be_bytes(buf.get(1..5).ok_or(WireError::ShortBuffer)?.try_into().unwrap());
        if version == 0 {
            warn!("version negotiation received; no fallback version configured");
            return Err(ConnectionError::Wire(WireError::UnsupportedVersion(0)));
        }
        let is_v2 = version == Version::V2_NUMBER;
        let packet_type_bits = (buf[0] >> 4) & 0x3;
        let packet_type = LongPacketType::from_type_bits(packet_type_bits, is_v2);

        let (space, level, key_level) = match packet_type {
            LongPacketType::Initial => (Space::Initial, EncryptionLevel::Initial, KeyLevel::Initial),
            LongPacketType::Handshake => (Space::Handshake, EncryptionLevel::Handshake, KeyLevel::Handshake),
            LongPacketType::ZeroRtt | LongPacketType::Retry => {
                debug!("ignoring 0-RTT/Retry packet (client does not send 0-RTT, §1 Non-goals)");
                return Ok(());
            }
        };

        let largest_pn = match space {
            Space::Initial => self.initial_space.largest_received(),
            Space::Handshake => self.handshake_space.largest_received(),
            Space::Application => unreachable!(),
        }
        .map(|p| p as i64)
        .unwrap_or(-1);

        let decoded: DecodedLong = {
            let keys = self.keys.level(key_level).ok_or(ConnectionError::Wire(WireError::AeadFailure))?;
            packet::decode_long(buf, largest_pn, &keys.server)?
        };

        let accepted = match space {
            Space::Initial => self.initial_space.on_packet_received(decoded.packet_number, true, None, now),
            Space::Handshake => self.handshake_space.on_packet_received(decoded.packet_number, true, None, now),
            Space::Application => unreachable!(),
        };
        if !accepted {
            return Ok(());
        }
        self.process_frames(&decoded.payload, level, now)
    }

    fn on_short_header(&mut self, buf: &[u8], now: Instant) -> Result<(), ConnectionError> {
        let key_phase_bit = buf.first().map(|b| b & 0b0000_0100 != 0).unwrap_or(false);
        let largest_pn = self.app_space.largest_received().map(|p| p as i64).unwrap_or(-1);
        let dcid_len = self.scid.len();

        // Note: a peer-initiated key update (new phase bit we haven't
        // derived yet) is not auto-detected here — only the locally
        // triggered update path is supported. A genuinely new phase from
        // the peer is treated as undecryptable and the packet is dropped.
        let decoded: DecodedShort = {
            let Some(app_keys) = self.keys.application() else {
                debug!("short-header packet received before application keys installed");
                return Ok(());
            };
            let Some(keys) = app_keys.keys_for_phase(key_phase_bit) else {
                debug!("short-header packet with unrecognised key phase dropped");
                return Ok(());
            };
            packet::decode_short(buf, dcid_len, largest_pn, &keys.server)?
        };

        let accepted = self.app_space.on_packet_received(decoded.packet_number, true, None, now);
        if !accepted {
            return Ok(());
        }
        self.process_frames(&decoded.payload, EncryptionLevel::OneRtt, now)
    }

    fn process_frames(&mut self, payload: &[u8], level: EncryptionLevel, now: Instant) -> Result<(), ConnectionError> {
        let mut pos = 0;
        while pos < payload.len() {
            let frame = Frame::decode(payload, &mut pos)?;
            if !frame.allowed_at(level) {
                return Err(ConnectionError::Wire(WireError::FrameNotAllowed(0)));
            }
            self.handle_frame(frame, level, now)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, level: EncryptionLevel, now: Instant) -> Result<(), ConnectionError> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Crypto { offset, data } => {
                let key_level = match level {
                    EncryptionLevel::Initial => KeyLevel::Initial,
                    EncryptionLevel::Handshake => KeyLevel::Handshake,
                    _ => KeyLevel::Application,
                };
                let ready = self
                    .crypto_streams
                    .get_mut(&key_level)
                    .unwrap()
                    .on_crypto_frame(offset, &data)
                    .map_err(ConnectionError::Wire)?;
                if !ready.is_empty() {
                    let tls_events = self.tls.process_handshake_bytes(&ready)?;
                    for ev in tls_events {
                        self.on_tls_event(ev, now)?;
                    }
                    self.pump_tls();
                }
            }
            Frame::Ack { largest_ack, ack_delay, ranges, .. } => {
                let space = match level {
                    EncryptionLevel::Initial => Space::Initial,
                    EncryptionLevel::Handshake => Space::Handshake,
                    _ => Space::Application,
                };
                match space {
                    Space::Initial => self.initial_space.note_peer_ack(largest_ack),
                    Space::Handshake => self.handshake_space.note_peer_ack(largest_ack),
                    Space::Application => self.app_space.note_peer_ack(largest_ack),
                }
                let ack_delay = Duration::from_micros(ack_delay << self.config.app.transport.ack_delay_exponent);
                let outcome =
                    self.recovery.on_ack_received(space, largest_ack, ack_delay, &ranges, now, self.congestion.as_mut());
                self.stats.packets_lost += outcome.lost.len() as u64;
                for lost in &outcome.lost {
                    crate::telemetry::PACKETS_LOST.inc();
                    self.requeue_lost_frames(lost);
                }
                for acked in &outcome.acked {
                    self.note_frames_acked(&acked.frames);
                }
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                self.ensure_peer_stream(stream_id)?;
                let consumed = data.len() as u64;
                let stream = self.streams.get_mut(&stream_id).ok_or(ConnectionError::UnknownStream(stream_id))?;
                stream.on_stream_frame(offset, &data, fin)?;
                let (bytes, fin_delivered) = stream.read()?;
                if let Some(new_max) = self.conn_recv_flow.on_bytes_consumed(consumed) {
                    self.pending_max_data = Some(new_max);
                }
                if !bytes.is_empty() || fin_delivered {
                    self.events.push(Event::StreamData { id: stream_id, data: bytes, fin: fin_delivered });
                }
            }
            Frame::ResetStream { stream_id, error_code, .. } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_reset(error_code);
                    self.scheduler.unregister(stream_id);
                    self.events.push(Event::StreamReset { id: stream_id, error_code });
                }
            }
            Frame::StopSending { stream_id, .. } => {
                self.scheduler.unregister(stream_id);
            }
            Frame::MaxData { max } => self.conn_send_flow.on_max_data_update(max),
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_flow.on_max_data_update(max);
                    self.events.push(Event::StreamWritable { id: stream_id });
                }
            }
            Frame::MaxStreamsBidi { max } => {
                if max > self.peer_max_streams_bidi {
                    self.peer_max_streams_bidi = max;
                }
            }
            Frame::MaxStreamsUni { max } => {
                if max > self.peer_max_streams_uni {
                    self.peer_max_streams_uni = max;
                }
            }
            Frame::DataBlocked { .. } | Frame::StreamDataBlocked { .. } => {}
            Frame::StreamsBlockedBidi { .. } | Frame::StreamsBlockedUni { .. } => {}
            Frame::NewConnectionId { .. } | Frame::RetireConnectionId { .. } => {}
            Frame::PathChallenge { data } => {
                self.pending_path_response = Some(data);
            }
            Frame::PathResponse { data } => {
                if self.path.challenge_sent == Some(data) {
                    self.path.validated = true;
                    self.events.push(Event::PathValidated {
                        local: self.path.local.to_string(),
                        remote: self.path.remote.to_string(),
                    });
                    crate::telemetry::PATH_VALIDATIONS.inc();
                }
            }
            Frame::ConnectionCloseTransport { error_code, reason, .. } => self.on_peer_close(error_code, reason),
            Frame::ConnectionCloseApp { error_code, reason } => self.on_peer_close(error_code, reason),
            Frame::HandshakeDone => {
                if self.state == ConnectionState::Handshaking {
                    self.complete_handshake(now);
                }
            }
            Frame::Datagram { data } => self.events.push(Event::Datagram { data }),
            Frame::NewToken { .. } => {}
        }
        Ok(())
    }

    fn ensure_peer_stream(&mut self, stream_id: u64) -> Result<(), ConnectionError> {
        if self.streams.contains_key(&stream_id) {
            return Ok(());
        }
        let (initiator, direction) = stream::classify(stream_id);
        if initiator == Initiator::Client {
            return Err(ConnectionError::UnknownStream(stream_id));
        }
        let transport = &self.config.app.transport;
        let recv_window = match direction {
            Direction::Bidi => transport.initial_max_stream_data_bidi_remote,
            Direction::Uni => transport.initial_max_stream_data_uni,
        };
        self.streams.insert(stream_id, Stream::new(stream_id, recv_window, 0));
        self.events.push(Event::StreamOpened { id: stream_id, direction });
        Ok(())
    }

    fn on_tls_event(&mut self, event: TlsEvent, now: Instant) -> Result<(), ConnectionError> {
        match event {
            TlsEvent::SecretsReady(secrets) => {
                match secrets.level {
                    KeyLevel::Handshake => self.keys.install_handshake(&secrets.client, &secrets.server)?,
                    KeyLevel::Application => self.keys.install_application(&secrets.client, &secrets.server)?,
                    KeyLevel::Initial => {}
                }
                info!("installed {:?} keys", secrets.level);
            }
            TlsEvent::HandshakeComplete { alpn } => {
                self.complete_handshake(now);
                self.events.push(Event::HandshakeComplete { alpn: alpn.unwrap_or_default() });
            }
        }
        Ok(())
    }

    fn pump_tls(&mut self) {
        while let Some((level, bytes)) = self.tls.next_outgoing_handshake_bytes() {
            self.crypto_streams.get_mut(&level).unwrap().queue_outgoing(&bytes);
        }
    }

    fn complete_handshake(&mut self, now: Instant) {
        if self.state != ConnectionState::Handshaking {
            return;
        }
        self.state = ConnectionState::Connected;
        self.conn_send_flow = SendFlowControl::new(self.config.app.transport.initial_max_data);
        self.idle_deadline = now + self.max_idle_timeout;
    }

    fn on_peer_close(&mut self, error_code: u64, reason: String) {
        self.events.push(Event::ConnectionClose { error_code, reason: reason.clone() });
        if self.close.is_none() {
            self.close = Some(CloseState { error_code, reason, is_app: true, frame_type: 0, deadline: Instant::now() });
        }
        self.state = ConnectionState::Draining;
    }

    fn fail(&mut self, err: &ConnectionError) {
        let code = match err {
            ConnectionError::Wire(w) => w.transport_code().code(),
            _ => crate::error::TransportErrorCode::InternalError.code(),
        };
        self.events.push(Event::ConnectionClose { error_code: code, reason: err.to_string() });
        let pto = self.recovery.rtt().pto(Duration::from_millis(self.config.app.transport.max_ack_delay_ms));
        self.close = Some(CloseState {
            error_code: code,
            reason: err.to_string(),
            is_app: false,
            frame_type: 0,
            deadline: Instant::now() + pto * 3,
        });
        self.state = ConnectionState::Closing;
    }

    fn requeue_lost_frames(&mut self, lost: &SentPacket) {
        for frame in &lost.frames {
            if let Frame::Stream { stream_id, .. } = frame {
                self.scheduler.register(*stream_id);
            }
        }
    }

    fn note_frames_acked(&mut self, frames: &[Frame]) {
        for frame in frames {
            if let Frame::Stream { stream_id, offset, data, .. } = frame {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.on_stream_acked(*offset, data.len() as u64);
                }
            }
        }
    }

    // ---- Send path ----

    /// Earliest deadline the caller must wake up for: idle timeout,
    /// handshake timeout, PTO, an ACK that's due, or closing teardown.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut deadlines = vec![self.idle_deadline];
        if self.state == ConnectionState::Handshaking {
            deadlines.push(self.handshake_deadline);
        }
        if let Some(pto) = self.recovery.pto_deadline() {
            deadlines.push(pto);
        }
        if let Some(close) = &self.close {
            deadlines.push(close.deadline);
        }
        if let Some(key_update) = self.key_update_deadline {
            deadlines.push(key_update);
        }
        for space in [&self.initial_space, &self.handshake_space, &self.app_space] {
            if let Some(d) = space.ack_deadline() {
                deadlines.push(d);
            }
        }
        deadlines.into_iter().min()
    }

    pub fn on_timeout(&mut self, now: Instant) {
        if now >= self.idle_deadline {
            info!("idle timeout");
            self.state = ConnectionState::Closed;
            self.events.push(Event::ConnectionClose { error_code: 0, reason: "idle timeout".into() });
            return;
        }
        if self.state == ConnectionState::Handshaking && now >= self.handshake_deadline {
            self.fail(&ConnectionError::HandshakeTimeout);
            return;
        }
        if let Some(close) = &self.close {
            if now >= close.deadline {
                self.state = ConnectionState::Closed;
                return;
            }
        }
        if let Some(pto) = self.recovery.pto_deadline() {
            if now >= pto {
                self.recovery.on_pto_fired();
                crate::telemetry::PTO_EVENTS.inc();
                self.pto_pending = true;
            }
        }
        if let Some(deadline) = self.key_update_deadline {
            if now >= deadline {
                if let Some(app_keys) = self.keys.application_mut() {
                    app_keys.drop_previous();
                }
                self.key_update_deadline = None;
            }
        }
    }

    /// Produces the next batch of wire-ready UDP payloads to send, one per
    /// packet, honouring pacing, congestion window, and the anti-
    /// amplification limit on an unvalidated path (§4.9, §4.12).
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut datagrams = Vec::new();
        let srtt = self.recovery.rtt().smoothed_rtt();
        let pacing_rate = self.congestion.pacing_rate(srtt);
        self.pacer.update(now, self.congestion.cwnd(), srtt, pacing_rate);

        if self.close.is_some() {
            if let Some(packet) = self.build_close_packet(now) {
                datagrams.push(packet);
            }
            return datagrams;
        }

        while datagrams.len() < MAX_PACKETS_PER_TRANSMIT {
            if self.recovery.bytes_in_flight() >= self.congestion.cwnd() && !self.pto_pending {
                break;
            }
            if !self.path.may_send(MAX_UDP_PAYLOAD) {
                break;
            }
            let Some(packet) = self.build_next_packet(now) else { break };
            if self.pacer.next_send_delay(packet.len()) != Duration::ZERO {
                break;
            }
            self.path.note_sent(packet.len());
            self.stats.bytes_sent += packet.len() as u64;
            crate::telemetry::BYTES_SENT.inc_by(packet.len() as u64);
            self.pto_pending = false;
            datagrams.push(packet);
        }
        datagrams
    }

    fn build_close_packet(&mut self, _now: Instant) -> Option<Vec<u8>> {
        let close = self.close.as_ref()?;
        let frame = if close.is_app {
            Frame::ConnectionCloseApp { error_code: close.error_code, reason: close.reason.clone() }
        } else {
            Frame::ConnectionCloseTransport {
                error_code: close.error_code,
                frame_type: close.frame_type,
                reason: close.reason.clone(),
            }
        };
        let mut payload = Vec::new();
        frame.encode(&mut payload).ok()?;
        let pn = self.app_space.next_send_pn();
        self.protect_application(pn, payload)
    }

    /// Builds one packet's worth of frames from whichever space has the
    /// most urgent data, in ascending encryption-level order per §4.12.
    fn build_next_packet(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.keys.level(KeyLevel::Initial).is_some() && !self.crypto_streams[&KeyLevel::Initial].is_empty() {
            if let Some(packet) = self.build_level_packet(Space::Initial, KeyLevel::Initial, now) {
                return Some(packet);
            }
        }
        if self.keys.level(KeyLevel::Handshake).is_some() {
            if let Some(packet) = self.build_level_packet(Space::Handshake, KeyLevel::Handshake, now) {
                return Some(packet);
            }
        }
        if self.keys.level(KeyLevel::Application).is_some() {
            return self.build_application_packet(now);
        }
        None
    }

    fn build_level_packet(&mut self, space: Space, key_level: KeyLevel, now: Instant) -> Option<Vec<u8>> {
        let ack_delay_exp = self.config.app.transport.ack_delay_exponent;
        let mut frames = Vec::new();

        let ack = match space {
            Space::Initial => self.initial_space.build_ack(Duration::ZERO, ack_delay_exp),
            Space::Handshake => self.handshake_space.build_ack(Duration::ZERO, ack_delay_exp),
            Space::Application => unreachable!(),
        };
        if let Some(ack) = ack {
            frames.push(ack);
            match space {
                Space::Initial => self.initial_space.on_ack_sent(),
                Space::Handshake => self.handshake_space.on_ack_sent(),
                Space::Application => unreachable!(),
            }
        }
        if let Some(crypto_frame) = self.crypto_streams.get_mut(&key_level).unwrap().next_frame(1200) {
            frames.push(crypto_frame);
        }
        if frames.is_empty() {
            return None;
        }

        let mut payload = Vec::new();
        for f in &frames {
            f.encode(&mut payload).ok()?;
        }
        if space == Space::Initial && payload.len() < packet::MIN_INITIAL_SIZE {
            let pad = packet::MIN_INITIAL_SIZE - payload.len();
            frames.push(Frame::Padding { length: pad });
            payload.resize(packet::MIN_INITIAL_SIZE, 0);
        }

        // `pn`/`largest_acked` must be read from the relevant packet-number
        // space *before* borrowing `self.keys`, so that the `keys` borrow
        // below is the last use of `self` before `encode_long` consumes it.
        let pn = match space {
            Space::Initial => self.initial_space.next_send_pn(),
            Space::Handshake => self.handshake_space.next_send_pn(),
            Space::Application => unreachable!(),
        };
        let largest_acked = match space {
            Space::Initial => self.initial_space.largest_acked_by_peer(),
            Space::Handshake => self.handshake_space.largest_acked_by_peer(),
            Space::Application => unreachable!(),
        };
        let packet = {
            let keys = self.keys.level(key_level)?;
            let fields = LongHeaderFields {
                packet_type: match space {
                    Space::Initial => LongPacketType::Initial,
                    Space::Handshake => LongPacketType::Handshake,
                    Space::Application => unreachable!(),
                },
                version: self.version.wire(),
                dcid: self.dcid.clone(),
                scid: self.scid.clone(),
                token: Vec::new(),
            };
            packet::encode_long(&fields, pn, largest_acked, &payload, &keys.client).ok()?
        };
        self.on_packet_built(space, pn, packet.len(), frames, now);
        Some(packet)
    }

    fn build_application_packet(&mut self, now: Instant) -> Option<Vec<u8>> {
        let ack_delay_exp = self.config.app.transport.ack_delay_exponent;
        let mut frames = Vec::new();

        if let Some(ack) = self.app_space.build_ack(Duration::ZERO, ack_delay_exp) {
            frames.push(ack);
            self.app_space.on_ack_sent();
        }
        if let Some(max) = self.pending_max_data.take() {
            frames.push(Frame::MaxData { max });
        }
        if let Some(data) = self.pending_path_response.take() {
            frames.push(Frame::PathResponse { data });
        }
        if let Some((stream_id, error_code, final_size)) = self.pending_resets.pop() {
            frames.push(Frame::ResetStream { stream_id, error_code, final_size });
        }
        if let Some(data) = self.pending_datagrams.pop() {
            frames.push(Frame::Datagram { data });
        }
        for stream_id in self.scheduler.next_round(&self.streams) {
            let Some(stream) = self.streams.get_mut(&stream_id) else { continue };
            let budget = effective_send_budget(&stream.send_flow, &self.conn_send_flow).min(1200) as usize;
            if budget == 0 {
                continue;
            }
            let Some(frame) = stream.next_send_frame(budget) else { continue };
            if let Frame::Stream { ref data, .. } = frame {
                stream.send_flow.on_bytes_sent(data.len() as u64);
                self.conn_send_flow.on_bytes_sent(data.len() as u64);
            }
            if !stream.has_pending_send() {
                self.scheduler.unregister(stream_id);
            }
            frames.push(frame);
            break;
        }
        if frames.is_empty() {
            return None;
        }

        let mut payload = Vec::new();
        for f in &frames {
            f.encode(&mut payload).ok()?;
        }
        let pn = self.app_space.next_send_pn();
        let packet = self.protect_application(pn, payload)?;
        self.on_packet_built(Space::Application, pn, packet.len(), frames, now);
        Some(packet)
    }

    fn protect_application(&mut self, pn: u64, payload: Vec<u8>) -> Option<Vec<u8>> {
        let largest_acked = self.app_space.largest_acked_by_peer();
        let app_keys = self.keys.application()?;
        packet::encode_short(&self.dcid, app_keys.current_phase(), false, pn, largest_acked, &payload, &app_keys.current().client)
            .ok()
    }

    fn on_packet_built(&mut self, space: Space, pn: u64, size: usize, frames: Vec<Frame>, now: Instant) {
        let ack_eliciting = frames.iter().any(|f| f.is_ack_eliciting());
        self.congestion.on_packet_sent(now, size);
        crate::telemetry::CWND_BYTES.set(self.congestion.cwnd() as i64);
        crate::telemetry::RTT_MICROS.set(self.recovery.rtt().smoothed_rtt().as_micros() as i64);
        self.recovery.on_packet_sent(SentPacket { packet_number: pn, space, sent_time: now, size, ack_eliciting, in_flight: true, frames });
    }
}
