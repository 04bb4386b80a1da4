//! Stream multiplexer (C11): ID allocation, state machines, gap-tolerant
//! reassembly, and a round-robin send scheduler.

use crate::error::ConnectionError;
use crate::flow_control::{ReceiveFlowControl, SendFlowControl};
use crate::frame::Frame;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bidi,
    Uni,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Client,
    Server,
}

/// Decodes the low two bits of a stream ID per §4.11.
pub fn classify(stream_id: u64) -> (Initiator, Direction) {
    let initiator = if stream_id & 0x1 == 0 { Initiator::Client } else { Initiator::Server };
    let direction = if stream_id & 0x2 == 0 { Direction::Bidi } else { Direction::Uni };
    (initiator, direction)
}

pub fn client_stream_id(n: u64, direction: Direction) -> u64 {
    match direction {
        Direction::Bidi => 4 * n,
        Direction::Uni => 4 * n + 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ready,
    Open,
    SendClosed,
    RecvClosed,
    ResetSent,
    ResetReceived,
    Closed,
}

/// Non-overlapping, gap-tolerant receive reassembly. Overlapping bytes
/// must agree with what's already buffered (§4.11) or the connection is
/// torn down with `PROTOCOL_VIOLATION`.
#[derive(Default)]
struct ReassemblyBuffer {
    // offset -> bytes, entries never overlap after insertion
    chunks: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    final_size: Option<u64>,
}

impl ReassemblyBuffer {
    fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<(), ConnectionError> {
        if fin {
            let end = offset + data.len() as u64;
            if let Some(existing) = self.final_size {
                if existing != end {
                    return Err(ConnectionError::Wire(crate::error::WireError::ProtocolViolation(
                        "final size mismatch",
                    )));
                }
            }
            self.final_size = Some(end);
        }
        if let Some(final_size) = self.final_size {
            if offset + data.len() as u64 > final_size {
                return Err(ConnectionError::Wire(crate::error::WireError::ProtocolViolation(
                    "data beyond final size",
                )));
            }
        }
        if data.is_empty() {
            return Ok(());
        }
        if offset + (data.len() as u64) <= self.read_offset {
            return Ok(()); // fully duplicate, already delivered
        }
        // Check for byte-for-byte agreement against any overlapping chunk
        // already on file.
        for (&existing_off, existing_data) in self.chunks.range(..offset + data.len() as u64) {
            let existing_end = existing_off + existing_data.len() as u64;
            if existing_end <= offset {
                continue;
            }
            let overlap_start = offset.max(existing_off);
            let overlap_end = (offset + data.len() as u64).min(existing_end);
            if overlap_start < overlap_end {
                let a = &data[(overlap_start - offset) as usize..(overlap_end - offset) as usize];
                let b = &existing_data[(overlap_start - existing_off) as usize..(overlap_end - existing_off) as usize];
                if a != b {
                    return Err(ConnectionError::Wire(crate::error::WireError::ProtocolViolation(
                        "inconsistent stream retransmission",
                    )));
                }
            }
        }
        self.chunks.entry(offset).or_insert_with(|| data.to_vec());
        Ok(())
    }

    /// Delivers the longest contiguous prefix starting at `read_offset`.
    fn take_readable(&mut self) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            let Some((&off, _)) = self.chunks.iter().find(|(&off, data)| {
                off <= self.read_offset && off + data.len() as u64 > self.read_offset
            }) else {
                break;
            };
            let data = self.chunks.remove(&off).unwrap();
            let start = (self.read_offset - off) as usize;
            out.extend_from_slice(&data[start..]);
            self.read_offset = off + data.len() as u64;
        }
        let fin_delivered = self.final_size == Some(self.read_offset);
        (out, fin_delivered)
    }
}

/// Ordered send-side byte log with a framing cursor and an acked-up-to
/// watermark (§4.11).
#[derive(Default)]
struct SendBuffer {
    data: Vec<u8>,
    framed_offset: u64,
    acked_offset: u64,
    fin_requested: bool,
    fin_framed: bool,
}

impl SendBuffer {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn request_fin(&mut self) {
        self.fin_requested = true;
    }

    /// Produces one STREAM frame up to `max_len` bytes of payload, or
    /// `None` if there's nothing left to frame.
    fn next_frame(&mut self, stream_id: u64, max_len: usize) -> Option<Frame> {
        let pending = self.data.len() as u64 - self.framed_offset;
        if pending == 0 {
            if self.fin_requested && !self.fin_framed {
                self.fin_framed = true;
                return Some(Frame::Stream { stream_id, offset: self.framed_offset, data: vec![], fin: true });
            }
            return None;
        }
        let take = pending.min(max_len as u64) as usize;
        let start = self.framed_offset as usize;
        let chunk = self.data[start..start + take].to_vec();
        let offset = self.framed_offset;
        self.framed_offset += take as u64;
        let fin = self.fin_requested && self.framed_offset as usize == self.data.len();
        if fin {
            self.fin_framed = true;
        }
        Some(Frame::Stream { stream_id, offset, data: chunk, fin })
    }

    fn on_acked(&mut self, offset: u64, len: u64) {
        if offset == self.acked_offset {
            self.acked_offset = self.acked_offset.max(offset + len);
        }
    }
}

pub struct Stream {
    pub id: u64,
    state: StreamState,
    recv: ReassemblyBuffer,
    send: SendBuffer,
    pub recv_flow: ReceiveFlowControl,
    pub send_flow: SendFlowControl,
    pub priority: u8,
    reset_error: Option<u64>,
}

impl Stream {
    pub fn new(id: u64, initial_recv_window: u64, initial_send_window: u64) -> Self {
        Self {
            id,
            state: StreamState::Ready,
            recv: ReassemblyBuffer::default(),
            send: SendBuffer::default(),
            recv_flow: ReceiveFlowControl::new(initial_recv_window),
            send_flow: SendFlowControl::new(initial_send_window),
            priority: 0,
            reset_error: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn on_stream_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<(), ConnectionError> {
        if self.recv_flow.would_violate(offset + data.len() as u64) {
            return Err(ConnectionError::FlowControlBlocked);
        }
        self.recv.insert(offset, data, fin)?;
        if self.state == StreamState::Ready {
            self.state = StreamState::Open;
        }
        Ok(())
    }

    /// Reads the longest available contiguous prefix. Returns `(bytes,
    /// fin)`; `fin == true` means this is the last data the application
    /// will see.
    pub fn read(&mut self) -> Result<(Vec<u8>, bool), ConnectionError> {
        if let Some(code) = self.reset_error {
            return Err(ConnectionError::StreamReset(self.id, code));
        }
        let (bytes, fin) = self.recv.take_readable();
        self.recv_flow.on_bytes_consumed(bytes.len() as u64);
        if fin {
            self.state = match self.state {
                StreamState::SendClosed => StreamState::Closed,
                _ => StreamState::RecvClosed,
            };
        }
        Ok((bytes, fin))
    }

    pub fn on_reset(&mut self, error_code: u64) {
        self.reset_error = Some(error_code);
        self.state = StreamState::ResetReceived;
    }

    pub fn write(&mut self, bytes: &[u8], fin: bool) -> Result<(), ConnectionError> {
        if matches!(self.state, StreamState::SendClosed | StreamState::Closed | StreamState::ResetSent) {
            return Err(ConnectionError::StreamSendClosed(self.id));
        }
        self.send.write(bytes);
        if fin {
            self.send.request_fin();
        }
        if self.state == StreamState::Ready {
            self.state = StreamState::Open;
        }
        Ok(())
    }

    pub fn next_send_frame(&mut self, max_len: usize) -> Option<Frame> {
        let frame = self.send.next_frame(self.id, max_len)?;
        if let Frame::Stream { fin: true, .. } = frame {
            self.state = match self.state {
                StreamState::RecvClosed => StreamState::Closed,
                _ => StreamState::SendClosed,
            };
        }
        Some(frame)
    }

    pub fn on_stream_acked(&mut self, offset: u64, len: u64) {
        self.send.on_acked(offset, len);
    }

    pub fn has_pending_send(&self) -> bool {
        self.send.framed_offset < self.send.data.len() as u64
            || (self.send.fin_requested && !self.send.fin_framed)
    }

    /// Total bytes ever written to the send side, i.e. the final size a
    /// `RESET_STREAM` for this stream would carry (§4.11).
    pub fn total_written(&self) -> u64 {
        self.send.data.len() as u64
    }
}

/// Round-robin scheduler respecting an application-set per-stream priority
/// (lower value = scheduled first within a round), per §4.11.
pub struct Scheduler {
    order: Vec<u64>,
    cursor: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { order: Vec::new(), cursor: 0 }
    }

    pub fn register(&mut self, stream_id: u64) {
        if !self.order.contains(&stream_id) {
            self.order.push(stream_id);
        }
    }

    pub fn unregister(&mut self, stream_id: u64) {
        self.order.retain(|&id| id != stream_id);
        if self.cursor >= self.order.len() {
            self.cursor = 0;
        }
    }

    /// Returns stream IDs in round-robin order starting after the last
    /// dequeued stream, highest priority (lowest value) first within ties
    /// resolved by rotation.
    pub fn next_round(&mut self, streams: &std::collections::HashMap<u64, Stream>) -> Vec<u64> {
        if self.order.is_empty() {
            return Vec::new();
        }
        let mut sorted = self.order.clone();
        sorted.sort_by_key(|id| streams.get(id).map(|s| s.priority).unwrap_or(u8::MAX));
        let start = self.cursor % sorted.len().max(1);
        let mut result = Vec::with_capacity(sorted.len());
        result.extend_from_slice(&sorted[start..]);
        result.extend_from_slice(&sorted[..start]);
        self.cursor = (self.cursor + 1) % sorted.len().max(1);
        result
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_decodes_initiator_and_direction() {
        assert_eq!(classify(0), (Initiator::Client, Direction::Bidi));
        assert_eq!(classify(2), (Initiator::Client, Direction::Uni));
        assert_eq!(classify(1), (Initiator::Server, Direction::Bidi));
        assert_eq!(classify(3), (Initiator::Server, Direction::Uni));
    }

    #[test]
    fn reassembly_delivers_out_of_order_gapless_prefix() {
        let mut s = Stream::new(0, 1_000_000, 1_000_000);
        s.on_stream_frame(5, b"world", false).unwrap();
        assert_eq!(s.read().unwrap(), (vec![], false));
        s.on_stream_frame(0, b"hello", false).unwrap();
        let (bytes, fin) = s.read().unwrap();
        assert_eq!(bytes, b"helloworld");
        assert!(!fin);
    }

    #[test]
    fn inconsistent_retransmission_is_rejected() {
        let mut s = Stream::new(0, 1_000_000, 1_000_000);
        s.on_stream_frame(0, b"hello", false).unwrap();
        assert!(s.on_stream_frame(0, b"HELLO", false).is_err());
    }

    #[test]
    fn fin_only_delivered_once_all_bytes_read() {
        let mut s = Stream::new(0, 1_000_000, 1_000_000);
        s.on_stream_frame(0, b"hi", true).unwrap();
        let (bytes, fin) = s.read().unwrap();
        assert_eq!(bytes, b"hi");
        assert!(fin);
        assert_eq!(s.state(), StreamState::RecvClosed);
    }

    #[test]
    fn reset_surfaces_at_next_read() {
        let mut s = Stream::new(0, 1_000_000, 1_000_000);
        s.on_stream_frame(0, b"partial", false).unwrap();
        s.on_reset(42);
        assert!(matches!(s.read(), Err(ConnectionError::StreamReset(0, 42))));
    }

    #[test]
    fn write_does_not_itself_consume_flow_control_budget() {
        // Accounting happens once, at the point bytes are actually framed
        // onto the wire (the caller calls `send_flow.on_bytes_sent` there);
        // `write` only buffers, so a write larger than the peer's window
        // must not make `available()` go negative-via-saturation before a
        // single byte has been framed.
        let mut s = Stream::new(4, 1_000_000, 10);
        s.write(b"fifteen bytes!!", false).unwrap();
        assert_eq!(s.send_flow.available(), 10);
    }

    #[test]
    fn send_fin_only_emitted_after_all_bytes_framed() {
        let mut s = Stream::new(4, 1_000_000, 1_000_000);
        s.write(b"0123456789", true).unwrap();
        let f1 = s.next_send_frame(5).unwrap();
        assert!(matches!(f1, Frame::Stream { fin: false, .. }));
        let f2 = s.next_send_frame(5).unwrap();
        assert!(matches!(f2, Frame::Stream { fin: true, .. }));
        assert_eq!(s.state(), StreamState::SendClosed);
    }

    #[test]
    fn scheduler_rotates_round_robin() {
        let mut sched = Scheduler::new();
        sched.register(0);
        sched.register(4);
        sched.register(8);
        let streams = std::collections::HashMap::new();
        let first = sched.next_round(&streams);
        let second = sched.next_round(&streams);
        assert_ne!(first[0], second[0]);
    }
}
