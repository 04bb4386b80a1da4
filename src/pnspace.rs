//! Packet-number spaces (C6): one per encryption level, tracking received
//! ranges for ACK generation and duplicate detection.

use crate::frame::{EcnCounts, Frame};
use std::time::{Duration, Instant};

/// Ranges are kept compressed and capped; beyond this the oldest (lowest)
/// range is dropped since peers stop needing acks for ancient packets.
const MAX_ACK_RANGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Initial,
    Handshake,
    Application,
}

/// One packet-number space's receive-side bookkeeping and send-side
/// counter. Ranges are stored high-to-low, non-adjacent, non-overlapping.
pub struct PacketNumberSpace {
    space: Space,
    next_send_pn: u64,
    largest_received: Option<u64>,
    largest_acked_by_peer: Option<u64>,
    received_ranges: Vec<(u64, u64)>,
    ecn_counts: EcnCounts,
    ack_deadline: Option<Instant>,
    max_ack_delay: Duration,
}

impl PacketNumberSpace {
    pub fn new(space: Space, max_ack_delay: Duration) -> Self {
        Self {
            space,
            next_send_pn: 0,
            largest_received: None,
            largest_acked_by_peer: None,
            received_ranges: Vec::new(),
            ecn_counts: EcnCounts::default(),
            ack_deadline: None,
            max_ack_delay,
        }
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn next_send_pn(&mut self) -> u64 {
        let pn = self.next_send_pn;
        self.next_send_pn += 1;
        pn
    }

    pub fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    pub fn largest_acked_by_peer(&self) -> Option<u64> {
        self.largest_acked_by_peer
    }

    pub fn note_peer_ack(&mut self, largest_ack: u64) {
        self.largest_acked_by_peer = Some(match self.largest_acked_by_peer {
            Some(cur) => cur.max(largest_ack),
            None => largest_ack,
        });
    }

    /// Returns `true` if `pn` had not already been received (i.e. this is
    /// not a duplicate). Updates the range set and ack deadline.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, ecn: Option<u8>, now: Instant) -> bool {
        if self.contains(pn) {
            return false;
        }
        self.insert(pn);
        let out_of_order = self.largest_received.map(|l| pn < l).unwrap_or(false);
        self.largest_received = Some(self.largest_received.map_or(pn, |l| l.max(pn)));
        match ecn {
            Some(0b10) => self.ecn_counts.ect0 += 1,
            Some(0b01) => self.ecn_counts.ect1 += 1,
            Some(0b11) => self.ecn_counts.ce += 1,
            _ => {}
        }
        if ack_eliciting {
            let ce_marked = matches!(ecn, Some(0b11));
            if out_of_order || ce_marked || self.ack_deadline.is_none() {
                self.ack_deadline = Some(now);
            } else {
                self.ack_deadline.get_or_insert(now + self.max_ack_delay);
            }
        }
        true
    }

    fn contains(&self, pn: u64) -> bool {
        self.received_ranges.iter().any(|&(low, high)| pn >= low && pn <= high)
    }

    fn insert(&mut self, pn: u64) {
        let mut merged = false;
        for r in self.received_ranges.iter_mut() {
            if pn + 1 == r.0 {
                r.0 = pn;
                merged = true;
                break;
            }
            if r.1 + 1 == pn {
                r.1 = pn;
                merged = true;
                break;
            }
        }
        if !merged {
            self.received_ranges.push((pn, pn));
        }
        self.received_ranges.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        self.coalesce();
        if self.received_ranges.len() > MAX_ACK_RANGES {
            self.received_ranges.truncate(MAX_ACK_RANGES);
        }
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.received_ranges.len() {
            let (low_a, high_a) = self.received_ranges[i];
            let (low_b, high_b) = self.received_ranges[i + 1];
            if low_a <= high_b + 1 {
                self.received_ranges[i] = (low_a.min(low_b), high_a.max(high_b));
                self.received_ranges.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    pub fn ack_is_due(&self, now: Instant) -> bool {
        self.ack_deadline.map(|d| now >= d).unwrap_or(false)
    }

    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }

    /// Builds the ACK frame for the current receive state, per §4.6.
    /// `ack_delay_exponent` is the negotiated transport parameter (default
    /// 3, RFC 9000 §18.2).
    pub fn build_ack(&self, ack_delay: Duration, ack_delay_exponent: u8) -> Option<Frame> {
        let largest_ack = self.largest_received?;
        let ack_delay_us = ack_delay.as_micros() as u64 >> ack_delay_exponent;
        let ecn = if self.ecn_counts.ect0 > 0 || self.ecn_counts.ect1 > 0 || self.ecn_counts.ce > 0 {
            Some(self.ecn_counts)
        } else {
            None
        };
        Some(Frame::Ack {
            largest_ack,
            ack_delay: ack_delay_us,
            ranges: self.received_ranges.clone(),
            ecn,
        })
    }

    pub fn on_ack_sent(&mut self) {
        self.ack_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> PacketNumberSpace {
        PacketNumberSpace::new(Space::Application, Duration::from_millis(25))
    }

    #[test]
    fn duplicate_packet_is_rejected() {
        let mut s = space();
        let now = Instant::now();
        assert!(s.on_packet_received(5, true, None, now));
        assert!(!s.on_packet_received(5, true, None, now));
    }

    #[test]
    fn ranges_coalesce_into_single_run() {
        let mut s = space();
        let now = Instant::now();
        for pn in [1, 2, 3, 4, 5] {
            s.on_packet_received(pn, true, None, now);
        }
        assert_eq!(s.received_ranges, vec![(1, 5)]);
    }

    #[test]
    fn out_of_order_packet_triggers_immediate_ack() {
        let mut s = space();
        let now = Instant::now();
        s.on_packet_received(0, true, None, now);
        s.on_packet_received(1, true, None, now);
        assert!(s.ack_deadline().unwrap() > now || s.ack_deadline() == Some(now));
        s.on_ack_sent();
        s.on_packet_received(5, true, None, now); // gap: out of order relative to contiguity
        assert_eq!(s.ack_deadline(), Some(now));
    }

    #[test]
    fn build_ack_reports_ecn_when_present() {
        let mut s = space();
        let now = Instant::now();
        s.on_packet_received(1, true, Some(0b10), now);
        let ack = s.build_ack(Duration::from_millis(1), 3).unwrap();
        match ack {
            Frame::Ack { ecn: Some(ecn), .. } => assert_eq!(ecn.ect0, 1),
            _ => panic!("expected ecn counts"),
        }
    }
}
