//! Loss detection, RTT estimation and the PTO timer (C7), per RFC 9002.

use crate::congestion::{CongestionController, RttSample};
use crate::frame::Frame;
use crate::pnspace::Space;
use std::time::{Duration, Instant};

const INITIAL_SRTT: Duration = Duration::from_millis(333);
const K_TIME_THRESHOLD: f64 = 9.0 / 8.0;
const K_GRANULARITY: Duration = Duration::from_millis(1);
const K_PACKET_THRESHOLD: u64 = 3;
const K_PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

pub struct RttEstimator {
    latest_rtt: Duration,
    smoothed_rtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
    has_sample: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: INITIAL_SRTT,
            rttvar: INITIAL_SRTT / 2,
            min_rtt: Duration::MAX,
            has_sample: false,
        }
    }

    pub fn update(&mut self, raw_rtt: Duration, ack_delay: Duration, max_ack_delay: Duration) {
        self.latest_rtt = raw_rtt;
        self.min_rtt = self.min_rtt.min(raw_rtt);

        let adjusted_rtt = if raw_rtt >= self.min_rtt + ack_delay.min(max_ack_delay) {
            raw_rtt - ack_delay.min(max_ack_delay)
        } else {
            raw_rtt
        };

        if !self.has_sample {
            self.smoothed_rtt = adjusted_rtt;
            self.rttvar = adjusted_rtt / 2;
            self.has_sample = true;
            return;
        }

        let diff = self.smoothed_rtt.abs_diff(adjusted_rtt);
        self.rttvar = self.rttvar.mul_f64(0.75) + diff.mul_f64(0.25);
        self.smoothed_rtt = self.smoothed_rtt.mul_f64(0.875) + adjusted_rtt.mul_f64(0.125);
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn min_rtt(&self) -> Duration {
        if self.min_rtt == Duration::MAX {
            self.smoothed_rtt
        } else {
            self.min_rtt
        }
    }

    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    pub fn sample(&self) -> RttSample {
        RttSample { latest_rtt: self.latest_rtt, smoothed_rtt: self.smoothed_rtt, min_rtt: self.min_rtt() }
    }

    /// RFC 9002 §6.2.1.
    pub fn pto(&self, max_ack_delay: Duration) -> Duration {
        self.smoothed_rtt + (self.rttvar * 4).max(K_GRANULARITY) + max_ack_delay
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub space: Space,
    pub sent_time: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    pub frames: Vec<Frame>,
}

pub struct LossRecovery {
    rtt: RttEstimator,
    sent_packets: Vec<SentPacket>,
    pto_count: u32,
    max_ack_delay: Duration,
}

pub struct LossOutcome {
    pub lost: Vec<SentPacket>,
    pub acked: Vec<SentPacket>,
    pub newly_acked_bytes: usize,
}

impl LossRecovery {
    pub fn new(max_ack_delay: Duration) -> Self {
        Self { rtt: RttEstimator::new(), sent_packets: Vec::new(), pto_count: 0, max_ack_delay }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        self.sent_packets.push(packet);
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.sent_packets.iter().filter(|p| p.in_flight).map(|p| p.size).sum()
    }

    /// Processes an incoming ACK frame for `space`: updates RTT from the
    /// newly-acked largest packet, detects losses among older unacked
    /// packets, and drains acked/lost entries from the sent-packet log.
    pub fn on_ack_received(
        &mut self,
        space: Space,
        largest_ack: u64,
        ack_delay: Duration,
        ranges: &[(u64, u64)],
        now: Instant,
        congestion: &mut dyn CongestionController,
    ) -> LossOutcome {
        let mut acked = Vec::new();
        let is_newly_acked = |pn: u64, ranges: &[(u64, u64)]| ranges.iter().any(|&(lo, hi)| pn >= lo && pn <= hi);

        let (to_keep, to_remove): (Vec<_>, Vec<_>) = self
            .sent_packets
            .drain(..)
            .partition(|p| !(p.space == space && is_newly_acked(p.packet_number, ranges)));
        self.sent_packets = to_keep;
        acked.extend(to_remove);
        acked.sort_by_key(|p| p.packet_number);

        let mut newly_acked_bytes = 0;
        if let Some(largest_pkt) = acked.iter().find(|p| p.packet_number == largest_ack) {
            let raw_rtt = now.duration_since(largest_pkt.sent_time);
            self.rtt.update(raw_rtt, ack_delay, self.max_ack_delay);
            self.pto_count = 0;
        }
        for p in &acked {
            if p.in_flight {
                newly_acked_bytes += p.size;
            }
        }
        if newly_acked_bytes > 0 {
            congestion.on_ack(now, newly_acked_bytes, self.rtt.sample(), false);
        }

        let lost = self.detect_losses(space, largest_ack, now);
        let lost_bytes: usize = lost.iter().map(|p| p.size).sum();
        if lost_bytes > 0 {
            let largest_lost_pn = lost.iter().map(|p| p.packet_number).max().unwrap_or(0);
            let persistent = self.is_persistent_congestion(&lost);
            congestion.on_loss(now, lost_bytes, largest_lost_pn, persistent);
        }

        LossOutcome { lost, acked, newly_acked_bytes }
    }

    fn detect_losses(&mut self, space: Space, largest_acked: u64, now: Instant) -> Vec<SentPacket> {
        let loss_delay = (self.rtt.smoothed_rtt().max(self.rtt.latest_rtt())).mul_f64(K_TIME_THRESHOLD).max(K_GRANULARITY);
        let (still_in_flight, lost): (Vec<_>, Vec<_>) = self.sent_packets.drain(..).partition(|p| {
            if p.space != space || p.packet_number >= largest_acked {
                return true;
            }
            let too_old = now.duration_since(p.sent_time) > loss_delay;
            let too_far_behind = largest_acked - p.packet_number >= K_PACKET_THRESHOLD;
            !(too_old || too_far_behind)
        });
        self.sent_packets = still_in_flight;
        lost
    }

    fn is_persistent_congestion(&self, lost: &[SentPacket]) -> bool {
        if lost.len() < 2 {
            return false;
        }
        let threshold = (self.rtt.smoothed_rtt() + self.rtt.rttvar() * 4 + self.max_ack_delay)
            * K_PERSISTENT_CONGESTION_THRESHOLD;
        let earliest = lost.iter().map(|p| p.sent_time).min().unwrap();
        let latest = lost.iter().map(|p| p.sent_time).max().unwrap();
        latest.duration_since(earliest) > threshold
    }

    /// RFC 9002 §6.2.1: PTO fires after `pto * 2^pto_count` since the last
    /// ack-eliciting packet was sent, while any is in flight.
    pub fn pto_deadline(&self) -> Option<Instant> {
        let last_eliciting = self.sent_packets.iter().filter(|p| p.ack_eliciting).map(|p| p.sent_time).max()?;
        let pto = self.rtt.pto(self.max_ack_delay) * 2u32.pow(self.pto_count);
        Some(last_eliciting + pto)
    }

    pub fn on_pto_fired(&mut self) {
        self.pto_count += 1;
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::CubicCongestionController;

    fn pkt(pn: u64, space: Space, sent_time: Instant, size: usize) -> SentPacket {
        SentPacket { packet_number: pn, space, sent_time, size, ack_eliciting: true, in_flight: true, frames: vec![] }
    }

    #[test]
    fn rtt_sample_initializes_then_smooths() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO, Duration::from_millis(25));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        rtt.update(Duration::from_millis(120), Duration::ZERO, Duration::from_millis(25));
        assert!(rtt.smoothed_rtt() > Duration::from_millis(100));
    }

    #[test]
    fn older_unacked_packet_beyond_threshold_is_declared_lost() {
        let mut recovery = LossRecovery::new(Duration::from_millis(25));
        let mut cc = CubicCongestionController::new();
        let t0 = Instant::now();
        recovery.on_packet_sent(pkt(1, Space::Application, t0, 1200));
        recovery.on_packet_sent(pkt(2, Space::Application, t0, 1200));
        recovery.on_packet_sent(pkt(3, Space::Application, t0, 1200));
        recovery.on_packet_sent(pkt(4, Space::Application, t0, 1200));
        // Packet 1 is 3 behind packet 4 once 4 is acked -> packet threshold loss.
        let outcome = recovery.on_ack_received(
            Space::Application,
            4,
            Duration::ZERO,
            &[(4, 4)],
            t0 + Duration::from_millis(10),
            &mut cc,
        );
        assert!(outcome.lost.iter().any(|p| p.packet_number == 1));
    }

    #[test]
    fn pto_deadline_grows_with_backoff() {
        let mut recovery = LossRecovery::new(Duration::from_millis(25));
        let t0 = Instant::now();
        recovery.on_packet_sent(pkt(1, Space::Application, t0, 1200));
        let first = recovery.pto_deadline().unwrap();
        recovery.on_pto_fired();
        let second = recovery.pto_deadline().unwrap();
        assert!(second > first);
    }
}
