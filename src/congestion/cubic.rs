//! CUBIC congestion control (RFC 9438), with HyStart++ slow-start exit.

use super::{hystart::HyStart, initial_window, CongestionController, RttSample, MAX_DATAGRAM_SIZE, MINIMUM_WINDOW};
use std::time::{Duration, Instant};

const BETA: f64 = 0.7;
const C: f64 = 0.4;

pub struct CubicCongestionController {
    cwnd: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    w_max: f64,
    congestion_epoch: Option<Instant>,
    k: f64,
    hystart: HyStart,
    in_slow_start: bool,
}

impl CubicCongestionController {
    pub fn new() -> Self {
        Self {
            cwnd: initial_window(),
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            w_max: 0.0,
            congestion_epoch: None,
            k: 0.0,
            hystart: HyStart::new(),
            in_slow_start: true,
        }
    }

    fn cubic_window(&self, t: f64) -> f64 {
        C * (t - self.k).powi(3) + self.w_max
    }
}

impl Default for CubicCongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController for CubicCongestionController {
    fn on_packet_sent(&mut self, _now: Instant, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    fn on_ack(&mut self, now: Instant, acked_bytes: usize, rtt: RttSample, app_limited: bool) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes);
        if app_limited {
            return;
        }

        if self.in_slow_start {
            if self.hystart.on_rtt_sample(rtt.latest_rtt) {
                self.in_slow_start = false;
                self.ssthresh = self.cwnd;
            } else {
                self.cwnd += acked_bytes;
                if self.cwnd >= self.ssthresh {
                    self.in_slow_start = false;
                }
                return;
            }
        }

        let epoch = *self.congestion_epoch.get_or_insert(now);
        let t = now.duration_since(epoch).as_secs_f64();
        let target = self.cubic_window(t).max(self.cwnd as f64);
        let segments_acked = (acked_bytes as f64 / MAX_DATAGRAM_SIZE as f64).max(1.0);
        let cubic_increment = ((target - self.cwnd as f64) / self.cwnd as f64) * MAX_DATAGRAM_SIZE as f64;
        self.cwnd = (self.cwnd as f64 + cubic_increment.max(0.0) * segments_acked / segments_acked.max(1.0)) as usize;
        self.cwnd = self.cwnd.max(MINIMUM_WINDOW);
    }

    fn on_loss(&mut self, now: Instant, lost_bytes: usize, _largest_lost_pn: u64, persistent: bool) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        if persistent {
            self.cwnd = MINIMUM_WINDOW;
            self.w_max = 0.0;
            self.congestion_epoch = None;
            self.in_slow_start = false;
            self.hystart.reset();
            return;
        }
        self.w_max = self.cwnd as f64;
        self.cwnd = ((self.cwnd as f64 * BETA) as usize).max(MINIMUM_WINDOW);
        self.ssthresh = self.cwnd;
        self.k = (self.w_max * (1.0 - BETA) / C).cbrt();
        self.congestion_epoch = Some(now);
        self.in_slow_start = false;
    }

    fn on_congestion_event(&mut self, now: Instant) {
        self.congestion_epoch = Some(now);
    }

    fn cwnd(&self) -> usize {
        self.cwnd
    }

    fn pacing_rate(&self, rtt: Duration) -> f64 {
        if rtt.is_zero() {
            return f64::MAX;
        }
        self.cwnd as f64 * 1.25 / rtt.as_secs_f64()
    }

    fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ms: u64) -> RttSample {
        let d = Duration::from_millis(ms);
        RttSample { latest_rtt: d, smoothed_rtt: d, min_rtt: d }
    }

    #[test]
    fn slow_start_grows_cwnd_per_ack() {
        let mut c = CubicCongestionController::new();
        let before = c.cwnd();
        c.on_ack(Instant::now(), MAX_DATAGRAM_SIZE, sample(20), false);
        assert!(c.cwnd() > before);
    }

    #[test]
    fn loss_multiplicatively_decreases_cwnd() {
        let mut c = CubicCongestionController::new();
        let before = c.cwnd();
        c.on_loss(Instant::now(), MAX_DATAGRAM_SIZE, 10, false);
        assert!(c.cwnd() < before);
        assert!(c.cwnd() >= MINIMUM_WINDOW);
    }

    #[test]
    fn persistent_congestion_collapses_to_minimum() {
        let mut c = CubicCongestionController::new();
        c.on_loss(Instant::now(), MAX_DATAGRAM_SIZE, 10, true);
        assert_eq!(c.cwnd(), MINIMUM_WINDOW);
    }

    #[test]
    fn bytes_in_flight_tracks_sends_and_acks() {
        let mut c = CubicCongestionController::new();
        let now = Instant::now();
        c.on_packet_sent(now, 1000);
        c.on_packet_sent(now, 1000);
        assert_eq!(c.bytes_in_flight(), 2000);
        c.on_ack(now, 1000, sample(20), false);
        assert_eq!(c.bytes_in_flight(), 1000);
    }
}
