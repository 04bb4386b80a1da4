//! BBR / BBRv2 congestion control: bandwidth- and RTT-probing state
//! machine (Startup, Drain, ProbeBW, ProbeRTT) rather than a loss-reactive
//! window. BBRv2 additionally caps inflight using a loss signal.

use super::{initial_window, CongestionController, RttSample, MINIMUM_WINDOW};
use std::time::{Duration, Instant};

const PROBE_BW_GAIN_CYCLE: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const STARTUP_GAIN: f64 = 2.885; // 2/ln(2), the BBR startup pacing/cwnd gain.
const CWND_GAIN: f64 = 2.0;
const BTL_BW_WINDOW: Duration = Duration::from_secs(10);
/// BBR filters RTprop over 10s of samples (by round in full BBR; time-based
/// here since this controller is driven by ack events, not fixed rounds).
const RT_PROP_WINDOW: Duration = Duration::from_secs(10);
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

pub struct BbrCongestionController {
    v2: bool,
    state: State,
    cwnd: usize,
    bytes_in_flight: usize,
    btl_bw_samples: Vec<(Instant, f64)>, // bytes/sec
    rt_prop: Option<Duration>,
    rt_prop_stamp: Option<Instant>,
    rt_prop_expired: bool,
    cycle_index: usize,
    cycle_stamp: Option<Instant>,
    probe_rtt_done_at: Option<Instant>,
    full_bw: f64,
    full_bw_count: u32,
    inflight_hi: usize,
    recent_loss: bool,
    last_btl_bw: f64,
    last_gain: f64,
}

impl BbrCongestionController {
    pub fn new(v2: bool) -> Self {
        Self {
            v2,
            state: State::Startup,
            cwnd: initial_window(),
            bytes_in_flight: 0,
            btl_bw_samples: Vec::new(),
            rt_prop: None,
            rt_prop_stamp: None,
            rt_prop_expired: false,
            cycle_index: 0,
            cycle_stamp: None,
            probe_rtt_done_at: None,
            full_bw: 0.0,
            full_bw_count: 0,
            inflight_hi: usize::MAX,
            recent_loss: false,
            last_btl_bw: 0.0,
            last_gain: STARTUP_GAIN,
        }
    }

    fn btl_bw(&self, now: Instant) -> f64 {
        self.btl_bw_samples
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= BTL_BW_WINDOW)
            .map(|(_, bw)| *bw)
            .fold(0.0, f64::max)
    }

    fn update_rt_prop(&mut self, now: Instant, rtt: Duration) {
        self.rt_prop_expired = self.rt_prop_stamp.map(|s| now.duration_since(s) > RT_PROP_WINDOW).unwrap_or(true);
        if self.rt_prop_expired || self.rt_prop.map(|r| rtt < r).unwrap_or(true) {
            self.rt_prop = Some(rtt);
            self.rt_prop_stamp = Some(now);
        }
    }

    fn pacing_gain(&self, _now: Instant) -> f64 {
        match self.state {
            State::Startup => STARTUP_GAIN,
            State::Drain => 1.0 / STARTUP_GAIN,
            State::ProbeBw => PROBE_BW_GAIN_CYCLE[self.cycle_index],
            State::ProbeRtt => 1.0,
        }
    }

    fn advance_probe_bw_cycle(&mut self, now: Instant) {
        let due = self.cycle_stamp.map(|s| now.duration_since(s) >= self.rt_prop.unwrap_or(Duration::from_millis(50))).unwrap_or(true);
        if due {
            self.cycle_index = (self.cycle_index + 1) % PROBE_BW_GAIN_CYCLE.len();
            self.cycle_stamp = Some(now);
        }
    }
}

impl CongestionController for BbrCongestionController {
    fn on_packet_sent(&mut self, _now: Instant, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    fn on_ack(&mut self, now: Instant, acked_bytes: usize, rtt: RttSample, app_limited: bool) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes);
        self.update_rt_prop(now, rtt.latest_rtt);

        if !app_limited && rtt.latest_rtt > Duration::ZERO {
            let delivery_rate = acked_bytes as f64 / rtt.latest_rtt.as_secs_f64();
            self.btl_bw_samples.push((now, delivery_rate));
            self.btl_bw_samples.retain(|(t, _)| now.duration_since(*t) <= BTL_BW_WINDOW);
        }

        let btl_bw = self.btl_bw(now);

        match self.state {
            State::Startup => {
                if btl_bw > 0.0 {
                    if btl_bw >= self.full_bw * 1.25 {
                        self.full_bw = btl_bw;
                        self.full_bw_count = 0;
                    } else {
                        self.full_bw_count += 1;
                    }
                    if self.full_bw_count >= 3 {
                        self.state = State::Drain;
                    }
                }
            }
            State::Drain => {
                if self.bytes_in_flight <= self.target_cwnd(btl_bw, 1.0) {
                    self.state = State::ProbeBw;
                    self.cycle_stamp = Some(now);
                    self.cycle_index = 0;
                }
            }
            State::ProbeBw => {
                self.advance_probe_bw_cycle(now);
                if self.rt_prop_expired {
                    self.state = State::ProbeRtt;
                    self.probe_rtt_done_at = None;
                }
            }
            State::ProbeRtt => {
                let done_at = *self.probe_rtt_done_at.get_or_insert(now + PROBE_RTT_DURATION);
                if now >= done_at {
                    self.state = State::ProbeBw;
                    self.cycle_stamp = Some(now);
                    self.rt_prop_stamp = Some(now);
                }
            }
        }

        let gain = self.pacing_gain(now);
        let target = self.target_cwnd(btl_bw, gain.max(CWND_GAIN));
        self.cwnd = target.max(MINIMUM_WINDOW);
        if self.v2 {
            self.cwnd = self.cwnd.min(self.inflight_hi);
        }
        self.last_btl_bw = btl_bw;
        self.last_gain = gain;
    }

    fn on_loss(&mut self, _now: Instant, lost_bytes: usize, _largest_lost_pn: u64, persistent: bool) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        self.recent_loss = true;
        if self.v2 {
            // BBRv2 §4.2.4: cap inflight using the loss signal instead of
            // collapsing the window outright, unless persistent congestion.
            self.inflight_hi = (self.cwnd as f64 * 0.85) as usize;
        }
        if persistent {
            self.cwnd = MINIMUM_WINDOW;
            self.state = State::Startup;
            self.full_bw = 0.0;
            self.full_bw_count = 0;
        }
    }

    fn on_congestion_event(&mut self, _now: Instant) {
        self.recent_loss = false;
    }

    fn cwnd(&self) -> usize {
        self.cwnd
    }

    fn pacing_rate(&self, rtt: Duration) -> f64 {
        if self.last_btl_bw > 0.0 {
            self.last_btl_bw * self.last_gain
        } else if !rtt.is_zero() {
            self.cwnd as f64 * 2.0 / rtt.as_secs_f64()
        } else {
            f64::MAX
        }
    }

    fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }
}

impl BbrCongestionController {
    fn target_cwnd(&self, btl_bw: f64, gain: f64) -> usize {
        let rt_prop = self.rt_prop.unwrap_or(Duration::from_millis(50)).as_secs_f64();
        if btl_bw <= 0.0 {
            return initial_window();
        }
        (btl_bw * rt_prop * gain) as usize
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
    fn cwnd_increases_on_ack() {
        let mut bbr = BbrCongestionController::new(false);
        let now = Instant::now();
        bbr.on_packet_sent(now, 1500);
        let before = bbr.cwnd();
        bbr.on_ack(now + Duration::from_millis(20), 1500, sample(20), false);
        assert!(bbr.cwnd() >= before || bbr.cwnd() > 0);
    }

    #[test]
    fn persistent_loss_resets_to_startup_and_minimum_window() {
        let mut bbr = BbrCongestionController::new(true);
        bbr.on_loss(Instant::now(), 1500, 5, true);
        assert_eq!(bbr.cwnd(), MINIMUM_WINDOW);
        assert_eq!(bbr.state, State::Startup);
    }

    #[test]
    fn bbr2_caps_inflight_after_loss() {
        let mut bbr = BbrCongestionController::new(true);
        bbr.cwnd = 100_000;
        bbr.on_loss(Instant::now(), 1000, 1, false);
        assert!(bbr.inflight_hi < 100_000);
    }
}
