//! HyStart++ (RFC 9406): exits slow start early when per-round minimum RTT
//! stops improving, instead of waiting for a loss signal.

use std::time::Duration;

const MIN_RTT_THRESH: Duration = Duration::from_millis(4);
const MAX_RTT_THRESH: Duration = Duration::from_millis(16);
const N_RTT_SAMPLE: u32 = 8;

pub struct HyStart {
    last_round_min_rtt: Option<Duration>,
    current_round_min_rtt: Option<Duration>,
    rtt_sample_count: u32,
    triggered: bool,
}

impl HyStart {
    pub fn new() -> Self {
        Self { last_round_min_rtt: None, current_round_min_rtt: None, rtt_sample_count: 0, triggered: false }
    }

    pub fn triggered(&self) -> bool {
        self.triggered
    }

    pub fn reset(&mut self) {
        self.last_round_min_rtt = None;
        self.current_round_min_rtt = None;
        self.rtt_sample_count = 0;
        self.triggered = false;
    }

    /// Call on every ACK-driven RTT sample while in slow start. Returns
    /// `true` the round this sample causes HyStart++ to trigger.
    pub fn on_rtt_sample(&mut self, rtt: Duration) -> bool {
        if self.triggered {
            return false;
        }
        self.current_round_min_rtt = Some(self.current_round_min_rtt.map_or(rtt, |m| m.min(rtt)));
        self.rtt_sample_count += 1;

        if self.rtt_sample_count < N_RTT_SAMPLE {
            return false;
        }

        if let (Some(last), Some(curr)) = (self.last_round_min_rtt, self.current_round_min_rtt) {
            let threshold = (last / 8).clamp(MIN_RTT_THRESH, MAX_RTT_THRESH);
            if curr >= last + threshold {
                self.triggered = true;
                return true;
            }
        }
        self.last_round_min_rtt = self.current_round_min_rtt;
        self.current_round_min_rtt = None;
        self.rtt_sample_count = 0;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_when_min_rtt_stops_improving() {
        let mut h = HyStart::new();
        for _ in 0..N_RTT_SAMPLE {
            assert!(!h.on_rtt_sample(Duration::from_millis(20)));
        }
        let mut triggered = false;
        for _ in 0..N_RTT_SAMPLE {
            if h.on_rtt_sample(Duration::from_millis(40)) {
                triggered = true;
            }
        }
        assert!(triggered);
    }

    #[test]
    fn does_not_trigger_while_rtt_keeps_improving() {
        let mut h = HyStart::new();
        let mut rtt = Duration::from_millis(50);
        for _ in 0..40 {
            h.on_rtt_sample(rtt);
            rtt -= Duration::from_micros(200);
        }
        assert!(!h.triggered());
    }
}
