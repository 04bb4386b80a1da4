//! Pacer (C9): a token bucket that spreads a congestion window's worth of
//! bytes across a round trip instead of releasing it in one burst.
//!
//! An initial burst is allowed unpaced coming out of quiescence, then sends
//! are spaced by `bytes / pacing_rate` until the bucket refills (§4.9).

use crate::congestion::MAX_DATAGRAM_SIZE;
use std::time::{Duration, Instant};

const INITIAL_BURST_PACKETS: usize = 10;

pub struct Pacer {
    capacity: f64,
    tokens: f64,
    pacing_rate: f64, // bytes/sec
    last_refill: Instant,
    burst_tokens: usize,
}

impl Pacer {
    pub fn new(now: Instant) -> Self {
        let initial_burst = INITIAL_BURST_PACKETS * MAX_DATAGRAM_SIZE;
        Self {
            capacity: initial_burst as f64,
            tokens: initial_burst as f64,
            pacing_rate: 0.0,
            last_refill: now,
            burst_tokens: INITIAL_BURST_PACKETS,
        }
    }

    /// Refills the bucket to `capacity = max(burst, cwnd*1.25/srtt * interval)`
    /// per §4.9, then reports whether `bytes` may be released immediately.
    pub fn update(&mut self, now: Instant, cwnd: usize, srtt: Duration, pacing_rate: f64) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.pacing_rate = pacing_rate;

        let _ = srtt; // capacity caps at a 1.25x headroom over one window's worth of bytes
        let burst = (INITIAL_BURST_PACKETS * MAX_DATAGRAM_SIZE) as f64;
        let rtt_worth = cwnd as f64 * 1.25;
        self.capacity = burst.max(rtt_worth);
        self.tokens = (self.tokens + pacing_rate * elapsed).min(self.capacity);
    }

    /// Called when a connection leaves quiescence (no bytes were in
    /// flight); grants a fresh unpaced burst bounded by the cwnd.
    pub fn on_leaving_quiescence(&mut self, cwnd_packets: usize) {
        self.burst_tokens = INITIAL_BURST_PACKETS.min(cwnd_packets.max(1));
    }

    /// Returns `Some(0)` (send now) if tokens/burst allow it, or
    /// `Some(delay)` with the wait before `bytes` may go out.
    pub fn next_send_delay(&mut self, bytes: usize) -> Duration {
        if self.burst_tokens > 0 {
            self.burst_tokens -= 1;
            return Duration::ZERO;
        }
        if self.tokens >= bytes as f64 {
            self.tokens -= bytes as f64;
            return Duration::ZERO;
        }
        if self.pacing_rate <= 0.0 {
            return Duration::ZERO;
        }
        let deficit = bytes as f64 - self.tokens;
        self.tokens = 0.0;
        Duration::from_secs_f64(deficit / self.pacing_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_burst_sends_without_delay() {
        let now = Instant::now();
        let mut p = Pacer::new(now);
        for _ in 0..INITIAL_BURST_PACKETS {
            assert_eq!(p.next_send_delay(MAX_DATAGRAM_SIZE), Duration::ZERO);
        }
    }

    #[test]
    fn exhausted_bucket_delays_by_deficit_over_rate() {
        let now = Instant::now();
        let mut p = Pacer::new(now);
        p.update(now, 10 * MAX_DATAGRAM_SIZE, Duration::from_millis(50), 10_000.0);
        for _ in 0..INITIAL_BURST_PACKETS {
            p.next_send_delay(MAX_DATAGRAM_SIZE);
        }
        p.tokens = 0.0;
        let delay = p.next_send_delay(MAX_DATAGRAM_SIZE);
        assert!(delay > Duration::ZERO);
    }

    #[test]
    fn leaving_quiescence_grants_fresh_burst() {
        let now = Instant::now();
        let mut p = Pacer::new(now);
        p.burst_tokens = 0;
        p.on_leaving_quiescence(20);
        assert_eq!(p.burst_tokens, INITIAL_BURST_PACKETS);
    }
}
