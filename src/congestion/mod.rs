//! Congestion controller (C8): a narrow trait contract with pluggable
//! CUBIC, BBR and BBRv2 implementations, per RFC 9438 / the BBR draft.

mod bbr;
mod cubic;
mod hystart;

pub use bbr::BbrCongestionController;
pub use cubic::CubicCongestionController;

use std::time::Instant;

pub const MAX_DATAGRAM_SIZE: usize = 1452;
/// `min(10*MaxDatagramSize, max(2*MaxDatagramSize, 14720))`, RFC 9002 §7.2.
pub fn initial_window() -> usize {
    (10 * MAX_DATAGRAM_SIZE).min((2 * MAX_DATAGRAM_SIZE).max(14720))
}
pub const MINIMUM_WINDOW: usize = 2 * MAX_DATAGRAM_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct RttSample {
    pub latest_rtt: std::time::Duration,
    pub smoothed_rtt: std::time::Duration,
    pub min_rtt: std::time::Duration,
}

/// The contract every congestion controller implements. `now` is supplied
/// by the caller (the externally injected clock, §6) rather than read
/// internally, keeping the controllers deterministic and testable.
pub trait CongestionController: Send {
    fn on_packet_sent(&mut self, now: Instant, bytes: usize);
    fn on_ack(&mut self, now: Instant, acked_bytes: usize, rtt: RttSample, app_limited: bool);
    fn on_loss(&mut self, now: Instant, lost_bytes: usize, largest_lost_pn: u64, persistent: bool);
    fn on_congestion_event(&mut self, now: Instant);
    fn cwnd(&self) -> usize;
    fn pacing_rate(&self, rtt: std::time::Duration) -> f64;
    fn bytes_in_flight(&self) -> usize;
}

/// Which pluggable controller to instantiate, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Cubic,
    Bbr,
    Bbr2,
}

pub fn new_controller(algorithm: Algorithm) -> Box<dyn CongestionController> {
    match algorithm {
        Algorithm::Cubic => Box::new(CubicCongestionController::new()),
        Algorithm::Bbr => Box::new(BbrCongestionController::new(false)),
        Algorithm::Bbr2 => Box::new(BbrCongestionController::new(true)),
    }
}
