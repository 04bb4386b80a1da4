//! Public connection statistics surfaced by `Connection::stats()` (§6).

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub rtt: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub bytes_in_flight: usize,
    pub cwnd: usize,
    pub pacing_rate: f64,
    pub stream_count: usize,
}
