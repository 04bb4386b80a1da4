//! Prometheus metrics for the transport and HTTP/3 layers.
//!
//! Exported metrics:
//! - `quic_bytes_sent_total` / `quic_bytes_received_total`: UDP payload bytes.
//! - `quic_packets_lost_total`: packets RFC 9002 loss detection declared lost.
//! - `quic_pto_total`: number of PTO timer expirations.
//! - `quic_key_updates_total`: application key-update events.
//! - `quic_cwnd_bytes`: current congestion window.
//! - `quic_rtt_microseconds`: smoothed RTT.
//! - `quic_streams_open`: currently open stream count.
//! - `quic_path_validations_total`: successful path validations.

use prometheus::{register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder};

lazy_static::lazy_static! {
    pub static ref BYTES_SENT: IntCounter =
        register_int_counter!("quic_bytes_sent_total", "Total UDP bytes sent").unwrap();
    pub static ref BYTES_RECEIVED: IntCounter =
        register_int_counter!("quic_bytes_received_total", "Total UDP bytes received").unwrap();
    pub static ref PACKETS_LOST: IntCounter =
        register_int_counter!("quic_packets_lost_total", "Packets declared lost").unwrap();
    pub static ref PTO_EVENTS: IntCounter =
        register_int_counter!("quic_pto_total", "PTO timer expirations").unwrap();
    pub static ref KEY_UPDATES: IntCounter =
        register_int_counter!("quic_key_updates_total", "Application key updates performed").unwrap();
    pub static ref CWND_BYTES: IntGauge =
        register_int_gauge!("quic_cwnd_bytes", "Current congestion window").unwrap();
    pub static ref RTT_MICROS: IntGauge =
        register_int_gauge!("quic_rtt_microseconds", "Smoothed round-trip time").unwrap();
    pub static ref STREAMS_OPEN: IntGauge =
        register_int_gauge!("quic_streams_open", "Currently open streams").unwrap();
    pub static ref PATH_VALIDATIONS: IntCounter =
        register_int_counter!("quic_path_validations_total", "Successful path validations").unwrap();
}

/// Serves the Prometheus text exposition format on `addr`, in a background
/// thread, for as long as the process runs.
pub fn serve(addr: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::net::TcpListener;
    let listener = TcpListener::bind(addr)?;
    std::thread::spawn(move || {
        let encoder = TextEncoder::new();
        for stream in listener.incoming() {
            if let Ok(mut s) = stream {
                let metrics = prometheus::gather();
                let mut buf = Vec::new();
                if encoder.encode(&metrics, &mut buf).is_ok() {
                    let _ = s.write_all(&buf);
                }
            }
        }
    });
    Ok(())
}

/// Logs the current metrics snapshot at info level, for one-shot CLI runs
/// that don't keep a metrics server alive.
pub fn flush() {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&metrics, &mut buf).is_ok() {
        log::info!("\n{}", String::from_utf8_lossy(&buf));
    }
}
