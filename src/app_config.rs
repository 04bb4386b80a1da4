//! Application-level configuration, parsed from a TOML file (§6 transport
//! parameters plus the congestion-control algorithm choice).

use crate::congestion::Algorithm;
use serde::Deserialize;
use std::path::Path;

fn default_max_idle_timeout_ms() -> u64 {
    30_000
}
fn default_max_udp_payload_size() -> u64 {
    1200
}
fn default_initial_max_data() -> u64 {
    10 * 1024 * 1024
}
fn default_initial_max_stream_data() -> u64 {
    1024 * 1024
}
fn default_initial_max_streams() -> u64 {
    100
}
fn default_ack_delay_exponent() -> u8 {
    3
}
fn default_max_ack_delay_ms() -> u64 {
    25
}
fn default_active_connection_id_limit() -> u64 {
    4
}
fn default_max_datagram_frame_size() -> u64 {
    65527
}
fn default_congestion_algorithm() -> String {
    "cubic".to_string()
}

/// The subset of RFC 9000 §18 transport parameters this crate emits and
/// parses, per §6. `stateless_reset_token` and `original_destination_
/// connection_id` are server-only and therefore absent from the client
/// config surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportParameters {
    #[serde(rename = "max_idle_timeout_ms")]
    pub max_idle_timeout_ms: u64,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay_ms: u64,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: u64,
    pub max_datagram_frame_size: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            max_idle_timeout_ms: default_max_idle_timeout_ms(),
            max_udp_payload_size: default_max_udp_payload_size(),
            initial_max_data: default_initial_max_data(),
            initial_max_stream_data_bidi_local: default_initial_max_stream_data(),
            initial_max_stream_data_bidi_remote: default_initial_max_stream_data(),
            initial_max_stream_data_uni: default_initial_max_stream_data(),
            initial_max_streams_bidi: default_initial_max_streams(),
            initial_max_streams_uni: default_initial_max_streams(),
            ack_delay_exponent: default_ack_delay_exponent(),
            max_ack_delay_ms: default_max_ack_delay_ms(),
            disable_active_migration: false,
            active_connection_id_limit: default_active_connection_id_limit(),
            max_datagram_frame_size: default_max_datagram_frame_size(),
        }
    }
}

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportParameters,
    #[serde(default = "default_congestion_algorithm")]
    pub congestion_control: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { transport: TransportParameters::default(), congestion_control: default_congestion_algorithm() }
    }
}

impl AppConfig {
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn congestion_algorithm(&self) -> Result<Algorithm, String> {
        match self.congestion_control.as_str() {
            "cubic" => Ok(Algorithm::Cubic),
            "bbr" => Ok(Algorithm::Bbr),
            "bbr2" => Ok(Algorithm::Bbr2),
            other => Err(format!("unknown congestion_control algorithm: {other}")),
        }
    }

    /// Validates the ranges §6 places on each parameter.
    pub fn validate(&self) -> Result<(), String> {
        if self.transport.ack_delay_exponent > 20 {
            return Err("ack_delay_exponent must be in 0..=20".into());
        }
        if self.transport.max_ack_delay_ms > 1 << 14 {
            return Err("max_ack_delay_ms must be <= 2^14".into());
        }
        if self.transport.active_connection_id_limit < 2 {
            return Err("active_connection_id_limit must be >= 2".into());
        }
        if self.transport.max_udp_payload_size < 1200 {
            return Err("max_udp_payload_size must be >= 1200".into());
        }
        self.congestion_algorithm()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = AppConfig::from_toml("congestion_control = \"bbr\"\n").unwrap();
        assert_eq!(cfg.congestion_control, "bbr");
        assert_eq!(cfg.transport.max_udp_payload_size, 1200);
    }

    #[test]
    fn rejects_out_of_range_ack_delay_exponent() {
        let mut cfg = AppConfig::default();
        cfg.transport.ack_delay_exponent = 21;
        assert!(cfg.validate().is_err());
    }
}
