//! QUIC v1/v2 transport and HTTP/3 framing core.
//!
//! This crate implements the packet/frame codec, connection state machine,
//! loss detection, congestion control and stream multiplexing required to
//! drive a QUIC client, plus the HTTP/3 framing layer that rides on top of
//! it. Everything peripheral to that core (UI, DNS, proxying) lives outside
//! this crate and is expected to supply the four externally injected
//! collaborators: a datagram socket, a clock, a CSPRNG and a TLS 1.3 stack.

pub mod app_config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod flow_control;
pub mod frame;
pub mod h3;
pub mod packet;
pub mod pacer;
pub mod pnspace;
pub mod recovery;
pub mod stats;
pub mod stream;
pub mod telemetry;
pub mod tls;
pub mod tls_rustls;
pub mod varint;

pub mod congestion;

pub use connection::{Config, Connection};
pub use error::{ConnectionError, WireError};
pub use events::Event;
pub use stats::Stats;
