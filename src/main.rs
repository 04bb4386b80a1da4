//! `quicfuscate-client`: a minimal CLI driver over the transport core.
//!
//! This is the one place in the crate that actually awaits anything
//! (connection.rs's doc comment on this). The event loop is plain: read
//! a datagram, feed it in, drain `poll_transmit`, sleep until
//! `next_timeout`, repeat — everything interesting happens inside
//! `Connection`.

use clap::Parser;
use log::{error, info};
use quicfuscate_core::connection::{Config, Connection};
use quicfuscate_core::events::Event;
use quicfuscate_core::h3;
use quicfuscate_core::stream::Direction;
use quicfuscate_core::tls_rustls::RustlsEngine;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "quicfuscate-client", about = "Minimal HTTP/3-over-QUIC client driver")]
struct Args {
    /// Server authority, e.g. example.com:443
    #[arg(long)]
    connect: String,

    /// SNI / :authority host name, if different from the connect host.
    #[arg(long)]
    server_name: Option<String>,

    /// Request path.
    #[arg(long, default_value = "/")]
    path: String,

    /// Expose Prometheus metrics on this address instead of printing a
    /// one-shot snapshot at exit.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Some(addr) = args.metrics_addr {
        if let Err(e) = quicfuscate_core::telemetry::serve(&addr.to_string()) {
            error!("failed to start metrics server: {e}");
        }
    }

    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let remote: SocketAddr = tokio::net::lookup_host(&args.connect)
        .await?
        .next()
        .ok_or("could not resolve --connect address")?;
    let server_name = args.server_name.unwrap_or_else(|| args.connect.split(':').next().unwrap().to_string());

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect(remote).await?;
    let local = socket.local_addr()?;

    let config = Config::new(server_name.clone());
    // A placeholder SCID for the transport-parameter preamble; the real
    // SCID `Connection::connect` generates may differ, a known seam
    // documented in DESIGN.md.
    let placeholder_scid = [0u8; 8];
    let params = quicfuscate_core::tls::encode_transport_parameters(&config.app.transport, &placeholder_scid);
    let tls = RustlsEngine::new(&server_name, config.alpn.clone(), params)?;

    let mut conn = Connection::connect(config, local, remote, Box::new(tls), Instant::now())?;
    let events = conn.events();

    let mut recv_buf = vec![0u8; 65535];
    let mut request_sent = false;
    let mut h3_control_opened = false;
    let mut h3_decoder = h3::RequestStreamDecoder::new();
    let mut request_stream_id = None;

    loop {
        for packet in conn.poll_transmit(Instant::now()) {
            socket.send(&packet).await?;
        }

        if !h3_control_opened && conn.state() == quicfuscate_core::connection::ConnectionState::Connected {
            h3_control_opened = true;
            let control_id = conn.open_stream(Direction::Uni)?;
            conn.stream_write(control_id, &h3::control_stream_preface(), false)?;
            let enc_id = conn.open_stream(Direction::Uni)?;
            conn.stream_write(enc_id, &h3::qpack_encoder_stream_preface(), false)?;
            let dec_id = conn.open_stream(Direction::Uni)?;
            conn.stream_write(dec_id, &h3::qpack_decoder_stream_preface(), false)?;
        }

        if h3_control_opened && !request_sent {
            request_sent = true;
            let id = conn.open_stream(Direction::Bidi)?;
            request_stream_id = Some(id);
            let request = h3::encode_request(
                &[(":method", "GET"), (":scheme", "https"), (":authority", &server_name), (":path", &args.path)],
                None,
            );
            conn.stream_write(id, &request, true)?;
            info!("sent request for {}", args.path);
        }

        while let Some(event) = events.poll() {
            match event {
                Event::HandshakeComplete { alpn } => {
                    info!("handshake complete, alpn={:?}", String::from_utf8_lossy(&alpn));
                }
                Event::StreamData { id, data, fin } => {
                    if Some(id) == request_stream_id {
                        if let Ok(h3_events) = h3_decoder.on_bytes(&data) {
                            for ev in h3_events {
                                match ev {
                                    h3::H3Event::Headers(headers) => {
                                        for header in headers {
                                            println!("{}: {}", header.name, header.value);
                                        }
                                    }
                                    h3::H3Event::Data(body) => {
                                        print!("{}", String::from_utf8_lossy(&body));
                                    }
                                }
                            }
                        }
                        if fin {
                            println!();
                            let stats = conn.stats();
                            info!(
                                "done: rtt={:?} bytes_sent={} bytes_received={} cwnd={}",
                                stats.rtt, stats.bytes_sent, stats.bytes_received, stats.cwnd
                            );
                            return Ok(());
                        }
                    }
                }
                Event::ConnectionClose { error_code, reason } => {
                    return Err(format!("connection closed: code={error_code:#x} reason={reason}").into());
                }
                _ => {}
            }
        }

        let deadline = conn.next_timeout().unwrap_or_else(|| Instant::now() + Duration::from_millis(100));
        let timeout = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            result = socket.recv(&mut recv_buf) => {
                let n = result?;
                conn.on_datagram_received(&recv_buf[..n], Instant::now())?;
            }
            _ = sleep(timeout) => {
                conn.on_timeout(Instant::now());
            }
        }
    }
}
