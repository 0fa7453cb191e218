// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Transport --------
pub static CONN_STATE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "dtc_connection_state",
        "0=disconnected 1=connecting 2=connected 3=session_ready",
    )
    .unwrap()
});

pub static FRAMES_RX: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dtc_frames_rx_total", "decoded frames received").unwrap());

pub static FRAMES_TX: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dtc_frames_tx_total", "frames written").unwrap());

pub static HEARTBEATS_SENT: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dtc_heartbeats_sent_total", "heartbeats written").unwrap());

pub static RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dtc_reconnects_scheduled_total", "reconnect attempts scheduled").unwrap());

pub static ENCODING_MISMATCH: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("dtc_encoding_mismatch_total", "sessions that saw binary frames").unwrap()
});

pub static REQUEST_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dtc_request_timeouts_total", "requests without a response in time"),
        &["kind"],
    )
    .unwrap()
});

// -------- Breakers --------
pub static BREAKER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("circuit_breaker_state", "0=closed 1=half_open 2=open"),
        &["name"],
    )
    .unwrap()
});

// -------- Normalization / routing --------
pub static NORMALIZED_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("normalized_events_total", "typed events produced (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static UNKNOWN_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("unknown_messages_total", "records with an unrecognised Type"),
        &["type"],
    )
    .unwrap()
});

pub static MODE_DRIFT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mode_drift_total", "events whose scope differs from the active one"),
        &["kind"],
    )
    .unwrap()
});

// -------- Balances & trades --------
pub static BALANCE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("account_balance", "cached balance (labels: mode, account)"),
        &["mode", "account"],
    )
    .unwrap()
});

pub static TRADES_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trades_closed_total", "ledger rows written (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "open positions across all scopes").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CONN_STATE.clone())),
        REGISTRY.register(Box::new(FRAMES_RX.clone())),
        REGISTRY.register(Box::new(FRAMES_TX.clone())),
        REGISTRY.register(Box::new(HEARTBEATS_SENT.clone())),
        REGISTRY.register(Box::new(RECONNECTS.clone())),
        REGISTRY.register(Box::new(ENCODING_MISMATCH.clone())),
        REGISTRY.register(Box::new(REQUEST_TIMEOUTS.clone())),
        REGISTRY.register(Box::new(BREAKER_STATE.clone())),
        REGISTRY.register(Box::new(NORMALIZED_EVENTS.clone())),
        REGISTRY.register(Box::new(UNKNOWN_MESSAGES.clone())),
        REGISTRY.register(Box::new(MODE_DRIFT.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(TRADES_CLOSED.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
    ] {
        // AlreadyReg on a second init() is harmless
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server lives on its own OS thread; a failed bind only loses /metrics.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                warn!(%addr, error = %e, "metrics bind failed; exporter disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    });
}
