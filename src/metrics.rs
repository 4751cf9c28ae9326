// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static TICKS_BY_INSTRUMENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_instrument", "market data ticks per instrument"),
        &["instrument"],
    )
    .unwrap()
});

// -------- Strategy / execution --------
pub static SIGNALS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("signals_total", "strategy signals").unwrap());

pub static ORDERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_total", "orders forwarded to the broker").unwrap());

pub static TRADES_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trades_closed_total", "trades fully closed").unwrap());

// -------- Event bus health --------
pub static EVENTS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_dispatched_total", "events dispatched per kind"),
        &["kind"],
    )
    .unwrap()
});

pub static HANDLER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("handler_errors_total", "handler failures per handler"),
        &["handler"],
    )
    .unwrap()
});

pub static EVENTS_REDELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_redelivered_total", "events requeued for another attempt").unwrap()
});

pub static EVENTS_ABANDONED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "events_abandoned_total",
        "events dropped after the redelivery ceiling",
    )
    .unwrap()
});

// -------- Session / feed health --------
pub static FEED_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("feed_connected", "1 if the price stream is connected").unwrap());

pub static FEED_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_reconnects_total", "price stream reconnect attempts").unwrap()
});

pub static HEARTBEATS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("heartbeats_total", "heartbeats emitted while connected").unwrap());

// -------- Ledger --------
pub static BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("account_balance", "account balance (base currency)").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "cumulative realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("pnl_unrealized", "unrealized PnL across open positions").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_BY_INSTRUMENT.clone())),
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(TRADES_CLOSED.clone())),
        REGISTRY.register(Box::new(EVENTS_DISPATCHED.clone())),
        REGISTRY.register(Box::new(HANDLER_ERRORS.clone())),
        REGISTRY.register(Box::new(EVENTS_REDELIVERED.clone())),
        REGISTRY.register(Box::new(EVENTS_ABANDONED.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(HEARTBEATS.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
    ] {
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

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
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

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("metrics bind {addr} failed: {e}");
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {e}"),
            }
        }
    });
}
