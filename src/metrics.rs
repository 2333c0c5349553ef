// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static FEED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_messages_total", "upstream messages by type"),
        &["type"],
    )
    .unwrap()
});

pub static FEED_MALFORMED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_malformed_total", "upstream frames skipped as malformed").unwrap());

pub static FEED_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("feed_connected", "1 if upstream WS connected, 0 otherwise").unwrap());

pub static FEED_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_reconnects_total", "reconnect attempts to upstream WS").unwrap());

pub static FEED_GAVE_UP: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_gave_up_total", "upstream reconnect attempts exhausted (alert)").unwrap()
});

pub static FEED_QUEUE_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_queue_dropped_total", "feed events dropped because dispatcher lagged").unwrap()
});

// -------- Matching / settlement --------
pub static MATCH_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("match_runs_total", "matching runs by outcome (completed|skipped|error)"),
        &["outcome"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("fills_total", "settled fills by side"), &["side"]).unwrap()
});

// Settlement transaction latency (milliseconds)
pub static SETTLE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "settlement_latency_ms",
        "Latency of one fill transaction (ms)",
    ))
    .unwrap()
});

// -------- Gateway --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders accepted by side and type"),
        &["side", "type"],
    )
    .unwrap()
});

pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("order_rejects_total", "rejected requests by code"), &["code"]).unwrap()
});

pub static CANCELS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("order_cancels_total", "orders cancelled").unwrap());

// -------- Clients --------
pub static WS_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_clients", "connected client sessions").unwrap());

pub static WS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ws_sessions_dropped_total", "sessions removed after a failed send").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(FEED_MESSAGES.clone())),
        REGISTRY.register(Box::new(FEED_MALFORMED.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(FEED_GAVE_UP.clone())),
        REGISTRY.register(Box::new(FEED_QUEUE_DROPPED.clone())),
        REGISTRY.register(Box::new(MATCH_RUNS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(SETTLE_LATENCY.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(CANCELS.clone())),
        REGISTRY.register(Box::new(WS_CLIENTS.clone())),
        REGISTRY.register(Box::new(WS_DROPPED.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
