// ===============================
// src/main.rs
// ===============================
/*
 # jalankan dengan feed mock
 FEED_MODE=mock MARKETS=KRW-BTC,KRW-ETH JOURNAL_FILE=data/ledger.jsonl cargo run

 # pasang order & cek saldo
curl -s -XPOST localhost:8080/orders -H 'X-User-Id: alice' \
     -d '{"market":"KRW-BTC","side":"bid","type":"limit","price":"50000000","quantity":"0.01"}'
curl -s localhost:8080/balance -H 'X-User-Id: alice'

# aktivitas feed & matching
curl -s localhost:8080/metrics | egrep '^(feed_messages_total|match_runs_total|fills_total)'
*/
/*
=============================================================================
Project : feed_exchange_rust: feed-driven paper exchange core in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Relays a live exchange feed (mock/Upbit) to clients, matches
          resting user limit orders against the live order book, settles
          fills against per-user balances with a JSONL write-ahead journal,
          and exposes REST + WebSocket + Prometheus metrics.
=============================================================================
*/
mod app;
mod cache;
mod clients;
mod config;
mod domain;
mod engine;
mod error;
mod feed;
mod gateway;
mod http;
mod hub;
mod journal;
mod ledger;
mod metrics;
mod settlement;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();

    let app = match app::App::build(args).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };
    if let Err(e) = app.run().await {
        error!(error = %e, "exited with error");
        std::process::exit(1);
    }
    info!("stopped");
}
