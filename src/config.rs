// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : feed_exchange_rust: feed-driven paper exchange core in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Reads .env + CLI/env settings for the upstream feed, markets,
          matching level, ports, journal file and paper-account defaults.
=============================================================================
*/
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use rust_decimal::Decimal;

use crate::feed::FeedConfig;
use crate::ledger::BalanceRow;

/// Sumber market data
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeedMode {
    Mock,
    Upbit,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Upbit => "upbit",
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

fn parse_levels(raw: &str) -> Result<Vec<Decimal>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| Decimal::from_str(x).map_err(|e| format!("bad orderbook level {x}: {e}")))
        .collect()
}

#[derive(Clone, Debug, Parser)]
#[command(name = "feed_exchange_rust", about = "Paper exchange matching user orders against a live feed")]
pub struct Args {
    #[arg(long, env = "FEED_MODE", value_enum, default_value = "mock")]
    pub feed_mode: FeedMode,

    #[arg(long, env = "FEED_WS_URL", default_value = "wss://api.upbit.com/websocket/v1")]
    pub feed_ws_url: String,

    #[arg(long, env = "FEED_REST_URL", default_value = "https://api.upbit.com/v1")]
    pub feed_rest_url: String,

    /// MARKETS=KRW-BTC,KRW-ETH
    #[arg(long, env = "MARKETS", default_value = "KRW-BTC,KRW-ETH,KRW-XRP")]
    pub markets: String,

    /// Price-aggregation levels to subscribe; 0 means the raw book.
    #[arg(long, env = "ORDERBOOK_LEVELS", default_value = "0")]
    pub orderbook_levels: String,

    #[arg(long, env = "MATCH_LEVEL", default_value = "0")]
    pub match_level: Decimal,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    #[arg(long, env = "WS_PORT", default_value_t = 8081)]
    pub ws_port: u16,

    /// Write-ahead journal; empty disables persistence.
    #[arg(long, env = "JOURNAL_FILE")]
    pub journal_file: Option<String>,

    /// Home-currency balance granted to a new paper account.
    #[arg(long, env = "STARTING_BALANCE", default_value = "10000000")]
    pub starting_balance: Decimal,

    #[arg(long, env = "RECONNECT_BASE_MS", default_value_t = 1_000)]
    pub reconnect_base_ms: u64,

    #[arg(long, env = "RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    #[arg(long, env = "RECONNECT_MAX_ATTEMPTS", default_value_t = 10)]
    pub reconnect_max_attempts: u32,

    #[arg(long, env = "FEED_KEEPALIVE_SECS", default_value_t = 30)]
    pub feed_keepalive_secs: u64,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Outbound queue per client session.
    #[arg(long, env = "CLIENT_QUEUE", default_value_t = 256)]
    pub client_queue: usize,
}

impl Args {
    pub fn markets(&self) -> Vec<String> { parse_list(&self.markets) }

    pub fn levels(&self) -> Vec<Decimal> {
        // level yang tidak valid sudah ditolak di load()
        parse_levels(&self.orderbook_levels).unwrap_or_else(|_| vec![Decimal::ZERO])
    }

    pub fn http_addr(&self) -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], self.http_port)) }

    pub fn ws_addr(&self) -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], self.ws_port)) }

    pub fn http_timeout(&self) -> Duration { Duration::from_secs(self.http_timeout_secs.max(1)) }

    pub fn journal_path(&self) -> Option<&str> {
        self.journal_file.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            ws_url: self.feed_ws_url.clone(),
            markets: self.markets(),
            orderbook_levels: self.levels(),
            keepalive: Duration::from_secs(self.feed_keepalive_secs.max(1)),
            connect_timeout: self.http_timeout(),
            backoff_base: Duration::from_millis(self.reconnect_base_ms.max(1)),
            backoff_cap: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    /// Opening row of a new account: starting balance in every configured home currency.
    pub fn opening_balance(&self) -> BalanceRow {
        let mut row = BalanceRow::new();
        for m in self.markets() {
            if let Some((home, _)) = m.split_once('-') {
                row.insert(home.to_string(), self.starting_balance);
            }
        }
        row
    }

    fn check(&self) -> Result<(), String> {
        let markets = self.markets();
        if markets.is_empty() {
            return Err("MARKETS is empty".into());
        }
        if let Some(bad) = markets.iter().find(|m| crate::domain::split_instrument(m).is_none()) {
            return Err(format!("market {bad} is not HOME-ASSET"));
        }
        let levels = parse_levels(&self.orderbook_levels)?;
        if !levels.contains(&self.match_level) {
            return Err(format!("MATCH_LEVEL {} is not in ORDERBOOK_LEVELS", self.match_level));
        }
        if self.starting_balance < Decimal::ZERO {
            return Err("STARTING_BALANCE must not be negative".into());
        }
        Ok(())
    }
}

pub fn load() -> Result<Args, String> {
    // Pastikan .env dibaca sebelum clap melihat env
    let _ = dotenv();
    let args = Args::parse();
    args.check()?;
    Ok(args)
}
