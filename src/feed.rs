// ===============================
// src/feed.rs
// ===============================
//
// Market Data adapters:
// - run_upstream : satu koneksi WS ke feed (ticker + orderbook beberapa level)
//                  dengan state machine reconnect + backoff eksponensial ber-cap.
// - run_mock     : random-walk generator dengan format wire yang sama.
// - seed_last_prices : ambil harga trade terakhir via REST saat startup.
//
// Notes:
// - Loop penerima tidak pernah menunggu matching/persistensi: setiap frame
//   dinormalisasi lalu di-try_send ke antrean dispatcher.
// - Frame rusak dicatat dan dilewati.
//
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::OrderBookCache;
use crate::domain::{OrderBookSnapshot, OrderBookUnit, Ticker};
use crate::metrics::{
    FEED_CONNECTED, FEED_GAVE_UP, FEED_MALFORMED, FEED_MESSAGES, FEED_QUEUE_DROPPED, FEED_RECONNECTS,
};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("bad feed url: {0}")]
    BadUrl(#[from] url::ParseError),
    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
    #[error("ticker request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub ws_url: String,
    pub markets: Vec<String>,
    pub orderbook_levels: Vec<Decimal>,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Backoff { attempt: u32, delay: Duration },
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedState::Disconnected => f.write_str("disconnected"),
            FeedState::Connecting => f.write_str("connecting"),
            FeedState::Connected => f.write_str("connected"),
            FeedState::Backoff { attempt, delay } => write!(f, "backoff(attempt={attempt}, delay={delay:?})"),
        }
    }
}

/// Capped exponential backoff: base, 2×base, 4×base … up to `cap`, at most `max_attempts` times.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn reset(&mut self) { self.attempt = 0; }

    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt += 1;
        Some(delay)
    }
}

// ---- Wire model ----

#[derive(Debug, Clone, Deserialize)]
pub struct OrderbookMessage {
    pub code: String,
    #[serde(default)]
    pub level: Decimal,
    pub orderbook_units: Vec<OrderBookUnit>,
    #[serde(default)]
    pub timestamp: i64,
}

impl OrderbookMessage {
    pub fn into_snapshot(self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            instrument: self.code,
            level: self.level,
            units: self.orderbook_units,
            timestamp: if self.timestamp > 0 { self.timestamp } else { Utc::now().timestamp_millis() },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    #[serde(rename = "ticker")]
    Ticker(Ticker),
    #[serde(rename = "orderbook")]
    Orderbook(OrderbookMessage),
    #[serde(other)]
    Other,
}

impl FeedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedMessage::Ticker(_) => "ticker",
            FeedMessage::Orderbook(_) => "orderbook",
            FeedMessage::Other => "other",
        }
    }
}

/// A decoded upstream frame plus its original text for passthrough.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub raw: Arc<str>,
    pub message: FeedMessage,
}

pub fn normalize(text: &str) -> Result<FeedEvent, serde_json::Error> {
    let message = serde_json::from_str::<FeedMessage>(text)?;
    Ok(FeedEvent { raw: Arc::from(text), message })
}

// level dikirim sebagai angka, bukan string
fn level_json(level: Decimal) -> serde_json::Value {
    match level.to_i64() {
        Some(i) if Decimal::from(i) == level => json!(i),
        _ => json!(level.to_f64()),
    }
}

/// `[{ticket}, {ticker}, {orderbook, level}…, {format}]`
pub fn subscription_request(markets: &[String], levels: &[Decimal]) -> serde_json::Value {
    let ticket = format!("feed-{}", rand::thread_rng().gen::<u32>());
    let mut req = vec![json!({ "ticket": ticket }), json!({ "type": "ticker", "codes": markets })];
    for level in levels {
        if level.is_zero() {
            req.push(json!({ "type": "orderbook", "codes": markets }));
        } else {
            req.push(json!({ "type": "orderbook", "codes": markets, "level": level_json(*level) }));
        }
    }
    req.push(json!({ "format": "DEFAULT" }));
    serde_json::Value::Array(req)
}

fn enqueue(events: &mpsc::Sender<FeedEvent>, text: &str) {
    match normalize(text) {
        Ok(ev) => {
            FEED_MESSAGES.with_label_values(&[ev.message.kind()]).inc();
            if events.try_send(ev).is_err() {
                FEED_QUEUE_DROPPED.inc();
                debug!("feed queue full, frame dropped");
            }
        }
        Err(e) => {
            FEED_MALFORMED.inc();
            debug!(?e, "skip malformed feed frame");
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed(String),
}

fn set_state(state_tx: &watch::Sender<FeedState>, next: FeedState) {
    debug!(state = %next, "feed state");
    state_tx.send_replace(next);
}

/// Keep one upstream connection alive until shutdown or the retry budget is spent.
pub async fn run_upstream(
    cfg: FeedConfig,
    events: mpsc::Sender<FeedEvent>,
    state_tx: watch::Sender<FeedState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FeedError> {
    let url = Url::parse(&cfg.ws_url)?;
    let mut backoff = Backoff::new(cfg.backoff_base, cfg.backoff_cap, cfg.max_attempts);

    loop {
        if *shutdown.borrow() {
            set_state(&state_tx, FeedState::Disconnected);
            return Ok(());
        }

        set_state(&state_tx, FeedState::Connecting);
        info!(ws_url = %url, markets = ?cfg.markets, "connecting upstream feed");
        let connect = timeout(cfg.connect_timeout, connect_async(url.as_str()));
        let result = tokio::select! {
            r = connect => r,
            _ = shutdown.changed() => {
                set_state(&state_tx, FeedState::Disconnected);
                return Ok(());
            }
        };

        match result {
            Ok(Ok((ws, _resp))) => {
                info!("upstream feed connected");
                backoff.reset();
                set_state(&state_tx, FeedState::Connected);
                FEED_CONNECTED.set(1);
                let end = run_session(ws, &cfg, &events, &mut shutdown).await;
                FEED_CONNECTED.set(0);
                match end {
                    SessionEnd::Shutdown => {
                        set_state(&state_tx, FeedState::Disconnected);
                        return Ok(());
                    }
                    SessionEnd::Closed(reason) => warn!(%reason, "upstream feed disconnected, will reconnect…"),
                }
            }
            Ok(Err(e)) => error!(?e, "feed connect failed"),
            Err(_) => error!(timeout = ?cfg.connect_timeout, "feed connect timed out"),
        }
        set_state(&state_tx, FeedState::Disconnected);

        let Some(delay) = backoff.next_delay() else {
            FEED_GAVE_UP.inc();
            error!(attempts = backoff.attempt(), "ALERT: upstream feed unreachable, giving up");
            return Err(FeedError::RetriesExhausted(backoff.attempt()));
        };
        // jangan simpan ThreadRng melewati .await
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
        FEED_RECONNECTS.inc();
        set_state(&state_tx, FeedState::Backoff { attempt: backoff.attempt(), delay });
        tokio::select! {
            _ = sleep(delay + jitter) => {}
            _ = shutdown.changed() => {
                set_state(&state_tx, FeedState::Disconnected);
                return Ok(());
            }
        }
    }
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    cfg: &FeedConfig,
    events: &mpsc::Sender<FeedEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let sub = subscription_request(&cfg.markets, &cfg.orderbook_levels);
    if let Err(e) = sink.send(Message::Text(sub.to_string())).await {
        return SessionEnd::Closed(format!("subscribe failed: {e}"));
    }

    let mut ping = interval(cfg.keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            frame = stream.next() => {
                ping.reset();
                match frame {
                    Some(Ok(Message::Text(text))) => enqueue(events, &text),
                    // format DEFAULT dikirim sebagai frame biner berisi JSON
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => enqueue(events, text),
                        Err(e) => {
                            FEED_MALFORMED.inc();
                            warn!(?e, "non-utf8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => return SessionEnd::Closed(format!("close frame: {frame:?}")),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Closed(format!("ws read error: {e}")),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Closed(format!("keepalive failed: {e}"));
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

/// Generator market data mock (random walk), same wire shape as upstream.
pub async fn run_mock(markets: Vec<String>, events: mpsc::Sender<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
    let mut mids: Vec<i64> = markets.iter().map(|_| 50_000_000).collect();
    let mut tick = interval(Duration::from_millis(200));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(markets = ?markets, "mock feed started");

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                info!("mock feed stopped");
                return;
            }
        }
        for (code, mid) in markets.iter().zip(mids.iter_mut()) {
            let frames = {
                let mut rng = rand::thread_rng();
                *mid = (*mid + rng.gen_range(-5..=5) * 1_000).max(1_000_000);
                mock_frames(code, *mid, &mut rng)
            };
            for frame in frames {
                enqueue(&events, &frame);
            }
        }
    }
}

fn mock_frames(code: &str, mid: i64, rng: &mut impl Rng) -> [String; 2] {
    let ts = Utc::now().timestamp_millis();
    let units: Vec<serde_json::Value> = (1..=15)
        .map(|i| {
            json!({
                "ask_price": mid + i * 1_000,
                "bid_price": mid - i * 1_000,
                "ask_size": rng.gen_range(1..=500) as f64 / 1_000.0,
                "bid_size": rng.gen_range(1..=500) as f64 / 1_000.0,
            })
        })
        .collect();
    let ticker = json!({ "type": "ticker", "code": code, "trade_price": mid, "timestamp": ts });
    let book = json!({ "type": "orderbook", "code": code, "level": 0, "orderbook_units": units, "timestamp": ts });
    [ticker.to_string(), book.to_string()]
}

#[derive(Debug, Deserialize)]
struct RestTicker {
    market: String,
    trade_price: Decimal,
}

/// Prime last trade prices from the REST ticker endpoint. Bounded by the client's timeout.
pub async fn seed_last_prices(
    http: &reqwest::Client,
    rest_url: &str,
    markets: &[String],
    cache: &OrderBookCache,
) -> Result<usize, FeedError> {
    let url = format!(
        "{}/ticker?markets={}",
        rest_url.trim_end_matches('/'),
        urlencoding::encode(&markets.join(","))
    );
    let tickers: Vec<RestTicker> = http.get(url).send().await?.error_for_status()?.json().await?;
    for t in &tickers {
        cache.set_last_price(&t.market, t.trade_price);
    }
    info!(count = tickers.len(), "seeded last trade prices");
    Ok(tickers.len())
}
