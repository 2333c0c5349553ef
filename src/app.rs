// ===============================
// src/app.rs
// ===============================
//
// Wiring: cache, ledger (+ journal replay), settlement, hub, engine, gateway.
// Satu dispatcher mengonsumsi antrean feed secara berurutan:
//   ticker    -> cache
//   orderbook -> cache, lalu spawn matching bila level == MATCH_LEVEL
//   semua     -> passthrough ke client
//
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cache::OrderBookCache;
use crate::clients;
use crate::config::{Args, FeedMode};
use crate::engine::MatchingEngine;
use crate::feed::{self, FeedEvent, FeedMessage, FeedState};
use crate::gateway::OrderGateway;
use crate::http::{self, HttpState};
use crate::hub::BroadcastHub;
use crate::journal::{read_records, Journal, JsonlJournal, NullJournal};
use crate::ledger::LedgerStore;
use crate::settlement::SettlementService;

const FEED_QUEUE: usize = 4096;
const HEARTBEAT: Duration = Duration::from_secs(10);

pub struct App {
    args: Args,
    pub cache: Arc<OrderBookCache>,
    pub ledger: Arc<LedgerStore>,
    pub hub: Arc<BroadcastHub>,
    pub engine: Arc<MatchingEngine>,
    pub gateway: Arc<OrderGateway>,
}

impl App {
    /// Build every component; replays the journal when one is configured.
    pub async fn build(args: Args) -> io::Result<Self> {
        let opening = args.opening_balance();
        let ledger = match args.journal_path() {
            Some(path) => {
                let replay = read_records(Path::new(path)).await?;
                let replayed = replay.records.len();
                let journal: Arc<dyn Journal> = Arc::new(JsonlJournal::open(path).await?);
                info!(path, replayed, "ledger restored from journal");
                LedgerStore::restore(journal, opening, replay)
            }
            None => {
                warn!("JOURNAL_FILE not set, ledger is memory-only");
                LedgerStore::new(Arc::new(NullJournal), opening)
            }
        };
        let ledger = Arc::new(ledger);
        let cache = Arc::new(OrderBookCache::new(args.match_level));
        let hub = Arc::new(BroadcastHub::new(args.client_queue));
        let settlement = Arc::new(SettlementService::new(ledger.clone()));
        let engine = Arc::new(MatchingEngine::new(ledger.clone(), settlement, hub.clone()));
        let gateway = Arc::new(OrderGateway::new(ledger.clone(), cache.clone(), hub.clone(), args.markets()));
        Ok(Self { args, cache, ledger, hub, engine, gateway })
    }

    pub fn handle_event(&self, ev: FeedEvent) {
        match ev.message {
            FeedMessage::Ticker(t) => self.cache.set_ticker(t),
            FeedMessage::Orderbook(ob) => {
                let snap = self.cache.put_snapshot(ob.into_snapshot());
                if self.cache.is_match_level(snap.level) {
                    self.engine.spawn_process(snap);
                }
            }
            FeedMessage::Other => {}
        }
        self.hub.publish_raw(ev.raw);
    }

    async fn dispatch(self: Arc<Self>, mut events: mpsc::Receiver<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut beat = interval(HEARTBEAT);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seen: u64 = 0;
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => {
                        seen += 1;
                        self.handle_event(ev);
                    }
                    None => break,
                },
                _ = beat.tick() => {
                    info!(events = seen, clients = self.hub.session_count(), "heartbeat");
                    seen = 0;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("dispatcher stopped");
    }

    fn spawn_feed(
        &self,
        events: mpsc::Sender<FeedEvent>,
        state_tx: watch::Sender<FeedState>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let markets = self.args.markets();
        match self.args.feed_mode {
            FeedMode::Mock => {
                state_tx.send_replace(FeedState::Connected);
                tokio::spawn(async move {
                    feed::run_mock(markets, events, shutdown).await;
                    state_tx.send_replace(FeedState::Disconnected);
                })
            }
            FeedMode::Upbit => {
                let cfg = self.args.feed_config();
                let rest_url = self.args.feed_rest_url.clone();
                let http_timeout = self.args.http_timeout();
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    match reqwest::Client::builder().timeout(http_timeout).build() {
                        Ok(http) => {
                            if let Err(e) = feed::seed_last_prices(&http, &rest_url, &markets, &cache).await {
                                warn!(error = %e, "last price seed failed, waiting for ticker frames");
                            }
                        }
                        Err(e) => warn!(error = %e, "http client build failed"),
                    }
                    if let Err(e) = feed::run_upstream(cfg, events, state_tx, shutdown).await {
                        error!(error = %e, "upstream feed stopped");
                    }
                })
            }
        }
    }

    /// Run until ctrl-c, then stop every task through the shutdown signal.
    pub async fn run(self) -> io::Result<()> {
        let app = Arc::new(self);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let (ev_tx, ev_rx) = mpsc::channel::<FeedEvent>(FEED_QUEUE);

        info!(
            feed_mode = app.args.feed_mode.as_str(),
            markets = ?app.args.markets(),
            levels = ?app.args.levels(),
            match_level = %app.args.match_level,
            http_port = app.args.http_port,
            ws_port = app.args.ws_port,
            "startup config"
        );

        let feed_task = app.spawn_feed(ev_tx, state_tx, stop_rx.clone());
        let dispatch_task = tokio::spawn(app.clone().dispatch(ev_rx, stop_rx.clone()));

        let http_state = HttpState { gateway: app.gateway.clone(), feed_state: state_rx };
        let http_task = tokio::spawn(http::serve(app.args.http_addr(), http_state, stop_rx.clone()));
        let ws_task = tokio::spawn(clients::serve(app.args.ws_addr(), app.hub.clone(), app.cache.clone(), stop_rx));

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        let _ = stop_tx.send(true);

        let _ = feed_task.await;
        let _ = dispatch_task.await;
        match http_task.await {
            Ok(Err(e)) => error!(error = %e, "http server error"),
            Err(e) => error!(error = %e, "http task panicked"),
            Ok(Ok(())) => {}
        }
        match ws_task.await {
            Ok(Err(e)) => error!(error = %e, "client websocket error"),
            Err(e) => error!(error = %e, "client websocket task panicked"),
            Ok(Ok(())) => {}
        }
        info!("bye");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderStatus;
    use crate::gateway::OrderRequest;
    use crate::ledger::tests::d;
    use clap::Parser;

    fn args(journal: &str) -> Args {
        Args::try_parse_from([
            "feed_exchange_rust",
            "--markets",
            "KRW-BTC",
            "--starting-balance",
            "1000000",
            "--journal-file",
            journal,
        ])
        .unwrap()
    }

    fn book(ask: &str, size: &str) -> FeedEvent {
        let text = format!(
            r#"{{"type":"orderbook","code":"KRW-BTC","timestamp":1,"orderbook_units":[{{"ask_price":{ask},"bid_price":1,"ask_size":{size},"bid_size":0}}]}}"#
        );
        feed::normalize(&text).unwrap()
    }

    async fn wait_status(app: &App, id: u64, want: OrderStatus) {
        for _ in 0..100 {
            if app.ledger.order(id).await.map(|o| o.status) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("order {id} never reached {want:?}");
    }

    #[tokio::test]
    async fn orderbook_event_fills_and_journal_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let path = path.to_str().unwrap();

        let app = App::build(args(path)).await.unwrap();
        let (_sid, mut client) = app.hub.register();
        let receipt = app
            .gateway
            .submit(
                "alice",
                OrderRequest {
                    market: "KRW-BTC".into(),
                    side: "bid".into(),
                    order_type: "limit".into(),
                    price: Some(d("1000")),
                    quantity: Some(d("3")),
                    total: None,
                },
            )
            .await
            .unwrap();

        app.handle_event(book("990", "5"));
        wait_status(&app, receipt.order.id, OrderStatus::Filled).await;

        // passthrough first, then the fill notice
        let first = client.recv().await.unwrap();
        assert!(first.contains("\"orderbook\""));
        let second = client.recv().await.unwrap();
        assert!(second.contains("order_filled"));

        let before = app.ledger.balances("alice").await;
        assert_eq!(before.get("KRW"), Some(&d("997030")));
        assert_eq!(before.get("BTC"), Some(&d("3")));
        drop(app);

        let restored = App::build(args(path)).await.unwrap();
        assert_eq!(restored.ledger.balances("alice").await, before);
        assert_eq!(restored.ledger.order(receipt.order.id).await.unwrap().status, OrderStatus::Filled);
        assert_eq!(restored.gateway.transactions("alice", 1, 10).total, 1);
    }

    #[tokio::test]
    async fn ticker_event_sets_last_price_and_other_levels_do_not_match() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(args(dir.path().join("j.jsonl").to_str().unwrap())).await.unwrap();

        app.handle_event(feed::normalize(r#"{"type":"ticker","code":"KRW-BTC","trade_price":123}"#).unwrap());
        assert_eq!(app.cache.last_price("KRW-BTC"), Some(d("123")));

        let other_level = feed::normalize(
            r#"{"type":"orderbook","code":"KRW-BTC","level":10000,"orderbook_units":[{"ask_price":1,"bid_price":1,"ask_size":1,"bid_size":1}]}"#,
        )
        .unwrap();
        app.handle_event(other_level);
        assert!(app.cache.snapshot("KRW-BTC").is_none());
        assert!(app.cache.snapshot_at("KRW-BTC", d("10000")).is_some());
    }
}
