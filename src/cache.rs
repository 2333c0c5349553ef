// ===============================
// src/cache.rs
// ===============================
//
// OrderBookCache: snapshot terakhir per (instrument, level), ticker terakhir,
// dan harga trade terakhir. Semua ditimpa utuh setiap update dari feed
// (feed mengirim full snapshot, bukan diff).
//
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;

use crate::domain::{BestPrices, OrderBookSnapshot, Ticker};

pub struct OrderBookCache {
    match_level: Decimal,
    books: RwLock<HashMap<(String, Decimal), Arc<OrderBookSnapshot>>>,
    tickers: RwLock<HashMap<String, Ticker>>,
    last_prices: RwLock<HashMap<String, Decimal>>,
}

impl OrderBookCache {
    /// `match_level` is the order-book granularity used for matching and best prices.
    pub fn new(match_level: Decimal) -> Self {
        Self {
            match_level,
            books: RwLock::new(HashMap::new()),
            tickers: RwLock::new(HashMap::new()),
            last_prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_match_level(&self, level: Decimal) -> bool { level == self.match_level }

    pub fn put_snapshot(&self, snapshot: OrderBookSnapshot) -> Arc<OrderBookSnapshot> {
        let snap = Arc::new(snapshot);
        let key = (snap.instrument.clone(), snap.level);
        self.books
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, snap.clone());
        snap
    }

    pub fn snapshot(&self, instrument: &str) -> Option<Arc<OrderBookSnapshot>> {
        self.snapshot_at(instrument, self.match_level)
    }

    pub fn snapshot_at(&self, instrument: &str, level: Decimal) -> Option<Arc<OrderBookSnapshot>> {
        self.books
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(instrument.to_string(), level))
            .cloned()
    }

    /// Lowest positive ask and highest positive bid of the matching-level snapshot.
    pub fn best_prices(&self, instrument: &str) -> Option<BestPrices> {
        let snap = self.snapshot(instrument)?;
        let best_ask = snap
            .units
            .iter()
            .filter(|u| u.ask_price > Decimal::ZERO && u.ask_size > Decimal::ZERO)
            .map(|u| u.ask_price)
            .min();
        let best_bid = snap
            .units
            .iter()
            .filter(|u| u.bid_price > Decimal::ZERO && u.bid_size > Decimal::ZERO)
            .map(|u| u.bid_price)
            .max();
        Some(BestPrices { best_ask, best_bid })
    }

    pub fn set_ticker(&self, ticker: Ticker) {
        self.set_last_price(&ticker.code, ticker.trade_price);
        self.tickers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticker.code.clone(), ticker);
    }

    pub fn ticker(&self, instrument: &str) -> Option<Ticker> {
        self.tickers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument)
            .cloned()
    }

    pub fn set_last_price(&self, instrument: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        self.last_prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instrument.to_string(), price);
    }

    pub fn last_price(&self, instrument: &str) -> Option<Decimal> {
        self.last_prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument)
            .copied()
    }

    pub fn last_prices(&self) -> HashMap<String, Decimal> {
        self.last_prices.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderBookUnit;
    use crate::ledger::tests::d;

    fn unit(ask: &str, ask_size: &str, bid: &str, bid_size: &str) -> OrderBookUnit {
        OrderBookUnit { ask_price: d(ask), ask_size: d(ask_size), bid_price: d(bid), bid_size: d(bid_size) }
    }

    fn snap(level: &str, units: Vec<OrderBookUnit>) -> OrderBookSnapshot {
        OrderBookSnapshot { instrument: "KRW-BTC".into(), level: d(level), units, timestamp: 0 }
    }

    #[test]
    fn snapshot_is_replaced_wholesale() {
        let c = OrderBookCache::new(Decimal::ZERO);
        c.put_snapshot(snap("0", vec![unit("101", "1", "99", "1"), unit("102", "1", "98", "1")]));
        c.put_snapshot(snap("0", vec![unit("105", "2", "95", "2")]));
        let s = c.snapshot("KRW-BTC").unwrap();
        assert_eq!(s.units.len(), 1);
        assert_eq!(s.units[0].ask_price, d("105"));
    }

    #[test]
    fn levels_are_kept_apart() {
        let c = OrderBookCache::new(Decimal::ZERO);
        c.put_snapshot(snap("0", vec![unit("101", "1", "99", "1")]));
        c.put_snapshot(snap("10000", vec![unit("110000", "1", "90000", "1")]));
        assert_eq!(c.best_prices("KRW-BTC").unwrap().best_ask, Some(d("101")));
        assert!(c.snapshot_at("KRW-BTC", d("10000")).is_some());
        assert!(!c.is_match_level(d("10000")));
    }

    #[test]
    fn best_prices_ignore_empty_levels() {
        let c = OrderBookCache::new(Decimal::ZERO);
        c.put_snapshot(snap("0", vec![unit("100", "0", "0", "3"), unit("101", "1", "98", "1")]));
        let bp = c.best_prices("KRW-BTC").unwrap();
        assert_eq!(bp.best_ask, Some(d("101")));
        assert_eq!(bp.best_bid, Some(d("98")));
        assert!(c.best_prices("KRW-ETH").is_none());
    }

    #[test]
    fn ticker_updates_last_price() {
        let c = OrderBookCache::new(Decimal::ZERO);
        assert_eq!(c.last_price("KRW-BTC"), None);
        c.set_ticker(Ticker {
            code: "KRW-BTC".into(),
            trade_price: d("50000000"),
            change_rate: None,
            high_price: None,
            low_price: None,
            timestamp: None,
        });
        assert_eq!(c.last_price("KRW-BTC"), Some(d("50000000")));
        assert_eq!(c.last_prices().len(), 1);
    }
}
