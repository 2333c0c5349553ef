// ===============================
// src/gateway.rs
// ===============================
//
// OrderGateway: validasi -> hitung reservasi -> satu transaksi
// (lock baris saldo, cek, debit, simpan order / settle market).
// Semua penolakan terjadi sebelum ada mutasi.
//
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::OrderBookCache;
use crate::domain::{
    split_instrument, FillNotice, FillRecord, OrderBookSnapshot, OrderId, OrderStatus, OrderType, PendingOrder,
    Side, Ticker, EPSILON,
};
use crate::error::ExchangeError;
use crate::hub::BroadcastHub;
use crate::ledger::LedgerStore;
use crate::metrics::{CANCELS, ORDERS, REJECTS};
use crate::settlement::apply_fill;

/// Body of `POST /orders`. Market buys take the amount to spend in `total`
/// (or in `price`, as the upstream exchange does).
#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub market: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub total: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub order: PendingOrder,
    pub fill: Option<FillRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceView {
    pub currency: String,
    pub balance: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<FillRecord>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookView {
    pub orderbook: OrderBookSnapshot,
    pub best_ask: Option<Decimal>,
    pub best_bid: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Admission {
    Limit { price: Decimal, qty: Decimal },
    MarketBuy { total: Decimal },
    MarketSell { qty: Decimal },
}

/// What gets earmarked up front: `(asset, amount)`.
fn reservation(home: &str, asset: &str, side: Side, admission: Admission) -> Result<(String, Decimal), ExchangeError> {
    let held = match (side, admission) {
        (Side::Bid, Admission::Limit { price, qty }) => {
            let amount = price
                .checked_mul(qty)
                .ok_or_else(|| ExchangeError::validation("price × quantity out of range"))?;
            (home.to_string(), amount)
        }
        (Side::Ask, Admission::Limit { qty, .. }) => (asset.to_string(), qty),
        (_, Admission::MarketBuy { total }) => (home.to_string(), total),
        (_, Admission::MarketSell { qty }) => (asset.to_string(), qty),
    };
    Ok(held)
}

fn positive(v: Option<Decimal>, what: &str) -> Result<Decimal, ExchangeError> {
    match v {
        Some(x) if x > Decimal::ZERO => Ok(x),
        Some(_) => Err(ExchangeError::validation(format!("{what} must be greater than zero"))),
        None => Err(ExchangeError::validation(format!("{what} is required"))),
    }
}

pub struct OrderGateway {
    ledger: Arc<LedgerStore>,
    cache: Arc<OrderBookCache>,
    hub: Arc<BroadcastHub>,
    markets: HashSet<String>,
}

impl OrderGateway {
    pub fn new(
        ledger: Arc<LedgerStore>,
        cache: Arc<OrderBookCache>,
        hub: Arc<BroadcastHub>,
        markets: impl IntoIterator<Item = String>,
    ) -> Self {
        Self { ledger, cache, hub, markets: markets.into_iter().collect() }
    }

    fn validate(&self, req: &OrderRequest) -> Result<(String, Side, OrderType, Admission), ExchangeError> {
        let instrument = req.market.trim().to_ascii_uppercase();
        if !self.markets.contains(&instrument) || split_instrument(&instrument).is_none() {
            return Err(ExchangeError::validation(format!("unsupported market {}", req.market)));
        }
        let side = Side::parse(&req.side)
            .ok_or_else(|| ExchangeError::validation(format!("invalid side {}", req.side)))?;
        let order_type = OrderType::parse(&req.order_type)
            .ok_or_else(|| ExchangeError::validation(format!("invalid order type {}", req.order_type)))?;

        let admission = match (order_type, side) {
            (OrderType::Limit, _) => Admission::Limit {
                price: positive(req.price, "price")?,
                qty: positive(req.quantity, "quantity")?,
            },
            (OrderType::Market, Side::Bid) => Admission::MarketBuy { total: positive(req.total.or(req.price), "total")? },
            (OrderType::Market, Side::Ask) => Admission::MarketSell { qty: positive(req.quantity, "quantity")? },
        };
        Ok((instrument, side, order_type, admission))
    }

    pub async fn submit(&self, user_id: &str, req: OrderRequest) -> Result<OrderReceipt, ExchangeError> {
        let result = self.submit_inner(user_id, &req).await;
        match &result {
            Ok(r) => {
                ORDERS.with_label_values(&[r.order.side.as_str(), r.order.order_type.as_str()]).inc();
            }
            Err(e) => {
                REJECTS.with_label_values(&[e.code()]).inc();
                info!(user = %user_id, market = %req.market, reason = %e, "order rejected");
            }
        }
        result
    }

    async fn submit_inner(&self, user_id: &str, req: &OrderRequest) -> Result<OrderReceipt, ExchangeError> {
        let (instrument, side, order_type, admission) = self.validate(req)?;
        let (home, asset) = split_instrument(&instrument)
            .ok_or_else(|| ExchangeError::validation("bad market code"))?;

        let last_price = match admission {
            Admission::Limit { .. } => None,
            _ => Some(self.cache.last_price(&instrument).ok_or_else(|| {
                ExchangeError::UpstreamUnavailable(format!("no last trade price for {instrument}"))
            })?),
        };
        let (res_asset, res_amount) = reservation(home, asset, side, admission)?;

        let mut tx = self.ledger.begin(user_id).await;
        tx.debit(&res_asset, res_amount)?;

        let now = Utc::now();
        let mut order = PendingOrder {
            id: tx.allocate_order_id(),
            user_id: user_id.to_string(),
            instrument: instrument.clone(),
            side,
            order_type,
            limit_price: None,
            original_quantity: Decimal::ZERO,
            remaining_quantity: Decimal::ZERO,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let fill = match (admission, last_price) {
            (Admission::Limit { price, qty }, _) => {
                order.limit_price = Some(price);
                order.original_quantity = qty;
                order.remaining_quantity = qty;
                None
            }
            (Admission::MarketBuy { total }, Some(px)) => {
                let qty = total
                    .checked_div(px)
                    .ok_or_else(|| ExchangeError::validation("total out of range"))?
                    .round_dp_with_strategy(8, RoundingStrategy::ToZero);
                if qty <= EPSILON {
                    return Err(ExchangeError::validation(format!("total {total} buys nothing at {px}")));
                }
                order.original_quantity = qty;
                order.remaining_quantity = qty;
                let (fill, _) = apply_fill(&mut tx, &mut order, px, qty)?;
                // sisa total yang tidak terpakai dikembalikan
                tx.credit(home, total - fill.total_amount);
                Some(fill)
            }
            (Admission::MarketSell { qty }, Some(px)) => {
                order.original_quantity = qty;
                order.remaining_quantity = qty;
                let (fill, _) = apply_fill(&mut tx, &mut order, px, qty)?;
                Some(fill)
            }
            (_, None) => return Err(ExchangeError::UpstreamUnavailable("no last trade price".into())),
        };

        tx.insert_order(order.clone());
        tx.commit().await?;

        info!(
            order_id = order.id,
            user = %user_id,
            instrument = %order.instrument,
            side = side.as_str(),
            kind = order_type.as_str(),
            reserved = %res_amount,
            "order accepted"
        );
        if let Some(f) = &fill {
            self.hub.publish_fill(&FillNotice::from_fill(&order, f));
        }
        Ok(OrderReceipt { order, fill })
    }

    /// Cancel an open order and release only what is still reserved.
    pub async fn cancel(&self, user_id: &str, order_id: OrderId) -> Result<PendingOrder, ExchangeError> {
        let result = self.cancel_inner(user_id, order_id).await;
        if let Err(e) = &result {
            REJECTS.with_label_values(&[e.code()]).inc();
        }
        result
    }

    async fn cancel_inner(&self, user_id: &str, order_id: OrderId) -> Result<PendingOrder, ExchangeError> {
        let mut tx = self.ledger.begin_for_order(order_id).await?;
        let mut order = tx
            .order()
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id}")))?;
        if order.user_id != user_id {
            // jangan bocorkan keberadaan order milik user lain
            return Err(ExchangeError::NotFound(format!("order {order_id}")));
        }
        if !order.status.is_open() {
            return Err(ExchangeError::validation(format!(
                "order {order_id} is {:?} and cannot be cancelled",
                order.status
            )));
        }
        let (asset, amount) = order
            .open_reservation()
            .ok_or_else(|| ExchangeError::validation(format!("order {order_id} holds no reservation")))?;

        order.status = OrderStatus::Cancelled;
        order.updated_at = Utc::now();
        tx.credit(&asset, amount);
        tx.update_order(order.clone())?;
        tx.commit().await?;

        CANCELS.inc();
        info!(
            order_id,
            user = %user_id,
            executed = %order.executed_quantity(),
            refund = %amount,
            asset = %asset,
            "order cancelled"
        );
        Ok(order)
    }

    /// Available balance per asset plus what open orders hold, read together.
    pub async fn balances(&self, user_id: &str) -> Vec<BalanceView> {
        let (available, open) = self.ledger.balance_snapshot(user_id).await;
        let mut views: Vec<BalanceView> = available
            .into_iter()
            .map(|(currency, balance)| BalanceView { currency, balance, locked: Decimal::ZERO })
            .collect();
        for order in open {
            let Some((asset, amount)) = order.open_reservation() else { continue };
            match views.iter_mut().find(|v| v.currency == asset) {
                Some(v) => v.locked += amount,
                None => views.push(BalanceView { currency: asset, balance: Decimal::ZERO, locked: amount }),
            }
        }
        views.sort_by(|a, b| a.currency.cmp(&b.currency));
        views
    }

    pub async fn pending_orders(&self, user_id: &str) -> Vec<PendingOrder> {
        self.ledger.user_open_orders(user_id).await
    }

    pub fn transactions(&self, user_id: &str, page: usize, limit: usize) -> TransactionPage {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let (transactions, total) = self.ledger.fills_for(user_id, page, limit);
        TransactionPage { transactions, page, limit, total }
    }

    fn known_market(&self, market: &str) -> Result<String, ExchangeError> {
        let instrument = market.trim().to_ascii_uppercase();
        if !self.markets.contains(&instrument) {
            return Err(ExchangeError::validation(format!("unsupported market {market}")));
        }
        Ok(instrument)
    }

    pub fn ticker(&self, market: &str) -> Result<Ticker, ExchangeError> {
        let instrument = self.known_market(market)?;
        self.cache
            .ticker(&instrument)
            .ok_or_else(|| ExchangeError::UpstreamUnavailable(format!("no ticker yet for {instrument}")))
    }

    /// Matching-level book with its best prices.
    pub fn orderbook(&self, market: &str) -> Result<OrderBookView, ExchangeError> {
        let instrument = self.known_market(market)?;
        let unavailable = || ExchangeError::UpstreamUnavailable(format!("no order book yet for {instrument}"));
        let orderbook = self.cache.snapshot(&instrument).ok_or_else(unavailable)?;
        let best = self.cache.best_prices(&instrument).ok_or_else(unavailable)?;
        Ok(OrderBookView { orderbook: (*orderbook).clone(), best_ask: best.best_ask, best_bid: best.best_bid })
    }
}
