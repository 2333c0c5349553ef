// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Quantities at or below this are treated as zero (1e-8).
pub const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

pub type UserId = String;
pub type OrderId = u64;

/// Split an instrument code such as `KRW-BTC` into `(home, asset)`.
pub fn split_instrument(code: &str) -> Option<(&str, &str)> {
    let (home, asset) = code.split_once('-')?;
    if home.is_empty() || asset.is_empty() || asset.contains('-') {
        return None;
    }
    Some((home, asset))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Bid, Ask }

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bid" | "buy" => Some(Side::Bid),
            "ask" | "sell" => Some(Side::Ask),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str { match self { Side::Bid => "bid", Side::Ask => "ask" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType { Limit, Market }

impl OrderType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "limit" => Some(OrderType::Limit),
            "market" | "price" => Some(OrderType::Market),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str { match self { OrderType::Limit => "limit", OrderType::Market => "market" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus { Pending, Partial, Filled, Cancelled }

impl OrderStatus {
    pub fn is_open(&self) -> bool { matches!(self, OrderStatus::Pending | OrderStatus::Partial) }

    /// Status only moves forward; filled and cancelled are terminal.
    pub fn can_become(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Partial | Filled | Cancelled) => true,
            (Partial, Partial | Filled | Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub instrument: String,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub original_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn executed_quantity(&self) -> Decimal { self.original_quantity - self.remaining_quantity }

    /// What this order still holds out of the user's balance: `(asset, amount)`.
    /// Only open limit orders hold anything.
    pub fn open_reservation(&self) -> Option<(String, Decimal)> {
        if !self.status.is_open() {
            return None;
        }
        let (home, asset) = split_instrument(&self.instrument)?;
        match (self.side, self.limit_price) {
            (Side::Bid, Some(px)) => Some((home.to_string(), px * self.remaining_quantity)),
            (Side::Ask, Some(_)) => Some((asset.to_string(), self.remaining_quantity)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillRecord {
    pub id: u64,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub instrument: String,
    pub side: Side,
    pub exec_price: Decimal,
    pub exec_quantity: Decimal,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

// ---- Market data (upstream wire shape) ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookUnit {
    pub ask_price: Decimal,
    pub bid_price: Decimal,
    pub ask_size: Decimal,
    pub bid_size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument: String,
    pub level: Decimal,
    pub units: Vec<OrderBookUnit>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub code: String,
    pub trade_price: Decimal,
    #[serde(default)]
    pub change_rate: Option<Decimal>,
    #[serde(default)]
    pub high_price: Option<Decimal>,
    #[serde(default)]
    pub low_price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BestPrices { pub best_ask: Option<Decimal>, pub best_bid: Option<Decimal> }

/// Fill event pushed to clients after a settlement commits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillNotice {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub instrument: String,
    pub side: Side,
    pub exec_price: Decimal,
    pub exec_qty: Decimal,
    pub remaining_qty: Decimal,
    pub status: OrderStatus,
    pub timestamp: i64,
}

impl FillNotice {
    pub fn from_fill(order: &PendingOrder, fill: &FillRecord) -> Self {
        Self {
            user_id: order.user_id.clone(),
            order_id: order.id,
            instrument: order.instrument.clone(),
            side: order.side,
            exec_price: fill.exec_price,
            exec_qty: fill.exec_quantity,
            remaining_qty: order.remaining_quantity,
            status: order.status,
            timestamp: fill.created_at.timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn splits_instrument_codes() {
        assert_eq!(split_instrument("KRW-BTC"), Some(("KRW", "BTC")));
        assert_eq!(split_instrument("KRWBTC"), None);
        assert_eq!(split_instrument("KRW-"), None);
        assert_eq!(split_instrument("A-B-C"), None);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use OrderStatus::*;
        assert!(Pending.can_become(Partial));
        assert!(Partial.can_become(Filled));
        assert!(Partial.can_become(Cancelled));
        assert!(!Filled.can_become(Cancelled));
        assert!(!Cancelled.can_become(Partial));
        assert!(!Partial.can_become(Pending));
    }

    #[test]
    fn epsilon_is_one_e_minus_8() {
        assert_eq!(EPSILON, Decimal::from_str("0.00000001").unwrap());
    }

    #[test]
    fn open_bid_reserves_home_currency() {
        let now = Utc::now();
        let mut o = PendingOrder {
            id: 1,
            user_id: "u1".into(),
            instrument: "KRW-BTC".into(),
            side: Side::Bid,
            order_type: OrderType::Limit,
            limit_price: Some(Decimal::from(50_000_000)),
            original_quantity: Decimal::from_str("0.01").unwrap(),
            remaining_quantity: Decimal::from_str("0.004").unwrap(),
            status: OrderStatus::Partial,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(o.open_reservation(), Some(("KRW".to_string(), Decimal::from(200_000))));
        o.status = OrderStatus::Cancelled;
        assert_eq!(o.open_reservation(), None);
    }

    #[test]
    fn side_and_type_parse_aliases() {
        assert_eq!(Side::parse("BUY"), Some(Side::Bid));
        assert_eq!(Side::parse("ask"), Some(Side::Ask));
        assert_eq!(Side::parse("hold"), None);
        assert_eq!(OrderType::parse("price"), Some(OrderType::Market));
        assert_eq!(OrderType::parse("stop"), None);
    }
}
