// ===============================
// src/settlement.rs
// ===============================
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::domain::{split_instrument, FillRecord, OrderStatus, PendingOrder, Side, EPSILON};
use crate::error::ExchangeError;
use crate::ledger::{LedgerStore, LedgerTx};
use crate::metrics::{FILLS, SETTLE_LATENCY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Cancelled or filled before we got the row lock.
    NotOpen,
    /// Remaining quantity moved since the caller read the order.
    Stale,
}

#[derive(Debug, Clone)]
pub struct SettledFill {
    pub order: PendingOrder,
    pub fill: FillRecord,
    pub refund: Decimal,
}

#[derive(Debug, Clone)]
pub enum FillOutcome {
    Settled(SettledFill),
    Skipped(SkipReason),
}

/// Balance movements of one fill, before they are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FillDeltas {
    pub credit_asset: String,
    pub credit_amount: Decimal,
    pub refund_asset: String,
    pub refund: Decimal,
    pub total_amount: Decimal,
}

/// A bid reserved `limit × qty`; anything it pays below the limit goes back.
pub fn fill_deltas(order: &PendingOrder, exec_price: Decimal, exec_qty: Decimal) -> Result<FillDeltas, ExchangeError> {
    let (home, asset) = split_instrument(&order.instrument)
        .ok_or_else(|| ExchangeError::validation(format!("bad instrument {}", order.instrument)))?;
    let out_of_range = || ExchangeError::validation(format!("fill {exec_qty} @ {exec_price} out of range"));
    let total_amount = exec_price.checked_mul(exec_qty).ok_or_else(out_of_range)?;
    let deltas = match order.side {
        Side::Bid => {
            let refund = match order.limit_price {
                Some(limit) if exec_price < limit => {
                    (limit - exec_price).checked_mul(exec_qty).ok_or_else(out_of_range)?
                }
                _ => Decimal::ZERO,
            };
            FillDeltas {
                credit_asset: asset.to_string(),
                credit_amount: exec_qty,
                refund_asset: home.to_string(),
                refund,
                total_amount,
            }
        }
        Side::Ask => FillDeltas {
            credit_asset: home.to_string(),
            credit_amount: total_amount,
            refund_asset: home.to_string(),
            refund: Decimal::ZERO,
            total_amount,
        },
    };
    Ok(deltas)
}

fn dust_reservation(order: &PendingOrder, dust: Decimal) -> Option<(String, Decimal)> {
    let (home, asset) = split_instrument(&order.instrument)?;
    match (order.side, order.limit_price) {
        (Side::Bid, Some(limit)) => Some((home.to_string(), limit * dust)),
        (Side::Ask, Some(_)) => Some((asset.to_string(), dust)),
        _ => None,
    }
}

/// Credit, fill record, order transition, refund. Runs inside the caller's transaction.
pub fn apply_fill(
    tx: &mut LedgerTx<'_>,
    order: &mut PendingOrder,
    exec_price: Decimal,
    exec_qty: Decimal,
) -> Result<(FillRecord, Decimal), ExchangeError> {
    if exec_price <= Decimal::ZERO || exec_qty <= EPSILON {
        return Err(ExchangeError::validation("fill price and quantity must be positive"));
    }
    if exec_qty > order.remaining_quantity + EPSILON {
        return Err(ExchangeError::validation(format!(
            "fill {exec_qty} exceeds remaining {} on order {}",
            order.remaining_quantity, order.id
        )));
    }
    let deltas = fill_deltas(order, exec_price, exec_qty)?;
    let now = Utc::now();

    tx.credit(&deltas.credit_asset, deltas.credit_amount);

    let fill = tx.record_fill(FillRecord {
        id: 0,
        order_id: order.id,
        user_id: order.user_id.clone(),
        instrument: order.instrument.clone(),
        side: order.side,
        exec_price,
        exec_quantity: exec_qty,
        total_amount: deltas.total_amount,
        created_at: now,
    });

    let remaining = (order.remaining_quantity - exec_qty).max(Decimal::ZERO);
    order.remaining_quantity = remaining;
    order.status = if remaining <= EPSILON { OrderStatus::Filled } else { OrderStatus::Partial };
    order.updated_at = now;

    tx.credit(&deltas.refund_asset, deltas.refund);

    // sisa debu (<= EPSILON) ikut dilepas saat order dianggap filled
    if order.status == OrderStatus::Filled && remaining > Decimal::ZERO {
        if let Some((asset, amount)) = dust_reservation(order, remaining) {
            tx.credit(&asset, amount);
        }
    }
    Ok((fill, deltas.refund))
}

pub struct SettlementService {
    ledger: Arc<LedgerStore>,
}

impl SettlementService {
    pub fn new(ledger: Arc<LedgerStore>) -> Self { Self { ledger } }

    /// Settle one increment of a resting order atomically. Never retry after `Settled`.
    pub async fn execute_fill(
        &self,
        order: &PendingOrder,
        exec_price: Decimal,
        exec_qty: Decimal,
        new_remaining: Decimal,
    ) -> Result<FillOutcome, ExchangeError> {
        let started = Instant::now();
        let mut tx = self.ledger.begin_for_order(order.id).await?;
        let mut current = tx
            .order()
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order.id)))?;

        if !current.status.is_open() {
            debug!(order_id = order.id, status = ?current.status, "settle: order no longer open");
            return Ok(FillOutcome::Skipped(SkipReason::NotOpen));
        }
        if current.remaining_quantity != order.remaining_quantity {
            debug!(order_id = order.id, "settle: stale view of remaining quantity");
            return Ok(FillOutcome::Skipped(SkipReason::Stale));
        }
        if (current.remaining_quantity - exec_qty - new_remaining).abs() > EPSILON {
            return Err(ExchangeError::validation(format!(
                "remaining {new_remaining} does not follow from fill {exec_qty} on order {}",
                order.id
            )));
        }

        let (fill, refund) = apply_fill(&mut tx, &mut current, exec_price, exec_qty)?;
        tx.update_order(current.clone())?;
        tx.commit().await?;

        FILLS.with_label_values(&[current.side.as_str()]).inc();
        SETTLE_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            order_id = current.id,
            user = %current.user_id,
            instrument = %current.instrument,
            side = current.side.as_str(),
            px = %exec_price,
            qty = %exec_qty,
            remaining = %current.remaining_quantity,
            refund = %refund,
            "FILLED"
        );
        Ok(FillOutcome::Settled(SettledFill { order: current, fill, refund }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::{d, limit_order, store};
    use proptest::prelude::*;
    use rust_decimal::RoundingStrategy;

    async fn rest(ledger: &LedgerStore, mut order: PendingOrder, reserve: (&str, Decimal)) -> PendingOrder {
        let mut tx = ledger.begin(&order.user_id).await;
        tx.debit(reserve.0, reserve.1).unwrap();
        order.id = tx.allocate_order_id();
        tx.insert_order(order.clone());
        tx.commit().await.unwrap();
        order
    }

    #[test]
    fn bid_below_limit_refunds_difference() {
        let o = limit_order("u", Side::Bid, "50000000", "0.01");
        let dl = fill_deltas(&o, d("49000000"), d("0.01")).unwrap();
        assert_eq!(dl.credit_asset, "BTC");
        assert_eq!(dl.credit_amount, d("0.01"));
        assert_eq!(dl.refund, d("10000"));
        assert_eq!(dl.total_amount, d("490000"));
    }

    #[test]
    fn ask_credits_proceeds_without_refund() {
        let o = limit_order("u", Side::Ask, "100", "2");
        let dl = fill_deltas(&o, d("120"), d("1.5")).unwrap();
        assert_eq!(dl.credit_asset, "KRW");
        assert_eq!(dl.credit_amount, d("180"));
        assert_eq!(dl.refund, Decimal::ZERO);
    }

    #[test]
    fn overflowing_fill_notional_is_an_error() {
        let o = limit_order("u", Side::Ask, "1", "2");
        let err = fill_deltas(&o, d("79228162514264337593543950335"), d("2")).unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[tokio::test]
    async fn partial_then_full_fill() {
        let ledger = Arc::new(store(1_000));
        let svc = SettlementService::new(ledger.clone());
        let o = rest(&ledger, limit_order("u", Side::Bid, "100", "4"), ("KRW", d("400"))).await;

        let FillOutcome::Settled(first) = svc.execute_fill(&o, d("90"), d("1"), d("3")).await.unwrap() else {
            panic!("expected settlement");
        };
        assert_eq!(first.order.status, OrderStatus::Partial);
        assert_eq!(first.refund, d("10"));

        let FillOutcome::Settled(second) =
            svc.execute_fill(&first.order, d("100"), d("3"), d("0")).await.unwrap()
        else {
            panic!("expected settlement");
        };
        assert_eq!(second.order.status, OrderStatus::Filled);

        let b = ledger.balances("u").await;
        // 1000 - 400 reserved + 10 refund
        assert_eq!(b.get("KRW"), Some(&d("610")));
        assert_eq!(b.get("BTC"), Some(&d("4")));
        assert_eq!(ledger.fills_for("u", 1, 10).1, 2);
    }

    #[tokio::test]
    async fn stale_view_is_skipped_without_mutation() {
        let ledger = Arc::new(store(1_000));
        let svc = SettlementService::new(ledger.clone());
        let o = rest(&ledger, limit_order("u", Side::Bid, "100", "4"), ("KRW", d("400"))).await;
        svc.execute_fill(&o, d("100"), d("1"), d("3")).await.unwrap();

        // same stale copy again: must not settle twice
        let out = svc.execute_fill(&o, d("100"), d("1"), d("3")).await.unwrap();
        assert!(matches!(out, FillOutcome::Skipped(SkipReason::Stale)));
        assert_eq!(ledger.balances("u").await.get("BTC"), Some(&d("1")));
    }

    #[tokio::test]
    async fn inconsistent_remaining_is_rejected() {
        let ledger = Arc::new(store(1_000));
        let svc = SettlementService::new(ledger.clone());
        let o = rest(&ledger, limit_order("u", Side::Bid, "100", "4"), ("KRW", d("400"))).await;
        let err = svc.execute_fill(&o, d("100"), d("1"), d("2")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
        assert_eq!(ledger.order(o.id).await.unwrap().remaining_quantity, d("4"));
    }

    proptest! {
        // Refund against the original limit on every partial fill must neither
        // over- nor under-refund: available + open reservation + spent stays constant.
        #[test]
        fn repeated_partial_fills_conserve_balance(
            limit in 1_000u64..100_000_000,
            qty_units in 1u64..100_000,
            steps in proptest::collection::vec((1u32..=100, 0u32..=1_000), 1..12),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async move {
                let limit = Decimal::from(limit);
                let qty = Decimal::new(qty_units as i64, 4);
                let start = limit * qty;
                let ledger = Arc::new(crate::ledger::LedgerStore::new(
                    Arc::new(crate::journal::NullJournal),
                    crate::ledger::tests::opening(0),
                ));
                {
                    let mut tx = ledger.begin("u").await;
                    tx.credit("KRW", start);
                    tx.commit().await.unwrap();
                }
                let svc = SettlementService::new(ledger.clone());
                let mut base = limit_order("u", Side::Bid, "1", "1");
                base.limit_price = Some(limit);
                base.original_quantity = qty;
                base.remaining_quantity = qty;
                let mut order = rest(&ledger, base, ("KRW", start)).await;

                let mut spent = Decimal::ZERO;
                let mut bought = Decimal::ZERO;
                for (pct, discount_permille) in steps {
                    if !order.status.is_open() { break; }
                    let q = (order.remaining_quantity * Decimal::from(pct) / Decimal::from(100))
                        .round_dp_with_strategy(8, RoundingStrategy::ToZero);
                    if q <= EPSILON { continue; }
                    let px = (limit - limit * Decimal::from(discount_permille) / Decimal::from(1_000) * Decimal::new(9, 1))
                        .round_dp_with_strategy(0, RoundingStrategy::ToZero)
                        .max(Decimal::ONE);
                    let next = order.remaining_quantity - q;
                    match svc.execute_fill(&order, px, q, next).await.unwrap() {
                        FillOutcome::Settled(s) => {
                            spent += px * q;
                            bought += q;
                            order = s.order;
                        }
                        FillOutcome::Skipped(r) => panic!("unexpected skip {r:?}"),
                    }
                    let b = ledger.balances("u").await;
                    let krw = b.get("KRW").copied().unwrap_or_default();
                    let reserved = order.open_reservation().map(|(_, a)| a).unwrap_or_default();
                    assert_eq!(krw + reserved + spent, start);
                    assert_eq!(bought + order.remaining_quantity, order.original_quantity);
                    assert_eq!(b.get("BTC").copied().unwrap_or_default(), bought);
                }
            });
        }
    }
}
