// ===============================
// src/engine.rs
// ===============================
//
// MatchingEngine: cocokkan order limit yang resting dengan snapshot orderbook
// dari feed (bukan dengan order user lain).
// - Satu run per instrument pada satu waktu; update yang datang saat run
//   masih berjalan langsung dibuang (snapshot berikutnya akan menyusul).
// - Likuiditas yang terpakai hanya mengurangi salinan kerja level, bukan cache.
//
use std::sync::{Arc, Mutex, PoisonError};

use ahash::AHashSet as HashSet;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::domain::{FillNotice, OrderBookSnapshot, PendingOrder, Side, EPSILON};
use crate::error::ExchangeError;
use crate::hub::BroadcastHub;
use crate::ledger::LedgerStore;
use crate::metrics::MATCH_RUNS;
use crate::settlement::{FillOutcome, SettlementService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRun {
    /// Another run for the instrument was in flight.
    Skipped,
    Completed { fills: usize },
}

/// Working copy of one side of a snapshot level.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Asks ascending and bids descending, non-positive price or size dropped.
pub fn working_levels(snapshot: &OrderBookSnapshot) -> (Vec<WorkingLevel>, Vec<WorkingLevel>) {
    let positive = |p: Decimal, s: Decimal| p > Decimal::ZERO && s > Decimal::ZERO;
    let mut asks: Vec<WorkingLevel> = snapshot
        .units
        .iter()
        .filter(|u| positive(u.ask_price, u.ask_size))
        .map(|u| WorkingLevel { price: u.ask_price, size: u.ask_size })
        .collect();
    let mut bids: Vec<WorkingLevel> = snapshot
        .units
        .iter()
        .filter(|u| positive(u.bid_price, u.bid_size))
        .map(|u| WorkingLevel { price: u.bid_price, size: u.bid_size })
        .collect();
    asks.sort_by(|a, b| a.price.cmp(&b.price));
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    (asks, bids)
}

/// Removes its instrument from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    instrument: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, instrument: &str) -> Option<Self> {
        let fresh = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instrument.to_string());
        fresh.then(|| Self { set, instrument: instrument.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instrument);
    }
}

pub struct MatchingEngine {
    ledger: Arc<LedgerStore>,
    settlement: Arc<SettlementService>,
    hub: Arc<BroadcastHub>,
    in_flight: Mutex<HashSet<String>>,
}

impl MatchingEngine {
    pub fn new(ledger: Arc<LedgerStore>, settlement: Arc<SettlementService>, hub: Arc<BroadcastHub>) -> Self {
        Self { ledger, settlement, hub, in_flight: Mutex::new(HashSet::new()) }
    }

    /// Fire-and-forget run; errors stay inside this instrument's task.
    pub fn spawn_process(self: &Arc<Self>, snapshot: Arc<OrderBookSnapshot>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.process_instrument(&snapshot.instrument, &snapshot).await {
                Ok(MatchRun::Completed { fills }) if fills > 0 => {
                    debug!(instrument = %snapshot.instrument, fills, "matching run done");
                }
                Ok(_) => {}
                Err(e) => {
                    MATCH_RUNS.with_label_values(&["error"]).inc();
                    error!(instrument = %snapshot.instrument, error = %e, "matching run failed");
                }
            }
        });
    }

    pub async fn process_instrument(
        &self,
        instrument: &str,
        snapshot: &OrderBookSnapshot,
    ) -> Result<MatchRun, ExchangeError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, instrument) else {
            MATCH_RUNS.with_label_values(&["skipped"]).inc();
            return Ok(MatchRun::Skipped);
        };

        let orders = self.ledger.open_orders(instrument).await;
        if orders.is_empty() {
            MATCH_RUNS.with_label_values(&["completed"]).inc();
            return Ok(MatchRun::Completed { fills: 0 });
        }
        let (mut asks, mut bids) = working_levels(snapshot);

        let mut fills = 0;
        for order in orders.iter().filter(|o| o.side == Side::Bid) {
            fills += self.sweep(order, &mut asks).await?;
        }
        for order in orders.iter().filter(|o| o.side == Side::Ask) {
            fills += self.sweep(order, &mut bids).await?;
        }

        MATCH_RUNS.with_label_values(&["completed"]).inc();
        Ok(MatchRun::Completed { fills })
    }

    /// Walk the opposite side best-first while the level still crosses the order's limit.
    async fn sweep(&self, order: &PendingOrder, levels: &mut [WorkingLevel]) -> Result<usize, ExchangeError> {
        // order market tidak pernah resting
        let Some(limit) = order.limit_price else {
            return Ok(0);
        };
        let crosses = |price: Decimal| match order.side {
            Side::Bid => price <= limit,
            Side::Ask => price >= limit,
        };

        let mut current = order.clone();
        let mut fills = 0;
        for level in levels.iter_mut() {
            if current.remaining_quantity <= EPSILON || !crosses(level.price) {
                break;
            }
            let exec_qty = current.remaining_quantity.min(level.size);
            if exec_qty <= EPSILON {
                continue;
            }
            let new_remaining = current.remaining_quantity - exec_qty;
            match self.settlement.execute_fill(&current, level.price, exec_qty, new_remaining).await? {
                FillOutcome::Settled(settled) => {
                    level.size -= exec_qty;
                    fills += 1;
                    if !settled.refund.is_zero() {
                        debug!(order_id = order.id, refund = %settled.refund, "price improvement refunded");
                    }
                    self.hub.publish_fill(&FillNotice::from_fill(&settled.order, &settled.fill));
                    current = settled.order;
                }
                FillOutcome::Skipped(reason) => {
                    warn!(order_id = order.id, ?reason, "order changed during matching, skipping");
                    break;
                }
            }
        }
        Ok(fills)
    }
}
