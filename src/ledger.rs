// ===============================
// src/ledger.rs
// ===============================
//
// LedgerStore: tiga "tabel" (saldo user, order, fill) di memori.
// - Setiap baris saldo & order punya lock sendiri (tokio Mutex, owned guard),
//   dipegang sepanjang transaksi.
// - Urutan lock global: baris order dulu, baru baris saldo pemiliknya.
// - Transaksi bekerja di salinan (staged); commit = tulis journal lalu terapkan.
//   Drop tanpa commit = rollback.
//
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, error};

use crate::domain::{FillRecord, OrderId, PendingOrder, Side, UserId};
use crate::error::ExchangeError;
use crate::journal::{Journal, JournalRecord, Replay};

/// Asset -> available quantity for one user.
pub type BalanceRow = BTreeMap<String, Decimal>;

type Row<T> = Arc<RowLock<T>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LedgerStore {
    balances: Mutex<HashMap<UserId, Row<BalanceRow>>>,
    orders: Mutex<HashMap<OrderId, Row<PendingOrder>>>,
    open_by_instrument: Mutex<HashMap<String, HashSet<OrderId>>>,
    open_by_user: Mutex<HashMap<UserId, HashSet<OrderId>>>,
    fills: Mutex<Vec<FillRecord>>,
    next_order_id: AtomicU64,
    next_fill_id: AtomicU64,
    next_seq: AtomicU64,
    journal: Arc<dyn Journal>,
    opening_balance: BalanceRow,
}

impl LedgerStore {
    /// `opening_balance` is what a user row starts with the first time it is touched.
    pub fn new(journal: Arc<dyn Journal>, opening_balance: BalanceRow) -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            open_by_instrument: Mutex::new(HashMap::new()),
            open_by_user: Mutex::new(HashMap::new()),
            fills: Mutex::new(Vec::new()),
            next_order_id: AtomicU64::new(1),
            next_fill_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            journal,
            opening_balance,
        }
    }

    /// Rebuild all tables from journal records, oldest first.
    /// A sequence number or fill id seen twice is applied once.
    pub fn restore(journal: Arc<dyn Journal>, opening_balance: BalanceRow, replay: Replay) -> Self {
        let store = Self::new(journal, opening_balance);
        let mut max_order = 0;
        let mut max_fill = 0;
        let mut seen_seq = HashSet::new();
        let mut seen_fill = HashSet::new();
        for rec in replay.records {
            if rec.seq != 0 && !seen_seq.insert(rec.seq) {
                debug!(seq = rec.seq, "ledger: skip repeated journal record");
                continue;
            }
            lock(&store.balances).insert(rec.user_id.clone(), Arc::new(RowLock::new(rec.balances)));
            for o in &rec.orders {
                max_order = max_order.max(o.id);
                lock(&store.orders).insert(o.id, Arc::new(RowLock::new(o.clone())));
            }
            store.reindex(&rec.orders);
            let mut fills = lock(&store.fills);
            for f in rec.fills {
                max_fill = max_fill.max(f.id);
                if seen_fill.insert(f.id) {
                    fills.push(f);
                }
            }
        }
        store.next_order_id.store(max_order + 1, Ordering::SeqCst);
        store.next_fill_id.store(max_fill + 1, Ordering::SeqCst);
        store.next_seq.store(replay.last_seq + 1, Ordering::SeqCst);
        store
    }

    fn balance_row(&self, user_id: &str) -> Row<BalanceRow> {
        let mut map = lock(&self.balances);
        map.entry(user_id.to_string())
            .or_insert_with(|| {
                debug!(user = %user_id, "ledger: provision balance row");
                Arc::new(RowLock::new(self.opening_balance.clone()))
            })
            .clone()
    }

    fn order_row(&self, id: OrderId) -> Option<Row<PendingOrder>> {
        lock(&self.orders).get(&id).cloned()
    }

    fn reindex(&self, orders: &[PendingOrder]) {
        let mut by_instrument = lock(&self.open_by_instrument);
        let mut by_user = lock(&self.open_by_user);
        for o in orders {
            let inst = by_instrument.entry(o.instrument.clone()).or_default();
            let user = by_user.entry(o.user_id.clone()).or_default();
            if o.status.is_open() {
                inst.insert(o.id);
                user.insert(o.id);
            } else {
                inst.remove(&o.id);
                user.remove(&o.id);
            }
        }
    }

    fn user_open_ids(&self, user_id: &str) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = lock(&self.open_by_user)
            .get(user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Start a transaction holding the user's balance row lock.
    pub async fn begin(&self, user_id: &str) -> LedgerTx<'_> {
        let balance = self.balance_row(user_id).lock_owned().await;
        let staged = balance.clone();
        LedgerTx {
            store: self,
            user_id: user_id.to_string(),
            balance,
            staged,
            order: None,
            new_orders: Vec::new(),
            fills: Vec::new(),
        }
    }

    /// Start a transaction on an existing order: order row first, then its owner's balance row.
    pub async fn begin_for_order(&self, order_id: OrderId) -> Result<LedgerTx<'_>, ExchangeError> {
        let row = self
            .order_row(order_id)
            .ok_or_else(|| ExchangeError::NotFound(format!("order {order_id}")))?;
        let order_guard = row.lock_owned().await;
        let staged_order = order_guard.clone();
        let mut tx = self.begin(&staged_order.user_id).await;
        tx.order = Some((order_guard, staged_order));
        Ok(tx)
    }

    pub async fn balances(&self, user_id: &str) -> BalanceRow {
        self.balance_row(user_id).lock().await.clone()
    }

    /// Balance row and open orders of one user as of a single instant.
    /// Locks the user's open order rows in id order, then the balance row.
    pub async fn balance_snapshot(&self, user_id: &str) -> (BalanceRow, Vec<PendingOrder>) {
        loop {
            let ids = self.user_open_ids(user_id);
            let rows: Vec<Row<PendingOrder>> = {
                let map = lock(&self.orders);
                ids.iter().filter_map(|id| map.get(id).cloned()).collect()
            };
            let mut held = Vec::with_capacity(rows.len());
            for row in rows {
                let guard = row.lock_owned().await;
                if guard.status.is_open() {
                    held.push(guard);
                }
            }
            let balance = self.balance_row(user_id).lock_owned().await;
            // admissions commit under the balance row; anything new means another pass
            let now = self.user_open_ids(user_id);
            if now.len() == held.len() && held.iter().all(|g| now.binary_search(&g.id).is_ok()) {
                let mut orders: Vec<PendingOrder> = held.iter().map(|g| (**g).clone()).collect();
                orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
                return (balance.clone(), orders);
            }
            debug!(user = %user_id, "ledger: open orders changed during snapshot, retrying");
        }
    }

    pub async fn order(&self, id: OrderId) -> Option<PendingOrder> {
        let row = self.order_row(id)?;
        let o = row.lock().await.clone();
        Some(o)
    }

    /// Open orders for one instrument in price-time priority.
    pub async fn open_orders(&self, instrument: &str) -> Vec<PendingOrder> {
        let ids: Vec<OrderId> = lock(&self.open_by_instrument)
            .get(instrument)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        let mut out = self.load_open(ids).await;
        out.retain(|o| o.instrument == instrument);
        sort_price_time(&mut out);
        out
    }

    pub async fn user_open_orders(&self, user_id: &str) -> Vec<PendingOrder> {
        let ids = self.user_open_ids(user_id);
        let mut out = self.load_open(ids).await;
        out.retain(|o| o.user_id == user_id);
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    async fn load_open(&self, ids: Vec<OrderId>) -> Vec<PendingOrder> {
        let rows: Vec<Row<PendingOrder>> = {
            let map = lock(&self.orders);
            ids.iter().filter_map(|id| map.get(id).cloned()).collect()
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let o = row.lock().await;
            if o.status.is_open() {
                out.push(o.clone());
            }
        }
        out
    }

    /// Fills for one user, newest first. `page` starts at 1. Returns the page and the total count.
    pub fn fills_for(&self, user_id: &str, page: usize, limit: usize) -> (Vec<FillRecord>, usize) {
        let fills = lock(&self.fills);
        let mine: Vec<&FillRecord> = fills.iter().rev().filter(|f| f.user_id == user_id).collect();
        let total = mine.len();
        let skip = page.saturating_sub(1).saturating_mul(limit);
        let items = mine.into_iter().skip(skip).take(limit).cloned().collect();
        (items, total)
    }
}

/// Bids: price desc; asks: price asc; then submission time, then id.
pub fn sort_price_time(orders: &mut [PendingOrder]) {
    orders.sort_by(|a, b| {
        let by_price = match (a.side, b.side) {
            (Side::Bid, Side::Bid) => b.limit_price.cmp(&a.limit_price),
            (Side::Ask, Side::Ask) => a.limit_price.cmp(&b.limit_price),
            (Side::Bid, Side::Ask) => std::cmp::Ordering::Less,
            (Side::Ask, Side::Bid) => std::cmp::Ordering::Greater,
        };
        by_price.then(a.created_at.cmp(&b.created_at)).then(a.id.cmp(&b.id))
    });
}

/// A single-user transaction. Nothing is visible until `commit`.
pub struct LedgerTx<'a> {
    store: &'a LedgerStore,
    user_id: UserId,
    balance: OwnedMutexGuard<BalanceRow>,
    staged: BalanceRow,
    order: Option<(OwnedMutexGuard<PendingOrder>, PendingOrder)>,
    new_orders: Vec<PendingOrder>,
    fills: Vec<FillRecord>,
}

impl<'a> LedgerTx<'a> {
    pub fn available(&self, asset: &str) -> Decimal {
        self.staged.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn debit(&mut self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        if amount < Decimal::ZERO {
            return Err(ExchangeError::validation("negative debit"));
        }
        let available = self.available(asset);
        if available < amount {
            return Err(ExchangeError::InsufficientBalance {
                asset: asset.to_string(),
                needed: amount,
                available,
            });
        }
        self.staged.insert(asset.to_string(), available - amount);
        Ok(())
    }

    pub fn credit(&mut self, asset: &str, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        *self.staged.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    /// The locked order row (staged copy), if this transaction was opened on one.
    pub fn order(&self) -> Option<&PendingOrder> { self.order.as_ref().map(|(_, o)| o) }

    /// Replace the staged copy of the locked order row.
    pub fn update_order(&mut self, next: PendingOrder) -> Result<(), ExchangeError> {
        let (_, staged) = self
            .order
            .as_mut()
            .ok_or_else(|| ExchangeError::validation("transaction holds no order row"))?;
        if staged.id != next.id {
            return Err(ExchangeError::validation("order id mismatch"));
        }
        if staged.status != next.status && !staged.status.can_become(next.status) {
            return Err(ExchangeError::validation(format!(
                "illegal status change {:?} -> {:?}",
                staged.status, next.status
            )));
        }
        *staged = next;
        Ok(())
    }

    pub fn allocate_order_id(&self) -> OrderId {
        self.store.next_order_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert_order(&mut self, order: PendingOrder) { self.new_orders.push(order); }

    /// Stage an immutable fill; the id is assigned here.
    pub fn record_fill(&mut self, mut fill: FillRecord) -> FillRecord {
        fill.id = self.store.next_fill_id.fetch_add(1, Ordering::SeqCst);
        self.fills.push(fill.clone());
        fill
    }

    /// Journal first, then make everything visible at once.
    pub async fn commit(self) -> Result<(), ExchangeError> {
        let LedgerTx { store, user_id, mut balance, staged, order, new_orders, fills } = self;

        let mut touched: Vec<PendingOrder> = Vec::with_capacity(1 + new_orders.len());
        if let Some((_, o)) = &order {
            touched.push(o.clone());
        }
        touched.extend(new_orders.iter().cloned());

        let record = JournalRecord {
            seq: store.next_seq.fetch_add(1, Ordering::SeqCst),
            ts_ms: Utc::now().timestamp_millis(),
            user_id: user_id.clone(),
            balances: staged.clone(),
            orders: touched.clone(),
            fills: fills.clone(),
        };
        if let Err(e) = store.journal.append(&record).await {
            error!(?e, user = %user_id, "ledger: journal append failed, rolling back");
            return Err(ExchangeError::Persistence(e.to_string()));
        }

        *balance = staged;
        if let Some((mut guard, o)) = order {
            *guard = o;
        }
        {
            let mut map = lock(&store.orders);
            for o in new_orders {
                map.insert(o.id, Arc::new(RowLock::new(o)));
            }
        }
        store.reindex(&touched);
        lock(&store.fills).extend(fills);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{OrderStatus, OrderType};
    use crate::journal::NullJournal;
    use async_trait::async_trait;
    use std::str::FromStr;

    pub fn d(s: &str) -> Decimal { Decimal::from_str(s).unwrap() }

    pub fn opening(krw: i64) -> BalanceRow {
        let mut b = BalanceRow::new();
        b.insert("KRW".into(), Decimal::from(krw));
        b
    }

    pub fn store(krw: i64) -> LedgerStore { LedgerStore::new(Arc::new(NullJournal), opening(krw)) }

    pub fn limit_order(user: &str, side: Side, px: &str, qty: &str) -> PendingOrder {
        let now = Utc::now();
        PendingOrder {
            id: 0,
            user_id: user.into(),
            instrument: "KRW-BTC".into(),
            side,
            order_type: OrderType::Limit,
            limit_price: Some(d(px)),
            original_quantity: d(qty),
            remaining_quantity: d(qty),
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    struct FailingJournal;

    #[async_trait]
    impl Journal for FailingJournal {
        async fn append(&self, _record: &JournalRecord) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"))
        }
    }

    #[tokio::test]
    async fn new_user_gets_opening_balance() {
        let s = store(1_000_000);
        assert_eq!(s.balances("alice").await.get("KRW"), Some(&Decimal::from(1_000_000)));
    }

    #[tokio::test]
    async fn insufficient_debit_leaves_row_untouched() {
        let s = store(100);
        let mut tx = s.begin("alice").await;
        let err = tx.debit("KRW", Decimal::from(101)).unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));
        drop(tx);
        assert_eq!(s.balances("alice").await.get("KRW"), Some(&Decimal::from(100)));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let s = store(100);
        let mut tx = s.begin("alice").await;
        tx.debit("KRW", Decimal::from(60)).unwrap();
        tx.credit("BTC", d("1"));
        drop(tx);
        let b = s.balances("alice").await;
        assert_eq!(b.get("KRW"), Some(&Decimal::from(100)));
        assert_eq!(b.get("BTC"), None);
    }

    #[tokio::test]
    async fn journal_failure_is_persistence_error_and_nothing_applies() {
        let s = LedgerStore::new(Arc::new(FailingJournal), opening(100));
        let mut tx = s.begin("alice").await;
        tx.debit("KRW", Decimal::from(60)).unwrap();
        let mut o = limit_order("alice", Side::Bid, "10", "6");
        o.id = tx.allocate_order_id();
        tx.insert_order(o);
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Persistence(_)));
        assert_eq!(s.balances("alice").await.get("KRW"), Some(&Decimal::from(100)));
        assert!(s.open_orders("KRW-BTC").await.is_empty());
    }

    #[tokio::test]
    async fn open_orders_follow_price_time_priority() {
        let s = store(10_000_000);
        let specs = [
            ("a", Side::Bid, "100"),
            ("b", Side::Bid, "105"),
            ("c", Side::Bid, "100"),
            ("d", Side::Ask, "120"),
            ("e", Side::Ask, "110"),
        ];
        for (user, side, px) in specs {
            let mut tx = s.begin(user).await;
            let mut o = limit_order(user, side, px, "1");
            o.id = tx.allocate_order_id();
            tx.insert_order(o);
            tx.commit().await.unwrap();
        }
        let users: Vec<String> = s.open_orders("KRW-BTC").await.into_iter().map(|o| o.user_id).collect();
        assert_eq!(users, vec!["b", "a", "c", "e", "d"]);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let s = store(0);
        assert!(matches!(s.begin_for_order(42).await, Err(ExchangeError::NotFound(_))));
    }

    #[tokio::test]
    async fn fills_paginate_newest_first() {
        let s = store(0);
        let mut tx = s.begin("alice").await;
        for i in 1..=5 {
            tx.record_fill(FillRecord {
                id: 0,
                order_id: i,
                user_id: "alice".into(),
                instrument: "KRW-BTC".into(),
                side: Side::Bid,
                exec_price: Decimal::from(1),
                exec_quantity: Decimal::from(1),
                total_amount: Decimal::from(1),
                created_at: Utc::now(),
            });
        }
        tx.commit().await.unwrap();
        let (page, total) = s.fills_for("alice", 2, 2);
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|f| f.order_id).collect::<Vec<_>>(), vec![3, 2]);
        assert!(s.fills_for("bob", 1, 10).0.is_empty());
    }

    #[tokio::test]
    async fn restore_rebuilds_tables_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let journal = Arc::new(crate::journal::JsonlJournal::open(&path).await.unwrap());
        let s = LedgerStore::new(journal, opening(1_000));
        let mut tx = s.begin("alice").await;
        tx.debit("KRW", Decimal::from(300)).unwrap();
        let mut o = limit_order("alice", Side::Bid, "100", "3");
        o.id = tx.allocate_order_id();
        tx.insert_order(o);
        tx.commit().await.unwrap();

        let replay = crate::journal::read_records(&path).await.unwrap();
        let back = LedgerStore::restore(Arc::new(NullJournal), opening(1_000), replay);
        assert_eq!(back.balances("alice").await.get("KRW"), Some(&Decimal::from(700)));
        let open = back.open_orders("KRW-BTC").await;
        assert_eq!(open.len(), 1);

        let tx = back.begin("bob").await;
        assert_eq!(tx.allocate_order_id(), open[0].id + 1);
    }

    #[tokio::test]
    async fn journal_line_written_twice_restores_one_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let journal = Arc::new(crate::journal::JsonlJournal::open(&path).await.unwrap());
        let s = LedgerStore::new(journal, opening(1_000));
        let mut tx = s.begin("alice").await;
        tx.debit("KRW", Decimal::from(100)).unwrap();
        tx.credit("BTC", d("1"));
        tx.record_fill(FillRecord {
            id: 0,
            order_id: 7,
            user_id: "alice".into(),
            instrument: "KRW-BTC".into(),
            side: Side::Bid,
            exec_price: Decimal::from(100),
            exec_quantity: d("1"),
            total_amount: Decimal::from(100),
            created_at: Utc::now(),
        });
        tx.commit().await.unwrap();

        // same line again, as left by a flush that failed after the bytes landed
        let line = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("{line}{line}")).unwrap();

        let replay = crate::journal::read_records(&path).await.unwrap();
        assert_eq!(replay.records.len(), 2);
        assert_eq!(replay.records[0], replay.records[1]);
        let back = LedgerStore::restore(Arc::new(NullJournal), opening(1_000), replay);
        let (fills, total) = back.fills_for("alice", 1, 10);
        assert_eq!(total, 1);
        assert_eq!(fills[0].order_id, 7);
        assert_eq!(back.balances("alice").await.get("KRW"), Some(&Decimal::from(900)));
        assert_eq!(back.balances("alice").await.get("BTC"), Some(&d("1")));
    }

    #[tokio::test]
    async fn repeated_fill_id_under_new_sequence_is_dropped() {
        let mut rec = JournalRecord {
            seq: 1,
            ts_ms: 1,
            user_id: "alice".into(),
            balances: opening(900),
            orders: vec![],
            fills: vec![FillRecord {
                id: 3,
                order_id: 1,
                user_id: "alice".into(),
                instrument: "KRW-BTC".into(),
                side: Side::Bid,
                exec_price: Decimal::from(100),
                exec_quantity: d("1"),
                total_amount: Decimal::from(100),
                created_at: Utc::now(),
            }],
        };
        let first = rec.clone();
        rec.seq = 0;
        let replay = Replay { records: vec![first, rec], last_seq: 1 };
        let back = LedgerStore::restore(Arc::new(NullJournal), opening(1_000), replay);
        assert_eq!(back.fills_for("alice", 1, 10).1, 1);

        let mut tx = back.begin("alice").await;
        let fill = tx.record_fill(FillRecord { id: 0, ..back.fills_for("alice", 1, 1).0[0].clone() });
        assert_eq!(fill.id, 4);
    }
}
