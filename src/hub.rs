// ===============================
// src/hub.rs
// ===============================
//
// BroadcastHub: fan-out ke semua sesi client.
// - Tiap sesi punya antrean keluar terbatas (bounded mpsc).
// - Kirim pakai try_send: sesi yang penuh/tertutup dibuang sendiri,
//   sesi lain tetap menerima.
//
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::FillNotice;
use crate::metrics::{WS_CLIENTS, WS_DROPPED};

pub type SessionId = u64;
pub type Payload = Arc<str>;

pub struct BroadcastHub {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Payload>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self) -> (SessionId, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(id, tx);
        WS_CLIENTS.set(sessions.len() as i64);
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&id);
        WS_CLIENTS.set(sessions.len() as i64);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver to every session; returns how many accepted the message.
    pub fn broadcast(&self, payload: Payload) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<Payload>)> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = id, "client queue full, dropping session");
                    dead.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = id, "client gone");
                    dead.push(id);
                }
            }
        }
        if !dead.is_empty() {
            WS_DROPPED.inc_by(dead.len() as u64);
            for id in dead {
                self.unregister(id);
            }
        }
        delivered
    }

    /// Upstream frame relayed verbatim.
    pub fn publish_raw(&self, raw: Payload) -> usize { self.broadcast(raw) }

    pub fn publish_fill(&self, notice: &FillNotice) -> usize {
        let msg = json!({
            "type": "order_filled",
            "userId": notice.user_id,
            "timestamp": notice.timestamp,
            "data": notice,
        });
        self.broadcast(Arc::from(msg.to_string()))
    }
}

/// `{type:"initial_prices", data:{instrument: price}}` sent to a fresh session.
pub fn initial_prices_message(prices: &HashMap<String, Decimal>) -> Payload {
    let data: serde_json::Map<String, serde_json::Value> = prices
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    let msg = json!({ "type": "initial_prices", "data": data, "timestamp": Utc::now().timestamp_millis() });
    Arc::from(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderStatus, Side};
    use crate::ledger::tests::d;

    #[tokio::test]
    async fn failing_sessions_do_not_block_others() {
        let hub = BroadcastHub::new(1);
        let (_closed_id, closed_rx) = hub.register();
        let (_slow_id, _slow_rx) = hub.register();
        let (_ok_id, mut ok_rx) = hub.register();
        drop(closed_rx);

        // slow session fills its single slot on the first message
        assert_eq!(hub.publish_raw(Arc::from("one")), 2);
        assert_eq!(ok_rx.recv().await.as_deref(), Some("one"));

        assert_eq!(hub.publish_raw(Arc::from("two")), 1);
        assert_eq!(ok_rx.recv().await.as_deref(), Some("two"));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn fill_notice_shape() {
        let hub = BroadcastHub::new(8);
        let (_id, mut rx) = hub.register();
        hub.publish_fill(&FillNotice {
            user_id: "alice".into(),
            order_id: 7,
            instrument: "KRW-BTC".into(),
            side: Side::Bid,
            exec_price: d("49000000"),
            exec_qty: d("0.01"),
            remaining_qty: d("0"),
            status: OrderStatus::Filled,
            timestamp: 1,
        });
        let text = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "order_filled");
        assert_eq!(v["userId"], "alice");
        assert_eq!(v["data"]["orderId"], 7);
        assert_eq!(v["data"]["status"], "filled");
        assert_eq!(v["data"]["execPrice"], "49000000");
    }

    #[test]
    fn initial_prices_lists_instruments() {
        let mut prices = HashMap::new();
        prices.insert("KRW-BTC".to_string(), d("50000000"));
        let v: serde_json::Value = serde_json::from_str(&initial_prices_message(&prices)).unwrap();
        assert_eq!(v["type"], "initial_prices");
        assert_eq!(v["data"]["KRW-BTC"], "50000000");
    }
}
