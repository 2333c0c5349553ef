// ===============================
// src/clients.rs
// ===============================
//
// WebSocket server untuk client downstream.
// Tiap koneksi: daftar ke hub, kirim initial_prices, lalu pump antrean
// keluar sampai client tutup / antrean dibuang hub / shutdown.
//
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::cache::OrderBookCache;
use crate::hub::{initial_prices_message, BroadcastHub};

pub async fn serve(
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    cache: Arc<OrderBookCache>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "client websocket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let hub = hub.clone();
                let cache = cache.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_client(stream, peer, hub, cache, shutdown).await;
                });
            }
            _ = shutdown.changed() => {
                info!("client websocket stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<BroadcastHub>,
    cache: Arc<OrderBookCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, mut inbound) = ws.split();

    let (session, mut outbound) = hub.register();
    info!(%peer, session, "client connected");

    let hello = initial_prices_message(&cache.last_prices());
    if sink.send(Message::Text(hello.to_string())).await.is_err() {
        hub.unregister(session);
        return;
    }

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload.to_string())).await {
                        debug!(session, error = %e, "send failed");
                        break;
                    }
                }
                // hub sudah membuang sesi ini
                None => break,
            },
            msg = inbound.next() => match msg {
                Some(Ok(Message::Ping(p))) => {
                    let _ = sink.send(Message::Pong(p)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session, error = %e, "client read error");
                    break;
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    hub.unregister(session);
    info!(%peer, session, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::d;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn client_gets_initial_prices_then_broadcasts() {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = spare.local_addr().unwrap();
        drop(spare);

        let hub = Arc::new(BroadcastHub::new(16));
        let cache = Arc::new(OrderBookCache::new(rust_decimal::Decimal::ZERO));
        cache.set_last_price("KRW-BTC", d("50000000"));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(addr, hub.clone(), cache, stop_rx));

        let mut ws = None;
        for _ in 0..50 {
            if let Ok((c, _)) = connect_async(format!("ws://{addr}")).await {
                ws = Some(c);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let mut ws = ws.expect("server did not come up");

        let first = ws.next().await.unwrap().unwrap().into_text().unwrap();
        let v: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(v["type"], "initial_prices");
        assert_eq!(v["data"]["KRW-BTC"], "50000000");

        hub.publish_raw(Arc::from(r#"{"type":"ticker"}"#));
        let second = ws.next().await.unwrap().unwrap().into_text().unwrap();
        assert_eq!(second, r#"{"type":"ticker"}"#);

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if hub.session_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(hub.session_count(), 0);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
