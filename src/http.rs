// ===============================
// src/http.rs
// ===============================
//
// REST surface (hyper 0.14). Identitas user datang dari header X-User-Id
// yang dipasang proxy auth di depan service ini.
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::error::ExchangeError;
use crate::feed::FeedState;
use crate::gateway::{OrderGateway, OrderRequest};
use crate::metrics::encode_metrics;

pub const USER_HEADER: &str = "x-user-id";
const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Clone)]
pub struct HttpState {
    pub gateway: Arc<OrderGateway>,
    pub feed_state: watch::Receiver<FeedState>,
}

pub async fn serve(addr: SocketAddr, state: HttpState, mut shutdown: watch::Receiver<bool>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "http listening");
    server
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("http stopping");
        })
        .await
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(err: &ExchangeError) -> Response<Body> {
    json_response(err.status(), &json!({ "error": err.code(), "message": err.public_message() }))
}

fn user_of(req: &Request<Body>) -> Result<String, ExchangeError> {
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExchangeError::validation("missing X-User-Id header"))
}

/// Percent-decoded value of the first `key` in the query string.
fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn parse_usize(raw: Option<String>, default: usize) -> usize {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub async fn route(state: &HttpState, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    debug!(%method, %path, "http request");

    match dispatch(state, &method, &path, req).await {
        Ok(resp) => resp,
        Err(e) => error_response(&e),
    }
}

async fn dispatch(
    state: &HttpState,
    method: &Method,
    path: &str,
    req: Request<Body>,
) -> Result<Response<Body>, ExchangeError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => {
            let feed = state.feed_state.borrow().to_string();
            Ok(json_response(StatusCode::OK, &json!({ "status": "ok", "feed": feed })))
        }
        (&Method::GET, ["metrics"]) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(encode_metrics()))
            .unwrap_or_else(|_| Response::new(Body::empty()))),
        (&Method::GET, ["ticker"]) => {
            let market = query_param(&req, "market").ok_or_else(|| ExchangeError::validation("market is required"))?;
            let ticker = state.gateway.ticker(&market)?;
            Ok(json_response(StatusCode::OK, &ticker))
        }
        (&Method::GET, ["orderbook"]) => {
            let market = query_param(&req, "market").ok_or_else(|| ExchangeError::validation("market is required"))?;
            Ok(json_response(StatusCode::OK, &state.gateway.orderbook(&market)?))
        }
        (&Method::POST, ["orders"]) => {
            let user = user_of(&req)?;
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .map_err(|e| ExchangeError::validation(format!("unreadable body: {e}")))?;
            let order: OrderRequest = serde_json::from_slice(&body)
                .map_err(|e| ExchangeError::validation(format!("invalid order body: {e}")))?;
            let receipt = state.gateway.submit(&user, order).await?;
            let message = if receipt.fill.is_some() { "order executed" } else { "order placed" };
            Ok(json_response(
                StatusCode::CREATED,
                &json!({ "message": message, "orderDetails": receipt }),
            ))
        }
        (&Method::DELETE, ["pending-orders", id]) => {
            let user = user_of(&req)?;
            let id: u64 = id.parse().map_err(|_| ExchangeError::validation(format!("bad order id {id}")))?;
            let order = state.gateway.cancel(&user, id).await?;
            Ok(json_response(
                StatusCode::OK,
                &json!({ "message": format!("order {} cancelled", order.id) }),
            ))
        }
        (&Method::GET, ["balance"]) => {
            let user = user_of(&req)?;
            let balances = state.gateway.balances(&user).await;
            Ok(json_response(StatusCode::OK, &json!({ "balances": balances })))
        }
        (&Method::GET, ["pending-orders"]) => {
            let user = user_of(&req)?;
            let orders = state.gateway.pending_orders(&user).await;
            Ok(json_response(StatusCode::OK, &json!({ "orders": orders })))
        }
        (&Method::GET, ["transactions"]) => {
            let user = user_of(&req)?;
            let page = parse_usize(query_param(&req, "page"), 1);
            let limit = parse_usize(query_param(&req, "limit"), DEFAULT_PAGE_SIZE);
            Ok(json_response(StatusCode::OK, &state.gateway.transactions(&user, page, limit)))
        }
        _ => Err(ExchangeError::NotFound(format!("{method} {path}"))),
    }
}
