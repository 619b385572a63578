use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::marketdata::{cache_key, parse_limit, trim_book_levels, WsMessage};
use crate::state::Gateway;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MarketQuery {
    limit: Option<String>,
    depth: Option<String>,
}

pub(crate) async fn get_trades(
    State(gw): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let limit = parse_limit(query.limit.as_deref(), 50);
    let history = gw.history_snapshot(&symbol);
    let mut trades: Vec<WsMessage> = history
        .into_iter()
        .filter(|evt| evt.channel == "trades")
        .collect();
    if trades.len() > limit {
        trades = trades.split_off(trades.len() - limit);
    }
    Json(json!({ "symbol": symbol, "trades": trades })).into_response()
}

pub(crate) async fn get_orderbook(
    State(gw): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let depth = parse_limit(query.depth.as_deref(), 20);
    if let Some(payload) = gw.cache_get(&cache_key("book", &symbol)).await {
        if let Ok(msg) = serde_json::from_slice::<WsMessage>(&payload) {
            if let Some(data) = msg.data.as_object() {
                let bids = trim_book_levels(data.get("bids").unwrap_or(&json!([])), depth);
                let asks = trim_book_levels(data.get("asks").unwrap_or(&json!([])), depth);
                return Json(json!({
                    "symbol": symbol,
                    "depth": depth,
                    "source": "derived-from-last-trade",
                    "bids": bids,
                    "asks": asks,
                }))
                .into_response();
            }
        }
    }

    Json(json!({
        "symbol": symbol,
        "depth": depth,
        "source": "derived-from-last-trade",
        "bids": [],
        "asks": [],
    }))
    .into_response()
}

pub(crate) async fn get_candles(
    State(gw): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let limit = parse_limit(query.limit.as_deref(), 120);
    let history = gw.history_snapshot(&symbol);
    let mut candles: Vec<WsMessage> = history
        .into_iter()
        .filter(|evt| evt.channel == "candles")
        .collect();
    if candles.len() > limit {
        candles = candles.split_off(candles.len() - limit);
    }
    Json(json!({ "symbol": symbol, "candles": candles })).into_response()
}

pub(crate) async fn get_ticker(
    State(gw): State<Arc<Gateway>>,
    Path(symbol): Path<String>,
) -> Response {
    let Some(payload) = gw.cache_get(&cache_key("ticker", &symbol)).await else {
        return Json(json!({ "symbol": symbol, "ticker": {} })).into_response();
    };
    let Ok(msg) = serde_json::from_slice::<WsMessage>(&payload) else {
        return Json(json!({ "symbol": symbol, "ticker": {} })).into_response();
    };
    Json(json!({ "symbol": symbol, "ticker": msg })).into_response()
}
