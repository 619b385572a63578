use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::Gateway;

pub(crate) const HISTORY_RING_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_BOOK_DEPTH: i64 = 20;
pub(crate) const DEFAULT_CANDLE_INTERVAL: &str = "1m";
const TICKER_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const CACHE_TTL_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WsMessage {
    #[serde(rename = "type")]
    pub(crate) msg_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) channel: String,
    pub(crate) symbol: String,
    pub(crate) seq: u64,
    pub(crate) ts: i64,
    pub(crate) data: Value,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TradePoint {
    pub(crate) ts_ms: i64,
    pub(crate) price: i64,
    pub(crate) qty: i64,
}

pub(crate) fn parse_symbol(symbol: &str) -> Option<(String, String)> {
    let (base, quote) = symbol.trim().split_once('-')?;
    let base = base.trim().to_uppercase();
    let quote = quote.trim().to_uppercase();
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base, quote))
}

pub(crate) fn is_valid_ws_symbol(symbol: &str) -> bool {
    let Some((base, quote)) = symbol.split_once('-') else {
        return false;
    };
    let side_ok = |s: &str| {
        (2..=16).contains(&s.len()) && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };
    side_ok(base) && side_ok(quote)
}

pub(crate) fn parse_i64_any(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(v)
            } else {
                n.as_f64().map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(v) = trimmed.parse::<i64>() {
                return Some(v);
            }
            trimmed.parse::<f64>().ok().map(|f| f as i64)
        }
        _ => None,
    }
}

pub(crate) fn conflatable(channel: &str) -> bool {
    matches!(channel, "book" | "candles" | "ticker")
}

pub(crate) fn cache_key(channel: &str, symbol: &str) -> String {
    format!("snapshot:{channel}:{symbol}")
}

pub(crate) fn parse_limit(raw: Option<&str>, fallback: usize) -> usize {
    let Some(raw) = raw else {
        return fallback;
    };
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => (n as usize).min(1_000),
        _ => fallback,
    }
}

pub(crate) fn build_orderbook_data(price_raw: &str, qty_raw: &str) -> Value {
    let price = price_raw.parse::<i64>().ok().filter(|p| *p > 0).unwrap_or(1);
    let base_qty = qty_raw.parse::<i64>().ok().filter(|q| *q > 0).unwrap_or(1);

    let depth = DEFAULT_BOOK_DEPTH;
    let tick = (price / 2_000).max(1);
    let mut bids = Vec::with_capacity(depth as usize);
    let mut asks = Vec::with_capacity(depth as usize);
    for i in 0..depth {
        let spread = (i + 1) * tick;
        let bid_price = (price - spread).max(1);
        let ask_price = price + spread;
        let bid_qty = (base_qty + (depth - i) * 17).max(1);
        let ask_qty = (base_qty + (i + 1) * 19).max(1);
        bids.push(json!([bid_price.to_string(), bid_qty.to_string()]));
        asks.push(json!([ask_price.to_string(), ask_qty.to_string()]));
    }

    json!({ "depth": depth, "bids": bids, "asks": asks })
}

pub(crate) fn trim_book_levels(raw: &Value, depth: usize) -> Value {
    let Some(levels) = raw.as_array() else {
        return json!([]);
    };
    if levels.is_empty() {
        return json!([]);
    }
    let take = if depth == 0 || depth > levels.len() {
        levels.len()
    } else {
        depth
    };
    Value::Array(levels[..take].to_vec())
}

pub(crate) fn candle_interval(msg: &WsMessage) -> String {
    msg.data
        .get("interval")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_CANDLE_INTERVAL.to_string())
}

impl Gateway {
    pub(crate) fn append_history(&self, symbol: &str, messages: &[WsMessage]) {
        let mut st = self.state();
        let ring = st.history_by_symbol.entry(symbol.to_string()).or_default();
        for msg in messages {
            ring.push_back(msg.clone());
            while ring.len() > HISTORY_RING_CAPACITY {
                ring.pop_front();
            }
        }
    }

    pub(crate) fn history_snapshot(&self, symbol: &str) -> Vec<WsMessage> {
        let st = self.state();
        st.history_by_symbol
            .get(symbol)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn cache_set(&self, key: &str, value: &WsMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(value)?;
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let stored: Result<(), _> = redis::cmd("SET")
                .arg(key)
                .arg(payload.as_slice())
                .arg("EX")
                .arg(CACHE_TTL_SECS)
                .query_async(&mut conn)
                .await;
            if stored.is_ok() {
                return Ok(());
            }
        }
        let mut st = self.state();
        st.cache_memory.insert(key.to_string(), payload);
        Ok(())
    }

    pub(crate) async fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            let cached: Result<Option<Vec<u8>>, _> =
                redis::cmd("GET").arg(key).query_async(&mut conn).await;
            if let Ok(Some(payload)) = cached {
                return Some(payload);
            }
        }
        let st = self.state();
        st.cache_memory.get(key).cloned()
    }

    pub(crate) fn record_ticker(&self, symbol: &str, price_raw: &str, qty_raw: &str, ts_ms: i64) -> Value {
        let price = price_raw.parse::<i64>().unwrap_or(0);
        let qty = qty_raw.parse::<i64>().unwrap_or(0);
        let cutoff = ts_ms - TICKER_WINDOW_MS;

        let mut st = self.state();
        let tape = st.trade_tape.entry(symbol.to_string()).or_default();
        tape.push(TradePoint { ts_ms, price, qty });
        tape.retain(|point| point.ts_ms >= cutoff);

        let mut high = 0i64;
        let mut low = 0i64;
        let mut volume = 0i64;
        let mut quote_volume = 0i64;
        for (i, point) in tape.iter().enumerate() {
            if i == 0 {
                high = point.price;
                low = point.price;
            } else {
                high = high.max(point.price);
                low = low.min(point.price);
            }
            volume += point.qty;
            quote_volume += point.price * point.qty;
        }

        json!({
            "lastPrice": price.to_string(),
            "high24h": high.to_string(),
            "low24h": low.to_string(),
            "volume24h": volume.to_string(),
            "quoteVolume24h": quote_volume.to_string(),
        })
    }

    pub(crate) async fn ingest_trade(
        &self,
        trade_id: &str,
        symbol: &str,
        price_raw: &str,
        qty_raw: &str,
        ts_ms: i64,
        persist: bool,
        seq_override: u64,
    ) -> anyhow::Result<u64> {
        if persist {
            self.append_settlement(trade_id, symbol, price_raw, qty_raw).await?;
        }

        let seq = {
            let mut st = self.state();
            let seq = if seq_override == 0 {
                let seq = st.next_seq;
                st.next_seq += 1;
                seq
            } else {
                if seq_override >= st.next_seq {
                    st.next_seq = seq_override + 1;
                }
                seq_override
            };
            st.trades_total += 1;
            seq
        };

        let trade_msg = WsMessage {
            msg_type: "TradeExecuted".to_string(),
            channel: "trades".to_string(),
            symbol: symbol.to_string(),
            seq,
            ts: ts_ms,
            data: json!({ "tradeId": trade_id, "price": price_raw, "qty": qty_raw }),
        };
        let candle_msg = WsMessage {
            msg_type: "CandleUpdated".to_string(),
            channel: "candles".to_string(),
            symbol: symbol.to_string(),
            seq,
            ts: ts_ms,
            data: json!({
                "interval": DEFAULT_CANDLE_INTERVAL,
                "open": price_raw,
                "high": price_raw,
                "low": price_raw,
                "close": price_raw,
                "volume": qty_raw,
                "tradeCount": 1,
                "isFinal": false,
            }),
        };
        let ticker_msg = WsMessage {
            msg_type: "TickerUpdated".to_string(),
            channel: "ticker".to_string(),
            symbol: symbol.to_string(),
            seq,
            ts: ts_ms,
            data: self.record_ticker(symbol, price_raw, qty_raw, ts_ms),
        };
        let book_msg = WsMessage {
            msg_type: "OrderbookUpdated".to_string(),
            channel: "book".to_string(),
            symbol: symbol.to_string(),
            seq,
            ts: ts_ms,
            data: build_orderbook_data(price_raw, qty_raw),
        };

        let messages = [trade_msg, candle_msg, ticker_msg, book_msg];
        self.append_history(symbol, &messages);
        for msg in &messages {
            let _ = self.cache_set(&cache_key(&msg.channel, symbol), msg).await;
        }
        for msg in &messages {
            self.broadcast(msg);
        }
        Ok(seq)
    }
}
