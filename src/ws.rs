use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::ErrorBody;
use crate::marketdata::{
    cache_key, candle_interval, conflatable, is_valid_ws_symbol, trim_book_levels, WsMessage,
    DEFAULT_BOOK_DEPTH, DEFAULT_CANDLE_INTERVAL,
};
use crate::state::{now_ms, Gateway};

pub(crate) const SLOW_CONSUMER_CLOSE_CODE: u16 = 4001;
pub(crate) const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;
const CONFLATION_FLUSH_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription {
    pub(crate) channel: String,
    pub(crate) symbol: String,
    pub(crate) depth: usize,
    pub(crate) interval: String,
}

impl Subscription {
    pub(crate) fn key(&self) -> String {
        match self.channel.as_str() {
            "book" => format!("{}:{}:depth={}", self.channel, self.symbol, self.depth),
            "candles" => format!("{}:{}:interval={}", self.channel, self.symbol, self.interval),
            _ => format!("{}:{}", self.channel, self.symbol),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct WsCommand {
    pub(crate) op: String,
    pub(crate) channel: String,
    pub(crate) symbol: String,
    pub(crate) last_seq: u64,
    pub(crate) depth: i64,
    pub(crate) interval: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CloseCommand {
    pub(crate) code: u16,
    pub(crate) reason: &'static str,
}

struct ClientInner {
    closed: bool,
    conflated: HashMap<String, Vec<u8>>,
    subscriptions: HashMap<String, Subscription>,
    command_ts: Vec<i64>,
}

pub(crate) struct WsClient {
    pub(crate) id: u64,
    sender: mpsc::Sender<Vec<u8>>,
    control: mpsc::Sender<CloseCommand>,
    inner: Mutex<ClientInner>,
}

impl WsClient {
    pub(crate) fn new(
        id: u64,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<CloseCommand>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let (control, control_rx) = mpsc::channel(4);
        let client = Arc::new(Self {
            id,
            sender,
            control,
            inner: Mutex::new(ClientInner {
                closed: false,
                conflated: HashMap::new(),
                subscriptions: HashMap::new(),
                command_ts: Vec::new(),
            }),
        });
        (client, receiver, control_rx)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ClientInner> {
        self.inner.lock().expect("ws client mutex poisoned")
    }

    pub(crate) fn enqueue(&self, payload: Vec<u8>) -> bool {
        if self.inner().closed {
            return false;
        }
        self.sender.try_send(payload).is_ok()
    }

    pub(crate) fn set_conflated(&self, key: &str, payload: Vec<u8>) -> (bool, bool) {
        let mut inner = self.inner();
        if inner.closed {
            return (false, false);
        }
        let replaced = inner.conflated.insert(key.to_string(), payload).is_some();
        (replaced, true)
    }

    pub(crate) fn drain_conflated(&self) -> Vec<Vec<u8>> {
        let mut inner = self.inner();
        inner.conflated.drain().map(|(_, payload)| payload).collect()
    }

    pub(crate) fn upsert_subscription(&self, sub: Subscription, max_subscriptions: usize) -> bool {
        let mut inner = self.inner();
        if inner.closed {
            return false;
        }
        let key = sub.key();
        if inner.subscriptions.contains_key(&key) {
            inner.subscriptions.insert(key, sub);
            return true;
        }
        if max_subscriptions > 0 && inner.subscriptions.len() >= max_subscriptions {
            return false;
        }
        inner.subscriptions.insert(key, sub);
        true
    }

    pub(crate) fn remove_subscription(&self, sub: &Subscription) {
        self.inner().subscriptions.remove(&sub.key());
    }

    pub(crate) fn matching_subscriptions(&self, channel: &str, symbol: &str) -> Vec<Subscription> {
        self.inner()
            .subscriptions
            .values()
            .filter(|sub| sub.channel == channel && sub.symbol == symbol)
            .cloned()
            .collect()
    }

    pub(crate) fn allow_command(&self, now_ms: i64, max_in_window: usize, window_ms: i64) -> bool {
        if max_in_window == 0 || window_ms <= 0 {
            return true;
        }
        let mut inner = self.inner();
        let cutoff = now_ms - window_ms;
        inner.command_ts.retain(|ts| *ts >= cutoff);
        if inner.command_ts.len() >= max_in_window {
            return false;
        }
        inner.command_ts.push(now_ms);
        true
    }

    pub(crate) fn request_close(&self, code: u16, reason: &'static str) {
        // Publishers only flip the flag; the writer task emits the frame.
        self.inner().closed = true;
        let _ = self.control.try_send(CloseCommand { code, reason });
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner().closed
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

pub(crate) fn parse_ws_subscription(cmd: &WsCommand) -> Option<Subscription> {
    let channel = cmd.channel.trim().to_lowercase();
    let symbol = cmd.symbol.trim().to_uppercase();
    if channel.is_empty() || symbol.is_empty() || !is_valid_ws_symbol(&symbol) {
        return None;
    }
    if !matches!(channel.as_str(), "trades" | "book" | "candles" | "ticker") {
        return None;
    }

    let mut sub = Subscription {
        channel: channel.clone(),
        symbol,
        depth: 0,
        interval: String::new(),
    };
    match channel.as_str() {
        "book" => {
            sub.depth = if cmd.depth > 0 {
                (cmd.depth as usize).min(1_000)
            } else {
                DEFAULT_BOOK_DEPTH as usize
            };
        }
        "candles" => {
            let interval = cmd.interval.trim().to_lowercase();
            sub.interval = if interval.is_empty() {
                DEFAULT_CANDLE_INTERVAL.to_string()
            } else {
                interval
            };
        }
        _ => {}
    }
    Some(sub)
}

fn default_subscription(channel: &str, symbol: &str) -> Subscription {
    let mut sub = Subscription {
        channel: channel.trim().to_lowercase(),
        symbol: symbol.trim().to_uppercase(),
        depth: 0,
        interval: String::new(),
    };
    if sub.channel == "book" {
        sub.depth = DEFAULT_BOOK_DEPTH as usize;
    }
    if sub.channel == "candles" {
        sub.interval = DEFAULT_CANDLE_INTERVAL.to_string();
    }
    sub
}

fn conflation_key_for_message(msg: &WsMessage) -> String {
    let mut sub = default_subscription(&msg.channel, &msg.symbol);
    if sub.channel == "book" {
        if let Some(depth) = msg.data.get("depth").and_then(Value::as_i64) {
            if depth > 0 {
                sub.depth = depth as usize;
            }
        }
    }
    if sub.channel == "candles" {
        sub.interval = candle_interval(msg);
    }
    sub.key()
}

pub(crate) fn message_for_subscription(msg: &WsMessage, sub: &Subscription) -> Option<WsMessage> {
    if msg.channel != sub.channel || msg.symbol != sub.symbol {
        return None;
    }
    match sub.channel.as_str() {
        "book" => {
            let Some(data) = msg.data.as_object() else {
                return Some(msg.clone());
            };
            let mut cloned = data.clone();
            cloned.insert("depth".to_string(), json!(sub.depth));
            cloned.insert(
                "bids".to_string(),
                trim_book_levels(data.get("bids").unwrap_or(&Value::Null), sub.depth),
            );
            cloned.insert(
                "asks".to_string(),
                trim_book_levels(data.get("asks").unwrap_or(&Value::Null), sub.depth),
            );
            let mut view = msg.clone();
            view.data = Value::Object(cloned);
            Some(view)
        }
        "candles" => {
            if candle_interval(msg) != sub.interval {
                return None;
            }
            let Some(data) = msg.data.as_object() else {
                return Some(msg.clone());
            };
            let mut cloned = data.clone();
            cloned.insert("interval".to_string(), json!(sub.interval));
            let mut view = msg.clone();
            view.data = Value::Object(cloned);
            Some(view)
        }
        _ => Some(msg.clone()),
    }
}

impl Gateway {
    pub(crate) fn reserve_ws_connection(&self, ip: &str) -> bool {
        let mut st = self.state();
        let total: usize = st.ws_conns_by_ip.values().sum();
        if total >= self.cfg.ws_max_conns {
            st.ws_conn_rejects += 1;
            return false;
        }
        let per_ip = st.ws_conns_by_ip.get(ip).copied().unwrap_or(0);
        if per_ip >= self.cfg.ws_max_conns_per_ip {
            st.ws_conn_rejects += 1;
            return false;
        }
        *st.ws_conns_by_ip.entry(ip.to_string()).or_insert(0) += 1;
        true
    }

    pub(crate) fn release_ws_connection(&self, ip: &str) {
        let mut st = self.state();
        match st.ws_conns_by_ip.get_mut(ip) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                st.ws_conns_by_ip.remove(ip);
            }
            None => {}
        }
    }

    pub(crate) fn broadcast(&self, msg: &WsMessage) {
        // Collect handles under the lock, dispatch outside it.
        let clients: Vec<Arc<WsClient>> = {
            let st = self.state();
            st.clients.values().cloned().collect()
        };

        for client in clients {
            for sub in client.matching_subscriptions(&msg.channel, &msg.symbol) {
                let Some(view) = message_for_subscription(msg, &sub) else {
                    continue;
                };
                self.send_to_client(&client, &view, conflatable(&msg.channel), &sub.key());
            }
        }
    }

    pub(crate) fn send_to_client(
        &self,
        client: &WsClient,
        msg: &WsMessage,
        conflatable_msg: bool,
        conflation_key: &str,
    ) {
        let Ok(payload) = serde_json::to_vec(msg) else {
            return;
        };
        if conflatable_msg {
            let key = if conflation_key.is_empty() {
                conflation_key_for_message(msg)
            } else {
                conflation_key.to_string()
            };
            let (replaced, accepted) = client.set_conflated(&key, payload);
            if accepted && replaced {
                self.state().ws_dropped_msgs += 1;
            }
            return;
        }

        if !client.enqueue(payload) {
            {
                let mut st = self.state();
                st.slow_consumer_closes += 1;
                st.ws_dropped_msgs += 1;
            }
            client.request_close(SLOW_CONSUMER_CLOSE_CODE, "SLOW_CONSUMER");
        }
    }

    fn send_error_frame(&self, client: &WsClient, code: &str) {
        let msg = WsMessage {
            msg_type: "Error".to_string(),
            channel: String::new(),
            symbol: String::new(),
            seq: 0,
            ts: now_ms(),
            data: json!({ "error": code }),
        };
        self.send_to_client(client, &msg, false, "");
    }

    pub(crate) async fn send_snapshot(&self, client: &WsClient, sub: &Subscription) {
        if let Some(payload) = self.cache_get(&cache_key(&sub.channel, &sub.symbol)).await {
            if let Ok(mut msg) = serde_json::from_slice::<WsMessage>(&payload) {
                msg.msg_type = "Snapshot".to_string();
                let view = message_for_subscription(&msg, sub).unwrap_or(msg);
                self.send_to_client(client, &view, conflatable(&sub.channel), &sub.key());
                return;
            }
        }

        let data = match sub.channel.as_str() {
            "book" => json!({ "depth": sub.depth, "bids": [], "asks": [] }),
            "candles" => json!({ "interval": sub.interval }),
            _ => json!({}),
        };
        let snapshot = WsMessage {
            msg_type: "Snapshot".to_string(),
            channel: sub.channel.clone(),
            symbol: sub.symbol.clone(),
            seq: 0,
            ts: now_ms(),
            data,
        };
        self.send_to_client(client, &snapshot, conflatable(&sub.channel), &sub.key());
    }

    pub(crate) async fn handle_resume(&self, client: &WsClient, sub: &Subscription, last_seq: u64) {
        let history = self.history_snapshot(&sub.symbol);
        // Conflated channels recover via snapshot, never replay.
        if history.is_empty() || conflatable(&sub.channel) {
            self.send_snapshot(client, sub).await;
            return;
        }

        let oldest = history
            .iter()
            .find(|evt| evt.channel == sub.channel && evt.symbol == sub.symbol)
            .map(|evt| evt.seq);
        let Some(oldest) = oldest else {
            self.send_snapshot(client, sub).await;
            return;
        };

        if last_seq + 1 < oldest {
            self.state().ws_resume_gaps += 1;
            let missed = WsMessage {
                msg_type: "Missed".to_string(),
                channel: sub.channel.clone(),
                symbol: sub.symbol.clone(),
                seq: 0,
                ts: now_ms(),
                data: json!({ "reason": "HISTORY_GAP" }),
            };
            self.send_to_client(client, &missed, false, "");
            self.send_snapshot(client, sub).await;
            return;
        }

        let mut replayed = false;
        for evt in &history {
            if evt.channel != sub.channel || evt.symbol != sub.symbol {
                continue;
            }
            if evt.seq > last_seq {
                self.send_to_client(client, evt, conflatable(&evt.channel), &sub.key());
                replayed = true;
            }
        }
        if !replayed {
            self.send_snapshot(client, sub).await;
        }
    }
}

fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin else {
        return false;
    };
    let normalized = origin.trim().to_lowercase();
    if normalized.is_empty() {
        return false;
    }
    allowed.iter().any(|o| o.trim().to_lowercase() == normalized)
}

pub(crate) async fn handle_ws(
    State(gw): State<Arc<Gateway>>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get("Origin").and_then(|v| v.to_str().ok());
    if !origin_allowed(&gw.cfg.allowed_origins, origin) {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody { error: "origin_not_allowed".to_string() }),
        )
            .into_response();
    }

    let client_ip = connect_info
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if !gw.reserve_ws_connection(&client_ip) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorBody { error: "ws_connection_limit".to_string() }),
        )
            .into_response();
    }

    let read_limit = gw.cfg.ws_read_limit_bytes;
    ws.max_message_size(read_limit)
        .on_upgrade(move |socket| handle_socket(gw, socket, client_ip))
}

async fn handle_socket(gw: Arc<Gateway>, socket: WebSocket, client_ip: String) {
    let (ws_tx, ws_rx) = socket.split();
    let id = gw.next_client_id();
    let (client, receiver, control_rx) = WsClient::new(id, gw.cfg.ws_queue_size);

    {
        let mut st = gw.state();
        st.clients.insert(id, client.clone());
    }
    tracing::debug!(client_id = id, ip = %client_ip, "ws client connected");

    let writer = tokio::spawn(ws_writer(
        gw.clone(),
        client.clone(),
        ws_tx,
        receiver,
        control_rx,
        client_ip,
    ));
    ws_reader(&gw, &client, ws_rx).await;
    client.request_close(1000, "");
    let _ = writer.await;
}

async fn ws_writer(
    gw: Arc<Gateway>,
    client: Arc<WsClient>,
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    mut control_rx: mpsc::Receiver<CloseCommand>,
    client_ip: String,
) {
    let mut flush_tick = interval(std::time::Duration::from_millis(CONFLATION_FLUSH_MS));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ping_tick = interval(gw.cfg.ws_ping_interval);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = receiver.recv() => {
                let Some(payload) = maybe else { break };
                if send_text(&mut sink, payload).await.is_err() {
                    break;
                }
            }
            Some(close) = control_rx.recv() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close.code,
                        reason: close.reason.into(),
                    })))
                    .await;
                break;
            }
            _ = flush_tick.tick() => {
                let mut failed = false;
                for payload in client.drain_conflated() {
                    if send_text(&mut sink, payload).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            _ = ping_tick.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    {
        let mut st = gw.state();
        st.clients.remove(&client.id);
    }
    gw.release_ws_connection(&client_ip);
    client.request_close(1000, "");
    let _ = sink.close().await;
    tracing::debug!(client_id = client.id, "ws client disconnected");
}

async fn send_text(sink: &mut SplitSink<WebSocket, Message>, payload: Vec<u8>) -> Result<(), axum::Error> {
    let text = String::from_utf8(payload).unwrap_or_default();
    sink.send(Message::Text(text)).await
}

async fn ws_reader(gw: &Arc<Gateway>, client: &Arc<WsClient>, mut stream: SplitStream<WebSocket>) {
    loop {
        // Pong-refreshed read deadline: the server pings on a shorter period,
        // so a live peer always produces a frame inside the timeout.
        let frame = match timeout(gw.cfg.ws_pong_timeout, stream.next()).await {
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        let raw = match frame {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if !client.allow_command(
            now_ms(),
            gw.cfg.ws_command_rate_limit,
            gw.cfg.ws_command_window.as_millis() as i64,
        ) {
            {
                let mut st = gw.state();
                st.ws_policy_closes += 1;
                st.ws_rate_limit_closes += 1;
            }
            client.request_close(POLICY_VIOLATION_CLOSE_CODE, "RATE_LIMIT");
            break;
        }

        let Ok(cmd) = serde_json::from_slice::<WsCommand>(&raw) else {
            gw.send_error_frame(client, "INVALID_COMMAND");
            continue;
        };

        match cmd.op.to_uppercase().as_str() {
            "SUB" => {
                let Some(sub) = parse_ws_subscription(&cmd) else {
                    gw.send_error_frame(client, "INVALID_SUBSCRIPTION");
                    continue;
                };
                if !client.upsert_subscription(sub.clone(), gw.cfg.ws_max_subscriptions) {
                    gw.state().ws_policy_closes += 1;
                    client.request_close(POLICY_VIOLATION_CLOSE_CODE, "TOO_MANY_SUBSCRIPTIONS");
                    break;
                }
                gw.send_snapshot(client, &sub).await;
            }
            "UNSUB" => {
                let Some(sub) = parse_ws_subscription(&cmd) else {
                    gw.send_error_frame(client, "INVALID_SUBSCRIPTION");
                    continue;
                };
                client.remove_subscription(&sub);
            }
            "RESUME" => {
                let Some(sub) = parse_ws_subscription(&cmd) else {
                    gw.send_error_frame(client, "INVALID_SUBSCRIPTION");
                    continue;
                };
                if !client.upsert_subscription(sub.clone(), gw.cfg.ws_max_subscriptions) {
                    gw.state().ws_policy_closes += 1;
                    client.request_close(POLICY_VIOLATION_CLOSE_CODE, "TOO_MANY_SUBSCRIPTIONS");
                    break;
                }
                gw.handle_resume(client, &sub, cmd.last_seq).await;
            }
            _ => gw.send_error_frame(client, "UNKNOWN_OP"),
        }
    }
}
