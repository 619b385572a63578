use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Pool, Postgres};
use std::sync::Arc;

use crate::config::Config;
use crate::idempotency::IdempotencyRecord;
use crate::matcher::MatcherClient;
use crate::orders::OrderRecord;
use crate::session::{SessionRecord, UserRecord};
use crate::wallet::Balance;
use crate::ws::WsClient;
use crate::marketdata::{TradePoint, WsMessage};

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Default)]
pub(crate) struct CoreState {
    pub(crate) next_seq: u64,

    pub(crate) orders: HashMap<String, OrderRecord>,
    pub(crate) idempotency: HashMap<String, IdempotencyRecord>,
    pub(crate) replay_cache: HashMap<String, i64>,
    pub(crate) rate_window: HashMap<String, Vec<i64>>,
    pub(crate) public_rate_window: HashMap<String, Vec<i64>>,
    pub(crate) auth_fail_reason: HashMap<String, u64>,

    pub(crate) clients: HashMap<u64, Arc<WsClient>>,
    pub(crate) next_client_id: u64,
    pub(crate) ws_conns_by_ip: HashMap<String, usize>,

    pub(crate) history_by_symbol: HashMap<String, VecDeque<WsMessage>>,
    pub(crate) trade_tape: HashMap<String, Vec<TradePoint>>,
    pub(crate) cache_memory: HashMap<String, Vec<u8>>,

    pub(crate) users_by_email: HashMap<String, UserRecord>,
    pub(crate) users_by_id: HashMap<String, UserRecord>,
    pub(crate) sessions_by_hash: HashMap<String, SessionRecord>,
    pub(crate) sessions_by_user: HashMap<String, Vec<String>>,
    pub(crate) wallets: HashMap<String, HashMap<String, Balance>>,

    pub(crate) applied_trades: HashMap<String, i64>,
    pub(crate) applying_trades: HashMap<String, i64>,

    pub(crate) orders_total: u64,
    pub(crate) trades_total: u64,
    pub(crate) slow_consumer_closes: u64,
    pub(crate) ws_dropped_msgs: u64,
    pub(crate) ws_policy_closes: u64,
    pub(crate) ws_rate_limit_closes: u64,
    pub(crate) ws_conn_rejects: u64,
    pub(crate) ws_resume_gaps: u64,
    pub(crate) replay_detected: u64,
    pub(crate) public_rate_limited: u64,
    pub(crate) settlement_anomalies: u64,
    pub(crate) session_evictions: u64,
    pub(crate) wallet_persist_errors: u64,

    pub(crate) next_order_gc_at_ms: i64,

    pub(crate) trade_consumer_expected: bool,
    pub(crate) trade_consumer_running: bool,
    pub(crate) trade_consumer_error_ms: i64,
    pub(crate) trade_consumer_read_errors: u64,
}

impl CoreState {
    pub(crate) fn new() -> Self {
        Self {
            next_seq: 1,
            ..Default::default()
        }
    }
}

pub(crate) struct Gateway {
    pub(crate) cfg: Config,
    pub(crate) db: Option<Pool<Postgres>>,
    pub(crate) redis: Option<redis::aio::ConnectionManager>,
    pub(crate) matcher: Option<Arc<dyn MatcherClient>>,
    state: Mutex<CoreState>,
}

impl Gateway {
    pub(crate) fn new(
        cfg: Config,
        db: Option<Pool<Postgres>>,
        redis: Option<redis::aio::ConnectionManager>,
        matcher: Option<Arc<dyn MatcherClient>>,
    ) -> Self {
        Self {
            cfg,
            db,
            redis,
            matcher,
            state: Mutex::new(CoreState::new()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().expect("gateway state mutex poisoned")
    }

    pub(crate) fn auth_fail(&self, reason: &str) {
        let mut st = self.state();
        *st.auth_fail_reason.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn next_client_id(&self) -> u64 {
        let mut st = self.state();
        st.next_client_id += 1;
        st.next_client_id
    }
}

pub(crate) fn p99(values: &[usize]) -> usize {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((99 * sorted.len() + 99) / 100).max(1);
    sorted[(rank - 1).min(sorted.len() - 1)]
}
