use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::{p99, Gateway};

pub(crate) async fn health(State(_gw): State<Arc<Gateway>>) -> Response {
    Json(json!({ "service": "edge-gateway", "status": "ok" })).into_response()
}

pub(crate) async fn ready(State(gw): State<Arc<Gateway>>) -> Response {
    if !gw.db_ready().await {
        return unready("db_unready");
    }
    if let Some(redis) = &gw.redis {
        let mut conn = redis.clone();
        let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        if ping.is_err() {
            return unready("redis_unready");
        }
    }
    if !gw.cfg.disable_core && gw.matcher.is_none() {
        return unready("core_unready");
    }
    if !gw.trade_consumer_ready() {
        return unready("trade_consumer_unready");
    }
    Json(json!({ "status": "ready" })).into_response()
}

fn unready(status: &str) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": status }))).into_response()
}

fn prometheus_label_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

pub(crate) async fn metrics(State(gw): State<Arc<Gateway>>) -> Response {
    let (
        orders_total,
        trades_total,
        clients,
        slow_closes,
        policy_closes,
        rate_limit_closes,
        conn_rejects,
        dropped_msgs,
        resume_gaps,
        replay_detected,
        public_rate_limited,
        settlement_anomalies,
        session_evictions,
        wallet_persist_errors,
        consumer_running,
        consumer_read_errors,
        queue_lens,
        auth_fail_by_reason,
    ) = {
        let st = gw.state();
        let queue_lens: Vec<usize> = st.clients.values().map(|c| c.queue_len()).collect();
        let mut reasons: Vec<(String, u64)> = st
            .auth_fail_reason
            .iter()
            .map(|(reason, count)| (reason.clone(), *count))
            .collect();
        reasons.sort();
        (
            st.orders_total,
            st.trades_total,
            st.clients.len(),
            st.slow_consumer_closes,
            st.ws_policy_closes,
            st.ws_rate_limit_closes,
            st.ws_conn_rejects,
            st.ws_dropped_msgs,
            st.ws_resume_gaps,
            st.replay_detected,
            st.public_rate_limited,
            st.settlement_anomalies,
            st.session_evictions,
            st.wallet_persist_errors,
            st.trade_consumer_running,
            st.trade_consumer_read_errors,
            queue_lens,
            reasons,
        )
    };
    let queue_p99 = p99(&queue_lens);
    let auth_fail_total: u64 = auth_fail_by_reason.iter().map(|(_, count)| count).sum();

    let mut out = String::with_capacity(1_500);
    let _ = writeln!(out, "edge_orders_total {orders_total}");
    let _ = writeln!(out, "edge_trades_total {trades_total}");
    let _ = writeln!(out, "edge_ws_connections {clients}");
    let _ = writeln!(out, "edge_ws_close_slow_consumer_total {slow_closes}");
    let _ = writeln!(out, "edge_ws_close_policy_total {policy_closes}");
    let _ = writeln!(out, "edge_ws_close_ratelimit_total {rate_limit_closes}");
    let _ = writeln!(out, "edge_ws_connection_reject_total {conn_rejects}");
    let _ = writeln!(out, "edge_public_rate_limited_total {public_rate_limited}");
    let _ = writeln!(out, "edge_settlement_anomaly_total {settlement_anomalies}");
    let _ = writeln!(out, "edge_session_eviction_total {session_evictions}");
    let _ = writeln!(out, "edge_wallet_persist_error_total {wallet_persist_errors}");
    let _ = writeln!(out, "edge_trade_consumer_running {}", u8::from(consumer_running));
    let _ = writeln!(out, "edge_trade_consumer_read_error_total {consumer_read_errors}");
    let _ = writeln!(out, "edge_auth_fail_total {auth_fail_total}");
    for (reason, count) in &auth_fail_by_reason {
        let _ = writeln!(
            out,
            "edge_auth_fail_reason_total{{reason=\"{}\"}} {count}",
            prometheus_label_escape(reason)
        );
    }
    let _ = writeln!(out, "edge_replay_detect_total {replay_detected}");
    let _ = writeln!(out, "ws_active_conns {clients}");
    let _ = writeln!(out, "ws_send_queue_p99 {queue_p99}");
    let _ = writeln!(out, "ws_dropped_msgs {dropped_msgs}");
    let _ = writeln!(out, "ws_resume_gaps {resume_gaps}");
    let _ = writeln!(out, "ws_slow_closes {slow_closes}");
    let _ = writeln!(out, "ws_policy_closes {policy_closes}");
    let _ = writeln!(out, "ws_command_rate_limit_closes {rate_limit_closes}");
    let _ = writeln!(out, "ws_connection_rejects {conn_rejects}");
    let _ = writeln!(out, "public_rate_limited {public_rate_limited}");
    let _ = writeln!(out, "settlement_anomalies {settlement_anomalies}");
    let _ = writeln!(out, "session_evictions {session_evictions}");

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
        .into_response()
}
