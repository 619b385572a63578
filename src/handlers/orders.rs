use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{AuthPrincipal, TraceId};
use crate::error::ApiError;
use crate::idempotency::{normalize_idempotency_key, request_hash, IdempotencyProbe};
use crate::matcher::{
    map_order_type, map_side, map_time_in_force, CancelOrderCmd, CommandMeta, PlaceOrderCmd,
};
use crate::orders::{is_terminal_status, normalize_order_status, OrderRecord};
use crate::state::{now_ms, Gateway};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OrderRequest {
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    price: String,
    qty: String,
    time_in_force: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: String,
    status: String,
    symbol: String,
    seq: u64,
    #[serde(skip_serializing_if = "is_zero")]
    accepted_at: i64,
    #[serde(skip_serializing_if = "is_zero")]
    canceled_at: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    reject_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    correlation_id: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn raw_json(status: u16, body: Vec<u8>) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn marshal<T: Serialize>(status: StatusCode, value: &T) -> (u16, Vec<u8>) {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    (status.as_u16(), body)
}

fn idem_key_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(raw) = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::bad_request("Idempotency-Key required"));
    };
    normalize_idempotency_key(raw).ok_or_else(|| ApiError::bad_request("invalid Idempotency-Key"))
}

pub(crate) async fn create_order(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
    Extension(trace): Extension<TraceId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = principal.0;
    if principal.is_empty() {
        return Err(ApiError::unauthorized("login required"));
    }
    let idem_key = idem_key_from_headers(&headers)?;

    let path = "/v1/orders";
    let hash = request_hash("POST", path, &body);
    match gw.idempotency_probe(&principal, &idem_key, "POST", path, &hash) {
        IdempotencyProbe::Conflict => {
            return Err(ApiError::new(StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"));
        }
        IdempotencyProbe::Hit { status, body } => return Ok(raw_json(status, body)),
        IdempotencyProbe::Miss => {}
    }

    let Ok(req) = serde_json::from_slice::<OrderRequest>(&body) else {
        return Err(ApiError::bad_request("invalid JSON"));
    };
    if req.symbol.is_empty() || req.side.is_empty() || req.order_type.is_empty() || req.qty.is_empty() {
        return Err(ApiError::bad_request("symbol/side/type/qty required"));
    }
    let Some(side) = map_side(&req.side) else {
        return Err(ApiError::bad_request("invalid side"));
    };
    let Some(order_type) = map_order_type(&req.order_type) else {
        return Err(ApiError::bad_request("invalid type"));
    };
    let Some(time_in_force) = map_time_in_force(&req.time_in_force) else {
        return Err(ApiError::bad_request("invalid timeInForce"));
    };

    let Some(matcher) = gw.matcher.clone() else {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "core_unavailable"));
    };

    let (reserve_currency, reserve_amount) = gw
        .try_reserve_for_order(
            &principal,
            &req.symbol,
            &req.side,
            &req.order_type,
            &req.price,
            &req.qty,
        )
        .await?;

    let order_id = format!("ord_{}", Uuid::new_v4());
    let cmd = PlaceOrderCmd {
        meta: CommandMeta {
            command_id: Uuid::new_v4().to_string(),
            idempotency_key: idem_key.clone(),
            user_id: principal.clone(),
            symbol: req.symbol.clone(),
            trace_id: trace.0.clone(),
            correlation_id: Uuid::new_v4().to_string(),
        },
        order_id,
        side,
        order_type,
        price: req.price.clone(),
        qty: req.qty.clone(),
        time_in_force,
    };

    let ack = match tokio::time::timeout(gw.cfg.core_timeout, matcher.place_order(cmd)).await {
        Ok(Ok(ack)) => ack,
        Ok(Err(err)) => {
            tracing::warn!(%err, "place order rpc failed");
            return Err(compensate_reserve(&gw, &principal, &reserve_currency, reserve_amount).await);
        }
        Err(_) => {
            tracing::warn!("place order rpc timed out");
            return Err(compensate_reserve(&gw, &principal, &reserve_currency, reserve_amount).await);
        }
    };

    let status_upper = normalize_order_status(&ack.status);
    let accepted_at = ack.ts_ms.max(0);
    let terminal_at = if is_terminal_status(&status_upper) { now_ms() } else { 0 };

    let mut reserve_currency = reserve_currency;
    let mut reserve_amount = reserve_amount;
    if (!ack.accepted || status_upper == "REJECTED" || status_upper == "CANCELED")
        && !reserve_currency.is_empty()
        && reserve_amount > 0.0
    {
        if let Err(err) = gw.release_reserve(&principal, &reserve_currency, reserve_amount).await {
            tracing::error!(%err, "reserve rollback failed");
            return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "reserve_rollback_failed"));
        }
        reserve_currency = String::new();
        reserve_amount = 0.0;
    }

    let qty = req.qty.trim().parse::<f64>().unwrap_or(0.0);
    let record = OrderRecord {
        order_id: ack.order_id.clone(),
        status: status_upper.clone(),
        symbol: ack.symbol.clone(),
        seq: ack.seq,
        accepted_at,
        owner_user_id: principal.clone(),
        reserve_currency,
        reserve_amount,
        side: req.side.trim().to_uppercase(),
        qty,
        terminal_at,
        ..OrderRecord::default()
    };
    {
        let mut st = gw.state();
        st.orders.insert(ack.order_id.clone(), record);
        st.orders_total += 1;
        gw.prune_orders_locked(&mut st, now_ms());
    }

    let response = OrderResponse {
        order_id: ack.order_id,
        status: status_upper,
        symbol: ack.symbol,
        seq: ack.seq,
        accepted_at,
        canceled_at: 0,
        reject_code: ack.reject_code,
        correlation_id: ack.correlation_id,
    };
    let (status, body) = marshal(StatusCode::OK, &response);
    gw.idempotency_store(&principal, &idem_key, "POST", path, &hash, status, &body);
    Ok(raw_json(status, body))
}

async fn compensate_reserve(
    gw: &Gateway,
    principal: &str,
    reserve_currency: &str,
    reserve_amount: f64,
) -> ApiError {
    if !reserve_currency.is_empty() && reserve_amount > 0.0 {
        if let Err(err) = gw.release_reserve(principal, reserve_currency, reserve_amount).await {
            tracing::error!(%err, "reserve rollback failed");
            return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "reserve_rollback_failed");
        }
    }
    ApiError::new(StatusCode::BAD_GATEWAY, "core_unavailable")
}

pub(crate) async fn cancel_order(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
    Extension(trace): Extension<TraceId>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let principal = principal.0;
    if principal.is_empty() {
        return Err(ApiError::unauthorized("login required"));
    }
    let idem_key = idem_key_from_headers(&headers)?;

    let path_key = format!("/v1/orders/{order_id}");
    let hash = request_hash("DELETE", &path_key, &[]);
    match gw.idempotency_probe(&principal, &idem_key, "DELETE", &path_key, &hash) {
        IdempotencyProbe::Conflict => {
            return Err(ApiError::new(StatusCode::CONFLICT, "IDEMPOTENCY_CONFLICT"));
        }
        IdempotencyProbe::Hit { status, body } => return Ok(raw_json(status, body)),
        IdempotencyProbe::Miss => {}
    }

    let Some(matcher) = gw.matcher.clone() else {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "core_unavailable"));
    };

    let record = {
        let st = gw.state();
        st.orders.get(&order_id).cloned()
    };
    let Some(record) = record else {
        let (status, body) =
            marshal(StatusCode::NOT_FOUND, &json!({ "error": "UNKNOWN_ORDER" }));
        gw.idempotency_store(&principal, &idem_key, "DELETE", &path_key, &hash, status, &body);
        return Ok(raw_json(status, body));
    };
    if !record.owner_user_id.is_empty() && record.owner_user_id != principal {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN"));
    }
    if record.symbol.trim().is_empty() {
        let (status, body) = marshal(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "error": "order_symbol_missing" }),
        );
        gw.idempotency_store(&principal, &idem_key, "DELETE", &path_key, &hash, status, &body);
        return Ok(raw_json(status, body));
    }

    let cmd = CancelOrderCmd {
        meta: CommandMeta {
            command_id: Uuid::new_v4().to_string(),
            idempotency_key: idem_key.clone(),
            user_id: principal.clone(),
            symbol: record.symbol.clone(),
            trace_id: trace.0.clone(),
            correlation_id: Uuid::new_v4().to_string(),
        },
        order_id: order_id.clone(),
    };

    let ack = match tokio::time::timeout(gw.cfg.core_timeout, matcher.cancel_order(cmd)).await {
        Ok(Ok(ack)) => ack,
        Ok(Err(err)) => {
            tracing::warn!(%err, "cancel order rpc failed");
            return Err(ApiError::new(StatusCode::BAD_GATEWAY, "core_unavailable"));
        }
        Err(_) => {
            tracing::warn!("cancel order rpc timed out");
            return Err(ApiError::new(StatusCode::BAD_GATEWAY, "core_unavailable"));
        }
    };

    let canceled_at = ack.ts_ms.max(0);
    let mut status_upper = normalize_order_status(&ack.status);
    if status_upper == "ACCEPTED" {
        status_upper = "CANCELED".to_string();
    }

    if ack.accepted && status_upper == "CANCELED" {
        let release = {
            let mut st = gw.state();
            let mut release = None;
            if let Some(mut stored) = st.orders.get(&order_id).cloned() {
                stored.status = "CANCELED".to_string();
                stored.seq = ack.seq;
                stored.canceled_at = canceled_at;
                stored.terminal_at = if canceled_at > 0 { canceled_at } else { now_ms() };
                let release_amount = (stored.reserve_amount - stored.reserve_consumed).max(0.0);
                stored.reserve_amount -= release_amount;
                if release_amount > 0.0
                    && !stored.reserve_currency.is_empty()
                    && !stored.owner_user_id.is_empty()
                {
                    release = Some((
                        stored.owner_user_id.clone(),
                        stored.reserve_currency.clone(),
                        release_amount,
                    ));
                }
                st.orders.insert(order_id.clone(), stored);
            }
            gw.prune_orders_locked(&mut st, now_ms());
            release
        };

        if let Some((owner, currency, amount)) = release {
            if let Err(err) = gw.release_reserve(&owner, &currency, amount).await {
                tracing::error!(%err, "cancel reserve release failed");
                return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "reserve_release_failed"));
            }
        }
    }

    let response = OrderResponse {
        order_id: ack.order_id,
        status: status_upper,
        symbol: ack.symbol,
        seq: ack.seq,
        accepted_at: 0,
        canceled_at,
        reject_code: ack.reject_code,
        correlation_id: ack.correlation_id,
    };
    let (status, body) = marshal(StatusCode::OK, &response);
    gw.idempotency_store(&principal, &idem_key, "DELETE", &path_key, &hash, status, &body);
    Ok(raw_json(status, body))
}

pub(crate) async fn get_order(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(order_id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = principal.0;
    if principal.is_empty() {
        return Err(ApiError::unauthorized("login required"));
    }
    let record = {
        let st = gw.state();
        st.orders.get(&order_id).cloned()
    };
    let Some(record) = record else {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "UNKNOWN_ORDER"));
    };
    if !record.owner_user_id.is_empty() && record.owner_user_id != principal {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN"));
    }
    Ok(Json(record).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SmokeTradeRequest {
    trade_id: String,
    symbol: String,
    price: String,
    qty: String,
}

pub(crate) async fn smoke_trade(
    State(gw): State<Arc<Gateway>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !gw.cfg.enable_smoke_routes {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "smoke_disabled"));
    }
    let Ok(req) = serde_json::from_slice::<SmokeTradeRequest>(&body) else {
        return Err(ApiError::bad_request("invalid JSON"));
    };
    if req.trade_id.is_empty() || req.symbol.is_empty() || req.price.is_empty() || req.qty.is_empty() {
        return Err(ApiError::bad_request("tradeId/symbol/price/qty required"));
    }

    let seq = gw
        .ingest_trade(&req.trade_id, &req.symbol, &req.price, &req.qty, now_ms(), true, 0)
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({ "status": "settled", "seq": seq })).into_response())
}
