use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Serialize;
use serde_json::json;

use crate::auth::AuthPrincipal;
use crate::error::ApiError;
use crate::state::{now_ms, Gateway};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceView {
    currency: String,
    available: f64,
    hold: f64,
    total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_krw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value_krw: Option<f64>,
}

pub(crate) async fn balances(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Response, ApiError> {
    if principal.0.is_empty() {
        return Err(ApiError::unauthorized("unauthorized"));
    }
    let wallet = gw.snapshot_wallet(&principal.0).await;
    let mut out: Vec<BalanceView> = wallet
        .into_iter()
        .map(|(currency, bal)| BalanceView {
            currency,
            available: bal.available,
            hold: bal.hold,
            total: bal.available + bal.hold,
            price_krw: None,
            value_krw: None,
        })
        .collect();
    out.sort_by(|a, b| a.currency.cmp(&b.currency));

    Ok(Json(json!({ "userId": principal.0, "balances": out })).into_response())
}

pub(crate) async fn portfolio(
    State(gw): State<Arc<Gateway>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Result<Response, ApiError> {
    if principal.0.is_empty() {
        return Err(ApiError::unauthorized("unauthorized"));
    }
    let wallet = gw.snapshot_wallet(&principal.0).await;
    let mut total_value = 0.0;
    let mut assets: Vec<BalanceView> = wallet
        .into_iter()
        .map(|(currency, bal)| {
            let total = bal.available + bal.hold;
            let price = if currency == "KRW" {
                1.0
            } else {
                gw.latest_price_krw(&currency).filter(|p| *p > 0.0).unwrap_or(0.0)
            };
            let value = total * price;
            total_value += value;
            BalanceView {
                currency,
                available: bal.available,
                hold: bal.hold,
                total,
                price_krw: Some(price),
                value_krw: Some(value),
            }
        })
        .collect();
    assets.sort_by(|a, b| {
        b.value_krw
            .partial_cmp(&a.value_krw)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(Json(json!({
        "userId": principal.0,
        "assets": assets,
        "totalAssetValue": total_value,
        "updatedAt": now_ms(),
    }))
    .into_response())
}
