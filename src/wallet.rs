use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::marketdata::parse_symbol;
use crate::state::{CoreState, Gateway};

pub(crate) const BALANCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Balance {
    pub(crate) available: f64,
    pub(crate) hold: f64,
}

pub(crate) struct WalletPersistUpdate {
    pub(crate) user_id: String,
    pub(crate) currency: String,
    pub(crate) balance: Balance,
}

pub(crate) struct WalletSnapshot {
    exists: bool,
    wallet: HashMap<String, Balance>,
}

pub(crate) fn default_wallet_balances() -> HashMap<String, Balance> {
    HashMap::from([
        ("KRW".to_string(), Balance { available: 50_000_000.0, hold: 0.0 }),
        ("BTC".to_string(), Balance { available: 2.0, hold: 0.0 }),
        ("ETH".to_string(), Balance { available: 8.0, hold: 0.0 }),
        ("SOL".to_string(), Balance { available: 240.0, hold: 0.0 }),
        ("XRP".to_string(), Balance { available: 15_000.0, hold: 0.0 }),
        ("BNB".to_string(), Balance { available: 34.0, hold: 0.0 }),
    ])
}

pub(crate) fn parse_positive_amount(raw: &str) -> Option<f64> {
    let d = Decimal::from_str(raw.trim()).ok()?;
    if d <= Decimal::ZERO {
        return None;
    }
    let v = d.to_f64()?;
    if !v.is_finite() || v <= 0.0 {
        return None;
    }
    Some(v)
}

pub(crate) fn capture_wallet_snapshots(
    st: &CoreState,
    user_ids: &[&str],
) -> HashMap<String, WalletSnapshot> {
    let mut snapshots = HashMap::with_capacity(user_ids.len());
    for user_id in user_ids {
        if user_id.trim().is_empty() || snapshots.contains_key(*user_id) {
            continue;
        }
        let snapshot = match st.wallets.get(*user_id) {
            Some(wallet) => WalletSnapshot { exists: true, wallet: wallet.clone() },
            None => WalletSnapshot { exists: false, wallet: HashMap::new() },
        };
        snapshots.insert((*user_id).to_string(), snapshot);
    }
    snapshots
}

pub(crate) fn restore_wallet_snapshots(
    st: &mut CoreState,
    snapshots: &HashMap<String, WalletSnapshot>,
) {
    for (user_id, snapshot) in snapshots {
        if snapshot.exists {
            st.wallets.insert(user_id.clone(), snapshot.wallet.clone());
        } else {
            st.wallets.remove(user_id);
        }
    }
}

// Empty return means the buyer cannot cover; the caller restores snapshots.
pub(crate) fn settle_buyer(
    st: &mut CoreState,
    user_id: &str,
    base: &str,
    quote: &str,
    qty: f64,
    quote_amount: f64,
) -> Vec<WalletPersistUpdate> {
    let wallet = st.wallets.entry(user_id.to_string()).or_default();

    // Quote leaves hold first, overflow from available.
    let mut quote_bal = wallet.get(quote).copied().unwrap_or_default();
    if quote_bal.hold + quote_bal.available + BALANCE_EPSILON < quote_amount {
        st.settlement_anomalies += 1;
        return Vec::new();
    }
    let mut remaining = quote_amount;
    if quote_bal.hold >= remaining {
        quote_bal.hold -= remaining;
        remaining = 0.0;
    } else {
        remaining -= quote_bal.hold;
        quote_bal.hold = 0.0;
    }
    if remaining > 0.0 {
        quote_bal.available = (quote_bal.available - remaining).max(0.0);
    }
    wallet.insert(quote.to_string(), quote_bal);

    let mut base_bal = wallet.get(base).copied().unwrap_or_default();
    base_bal.available += qty;
    wallet.insert(base.to_string(), base_bal);

    vec![
        WalletPersistUpdate { user_id: user_id.to_string(), currency: quote.to_string(), balance: quote_bal },
        WalletPersistUpdate { user_id: user_id.to_string(), currency: base.to_string(), balance: base_bal },
    ]
}

pub(crate) fn settle_seller(
    st: &mut CoreState,
    user_id: &str,
    base: &str,
    quote: &str,
    qty: f64,
    quote_amount: f64,
) -> Vec<WalletPersistUpdate> {
    let wallet = st.wallets.entry(user_id.to_string()).or_default();

    let mut base_bal = wallet.get(base).copied().unwrap_or_default();
    if base_bal.hold + base_bal.available + BALANCE_EPSILON < qty {
        st.settlement_anomalies += 1;
        return Vec::new();
    }
    let mut remaining = qty;
    if base_bal.hold >= remaining {
        base_bal.hold -= remaining;
        remaining = 0.0;
    } else {
        remaining -= base_bal.hold;
        base_bal.hold = 0.0;
    }
    if remaining > 0.0 {
        base_bal.available = (base_bal.available - remaining).max(0.0);
    }
    wallet.insert(base.to_string(), base_bal);

    let mut quote_bal = wallet.get(quote).copied().unwrap_or_default();
    quote_bal.available += quote_amount;
    wallet.insert(quote.to_string(), quote_bal);

    vec![
        WalletPersistUpdate { user_id: user_id.to_string(), currency: base.to_string(), balance: base_bal },
        WalletPersistUpdate { user_id: user_id.to_string(), currency: quote.to_string(), balance: quote_bal },
    ]
}

impl Gateway {
    pub(crate) async fn snapshot_wallet(&self, user_id: &str) -> HashMap<String, Balance> {
        {
            let st = self.state();
            if let Some(wallet) = st.wallets.get(user_id) {
                return wallet.clone();
            }
        }
        let mut wallet = self.load_wallet_from_db(user_id).await;
        if wallet.is_empty() {
            wallet = default_wallet_balances();
        }
        let mut st = self.state();
        st.wallets.entry(user_id.to_string()).or_insert_with(|| wallet.clone());
        st.wallets.get(user_id).cloned().unwrap_or(wallet)
    }

    pub(crate) async fn apply_reserve(
        &self,
        user_id: &str,
        currency: &str,
        amount: f64,
    ) -> Result<Balance, ApiError> {
        if amount <= 0.0 || !amount.is_finite() {
            return Err(ApiError::bad_request("invalid_amount"));
        }
        let currency = currency.trim().to_uppercase();

        let (current, previous) = {
            let mut st = self.state();
            let previous = capture_wallet_snapshots(&st, &[user_id]);
            let wallet = st
                .wallets
                .entry(user_id.to_string())
                .or_insert_with(default_wallet_balances);
            let mut current = wallet.get(&currency).copied().unwrap_or_default();
            if current.available + BALANCE_EPSILON < amount {
                return Err(ApiError::bad_request("insufficient_balance"));
            }
            current.available -= amount;
            current.hold += amount;
            wallet.insert(currency.clone(), current);
            (current, previous)
        };

        if let Err(err) = self.persist_wallet_balance(user_id, &currency, current).await {
            let mut st = self.state();
            restore_wallet_snapshots(&mut st, &previous);
            st.wallet_persist_errors += 1;
            tracing::warn!(user_id, %currency, %err, "wallet reserve persist failed");
            return Err(ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "wallet_persist_failed",
            ));
        }
        Ok(current)
    }

    pub(crate) async fn release_reserve(
        &self,
        user_id: &str,
        currency: &str,
        amount: f64,
    ) -> anyhow::Result<Balance> {
        if amount <= 0.0 {
            return Ok(Balance::default());
        }
        if !amount.is_finite() {
            anyhow::bail!("release amount must be finite");
        }
        let currency = currency.trim().to_uppercase();

        let (current, previous) = {
            let mut st = self.state();
            let previous = capture_wallet_snapshots(&st, &[user_id]);
            let wallet = st
                .wallets
                .entry(user_id.to_string())
                .or_insert_with(default_wallet_balances);
            let mut current = wallet.get(&currency).copied().unwrap_or_default();
            if current.hold >= amount {
                current.hold -= amount;
                current.available += amount;
            } else {
                // The hold was partially consumed by fills; clamp rather than
                // going negative.
                current.available += current.hold;
                current.hold = 0.0;
            }
            wallet.insert(currency.clone(), current);
            (current, previous)
        };

        if let Err(err) = self.persist_wallet_balance(user_id, &currency, current).await {
            let mut st = self.state();
            restore_wallet_snapshots(&mut st, &previous);
            st.wallet_persist_errors += 1;
            tracing::warn!(user_id, %currency, %err, "wallet release persist failed");
            return Err(err);
        }
        Ok(current)
    }

    pub(crate) async fn try_reserve_for_order(
        &self,
        user_id: &str,
        symbol: &str,
        side: &str,
        order_type: &str,
        price_raw: &str,
        qty_raw: &str,
    ) -> Result<(String, f64), ApiError> {
        let Some((base, quote)) = parse_symbol(symbol) else {
            return Err(ApiError::bad_request("invalid symbol"));
        };
        let Some(qty) = parse_positive_amount(qty_raw) else {
            return Err(ApiError::bad_request("invalid qty"));
        };

        match side.to_uppercase().as_str() {
            "BUY" => {
                let price = if order_type.eq_ignore_ascii_case("MARKET") {
                    self.latest_price_krw(&base).unwrap_or(0.0)
                } else {
                    parse_positive_amount(price_raw)
                        .ok_or_else(|| ApiError::bad_request("invalid price"))?
                };
                if price <= 0.0 {
                    return Err(ApiError::bad_request("price_unavailable"));
                }
                let amount = qty * price;
                self.apply_reserve(user_id, &quote, amount).await?;
                Ok((quote, amount))
            }
            "SELL" => {
                self.apply_reserve(user_id, &base, qty).await?;
                Ok((base, qty))
            }
            _ => Err(ApiError::bad_request("invalid side")),
        }
    }

    pub(crate) fn latest_price_krw(&self, base: &str) -> Option<f64> {
        let symbol = format!("{}-KRW", base.trim().to_uppercase());
        let st = self.state();
        let tape = st.trade_tape.get(&symbol)?;
        tape.last().map(|point| point.price as f64)
    }

    pub(crate) async fn settle_trade(
        &self,
        buyer_user_id: &str,
        seller_user_id: &str,
        symbol: &str,
        qty: i64,
        quote_amount: i64,
    ) -> anyhow::Result<()> {
        let Some((base, quote)) = parse_symbol(symbol) else {
            anyhow::bail!("invalid symbol");
        };
        let qty_f = qty as f64;
        let quote_f = quote_amount as f64;

        let (updates, snapshots) = {
            let mut st = self.state();
            let snapshots = capture_wallet_snapshots(&st, &[buyer_user_id, seller_user_id]);
            let mut updates = Vec::with_capacity(4);
            if !buyer_user_id.is_empty() {
                let buyer = settle_buyer(&mut st, buyer_user_id, &base, &quote, qty_f, quote_f);
                if buyer.is_empty() {
                    restore_wallet_snapshots(&mut st, &snapshots);
                    anyhow::bail!("insufficient buyer balance");
                }
                updates.extend(buyer);
            }
            if !seller_user_id.is_empty() {
                let seller = settle_seller(&mut st, seller_user_id, &base, &quote, qty_f, quote_f);
                if seller.is_empty() {
                    restore_wallet_snapshots(&mut st, &snapshots);
                    anyhow::bail!("insufficient seller balance");
                }
                updates.extend(seller);
            }
            (updates, snapshots)
        };

        // Persist outside the lock; any failure restores both wallets.
        for update in &updates {
            if let Err(err) = self
                .persist_wallet_balance(&update.user_id, &update.currency, update.balance)
                .await
            {
                let mut st = self.state();
                restore_wallet_snapshots(&mut st, &snapshots);
                st.settlement_anomalies += 1;
                st.wallet_persist_errors += 1;
                return Err(err);
            }
        }
        Ok(())
    }
}
