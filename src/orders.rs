use serde::Serialize;

use crate::state::{now_ms, CoreState, Gateway};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderRecord {
    pub(crate) order_id: String,
    pub(crate) status: String,
    pub(crate) symbol: String,
    pub(crate) seq: u64,
    pub(crate) accepted_at: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub(crate) canceled_at: i64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub(crate) filled_qty: f64,

    #[serde(skip)]
    pub(crate) owner_user_id: String,
    #[serde(skip)]
    pub(crate) reserve_currency: String,
    #[serde(skip)]
    pub(crate) reserve_amount: f64,
    #[serde(skip)]
    pub(crate) reserve_consumed: f64,
    #[serde(skip)]
    pub(crate) side: String,
    #[serde(skip)]
    pub(crate) qty: f64,
    #[serde(skip)]
    pub(crate) terminal_at: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

pub(crate) fn is_terminal_status(status: &str) -> bool {
    matches!(status.trim().to_uppercase().as_str(), "FILLED" | "CANCELED" | "REJECTED")
}

pub(crate) fn normalize_order_status(status: &str) -> String {
    let upper = status.trim().to_uppercase();
    if upper == "PARTIAL" {
        "PARTIALLY_FILLED".to_string()
    } else {
        upper
    }
}

struct PendingRelease {
    user_id: String,
    currency: String,
    amount: f64,
}

impl Gateway {
    pub(crate) fn prune_orders_locked(&self, st: &mut CoreState, now_ms: i64) {
        if self.cfg.order_max_records == 0 {
            return;
        }
        if st.orders.is_empty() {
            st.next_order_gc_at_ms = now_ms + self.cfg.order_gc_interval.as_millis() as i64;
            return;
        }
        if st.orders.len() <= self.cfg.order_max_records && now_ms < st.next_order_gc_at_ms {
            return;
        }

        let retention_cutoff = (now_ms - self.cfg.order_retention.as_millis() as i64).max(0);
        st.orders.retain(|_, record| {
            !is_terminal_status(&record.status)
                || record.terminal_at <= 0
                || record.terminal_at > retention_cutoff
        });

        if st.orders.len() > self.cfg.order_max_records {
            let mut terminal: Vec<(i64, String)> = st
                .orders
                .iter()
                .filter(|(_, record)| is_terminal_status(&record.status))
                .map(|(order_id, record)| {
                    let mut terminal_at = record.terminal_at;
                    if terminal_at <= 0 {
                        terminal_at = record.canceled_at;
                    }
                    if terminal_at <= 0 {
                        terminal_at = record.accepted_at;
                    }
                    (terminal_at, order_id.clone())
                })
                .collect();
            terminal.sort();
            let need = st.orders.len() - self.cfg.order_max_records;
            for (_, order_id) in terminal.into_iter().take(need) {
                st.orders.remove(&order_id);
            }
        }

        st.next_order_gc_at_ms = now_ms + self.cfg.order_gc_interval.as_millis() as i64;
    }

    pub(crate) async fn apply_order_fill(
        &self,
        order_id: &str,
        fill_qty: i64,
        fill_price: i64,
        seq: u64,
    ) -> anyhow::Result<()> {
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Ok(());
        }

        let fill_qty_f = fill_qty as f64;
        let fill_quote_f = (fill_qty as f64) * (fill_price as f64);
        let mut release: Option<PendingRelease> = None;

        {
            let mut st = self.state();
            if let Some(mut record) = st.orders.get(order_id).cloned() {
                record.filled_qty += fill_qty_f;
                match record.side.to_uppercase().as_str() {
                    "BUY" => record.reserve_consumed += fill_quote_f,
                    "SELL" => record.reserve_consumed += fill_qty_f,
                    _ => {}
                }

                if record.qty > 0.0 && record.filled_qty >= record.qty - crate::wallet::BALANCE_EPSILON {
                    record.filled_qty = record.qty;
                    record.status = "FILLED".to_string();
                    record.terminal_at = now_ms();
                    let remaining = record.reserve_amount - record.reserve_consumed;
                    if remaining > crate::wallet::BALANCE_EPSILON
                        && !record.owner_user_id.is_empty()
                        && !record.reserve_currency.is_empty()
                    {
                        release = Some(PendingRelease {
                            user_id: record.owner_user_id.clone(),
                            currency: record.reserve_currency.clone(),
                            amount: remaining,
                        });
                        record.reserve_amount -= remaining;
                    }
                } else if record.filled_qty > 0.0 {
                    record.status = "PARTIALLY_FILLED".to_string();
                }

                if seq > record.seq {
                    record.seq = seq;
                }
                st.orders.insert(order_id.to_string(), record);
                self.prune_orders_locked(&mut st, now_ms());
            }
        }

        if let Some(release) = release {
            self.release_reserve(&release.user_id, &release.currency, release.amount)
                .await?;
        }
        Ok(())
    }
}
