use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::marketdata::{parse_i64_any, parse_symbol};
use crate::state::{now_ms, Gateway};

const CONSUMER_ERROR_GRACE_MS: i64 = 10_000;
const CONSUMER_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const TRADE_JOURNAL_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct TradeEventEnvelope {
    pub(crate) event_id: String,
    pub(crate) event_version: i64,
    pub(crate) symbol: String,
    pub(crate) seq: u64,
    pub(crate) occurred_at: String,
    pub(crate) correlation_id: String,
    pub(crate) causation_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct TradeEventPayload {
    pub(crate) envelope: TradeEventEnvelope,
    pub(crate) trade_id: String,
    pub(crate) maker_order_id: String,
    pub(crate) taker_order_id: String,
    pub(crate) buyer_user_id: String,
    pub(crate) seller_user_id: String,
    pub(crate) price: Value,
    pub(crate) quantity: Value,
    pub(crate) quote_amount: Value,
    pub(crate) symbol: String,
    pub(crate) seq: u64,
    pub(crate) ts: i64,
}

// Err from the consume path is retryable; the offset must not be committed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsumeOutcome {
    Applied,
    Dropped,
}

pub(crate) struct TradeConsumerHandle {
    pub(crate) task: JoinHandle<()>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub(crate) fn begin_trade_apply(&self, trade_id: &str) -> bool {
        let now = now_ms();
        let cutoff = now - TRADE_JOURNAL_TTL_MS;
        let mut st = self.state();
        // Age out journal entries, then refuse applied or in-flight ids.
        st.applied_trades.retain(|_, seen_at| *seen_at >= cutoff);
        st.applying_trades.retain(|_, started_at| *started_at >= cutoff);
        if st.applied_trades.contains_key(trade_id) || st.applying_trades.contains_key(trade_id) {
            return false;
        }
        st.applying_trades.insert(trade_id.to_string(), now);
        true
    }

    pub(crate) fn commit_trade_apply(&self, trade_id: &str, ts_ms: i64) {
        let mut st = self.state();
        st.applying_trades.remove(trade_id);
        st.applied_trades.insert(trade_id.to_string(), ts_ms);
    }

    pub(crate) fn abort_trade_apply(&self, trade_id: &str) {
        let mut st = self.state();
        st.applying_trades.remove(trade_id);
    }

    pub(crate) fn trade_consumer_ready(&self) -> bool {
        if self.cfg.kafka_brokers.trim().is_empty() {
            return true;
        }
        let now = now_ms();
        let st = self.state();
        if !st.trade_consumer_expected || !st.trade_consumer_running {
            return false;
        }
        !(st.trade_consumer_error_ms > 0 && now - st.trade_consumer_error_ms <= CONSUMER_ERROR_GRACE_MS)
    }

    pub(crate) async fn consume_trade_message(&self, raw: &[u8]) -> Result<ConsumeOutcome> {
        let payload: TradeEventPayload = match serde_json::from_slice(raw) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "dropping undecodable trade event");
                return Ok(ConsumeOutcome::Dropped);
            }
        };

        if payload.envelope.event_version != 1 {
            tracing::warn!(version = payload.envelope.event_version, "dropping unsupported eventVersion");
            return Ok(ConsumeOutcome::Dropped);
        }
        let trade_id = payload.trade_id.trim().to_string();
        if trade_id.is_empty() {
            tracing::warn!("dropping trade event without tradeId");
            return Ok(ConsumeOutcome::Dropped);
        }

        let mut symbol = payload.envelope.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            symbol = payload.symbol.trim().to_uppercase();
        }
        if symbol.is_empty() || parse_symbol(&symbol).is_none() {
            tracing::warn!(%trade_id, "dropping trade event without symbol");
            return Ok(ConsumeOutcome::Dropped);
        }

        let price = parse_i64_any(&payload.price).filter(|p| *p > 0);
        let qty = parse_i64_any(&payload.quantity).filter(|q| *q > 0);
        let (Some(price), Some(qty)) = (price, qty) else {
            tracing::warn!(%trade_id, "dropping trade event with invalid price/quantity");
            return Ok(ConsumeOutcome::Dropped);
        };
        let quote_amount = parse_i64_any(&payload.quote_amount)
            .filter(|q| *q > 0)
            .unwrap_or(price * qty);

        let mut seq = payload.envelope.seq;
        if seq == 0 {
            seq = payload.seq;
        }
        if seq == 0 {
            tracing::warn!(%trade_id, "dropping trade event without seq");
            return Ok(ConsumeOutcome::Dropped);
        }

        let mut ts_ms = payload.ts;
        if ts_ms <= 0 {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&payload.envelope.occurred_at) {
                ts_ms = parsed.timestamp_millis();
            }
        }
        if ts_ms <= 0 {
            ts_ms = now_ms();
        }

        if !self.begin_trade_apply(&trade_id) {
            return Ok(ConsumeOutcome::Dropped);
        }
        tracing::debug!(
            %trade_id,
            %symbol,
            seq,
            event_id = %payload.envelope.event_id,
            correlation_id = %payload.envelope.correlation_id,
            causation_id = %payload.envelope.causation_id,
            "applying trade event"
        );

        let applied = async {
            self.settle_trade(
                &payload.buyer_user_id,
                &payload.seller_user_id,
                &symbol,
                qty,
                quote_amount,
            )
            .await
            .context("apply settlement")?;
            self.apply_order_fill(&payload.maker_order_id, qty, price, seq)
                .await
                .context("apply maker fill")?;
            self.apply_order_fill(&payload.taker_order_id, qty, price, seq)
                .await
                .context("apply taker fill")?;
            self.ingest_trade(
                &trade_id,
                &symbol,
                &price.to_string(),
                &qty.to_string(),
                ts_ms,
                false,
                seq,
            )
            .await
            .context("publish trade")?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(err) = applied {
            self.abort_trade_apply(&trade_id);
            return Err(err);
        }
        self.commit_trade_apply(&trade_id, ts_ms);
        Ok(ConsumeOutcome::Applied)
    }
}

fn kafka_auto_offset_reset(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "last" | "latest" => "latest",
        _ => "earliest",
    }
}

pub(crate) fn spawn_trade_consumer(gateway: Arc<Gateway>) -> Result<Option<TradeConsumerHandle>> {
    let brokers = gateway.cfg.kafka_brokers.trim().to_string();
    if brokers.is_empty() {
        let mut st = gateway.state();
        st.trade_consumer_expected = false;
        st.trade_consumer_running = false;
        st.trade_consumer_error_ms = 0;
        return Ok(None);
    }

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", &gateway.cfg.kafka_group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", kafka_auto_offset_reset(&gateway.cfg.kafka_start_offset))
        .create()
        .context("create kafka consumer")?;
    consumer
        .subscribe(&[gateway.cfg.kafka_trade_topic.as_str()])
        .context("subscribe trade topic")?;

    {
        let mut st = gateway.state();
        st.trade_consumer_expected = true;
        st.trade_consumer_running = true;
        st.trade_consumer_error_ms = 0;
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let topic = gateway.cfg.kafka_trade_topic.clone();
    let task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break,
                message = consumer.recv() => message,
            };
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    {
                        let mut st = gateway.state();
                        st.trade_consumer_read_errors += 1;
                        st.trade_consumer_error_ms = now_ms();
                    }
                    tracing::warn!(%topic, %err, "trade consume failed");
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(CONSUMER_RETRY_BACKOFF) => {}
                    }
                    continue;
                }
            };
            {
                let mut st = gateway.state();
                st.trade_consumer_error_ms = 0;
            }

            let payload = message.payload().unwrap_or_default().to_vec();
            // Apply errors are retryable: hold the offset and try the same
            // event again after a pause.
            loop {
                match gateway.consume_trade_message(&payload).await {
                    Ok(_) => {
                        if let Err(err) = consumer.commit_message(&message, CommitMode::Async) {
                            tracing::warn!(%topic, %err, "trade offset commit failed");
                        }
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%topic, %err, "trade apply failed, retrying");
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                let mut st = gateway.state();
                                st.trade_consumer_running = false;
                                return;
                            }
                            _ = tokio::time::sleep(CONSUMER_RETRY_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        let mut st = gateway.state();
        st.trade_consumer_running = false;
    });

    Ok(Some(TradeConsumerHandle { task, shutdown: shutdown_tx }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::wallet::{Balance, BALANCE_EPSILON};
    use serde_json::json;

    fn gateway() -> Gateway {
        Gateway::new(test_config(), None, None, None)
    }

    fn seed_wallets(gw: &Gateway) {
        let mut st = gw.state();
        st.wallets
            .entry("u1".into())
            .or_default()
            .insert("KRW".into(), Balance { available: 0.0, hold: 100.0 });
        st.wallets
            .entry("u2".into())
            .or_default()
            .insert("BTC".into(), Balance { available: 0.0, hold: 1.0 });
    }

    fn trade_event() -> Vec<u8> {
        json!({
            "envelope": {
                "eventId": "evt-1",
                "eventVersion": 1,
                "symbol": "BTC-KRW",
                "seq": 7,
                "occurredAt": "2026-01-02T03:04:05Z",
                "correlationId": "corr-1",
                "causationId": "cause-1",
            },
            "tradeId": "t1",
            "makerOrderId": "",
            "takerOrderId": "",
            "buyerUserId": "u1",
            "sellerUserId": "u2",
            "price": "100",
            "quantity": 1,
            "quoteAmount": "100",
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn dedup_journal_transitions() {
        let gw = gateway();
        assert!(gw.begin_trade_apply("t1"));
        // In-flight duplicates are refused.
        assert!(!gw.begin_trade_apply("t1"));
        gw.abort_trade_apply("t1");
        assert!(gw.begin_trade_apply("t1"));
        gw.commit_trade_apply("t1", 123);
        assert!(!gw.begin_trade_apply("t1"));

        // Entries age out of the journal.
        {
            let mut st = gw.state();
            let stale = now_ms() - TRADE_JOURNAL_TTL_MS - 1;
            st.applied_trades.insert("t1".to_string(), stale);
        }
        assert!(gw.begin_trade_apply("t1"));
    }

    #[tokio::test]
    async fn settlement_applies_exactly_once() {
        let gw = gateway();
        seed_wallets(&gw);

        let raw = trade_event();
        assert_eq!(gw.consume_trade_message(&raw).await.unwrap(), ConsumeOutcome::Applied);
        assert_eq!(gw.consume_trade_message(&raw).await.unwrap(), ConsumeOutcome::Dropped);

        let st = gw.state();
        let u1 = &st.wallets["u1"];
        let u2 = &st.wallets["u2"];
        assert!(u1["KRW"].available.abs() < BALANCE_EPSILON);
        assert!(u1["KRW"].hold.abs() < BALANCE_EPSILON);
        assert!((u1["BTC"].available - 1.0).abs() < BALANCE_EPSILON);
        assert!(u2["BTC"].available.abs() < BALANCE_EPSILON);
        assert!(u2["BTC"].hold.abs() < BALANCE_EPSILON);
        assert!((u2["KRW"].available - 100.0).abs() < BALANCE_EPSILON);
        assert_eq!(st.trades_total, 1);
    }

    #[tokio::test]
    async fn published_frames_carry_event_seq() {
        let gw = gateway();
        seed_wallets(&gw);
        gw.consume_trade_message(&trade_event()).await.unwrap();
        let history = gw.history_snapshot("BTC-KRW");
        assert_eq!(history.len(), 4);
        assert!(history.iter().all(|m| m.seq == 7));
        assert!(history.iter().any(|m| m.msg_type == "TradeExecuted"));
    }

    #[tokio::test]
    async fn rejects_unsupported_event_version() {
        let gw = gateway();
        let raw = json!({
            "envelope": {"eventVersion": 2, "symbol": "BTC-KRW", "seq": 1},
            "tradeId": "t9",
            "price": "100",
            "quantity": "1",
        })
        .to_string();
        assert_eq!(
            gw.consume_trade_message(raw.as_bytes()).await.unwrap(),
            ConsumeOutcome::Dropped
        );
        assert!(gw.state().applied_trades.is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_seq() {
        let gw = gateway();
        let raw = json!({
            "envelope": {"eventVersion": 1, "symbol": "BTC-KRW"},
            "tradeId": "t9",
            "price": "100",
            "quantity": "1",
        })
        .to_string();
        assert_eq!(
            gw.consume_trade_message(raw.as_bytes()).await.unwrap(),
            ConsumeOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn apply_failure_aborts_dedup_so_redelivery_can_succeed() {
        // A pool that cannot reach any server makes every persist fail fast.
        let mut cfg = test_config();
        cfg.db_statement_timeout = Duration::from_millis(200);
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://nobody@127.0.0.1:1/nowhere")
            .expect("lazy pool");
        let gw = Gateway::new(cfg, Some(pool), None, None);
        seed_wallets(&gw);

        let raw = trade_event();
        let err = gw.consume_trade_message(&raw).await.unwrap_err();
        assert!(err.to_string().contains("apply settlement"), "{err}");

        // Wallets rolled back, journal clean.
        {
            let st = gw.state();
            assert!((st.wallets["u1"]["KRW"].hold - 100.0).abs() < BALANCE_EPSILON);
            assert!(st.applying_trades.is_empty());
            assert!(st.applied_trades.is_empty());
            assert!(st.wallet_persist_errors > 0);
        }

        // Redelivery against a healthy store applies cleanly.
        let gw2 = gateway();
        seed_wallets(&gw2);
        assert_eq!(gw2.consume_trade_message(&raw).await.unwrap(), ConsumeOutcome::Applied);
    }

    #[test]
    fn readiness_tracks_consumer_state() {
        let mut cfg = test_config();
        cfg.kafka_brokers = "localhost:9092".to_string();
        let gw = Gateway::new(cfg, None, None, None);
        assert!(!gw.trade_consumer_ready());
        {
            let mut st = gw.state();
            st.trade_consumer_expected = true;
            st.trade_consumer_running = true;
        }
        assert!(gw.trade_consumer_ready());
        {
            let mut st = gw.state();
            st.trade_consumer_error_ms = now_ms();
        }
        assert!(!gw.trade_consumer_ready());
        {
            let mut st = gw.state();
            st.trade_consumer_error_ms = now_ms() - CONSUMER_ERROR_GRACE_MS - 1_000;
        }
        assert!(gw.trade_consumer_ready());

        // No brokers configured: consumer is not part of readiness.
        let gw2 = gateway();
        assert!(gw2.trade_consumer_ready());
    }
}
