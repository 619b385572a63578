use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::state::now_ms;

pub(crate) mod proto {
    tonic::include_proto!("exchange.v1");
}

use proto::trading_core_service_client::TradingCoreServiceClient;

#[derive(Debug, Clone, Default)]
pub(crate) struct CommandMeta {
    pub(crate) command_id: String,
    pub(crate) idempotency_key: String,
    pub(crate) user_id: String,
    pub(crate) symbol: String,
    pub(crate) trace_id: String,
    pub(crate) correlation_id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct PlaceOrderCmd {
    pub(crate) meta: CommandMeta,
    pub(crate) order_id: String,
    pub(crate) side: proto::Side,
    pub(crate) order_type: proto::OrderType,
    pub(crate) price: String,
    pub(crate) qty: String,
    pub(crate) time_in_force: proto::TimeInForce,
}

#[derive(Debug, Clone)]
pub(crate) struct CancelOrderCmd {
    pub(crate) meta: CommandMeta,
    pub(crate) order_id: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct OrderAck {
    pub(crate) accepted: bool,
    pub(crate) order_id: String,
    pub(crate) status: String,
    pub(crate) symbol: String,
    pub(crate) seq: u64,
    pub(crate) ts_ms: i64,
    pub(crate) reject_code: String,
    pub(crate) correlation_id: String,
}

#[async_trait]
pub(crate) trait MatcherClient: Send + Sync {
    async fn place_order(&self, cmd: PlaceOrderCmd) -> Result<OrderAck>;
    async fn cancel_order(&self, cmd: CancelOrderCmd) -> Result<OrderAck>;
}

pub(crate) fn map_side(value: &str) -> Option<proto::Side> {
    match value.to_uppercase().as_str() {
        "BUY" => Some(proto::Side::Buy),
        "SELL" => Some(proto::Side::Sell),
        _ => None,
    }
}

pub(crate) fn map_order_type(value: &str) -> Option<proto::OrderType> {
    match value.to_uppercase().as_str() {
        "LIMIT" => Some(proto::OrderType::Limit),
        "MARKET" => Some(proto::OrderType::Market),
        _ => None,
    }
}

pub(crate) fn map_time_in_force(value: &str) -> Option<proto::TimeInForce> {
    match value.to_uppercase().as_str() {
        "GTC" | "" => Some(proto::TimeInForce::Gtc),
        "IOC" => Some(proto::TimeInForce::Ioc),
        "FOK" => Some(proto::TimeInForce::Fok),
        _ => None,
    }
}

pub(crate) struct GrpcMatcher {
    client: TradingCoreServiceClient<Channel>,
}

impl GrpcMatcher {
    pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(addr.to_string())
            .context("core address")?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect()
            .await
            .context("dial core")?;
        Ok(Self {
            client: TradingCoreServiceClient::new(channel),
        })
    }
}

fn proto_meta(meta: &CommandMeta) -> proto::CommandMetadata {
    proto::CommandMetadata {
        command_id: meta.command_id.clone(),
        idempotency_key: meta.idempotency_key.clone(),
        user_id: meta.user_id.clone(),
        symbol: meta.symbol.clone(),
        ts_server_ms: now_ms(),
        trace_id: meta.trace_id.clone(),
        correlation_id: meta.correlation_id.clone(),
    }
}

#[async_trait]
impl MatcherClient for GrpcMatcher {
    async fn place_order(&self, cmd: PlaceOrderCmd) -> Result<OrderAck> {
        let request = proto::PlaceOrderRequest {
            meta: Some(proto_meta(&cmd.meta)),
            order_id: cmd.order_id,
            side: cmd.side as i32,
            order_type: cmd.order_type as i32,
            price: cmd.price,
            quantity: cmd.qty,
            time_in_force: cmd.time_in_force as i32,
        };
        let response = self
            .client
            .clone()
            .place_order(request)
            .await
            .context("place order rpc")?
            .into_inner();
        Ok(OrderAck {
            accepted: response.accepted,
            order_id: response.order_id,
            status: response.status,
            symbol: response.symbol,
            seq: response.seq,
            ts_ms: response.accepted_at_ms,
            reject_code: response.reject_code,
            correlation_id: response.correlation_id,
        })
    }

    async fn cancel_order(&self, cmd: CancelOrderCmd) -> Result<OrderAck> {
        let request = proto::CancelOrderRequest {
            meta: Some(proto_meta(&cmd.meta)),
            order_id: cmd.order_id,
        };
        let response = self
            .client
            .clone()
            .cancel_order(request)
            .await
            .context("cancel order rpc")?
            .into_inner();
        Ok(OrderAck {
            accepted: response.accepted,
            order_id: response.order_id,
            status: response.status,
            symbol: response.symbol,
            seq: response.seq,
            ts_ms: response.canceled_at_ms,
            reject_code: response.reject_code,
            correlation_id: response.correlation_id,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_type_tif_mappings() {
        assert_eq!(map_side("buy"), Some(proto::Side::Buy));
        assert_eq!(map_side("SELL"), Some(proto::Side::Sell));
        assert_eq!(map_side("HOLD"), None);
        assert_eq!(map_order_type("limit"), Some(proto::OrderType::Limit));
        assert_eq!(map_order_type("MARKET"), Some(proto::OrderType::Market));
        assert_eq!(map_order_type("STOP"), None);
        assert_eq!(map_time_in_force(""), Some(proto::TimeInForce::Gtc));
        assert_eq!(map_time_in_force("ioc"), Some(proto::TimeInForce::Ioc));
        assert_eq!(map_time_in_force("FOK"), Some(proto::TimeInForce::Fok));
        assert_eq!(map_time_in_force("GTD"), None);
    }
}
