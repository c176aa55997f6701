//! Brokerage gateway boundary. The engine only ever talks to
//! [`GatewayClient`]; wire-level adapter details stay behind this trait.

mod paper;
mod probe;

pub use paper::PaperGateway;
pub use probe::GatewayProbe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{OrderSide, OrderType, PortfolioSummary, PositionItem, SecType, TimeInForce};
use crate::error::{Result, SentraError};
use crate::marketdata::{BarsFetcher, ContractRef, HistoricalBar};

/// Fully-resolved order payload submitted to the gateway. Also serialized
/// verbatim into the order row for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    /// Caller-supplied idempotency token; resubmitting the same
    /// (trade_id, leg) must not create a second gateway order.
    pub trade_id: String,
    pub leg: i64,
    pub market: String,
    pub symbol: String,
    pub sec_type: SecType,
    pub exchange: String,
    pub currency: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub tif: TimeInForce,
    /// Opaque to the engine; the gateway decides what overnight means
    #[serde(default)]
    pub allow_overnight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_month: Option<String>,
}

/// Submission acknowledgement
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub ib_order_id: i64,
    pub raw_status: String,
}

/// Point-in-time order state as reported by the gateway
#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub ib_order_id: i64,
    pub raw_status: String,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque brokerage gateway client.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn fetch_bars(
        &self,
        contract: &ContractRef,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        bar_size: &str,
        what_to_show: &str,
        use_rth: bool,
    ) -> Result<Vec<HistoricalBar>>;

    /// Resolve the gateway contract id for a symbol.
    async fn resolve_contract_id(&self, contract: &ContractRef) -> Result<i64>;

    /// Idempotent under the payload's (trade_id, leg).
    async fn submit_order(&self, payload: &OrderPayload) -> Result<OrderAck>;

    async fn cancel_order(&self, ib_order_id: i64) -> Result<()>;

    async fn order_status(&self, ib_order_id: i64) -> Result<Option<OrderStatusSnapshot>>;

    async fn account_snapshot(&self) -> Result<PortfolioSummary>;

    async fn positions(&self) -> Result<Vec<PositionItem>>;
}

/// Adapter exposing a gateway as the cache's bar source.
pub struct GatewayBars {
    client: Arc<dyn GatewayClient>,
}

impl GatewayBars {
    pub fn new(client: Arc<dyn GatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BarsFetcher for GatewayBars {
    async fn fetch(
        &self,
        contract: &ContractRef,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        bar_size: &str,
        what_to_show: &str,
        use_rth: bool,
    ) -> Result<Vec<HistoricalBar>> {
        self.client
            .fetch_bars(contract, start_time, end_time, bar_size, what_to_show, use_rth)
            .await
    }
}

/// Bound a gateway call by the configured timeout.
pub async fn with_timeout<T, F>(timeout_seconds: u64, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_secs(timeout_seconds), future).await {
        Ok(result) => result,
        Err(_) => Err(SentraError::GatewayTimeout(timeout_seconds)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(0, async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(SentraError::GatewayTimeout(0))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(5, async { Ok(42u32) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_order_payload_round_trip() {
        let payload = OrderPayload {
            trade_id: "T-1".to_string(),
            leg: 0,
            market: "US_STOCK".to_string(),
            symbol: "SLV".to_string(),
            sec_type: SecType::Stk,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(100),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            allow_overnight: false,
            contract_month: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["sec_type"], "STK");
        let parsed: OrderPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }
}
