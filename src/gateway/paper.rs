//! In-process simulated gateway used for paper trading and tests. Orders
//! are accepted immediately; fills are driven either automatically
//! (`auto_fill`) or explicitly by the test harness.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use super::{GatewayClient, OrderAck, OrderPayload, OrderStatusSnapshot};
use crate::domain::{OrderType, PortfolioSummary, PositionItem};
use crate::error::{Result, SentraError};
use crate::marketdata::{ContractRef, HistoricalBar};

#[derive(Debug, Clone)]
struct PaperOrder {
    payload: OrderPayload,
    raw_status: String,
    filled_qty: Decimal,
    avg_fill_price: Option<Decimal>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct PaperState {
    orders: HashMap<i64, PaperOrder>,
    /// (trade_id, leg) -> ib_order_id, for idempotent resubmission
    by_trade_leg: HashMap<(String, i64), i64>,
    bars: HashMap<String, Vec<HistoricalBar>>,
    contract_ids: HashMap<String, i64>,
    portfolio: Option<PortfolioSummary>,
    positions: Vec<PositionItem>,
}

pub struct PaperGateway {
    state: Mutex<PaperState>,
    next_order_id: AtomicI64,
    next_contract_id: AtomicI64,
    /// Fill market orders at the latest preloaded close on submission
    auto_fill: bool,
}

impl PaperGateway {
    pub fn new(auto_fill: bool) -> Self {
        info!(auto_fill, "paper gateway started");
        Self {
            state: Mutex::new(PaperState::default()),
            next_order_id: AtomicI64::new(1),
            next_contract_id: AtomicI64::new(1000),
            auto_fill,
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| SentraError::Internal("paper gateway state poisoned".to_string()))
    }

    fn bars_key(contract: &ContractRef, bar_size: &str) -> String {
        format!("{}|{}", contract.key(), bar_size.trim().to_lowercase())
    }

    /// Preload a bar series the simulated feed will serve.
    pub fn push_bars(&self, contract: &ContractRef, bar_size: &str, bars: Vec<HistoricalBar>) {
        if let Ok(mut state) = self.state.lock() {
            let series = state
                .bars
                .entry(Self::bars_key(contract, bar_size))
                .or_default();
            series.extend(bars);
            series.sort_by_key(|bar| bar.ts);
            series.dedup_by_key(|bar| bar.ts);
        }
    }

    fn latest_close(state: &PaperState, contract_key: &str) -> Option<f64> {
        state
            .bars
            .iter()
            .filter(|(key, _)| key.starts_with(contract_key))
            .flat_map(|(_, bars)| bars.iter())
            .max_by_key(|bar| bar.ts)
            .map(|bar| bar.close)
    }

    /// Drive a fill from the test harness / simulation loop.
    pub fn fill_order(&self, ib_order_id: i64, avg_price: Decimal) -> Result<()> {
        let mut state = self.lock_state()?;
        let order = state.orders.get_mut(&ib_order_id).ok_or_else(|| {
            SentraError::NotFound {
                resource: "paper order",
                id: ib_order_id.to_string(),
            }
        })?;
        order.raw_status = "Filled".to_string();
        order.filled_qty = order.payload.quantity;
        order.avg_fill_price = Some(avg_price);
        order.updated_at = Utc::now();
        Ok(())
    }

    /// Reject an open order from the simulation.
    pub fn reject_order(&self, ib_order_id: i64, reason: &str) -> Result<()> {
        let mut state = self.lock_state()?;
        let order = state.orders.get_mut(&ib_order_id).ok_or_else(|| {
            SentraError::NotFound {
                resource: "paper order",
                id: ib_order_id.to_string(),
            }
        })?;
        order.raw_status = "Inactive".to_string();
        order.error_message = Some(reason.to_string());
        order.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_portfolio(&self, portfolio: PortfolioSummary, positions: Vec<PositionItem>) {
        if let Ok(mut state) = self.state.lock() {
            state.portfolio = Some(portfolio);
            state.positions = positions;
        }
    }

    pub fn open_order_ids(&self) -> Vec<i64> {
        self.state
            .lock()
            .map(|state| {
                state
                    .orders
                    .iter()
                    .filter(|(_, order)| {
                        !matches!(order.raw_status.as_str(), "Filled" | "Cancelled" | "Inactive")
                    })
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn submitted_order_count(&self) -> usize {
        self.state.lock().map(|state| state.orders.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GatewayClient for PaperGateway {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_bars(
        &self,
        contract: &ContractRef,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        bar_size: &str,
        _what_to_show: &str,
        _use_rth: bool,
    ) -> Result<Vec<HistoricalBar>> {
        let state = self.lock_state()?;
        let bars = state
            .bars
            .get(&Self::bars_key(contract, bar_size))
            .map(|series| {
                series
                    .iter()
                    .filter(|bar| bar.ts >= start_time && bar.ts < end_time)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(bars)
    }

    async fn resolve_contract_id(&self, contract: &ContractRef) -> Result<i64> {
        let mut state = self.lock_state()?;
        let key = contract.key();
        if let Some(id) = state.contract_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.next_contract_id.fetch_add(1, Ordering::SeqCst);
        state.contract_ids.insert(key, id);
        Ok(id)
    }

    async fn submit_order(&self, payload: &OrderPayload) -> Result<OrderAck> {
        let mut state = self.lock_state()?;
        let trade_leg = (payload.trade_id.clone(), payload.leg);
        if let Some(existing_id) = state.by_trade_leg.get(&trade_leg) {
            let existing = state.orders.get(existing_id).ok_or_else(|| {
                SentraError::Internal("paper order index out of sync".to_string())
            })?;
            debug!(
                trade_id = %payload.trade_id,
                leg = payload.leg,
                ib_order_id = existing_id,
                "idempotent resubmission"
            );
            return Ok(OrderAck {
                ib_order_id: *existing_id,
                raw_status: existing.raw_status.clone(),
            });
        }

        let ib_order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let mut order = PaperOrder {
            payload: payload.clone(),
            raw_status: "Submitted".to_string(),
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            error_message: None,
            updated_at: Utc::now(),
        };
        if self.auto_fill {
            let fill_price = match (payload.order_type, payload.limit_price) {
                (OrderType::Limit, Some(price)) => Some(price),
                _ => Self::latest_close(&state, &ContractRef::new(&payload.market, &payload.symbol).key())
                    .and_then(Decimal::from_f64),
            };
            if let Some(price) = fill_price {
                order.raw_status = "Filled".to_string();
                order.filled_qty = payload.quantity;
                order.avg_fill_price = Some(price);
            }
        }
        state.orders.insert(ib_order_id, order);
        state.by_trade_leg.insert(trade_leg, ib_order_id);
        info!(
            trade_id = %payload.trade_id,
            leg = payload.leg,
            ib_order_id,
            symbol = %payload.symbol,
            "paper order accepted"
        );
        Ok(OrderAck {
            ib_order_id,
            raw_status: "Submitted".to_string(),
        })
    }

    async fn cancel_order(&self, ib_order_id: i64) -> Result<()> {
        let mut state = self.lock_state()?;
        let order = state.orders.get_mut(&ib_order_id).ok_or_else(|| {
            SentraError::NotFound {
                resource: "paper order",
                id: ib_order_id.to_string(),
            }
        })?;
        if order.raw_status != "Filled" {
            order.raw_status = "Cancelled".to_string();
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn order_status(&self, ib_order_id: i64) -> Result<Option<OrderStatusSnapshot>> {
        let state = self.lock_state()?;
        Ok(state.orders.get(&ib_order_id).map(|order| OrderStatusSnapshot {
            ib_order_id,
            raw_status: order.raw_status.clone(),
            filled_qty: order.filled_qty,
            remaining_qty: order.payload.quantity - order.filled_qty,
            avg_fill_price: order.avg_fill_price,
            error_message: order.error_message.clone(),
            updated_at: order.updated_at,
        }))
    }

    async fn account_snapshot(&self) -> Result<PortfolioSummary> {
        let state = self.lock_state()?;
        Ok(state.portfolio.clone().unwrap_or(PortfolioSummary {
            net_liquidation: Decimal::new(100_000, 0),
            available_funds: Decimal::new(100_000, 0),
            daily_pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        }))
    }

    async fn positions(&self) -> Result<Vec<PositionItem>> {
        let state = self.lock_state()?;
        Ok(state.positions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, SecType, TimeInForce};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn payload(trade_id: &str, leg: i64) -> OrderPayload {
        OrderPayload {
            trade_id: trade_id.to_string(),
            leg,
            market: "US_STOCK".to_string(),
            symbol: "SLV".to_string(),
            sec_type: SecType::Stk,
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(100),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            allow_overnight: false,
            contract_month: None,
        }
    }

    #[tokio::test]
    async fn test_submit_is_idempotent_per_trade_leg() {
        let gateway = PaperGateway::new(false);
        let first = gateway.submit_order(&payload("T-1", 0)).await.unwrap();
        let second = gateway.submit_order(&payload("T-1", 0)).await.unwrap();
        assert_eq!(first.ib_order_id, second.ib_order_id);
        assert_eq!(gateway.submitted_order_count(), 1);

        let other_leg = gateway.submit_order(&payload("T-1", 1)).await.unwrap();
        assert_ne!(first.ib_order_id, other_leg.ib_order_id);
    }

    #[tokio::test]
    async fn test_fill_and_status() {
        let gateway = PaperGateway::new(false);
        let ack = gateway.submit_order(&payload("T-2", 0)).await.unwrap();

        gateway.fill_order(ack.ib_order_id, dec!(59.5)).unwrap();
        let status = gateway.order_status(ack.ib_order_id).await.unwrap().unwrap();
        assert_eq!(status.raw_status, "Filled");
        assert_eq!(status.filled_qty, dec!(100));
        assert_eq!(status.remaining_qty, dec!(0));
        assert_eq!(status.avg_fill_price, Some(dec!(59.5)));
    }

    #[tokio::test]
    async fn test_cancel_after_fill_is_noop() {
        let gateway = PaperGateway::new(false);
        let ack = gateway.submit_order(&payload("T-3", 0)).await.unwrap();
        gateway.fill_order(ack.ib_order_id, dec!(60)).unwrap();
        gateway.cancel_order(ack.ib_order_id).await.unwrap();
        let status = gateway.order_status(ack.ib_order_id).await.unwrap().unwrap();
        assert_eq!(status.raw_status, "Filled");
    }

    #[tokio::test]
    async fn test_fetch_bars_windowing() {
        let gateway = PaperGateway::new(false);
        let contract = ContractRef::new("US_STOCK", "SLV");
        let t0 = Utc.with_ymd_and_hms(2026, 2, 20, 14, 0, 0).unwrap();
        let bars: Vec<HistoricalBar> = (0..10)
            .map(|i| HistoricalBar::new(t0 + Duration::minutes(i), 10.0, 11.0, 9.0, 10.0))
            .collect();
        gateway.push_bars(&contract, "1m", bars);

        let fetched = gateway
            .fetch_bars(
                &contract,
                t0 + Duration::minutes(2),
                t0 + Duration::minutes(5),
                "1m",
                "TRADES",
                true,
            )
            .await
            .unwrap();
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].ts, t0 + Duration::minutes(2));
    }

    #[tokio::test]
    async fn test_auto_fill_uses_latest_close() {
        let gateway = PaperGateway::new(true);
        let contract = ContractRef::new("US_STOCK", "SLV");
        let t0 = Utc.with_ymd_and_hms(2026, 2, 20, 14, 0, 0).unwrap();
        gateway.push_bars(
            &contract,
            "1m",
            vec![HistoricalBar::new(t0, 59.0, 59.4, 58.8, 59.2)],
        );

        let ack = gateway.submit_order(&payload("T-4", 0)).await.unwrap();
        let status = gateway.order_status(ack.ib_order_id).await.unwrap().unwrap();
        assert_eq!(status.raw_status, "Filled");
        assert_eq!(status.avg_fill_price, Some(dec!(59.2)));
    }
}
