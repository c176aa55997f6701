//! Order submission and fill tracking (C8). A strategy yields at most one
//! order across its lifetime: the `TRIGGERED -> ORDER_SUBMITTED` transition
//! commits atomically with the order rows, and a re-triggered evaluator
//! finds the strategy already out of ACTIVE.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::activation::ActivationHandler;
use super::verifier::PreTradeVerifier;
use super::EngineContext;
use crate::domain::{
    normalize_order_status, resolve_market_profile, OrderSide, OrderStatus, StrategyRecord,
    StrategyStatus, TradeAction,
};
use crate::error::{Result, SentraError};
use crate::gateway::{with_timeout, OrderPayload};
use crate::marketdata::{ContractRef, HistoricalBarsRequest};
use crate::store::{
    NewOrderLeg, TransitionMutations, STATE_ROLLED_AT, STATE_TRIGGERED_AT, STATE_TRIGGER_EVENT_ID,
};

const SUBMIT_MAX_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF_MS: u64 = 500;

pub struct OrderSubmitter;

impl OrderSubmitter {
    /// TRIGGERED handler: chain activation, verification, then submission.
    pub async fn handle_triggered(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let strategy_id = record.id.as_str();

        let trigger_event_id = match ctx
            .store
            .get_runtime_state(strategy_id, STATE_TRIGGER_EVENT_ID)
            .await?
        {
            Some(id) => id,
            None => {
                // Recovered TRIGGERED row without a recorded identity;
                // mint one so chain activation stays de-duplicated.
                let id = Uuid::new_v4().to_string();
                ctx.store
                    .set_runtime_state(strategy_id, STATE_TRIGGER_EVENT_ID, Some(&id))
                    .await?;
                id
            }
        };
        let triggered_at = ctx
            .store
            .get_runtime_state(strategy_id, STATE_TRIGGERED_AT)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(now);

        ActivationHandler::activate_downstream(ctx, record, &trigger_event_id, triggered_at, now)
            .await?;

        let Some(action) = record.trade_action.clone() else {
            if record.next_strategy_id.is_some() {
                ctx.store
                    .transition(
                        strategy_id,
                        StrategyStatus::Triggered,
                        StrategyStatus::Filled,
                        Some(record.version),
                        TransitionMutations::default(),
                        Some(("FILLED", "no trade action; chain gate complete")),
                    )
                    .await?;
            } else {
                ctx.store
                    .transition(
                        strategy_id,
                        StrategyStatus::Triggered,
                        StrategyStatus::Failed,
                        Some(record.version),
                        TransitionMutations::default(),
                        Some(("FAILED", "triggered with neither trade action nor next strategy")),
                    )
                    .await?;
            }
            return Ok(());
        };

        if !ctx.store.orders_for_strategy(strategy_id).await?.is_empty() {
            warn!(strategy_id, "orders already exist; refusing a second submission");
            return Ok(());
        }

        let trade_id = format!("T-{}", &Uuid::new_v4().simple().to_string()[..10].to_uppercase());
        let price_proxy = Self::price_proxy(ctx, record, &action, now).await;
        let verification =
            PreTradeVerifier::verify(ctx, record, &action, &trade_id, price_proxy, now).await?;
        if !verification.passed {
            let reason = verification
                .failed_reason
                .unwrap_or_else(|| "verification failed".to_string());
            ctx.store
                .insert_trade_log(
                    strategy_id,
                    &trade_id,
                    "VERIFICATION",
                    "FAILED",
                    &reason,
                )
                .await?;
            ctx.store
                .transition(
                    strategy_id,
                    StrategyStatus::Triggered,
                    StrategyStatus::Failed,
                    Some(record.version),
                    TransitionMutations::default(),
                    Some(("FAILED", &format!("pre-trade verification failed: {reason}"))),
                )
                .await?;
            return Ok(());
        }
        ctx.store
            .insert_trade_log(
                strategy_id,
                &trade_id,
                "VERIFICATION",
                "PASSED",
                "all verification rules passed",
            )
            .await?;

        let first_payload = Self::build_payload(record, &action, &trade_id, 0)?;
        let summary = action.instruction_summary();
        ctx.store
            .begin_order_submission(
                strategy_id,
                record.version,
                &trade_id,
                &summary,
                record.effective_expire_at(),
                NewOrderLeg {
                    leg: 0,
                    qty: first_payload.quantity,
                    payload: serde_json::to_value(&first_payload)?,
                },
            )
            .await?;

        match Self::submit_with_retry(ctx, &first_payload).await {
            Ok(ib_order_id) => {
                ctx.store.attach_ib_order_id(&trade_id, 0, ib_order_id).await?;
                info!(strategy_id, trade_id = %trade_id, ib_order_id, "order submitted to gateway");
            }
            Err(err) => {
                error!(strategy_id, trade_id = %trade_id, error = %err, "order submission failed");
                ctx.store
                    .update_order_status(&trade_id, 0, OrderStatus::Failed, Decimal::ZERO, None)
                    .await?;
                ctx.store
                    .settle_order_terminal(
                        strategy_id,
                        &trade_id,
                        OrderStatus::Failed,
                        StrategyStatus::Failed,
                        &format!("gateway submission failed: {err}"),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// ORDER_SUBMITTED handler: poll gateway status, persist updates, drive
    /// the roll's second leg, and close out on terminal states.
    pub async fn handle_order_submitted(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let strategy_id = record.id.as_str();
        let Some(instruction) = ctx.store.latest_instruction_for_strategy(strategy_id).await?
        else {
            warn!(strategy_id, "ORDER_SUBMITTED without a trade instruction");
            return Ok(());
        };
        let trade_id = instruction.trade_id.clone();
        let mut orders = ctx.store.orders_for_trade(&trade_id).await?;

        for order in &mut orders {
            if order.status.is_terminal() {
                continue;
            }
            let Some(ib_order_id) = order.ib_order_id else {
                continue;
            };
            let snapshot = with_timeout(
                ctx.gateway_timeout(),
                ctx.gateway.order_status(ib_order_id),
            )
            .await;
            let snapshot = match snapshot {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) if err.is_retriable() => {
                    warn!(strategy_id, ib_order_id, error = %err, "order status poll failed");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let status = normalize_order_status(
                &snapshot.raw_status,
                snapshot.filled_qty,
                snapshot.remaining_qty,
            );
            if status != order.status || snapshot.filled_qty != order.filled_qty {
                ctx.store
                    .update_order_status(
                        &trade_id,
                        order.leg,
                        status,
                        snapshot.filled_qty,
                        snapshot.avg_fill_price,
                    )
                    .await?;
                order.status = status;
                order.filled_qty = snapshot.filled_qty;
                order.avg_fill_price = snapshot.avg_fill_price;
            }
        }

        let is_roll = matches!(record.trade_action, Some(TradeAction::FutRoll { .. }));
        if is_roll {
            Self::advance_roll(ctx, record, &trade_id, &orders, now).await?;
            // Re-read: the roll may have appended its open leg.
            orders = ctx.store.orders_for_trade(&trade_id).await?;
        }

        let expected_legs = if is_roll { 2 } else { 1 };
        let any_failed = orders.iter().any(|o| o.status == OrderStatus::Failed);
        let any_cancelled = orders.iter().any(|o| o.status == OrderStatus::Cancelled);
        let all_filled = orders.len() >= expected_legs
            && orders.iter().all(|o| o.status == OrderStatus::Filled);

        if any_failed {
            let naked = is_roll
                && orders
                    .iter()
                    .any(|o| o.leg == 0 && o.status == OrderStatus::Filled);
            if naked {
                ctx.store
                    .append_event(
                        strategy_id,
                        "NAKED_RISK_ALERT",
                        "roll open leg failed after close leg filled; position left uncovered",
                    )
                    .await?;
            }
            ctx.store
                .settle_order_terminal(
                    strategy_id,
                    &trade_id,
                    OrderStatus::Failed,
                    StrategyStatus::Failed,
                    "gateway reported order failure",
                )
                .await?;
        } else if all_filled {
            ctx.store
                .settle_order_terminal(
                    strategy_id,
                    &trade_id,
                    OrderStatus::Filled,
                    StrategyStatus::Filled,
                    "gateway reported fill",
                )
                .await?;
        } else if any_cancelled && !orders.iter().any(|o| !o.status.is_terminal()) {
            ctx.store
                .settle_order_terminal(
                    strategy_id,
                    &trade_id,
                    OrderStatus::Cancelled,
                    StrategyStatus::Cancelled,
                    "gateway reported cancel",
                )
                .await?;
        }
        Ok(())
    }

    /// Close-then-open roll: submit the far leg once the near leg filled,
    /// exactly once (`rolled_at` one-shot flag).
    async fn advance_roll(
        ctx: &EngineContext,
        record: &StrategyRecord,
        trade_id: &str,
        orders: &[crate::domain::OrderRecord],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let strategy_id = record.id.as_str();
        let close_filled = orders
            .iter()
            .any(|o| o.leg == 0 && o.status == OrderStatus::Filled);
        let open_exists = orders.iter().any(|o| o.leg == 1);
        if !close_filled || open_exists {
            return Ok(());
        }
        if ctx
            .store
            .get_runtime_state(strategy_id, STATE_ROLLED_AT)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let Some(action) = record.trade_action.as_ref() else {
            return Ok(());
        };

        let open_payload = Self::build_payload(record, action, trade_id, 1)?;
        ctx.store
            .insert_order_leg(
                trade_id,
                strategy_id,
                NewOrderLeg {
                    leg: 1,
                    qty: open_payload.quantity,
                    payload: serde_json::to_value(&open_payload)?,
                },
            )
            .await?;
        ctx.store
            .set_runtime_state(strategy_id, STATE_ROLLED_AT, Some(&now.to_rfc3339()))
            .await?;

        match Self::submit_with_retry(ctx, &open_payload).await {
            Ok(ib_order_id) => {
                ctx.store.attach_ib_order_id(trade_id, 1, ib_order_id).await?;
                ctx.store
                    .append_event(
                        strategy_id,
                        "ROLL_OPEN_SUBMITTED",
                        &format!("roll open leg submitted (trade {trade_id})"),
                    )
                    .await?;
            }
            Err(err) => {
                error!(strategy_id, trade_id, error = %err, "roll open leg submission failed");
                ctx.store
                    .update_order_status(trade_id, 1, OrderStatus::Failed, Decimal::ZERO, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Gateway submission with bounded backoff on transient errors. The
    /// payload's (trade_id, leg) keeps retries idempotent on the gateway.
    async fn submit_with_retry(ctx: &EngineContext, payload: &OrderPayload) -> Result<i64> {
        let mut last_error = None;
        for attempt in 0..SUBMIT_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    SUBMIT_BACKOFF_MS << (attempt - 1),
                ))
                .await;
            }
            match with_timeout(ctx.gateway_timeout(), ctx.gateway.submit_order(payload)).await {
                Ok(ack) => return Ok(ack.ib_order_id),
                Err(err) if err.is_retriable() => {
                    warn!(
                        trade_id = %payload.trade_id,
                        leg = payload.leg,
                        attempt,
                        error = %err,
                        "transient gateway error on submit"
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| SentraError::OrderSubmission("submission retries exhausted".to_string())))
    }

    /// Build the gateway payload for one leg of the action.
    fn build_payload(
        record: &StrategyRecord,
        action: &TradeAction,
        trade_id: &str,
        leg: i64,
    ) -> Result<OrderPayload> {
        let profile = resolve_market_profile(&record.market, Some(record.trade_type))?;
        let base = |symbol: &str, side: OrderSide, quantity: Decimal, contract_month: Option<String>| {
            OrderPayload {
                trade_id: trade_id.to_string(),
                leg,
                market: profile.market.to_string(),
                symbol: symbol.to_string(),
                sec_type: profile.sec_type,
                exchange: profile.exchange.to_string(),
                currency: profile.currency.to_string(),
                side,
                quantity,
                order_type: action.order_type(),
                limit_price: action.limit_price(),
                tif: Default::default(),
                allow_overnight: false,
                contract_month,
            }
        };
        match action {
            TradeAction::StockTrade {
                symbol,
                side,
                quantity,
                allow_overnight,
                ..
            } => {
                let mut payload = base(symbol, *side, *quantity, None);
                payload.allow_overnight = *allow_overnight;
                Ok(payload)
            }
            TradeAction::FutPosition {
                symbol,
                side,
                quantity,
                contract,
                allow_overnight,
                ..
            } => {
                let mut payload = base(symbol, *side, *quantity, contract.clone());
                payload.allow_overnight = *allow_overnight;
                Ok(payload)
            }
            TradeAction::FutRoll {
                symbol,
                near_contract,
                far_contract,
                quantity,
                ..
            } => {
                // Close the near long first, then open the far for the same
                // quantity. Total quantity is preserved across legs.
                let (side, contract_month) = if leg == 0 {
                    (OrderSide::Sell, near_contract.clone())
                } else {
                    (OrderSide::Buy, far_contract.clone())
                };
                Ok(base(symbol, side, *quantity, Some(contract_month)))
            }
        }
    }

    /// Price proxy for notional checks: limit price, else the anchor, else
    /// the freshest cached close.
    async fn price_proxy(
        ctx: &EngineContext,
        record: &StrategyRecord,
        action: &TradeAction,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        if let Some(limit) = action.limit_price() {
            return Some(limit);
        }
        if let Some(anchor) = record.anchor_price {
            return Decimal::from_f64(anchor);
        }
        let request = HistoricalBarsRequest {
            contract: ContractRef::new(&record.market, action.symbol()),
            start_time: now - Duration::minutes(10),
            end_time: now,
            bar_size: "1m".to_string(),
            what_to_show: "TRADES".to_string(),
            use_rth: true,
            include_partial_bar: true,
            max_bars: None,
            page_size: Some(500),
        };
        let result = ctx.cache.get_historical_bars(&request).await.ok()?;
        result.bars.last().and_then(|bar| Decimal::from_f64(bar.close))
    }
}
