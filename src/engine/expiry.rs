//! Expiry disposition (C9). A periodic sweep catches strategies whose
//! `expire_at` elapsed; leased runs also check at dispatch time. PAUSED
//! strategies keep accumulating elapsed time (`expire_at` is never frozen).

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::EngineContext;
use crate::domain::{OrderStatus, StrategyRecord, StrategyStatus};
use crate::error::Result;
use crate::gateway::with_timeout;
use crate::store::TransitionMutations;

pub struct ExpiryHandler;

impl ExpiryHandler {
    /// Sweep all non-terminal strategies; returns how many expired.
    pub async fn sweep(ctx: &EngineContext, now: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0;
        for record in ctx.store.list_expirable().await? {
            if Self::handle_expiry(ctx, &record, now).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Apply the expiry disposition for one strategy. Returns true when the
    /// strategy transitioned to EXPIRED.
    pub async fn handle_expiry(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(expire_at) = record.effective_expire_at() else {
            return Ok(false);
        };
        if now < expire_at {
            return Ok(false);
        }

        if record.status.is_expirable() {
            let result = ctx
                .store
                .transition(
                    &record.id,
                    record.status,
                    StrategyStatus::Expired,
                    None,
                    TransitionMutations::default(),
                    Some(("EXPIRED", "expiry reached; strategy retired")),
                )
                .await;
            return match result {
                Ok(_) => {
                    info!(strategy_id = %record.id, %expire_at, "strategy expired");
                    Ok(true)
                }
                // Lost the race against a worker: the next sweep re-checks.
                Err(err) if matches!(err, crate::error::SentraError::InvalidTransition { .. }) => {
                    Ok(false)
                }
                Err(err) => Err(err),
            };
        }

        if record.status == StrategyStatus::OrderSubmitted {
            let cancel_on_expiry = record
                .trade_action
                .as_ref()
                .map(|action| action.cancel_on_expiry())
                .unwrap_or(false);
            if !cancel_on_expiry {
                // Keep tracking the live order past expiry.
                return Ok(false);
            }
            Self::request_order_cancel(ctx, record).await?;
        }
        Ok(false)
    }

    /// Ask the gateway to cancel every live leg. The order-status handler
    /// settles the strategy on the gateway's reply; a fill that races the
    /// cancel wins.
    async fn request_order_cancel(ctx: &EngineContext, record: &StrategyRecord) -> Result<()> {
        let Some(instruction) = ctx
            .store
            .latest_instruction_for_strategy(&record.id)
            .await?
        else {
            return Ok(());
        };
        let orders = ctx.store.orders_for_trade(&instruction.trade_id).await?;
        let mut requested = false;
        for order in &orders {
            if order.status.is_terminal() {
                continue;
            }
            let Some(ib_order_id) = order.ib_order_id else {
                continue;
            };
            match with_timeout(ctx.gateway_timeout(), ctx.gateway.cancel_order(ib_order_id)).await
            {
                Ok(()) => requested = true,
                Err(err) => {
                    warn!(
                        strategy_id = %record.id,
                        ib_order_id,
                        error = %err,
                        "expiry cancel request failed"
                    );
                }
            }
        }
        if requested {
            ctx.store
                .append_event(
                    &record.id,
                    "EXPIRY_CANCEL_REQUESTED",
                    &format!(
                        "expiry reached with live order {}; cancel requested",
                        instruction.trade_id
                    ),
                )
                .await?;
            ctx.store
                .update_instruction_status(
                    &instruction.trade_id,
                    &record.id,
                    OrderStatus::OrderSubmitted.as_str(),
                    "expiry cancel requested",
                )
                .await?;
        }
        Ok(())
    }
}
