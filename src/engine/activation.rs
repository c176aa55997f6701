//! Activation preflight (VERIFYING handler) and the chain activator (C6).
//!
//! Manual activation and chain activation converge here: both leave the
//! strategy in VERIFYING, and the next scheduled run resolves contracts,
//! snapshots the anchor, seeds since-activation extrema (back-filling any
//! chain gap) and commits VERIFYING -> ACTIVE.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::EngineContext;
use crate::domain::{resolve_market_profile, ExpireMode, StrategyRecord, StrategyStatus};
use crate::error::{Result, SentraError};
use crate::gateway::with_timeout;
use crate::marketdata::{ContractRef, HistoricalBarsRequest};
use crate::store::{
    TransitionMutations, STATE_SINCE_ACTIVATION_HIGH, STATE_SINCE_ACTIVATION_LOW,
};

pub struct ActivationHandler;

/// Outcome of attempting to chain-activate a downstream strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainActivation {
    Activated,
    /// The (trigger_event_id, downstream) row already exists
    AlreadyActivated,
    /// Downstream missing or not in PENDING_ACTIVATION
    Skipped,
}

impl ActivationHandler {
    /// Activation preflight for a leased VERIFYING strategy.
    pub async fn handle_verifying(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let strategy_id = record.id.as_str();
        // Monitoring bookkeeping from a previous life is stale now.
        ctx.store.delete_strategy_run(strategy_id).await?;

        match Self::run_preflight(ctx, record, now).await {
            Ok(outcome) => {
                let activated_at = record.activated_at.unwrap_or(now);
                let logical_activated_at = record.logical_activated_at.unwrap_or(activated_at);
                let expire_at = match record.expire_mode {
                    ExpireMode::Absolute => record.expire_at,
                    ExpireMode::Relative => record
                        .expire_in_seconds
                        .map(|seconds| activated_at + Duration::seconds(seconds)),
                };

                let anchor_price = record.anchor_price.or(outcome.anchor_price);
                if let Some((high, low)) = outcome.extrema {
                    ctx.store
                        .set_runtime_state_f64(strategy_id, STATE_SINCE_ACTIVATION_HIGH, high)
                        .await?;
                    ctx.store
                        .set_runtime_state_f64(strategy_id, STATE_SINCE_ACTIVATION_LOW, low)
                        .await?;
                }

                ctx.store
                    .transition(
                        strategy_id,
                        StrategyStatus::Verifying,
                        StrategyStatus::Active,
                        Some(record.version),
                        TransitionMutations {
                            activated_at: Some(activated_at),
                            logical_activated_at: Some(logical_activated_at),
                            expire_at,
                            anchor_price,
                            conditions_json: outcome.enriched_conditions_json,
                            ..Default::default()
                        },
                        Some((
                            "ACTIVATED",
                            &format!(
                                "activation preflight passed (resolved_contracts={})",
                                outcome.resolved_contracts
                            ),
                        )),
                    )
                    .await?;
                info!(strategy_id, "strategy activated");
            }
            Err(err) => {
                warn!(strategy_id, error = %err, "activation preflight failed");
                ctx.store
                    .transition(
                        strategy_id,
                        StrategyStatus::Verifying,
                        StrategyStatus::VerifyFailed,
                        Some(record.version),
                        TransitionMutations::default(),
                        Some(("VERIFY_FAILED", &err.to_string())),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Chain activation on an upstream trigger: write the
    /// `(trigger_event_id, downstream)` row and move the downstream into
    /// VERIFYING atomically. `logical_activated_at` is pinned to the
    /// upstream trigger instant; the anchor snapshot is taken from the
    /// latest basis available right now.
    pub async fn activate_downstream(
        ctx: &EngineContext,
        upstream: &StrategyRecord,
        trigger_event_id: &str,
        triggered_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChainActivation> {
        let Some(downstream_id) = upstream.next_strategy_id.as_deref() else {
            return Ok(ChainActivation::Skipped);
        };

        let Some(downstream) = ctx.store.get_strategy_opt(downstream_id).await? else {
            ctx.store
                .append_event(
                    &upstream.id,
                    "DOWNSTREAM_SKIPPED",
                    &format!("downstream {downstream_id} not found"),
                )
                .await?;
            return Ok(ChainActivation::Skipped);
        };
        if downstream.status != StrategyStatus::PendingActivation {
            ctx.store
                .append_event(
                    &upstream.id,
                    "DOWNSTREAM_SKIPPED",
                    &format!(
                        "downstream {downstream_id} not activatable (status={})",
                        downstream.status
                    ),
                )
                .await?;
            return Ok(ChainActivation::Skipped);
        }

        // Anchor snapshot from the freshest bar we can see at the trigger.
        let anchor = Self::latest_close(ctx, &downstream, now).await;
        let market_snapshot = anchor.map(|(price, ts)| {
            serde_json::json!({
                "anchor_price": price,
                "observed_at": ts,
                "trigger_event_id": trigger_event_id,
            })
        });
        let context = serde_json::json!({
            "upstream_strategy_id": upstream.id,
            "upstream_triggered_at": triggered_at,
        });

        let activated = ctx
            .store
            .chain_activate(
                &upstream.id,
                &downstream.id,
                trigger_event_id,
                triggered_at,
                anchor.map(|(price, _)| price),
                market_snapshot.as_ref(),
                Some(&context),
                now,
            )
            .await?;
        match activated {
            true => {
                ctx.store
                    .append_event(
                        &upstream.id,
                        "DOWNSTREAM_ACTIVATED",
                        &format!("downstream {} activated", downstream.id),
                    )
                    .await?;
                info!(
                    upstream = %upstream.id,
                    downstream = %downstream.id,
                    trigger_event_id,
                    "downstream chain-activated"
                );
                Ok(ChainActivation::Activated)
            }
            false => Ok(ChainActivation::AlreadyActivated),
        }
    }

    async fn run_preflight(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<PreflightOutcome> {
        let strategy_id = record.id.as_str();
        let profile = resolve_market_profile(&record.market, Some(record.trade_type))?;
        if record.symbols.is_empty() {
            return Err(SentraError::Validation("symbols not configured".to_string()));
        }

        let timeout = ctx.gateway_timeout();
        with_timeout(timeout, ctx.gateway.account_snapshot())
            .await
            .map_err(|err| {
                SentraError::GatewayUnavailable(format!("account snapshot failed: {err}"))
            })?;

        // Resolve missing contract ids and write them back on the symbols.
        let mut resolved_contracts = 0usize;
        let mut contract_by_code: std::collections::HashMap<String, i64> =
            std::collections::HashMap::new();
        for symbol in &record.symbols {
            let contract_id = match symbol.contract_id {
                Some(id) if id > 0 => id,
                _ => {
                    let contract = ContractRef::new(profile.market, &symbol.code);
                    let id = with_timeout(timeout, ctx.gateway.resolve_contract_id(&contract))
                        .await?;
                    if id <= 0 {
                        return Err(SentraError::Validation(format!(
                            "resolve_contract_id returned invalid id for {}",
                            symbol.code
                        )));
                    }
                    ctx.store
                        .set_symbol_contract_id(strategy_id, &symbol.code, id)
                        .await?;
                    resolved_contracts += 1;
                    id
                }
            };
            if let Some(previous) = contract_by_code.insert(symbol.code.clone(), contract_id) {
                if previous != contract_id {
                    return Err(SentraError::Validation(format!(
                        "symbols carry conflicting contract ids for {}",
                        symbol.code
                    )));
                }
            }
        }

        // Enrich conditions with their contract ids.
        let mut conditions = record.conditions.clone();
        let mut updated_fields = 0usize;
        for condition in &mut conditions {
            let product = condition.normalized_product().ok_or_else(|| {
                SentraError::Validation("condition missing product".to_string())
            })?;
            let contract_id = *contract_by_code.get(&product).ok_or_else(|| {
                SentraError::Validation(format!("product {product} not found in symbols"))
            })?;
            if condition.contract_id != Some(contract_id) {
                condition.contract_id = Some(contract_id);
                updated_fields += 1;
            }
            if condition.metric.requires_pair() {
                let product_b = condition.normalized_product_b().ok_or_else(|| {
                    SentraError::Validation("condition missing product_b".to_string())
                })?;
                let contract_id_b = *contract_by_code.get(&product_b).ok_or_else(|| {
                    SentraError::Validation(format!("product {product_b} not found in symbols"))
                })?;
                if condition.contract_id_b != Some(contract_id_b) {
                    condition.contract_id_b = Some(contract_id_b);
                    updated_fields += 1;
                }
            } else {
                condition.contract_id_b = None;
            }
        }
        let enriched_conditions_json = if updated_fields > 0 {
            Some(serde_json::to_string(&conditions)?)
        } else {
            None
        };

        // Seed extrema from the logical activation instant forward. For a
        // chain-delayed activation this replays the gap the downstream
        // missed while the upstream was still monitoring.
        let logical_activated_at = record
            .logical_activated_at
            .or(record.activated_at)
            .unwrap_or(now);
        let extrema_product = conditions
            .iter()
            .find(|c| c.metric.requires_extrema())
            .and_then(|c| c.normalized_product());
        let mut extrema = None;
        let mut anchor_price = None;
        if let Some(product) = &extrema_product {
            let contract = ContractRef::new(profile.market, product);
            let start = logical_activated_at.min(now - Duration::minutes(5));
            let request = HistoricalBarsRequest {
                contract,
                start_time: start,
                end_time: now,
                bar_size: "1m".to_string(),
                what_to_show: "TRADES".to_string(),
                use_rth: true,
                include_partial_bar: true,
                max_bars: None,
                page_size: Some(500),
            };
            if let Ok(result) = ctx.cache.get_historical_bars(&request).await {
                let in_window: Vec<_> = result
                    .bars
                    .iter()
                    .filter(|bar| bar.ts >= logical_activated_at)
                    .collect();
                let high = in_window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                let low = in_window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                if !in_window.is_empty() {
                    extrema = Some((high, low));
                }
                anchor_price = result.bars.last().map(|bar| bar.close);
            }
        } else if let Some(symbol) = record.symbols.first() {
            // No extrema metric: still snapshot an anchor for projections.
            let contract = ContractRef::new(profile.market, &symbol.code);
            let request = HistoricalBarsRequest {
                contract,
                start_time: now - Duration::minutes(5),
                end_time: now,
                bar_size: "1m".to_string(),
                what_to_show: "TRADES".to_string(),
                use_rth: true,
                include_partial_bar: true,
                max_bars: None,
                page_size: Some(500),
            };
            if let Ok(result) = ctx.cache.get_historical_bars(&request).await {
                anchor_price = result.bars.last().map(|bar| bar.close);
            }
        }
        // Fall back to the anchor so drawdown/rally start from a defined
        // baseline even when the gap had no bars.
        if extrema.is_none() && extrema_product.is_some() {
            if let Some(price) = anchor_price {
                extrema = Some((price, price));
            }
        }

        Ok(PreflightOutcome {
            resolved_contracts,
            enriched_conditions_json,
            anchor_price,
            extrema,
        })
    }

    async fn latest_close(
        ctx: &EngineContext,
        downstream: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Option<(f64, DateTime<Utc>)> {
        let symbol = downstream.symbols.first()?;
        let request = HistoricalBarsRequest {
            contract: ContractRef::new(&downstream.market, &symbol.code),
            start_time: now - Duration::minutes(5),
            end_time: now,
            bar_size: "1m".to_string(),
            what_to_show: "TRADES".to_string(),
            use_rth: true,
            include_partial_bar: true,
            max_bars: None,
            page_size: Some(500),
        };
        let result = ctx.cache.get_historical_bars(&request).await.ok()?;
        result.bars.last().map(|bar| (bar.close, bar.ts))
    }
}

struct PreflightOutcome {
    resolved_contracts: usize,
    enriched_conditions_json: Option<String>,
    anchor_price: Option<f64>,
    extrema: Option<(f64, f64)>,
}
