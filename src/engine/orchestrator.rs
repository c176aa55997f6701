//! Trigger orchestrator (C5): drives one monitoring run for an ACTIVE
//! strategy. Gathers per-condition inputs through the window cache, keeps
//! since-activation extrema current, combines condition outcomes under
//! AND/OR with short-circuiting, and performs the guarded
//! `ACTIVE -> TRIGGERED` transition when the combination holds.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::evaluator::{self, PreparedCondition};
use super::EngineContext;
use crate::domain::{ConditionLogic, ConditionState, StrategyRecord, StrategyStatus};
use crate::error::Result;
use crate::marketdata::{bar_size_to_duration, latest_closed_bar_end, ContractRef, HistoricalBarsRequest};
use crate::rules::RulesConfig;
use crate::store::{
    ConditionRuntimeItem, MonitoringEndMap, StrategyRun, TransitionMutations,
    STATE_LAST_EVALUATION_OUTCOME, STATE_SINCE_ACTIVATION_HIGH, STATE_SINCE_ACTIVATION_LOW,
    STATE_THROTTLE_GATEWAY_UNAVAILABLE, STATE_THROTTLE_WAITING_FOR_DATA, STATE_TRIGGERED_AT,
    STATE_TRIGGER_EVENT_ID,
};

/// Outcome of one monitoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Evaluated,
    WaitingForMarketData,
    NoNewData,
    NoConditionsConfigured,
    ConditionConfigInvalid,
    GatewayUnavailable,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Evaluated => "evaluated",
            RunOutcome::WaitingForMarketData => "waiting_for_market_data",
            RunOutcome::NoNewData => "no_new_data",
            RunOutcome::NoConditionsConfigured => "no_conditions_configured",
            RunOutcome::ConditionConfigInvalid => "condition_config_invalid",
            RunOutcome::GatewayUnavailable => "gateway_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionOutcome {
    True,
    False,
    Waiting,
    NoNewData,
}

#[derive(Debug)]
struct EvaluationRun {
    outcome: RunOutcome,
    condition_met: bool,
    decision_reason: &'static str,
    condition_states: Vec<ConditionRuntimeItem>,
    monitoring_end: MonitoringEndMap,
    suggested_next_monitor_at: Option<DateTime<Utc>>,
    invalid_detail: Option<String>,
    evaluated_any: bool,
}

pub struct TriggerOrchestrator;

impl TriggerOrchestrator {
    /// One full monitoring run for an ACTIVE, leased strategy.
    pub async fn run_active(
        ctx: &EngineContext,
        record: &StrategyRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let strategy_id = record.id.as_str();

        // Extrema and watermarks hang off the logical activation instant.
        let Some(logical_activated_at) = record.logical_activated_at else {
            ctx.store
                .transition(
                    strategy_id,
                    StrategyStatus::Active,
                    StrategyStatus::Failed,
                    Some(record.version),
                    TransitionMutations::default(),
                    Some(("FAILED", "active run failed: missing_activation_time")),
                )
                .await?;
            return Ok(());
        };

        let previous_run = ctx.store.get_strategy_run(strategy_id).await?;
        if Self::should_skip_cycle(ctx, now, previous_run.as_ref()) {
            debug!(strategy_id, "skip monitoring cycle until suggested_next_monitor_at");
            return Ok(());
        }

        if record.conditions.is_empty() {
            // Nothing to monitor: the activation gate should have caught it.
            ctx.store
                .transition(
                    strategy_id,
                    StrategyStatus::Active,
                    StrategyStatus::Failed,
                    Some(record.version),
                    TransitionMutations::default(),
                    Some(("FAILED", "active run failed: no_conditions_configured")),
                )
                .await?;
            return Ok(());
        }

        let previous_outcome = ctx
            .store
            .get_runtime_state(strategy_id, STATE_LAST_EVALUATION_OUTCOME)
            .await?;

        if !ctx.gateway_available().await {
            for condition in &record.conditions {
                if let Some(condition_id) = condition.condition_id.as_deref() {
                    ctx.store
                        .upsert_condition_state(
                            strategy_id,
                            &ConditionRuntimeItem {
                                condition_id: condition_id.to_string(),
                                state: ConditionState::NotEvaluated,
                                last_value: None,
                                last_evaluated_at: Some(now),
                            },
                        )
                        .await?;
                }
            }
            Self::record_outcome(ctx, strategy_id, RunOutcome::GatewayUnavailable, now).await?;
            Self::emit_throttled(
                ctx,
                strategy_id,
                previous_outcome.as_deref(),
                RunOutcome::GatewayUnavailable,
                STATE_THROTTLE_GATEWAY_UNAVAILABLE,
                ctx.config.worker.gateway_unavailable_event_throttle_seconds,
                "GATEWAY_UNAVAILABLE",
                "gateway unreachable, skipping evaluation cycle",
                now,
            )
            .await?;
            return Ok(());
        }

        let rules = ctx.rules_snapshot();
        let watermarks = previous_run
            .map(|run| run.last_monitoring_data_end_at)
            .unwrap_or_default();
        let run = Self::evaluate_conditions(
            ctx,
            record,
            &rules,
            &watermarks,
            logical_activated_at,
            now,
        )
        .await?;

        info!(
            strategy_id,
            outcome = run.outcome.as_str(),
            condition_met = run.condition_met,
            decision_reason = run.decision_reason,
            conditions = run.condition_states.len(),
            "strategy evaluated"
        );

        for state in &run.condition_states {
            ctx.store.upsert_condition_state(strategy_id, state).await?;
        }
        ctx.store
            .upsert_strategy_run(&StrategyRun {
                strategy_id: strategy_id.to_string(),
                first_evaluated_at: run.evaluated_any.then_some(now),
                evaluated_at: run.evaluated_any.then_some(now),
                last_monitoring_data_end_at: run.monitoring_end.clone(),
                suggested_next_monitor_at: run.suggested_next_monitor_at,
                condition_met: run.condition_met,
                decision_reason: Some(run.decision_reason.to_string()),
                last_outcome: Some(run.outcome.as_str().to_string()),
                run_count: 1,
                metrics: Some(serde_json::json!({
                    "condition_logic": record.condition_logic.as_str(),
                    "conditions": run.condition_states.len(),
                    "outcome": run.outcome.as_str(),
                })),
                updated_at: now,
            })
            .await?;
        Self::record_outcome(ctx, strategy_id, run.outcome, now).await?;

        match run.outcome {
            RunOutcome::ConditionConfigInvalid => {
                let detail = match &run.invalid_detail {
                    Some(detail) => format!("active run failed: condition_config_invalid: {detail}"),
                    None => "active run failed: condition_config_invalid".to_string(),
                };
                ctx.store
                    .transition(
                        strategy_id,
                        StrategyStatus::Active,
                        StrategyStatus::Failed,
                        Some(record.version),
                        TransitionMutations::default(),
                        Some(("FAILED", &detail)),
                    )
                    .await?;
                return Ok(());
            }
            RunOutcome::WaitingForMarketData => {
                Self::emit_throttled(
                    ctx,
                    strategy_id,
                    previous_outcome.as_deref(),
                    RunOutcome::WaitingForMarketData,
                    STATE_THROTTLE_WAITING_FOR_DATA,
                    ctx.config
                        .worker
                        .waiting_for_market_data_event_throttle_seconds,
                    "WAITING_FOR_MARKET_DATA",
                    "market data not ready, skipping evaluation cycle",
                    now,
                )
                .await?;
                return Ok(());
            }
            RunOutcome::Evaluated if run.condition_met => {}
            _ => return Ok(()),
        }

        // Combined TRUE: mint the trigger identity, then take the guarded
        // transition. WAITING never reaches this point.
        let trigger_event_id = Uuid::new_v4().to_string();
        ctx.store
            .set_runtime_state(strategy_id, STATE_TRIGGER_EVENT_ID, Some(&trigger_event_id))
            .await?;
        ctx.store
            .set_runtime_state(strategy_id, STATE_TRIGGERED_AT, Some(&now.to_rfc3339()))
            .await?;
        ctx.store
            .transition(
                strategy_id,
                StrategyStatus::Active,
                StrategyStatus::Triggered,
                Some(record.version),
                TransitionMutations::default(),
                Some(("TRIGGERED", run.decision_reason)),
            )
            .await?;
        info!(strategy_id, trigger_event_id = %trigger_event_id, "strategy triggered");
        Ok(())
    }

    fn should_skip_cycle(
        ctx: &EngineContext,
        now: DateTime<Utc>,
        previous_run: Option<&StrategyRun>,
    ) -> bool {
        let Some(run) = previous_run else {
            return false;
        };
        let Some(suggested) = run.suggested_next_monitor_at else {
            return false;
        };
        if now >= suggested {
            return false;
        }
        let forced = run.updated_at
            + Duration::minutes(ctx.config.worker.max_monitoring_interval_minutes as i64);
        now < forced
    }

    async fn record_outcome(
        ctx: &EngineContext,
        strategy_id: &str,
        outcome: RunOutcome,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        ctx.store
            .set_runtime_state(strategy_id, STATE_LAST_EVALUATION_OUTCOME, Some(outcome.as_str()))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_throttled(
        ctx: &EngineContext,
        strategy_id: &str,
        previous_outcome: Option<&str>,
        outcome: RunOutcome,
        throttle_key: &str,
        throttle_seconds: u64,
        event_type: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome_changed = previous_outcome != Some(outcome.as_str());
        let due = match ctx.store.get_runtime_state(strategy_id, throttle_key).await? {
            None => true,
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(last) => (now - last.with_timezone(&Utc)).num_seconds() >= throttle_seconds as i64,
                Err(_) => true,
            },
        };
        if outcome_changed || due {
            ctx.store.append_event(strategy_id, event_type, detail).await?;
            ctx.store
                .set_runtime_state(strategy_id, throttle_key, Some(&now.to_rfc3339()))
                .await?;
        }
        Ok(())
    }

    async fn evaluate_conditions(
        ctx: &EngineContext,
        record: &StrategyRecord,
        rules: &RulesConfig,
        watermarks: &MonitoringEndMap,
        logical_activated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EvaluationRun> {
        let strategy_id = record.id.as_str();
        let mut condition_states = Vec::new();
        let mut outcomes: Vec<ConditionOutcome> = Vec::new();
        let mut monitoring_end = watermarks.clone();
        let mut next_bar_suggestions: Vec<DateTime<Utc>> = Vec::new();
        let mut evaluated_any = false;
        let mut short_circuited_at: Option<usize> = None;

        for (idx, condition) in record.conditions.iter().enumerate() {
            let fallback_id = format!("c{}", idx + 1);
            let condition_id = condition
                .condition_id
                .clone()
                .unwrap_or_else(|| fallback_id.clone());

            let prepared = match evaluator::prepare(condition, rules) {
                Ok(prepared) => prepared,
                Err(err) => {
                    condition_states.push(ConditionRuntimeItem {
                        condition_id,
                        state: ConditionState::NotEvaluated,
                        last_value: None,
                        last_evaluated_at: Some(now),
                    });
                    return Ok(EvaluationRun {
                        outcome: RunOutcome::ConditionConfigInvalid,
                        condition_met: false,
                        decision_reason: "condition_config_invalid",
                        condition_states,
                        monitoring_end,
                        suggested_next_monitor_at: None,
                        invalid_detail: Some(err.to_string()),
                        evaluated_any,
                    });
                }
            };

            let gathered = Self::gather_condition_inputs(
                ctx,
                record,
                &prepared,
                &monitoring_end,
                logical_activated_at,
                now,
            )
            .await?;

            if !gathered.has_new_data {
                // No freshly-closed bar: leave watermarks untouched and try
                // again next cycle.
                outcomes.push(ConditionOutcome::NoNewData);
                condition_states.push(ConditionRuntimeItem {
                    condition_id: prepared.condition_id.clone(),
                    state: ConditionState::NotEvaluated,
                    last_value: None,
                    last_evaluated_at: Some(now),
                });
                if let Some(next_at) = gathered.next_bar_close_at {
                    next_bar_suggestions.push(next_at);
                }
                continue;
            }

            evaluated_any = true;
            let evaluation = evaluator::evaluate(&prepared, &gathered.input)?;
            debug!(
                strategy_id,
                condition_id = %prepared.condition_id,
                metric = %prepared.metric,
                trigger_mode = %prepared.trigger_mode,
                state = %evaluation.state,
                reason = %evaluation.reason,
                observed_value = ?evaluation.observed_value,
                "condition evaluated"
            );

            match evaluation.state {
                ConditionState::Waiting => {
                    outcomes.push(ConditionOutcome::Waiting);
                    condition_states.push(ConditionRuntimeItem {
                        condition_id: prepared.condition_id.clone(),
                        state: ConditionState::Waiting,
                        last_value: None,
                        last_evaluated_at: Some(now),
                    });
                }
                state @ (ConditionState::True | ConditionState::False) => {
                    // Only decisive outcomes advance the data watermark.
                    for (contract_id, watermark) in &gathered.watermark_updates {
                        let by_contract = monitoring_end
                            .entry(prepared.condition_id.clone())
                            .or_default();
                        let entry = by_contract
                            .entry(contract_id.to_string())
                            .or_insert(*watermark);
                        if *watermark > *entry {
                            *entry = *watermark;
                        }
                    }
                    let decided_true = state == ConditionState::True;
                    outcomes.push(if decided_true {
                        ConditionOutcome::True
                    } else {
                        ConditionOutcome::False
                    });
                    condition_states.push(ConditionRuntimeItem {
                        condition_id: prepared.condition_id.clone(),
                        state,
                        last_value: evaluation.observed_value,
                        last_evaluated_at: Some(now),
                    });

                    // AND short-circuits on FALSE, OR on TRUE.
                    let stop = match record.condition_logic {
                        ConditionLogic::And => !decided_true,
                        ConditionLogic::Or => decided_true,
                    };
                    if stop && idx + 1 < record.conditions.len() {
                        short_circuited_at = Some(idx + 1);
                        break;
                    }
                }
                ConditionState::NotEvaluated => {
                    outcomes.push(ConditionOutcome::NoNewData);
                    condition_states.push(ConditionRuntimeItem {
                        condition_id: prepared.condition_id.clone(),
                        state: ConditionState::NotEvaluated,
                        last_value: None,
                        last_evaluated_at: Some(now),
                    });
                }
            }
        }

        if let Some(from_idx) = short_circuited_at {
            for (offset, condition) in record.conditions[from_idx..].iter().enumerate() {
                let condition_id = condition
                    .condition_id
                    .clone()
                    .unwrap_or_else(|| format!("c{}", from_idx + offset + 1));
                condition_states.push(ConditionRuntimeItem {
                    condition_id,
                    state: ConditionState::NotEvaluated,
                    last_value: None,
                    last_evaluated_at: None,
                });
            }
        }

        let any_true = outcomes.contains(&ConditionOutcome::True);
        let any_false = outcomes.contains(&ConditionOutcome::False);
        let has_waiting = outcomes.contains(&ConditionOutcome::Waiting);
        let all_true =
            !outcomes.is_empty() && outcomes.iter().all(|o| *o == ConditionOutcome::True);
        let all_false =
            !outcomes.is_empty() && outcomes.iter().all(|o| *o == ConditionOutcome::False);

        let (outcome, condition_met, decision_reason) = match record.condition_logic {
            ConditionLogic::And => {
                if any_false {
                    (RunOutcome::Evaluated, false, "conditions_not_met")
                } else if all_true {
                    (RunOutcome::Evaluated, true, "conditions_met")
                } else if has_waiting {
                    (
                        RunOutcome::WaitingForMarketData,
                        false,
                        "waiting_for_market_data",
                    )
                } else {
                    (RunOutcome::NoNewData, false, "no_new_data")
                }
            }
            ConditionLogic::Or => {
                if any_true {
                    (RunOutcome::Evaluated, true, "conditions_met")
                } else if all_false {
                    (RunOutcome::Evaluated, false, "conditions_not_met")
                } else if has_waiting {
                    (
                        RunOutcome::WaitingForMarketData,
                        false,
                        "waiting_for_market_data",
                    )
                } else {
                    (RunOutcome::NoNewData, false, "no_new_data")
                }
            }
        };

        let suggested_next_monitor_at = if outcome == RunOutcome::NoNewData {
            next_bar_suggestions
                .into_iter()
                .filter(|at| *at > now)
                .min()
        } else {
            None
        };

        Ok(EvaluationRun {
            outcome,
            condition_met,
            decision_reason,
            condition_states,
            monitoring_end,
            suggested_next_monitor_at,
            invalid_detail: None,
            evaluated_any,
        })
    }

    async fn gather_condition_inputs(
        ctx: &EngineContext,
        record: &StrategyRecord,
        prepared: &PreparedCondition,
        monitoring_end: &MonitoringEndMap,
        logical_activated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<GatheredInputs> {
        let strategy_id = record.id.as_str();
        let mut input = super::evaluator::EvaluationInput::default();
        let mut has_new_data = false;
        let mut watermark_updates: HashMap<i64, DateTime<Utc>> = HashMap::new();
        let mut next_bar_close_at: Option<DateTime<Utc>> = None;

        let needs_extrema = prepared
            .contracts
            .iter()
            .any(|c| c.needs_high || c.needs_low);
        if needs_extrema {
            input.since_activation_high = ctx
                .store
                .get_runtime_state_f64(strategy_id, STATE_SINCE_ACTIVATION_HIGH)
                .await?;
            input.since_activation_low = ctx
                .store
                .get_runtime_state_f64(strategy_id, STATE_SINCE_ACTIVATION_LOW)
                .await?;
        }

        for contract in &prepared.contracts {
            let Some(bar_duration) = bar_size_to_duration(&contract.base_bar) else {
                warn!(
                    strategy_id,
                    condition_id = %prepared.condition_id,
                    base_bar = %contract.base_bar,
                    "invalid base bar size"
                );
                continue;
            };

            let watermark = monitoring_end
                .get(&prepared.condition_id)
                .and_then(|by_contract| by_contract.get(&contract.contract_id.to_string()))
                .copied()
                .unwrap_or(logical_activated_at);

            let lookback_points = contract.required_points.max(3) + 2;
            let required_start = now - bar_duration * lookback_points as i32;
            let start_time = required_start.min(watermark);

            let request = HistoricalBarsRequest {
                contract: ContractRef::new(&record.market, &contract.product),
                start_time,
                end_time: now,
                bar_size: contract.base_bar.clone(),
                what_to_show: "TRADES".to_string(),
                use_rth: true,
                include_partial_bar: contract.include_partial_bar,
                max_bars: None,
                page_size: Some(500),
            };
            let bars = match ctx.cache.get_historical_bars(&request).await {
                Ok(result) => result.bars,
                Err(err) => {
                    debug!(
                        strategy_id,
                        condition_id = %prepared.condition_id,
                        contract_id = contract.contract_id,
                        error = %err,
                        "market data fetch failed"
                    );
                    Vec::new()
                }
            };

            if let Some(latest_end) = latest_closed_bar_end(&bars, bar_duration, now) {
                if latest_end > watermark {
                    has_new_data = true;
                    watermark_updates.insert(contract.contract_id, latest_end);
                }
                let next_close = latest_end + bar_duration;
                next_bar_close_at = Some(match next_bar_close_at {
                    Some(existing) => existing.min(next_close),
                    None => next_close,
                });
            }

            // Keep since-activation extrema current from the freshly seen bars.
            if contract.needs_high || contract.needs_low {
                let mut high = input.since_activation_high;
                let mut low = input.since_activation_low;
                for bar in &bars {
                    if bar.ts < logical_activated_at {
                        continue;
                    }
                    high = Some(high.map_or(bar.high, |h| h.max(bar.high)));
                    low = Some(low.map_or(bar.low, |l| l.min(bar.low)));
                }
                if contract.needs_high {
                    if let Some(high) = high {
                        if input.since_activation_high != Some(high) {
                            ctx.store
                                .set_runtime_state_f64(
                                    strategy_id,
                                    STATE_SINCE_ACTIVATION_HIGH,
                                    high,
                                )
                                .await?;
                        }
                        input.since_activation_high = Some(high);
                    }
                }
                if contract.needs_low {
                    if let Some(low) = low {
                        if input.since_activation_low != Some(low) {
                            ctx.store
                                .set_runtime_state_f64(strategy_id, STATE_SINCE_ACTIVATION_LOW, low)
                                .await?;
                        }
                        input.since_activation_low = Some(low);
                    }
                }
            }

            let series: Vec<f64> = bars
                .iter()
                .filter_map(|bar| {
                    evaluator::bar_value_for_metric(prepared.metric, prepared.basis, bar)
                })
                .collect();
            if !series.is_empty() {
                input.series_by_contract.insert(contract.contract_id, series);
            }
        }

        Ok(GatheredInputs {
            input,
            has_new_data,
            watermark_updates,
            next_bar_close_at,
        })
    }
}

struct GatheredInputs {
    input: super::evaluator::EvaluationInput,
    has_new_data: bool,
    watermark_updates: HashMap<i64, DateTime<Utc>>,
    next_bar_close_at: Option<DateTime<Utc>>,
}
