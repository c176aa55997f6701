use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::state::AppState;
use crate::api::types::{
    ApiResult, ControlResponse, NextStrategyProjection, StrategyDetailOut, StrategySummaryOut,
};
use crate::domain::{StrategyEvent, StrategyRecord, TradeInstruction, TradeLog};
use crate::store::{ActionsPutInput, BasicPatchInput, ConditionsPutInput, CreateStrategyInput};

async fn build_detail(state: &AppState, record: StrategyRecord) -> ApiResult<StrategyDetailOut> {
    let next_strategy = match &record.next_strategy_id {
        Some(next_id) => {
            let downstream = state.ctx.store.get_strategy_opt(next_id).await?;
            Some(NextStrategyProjection {
                id: next_id.clone(),
                description: downstream
                    .as_ref()
                    .map(|d| d.description.clone())
                    .or_else(|| record.next_strategy_note.clone()),
                status: downstream
                    .map(|d| d.status.to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
            })
        }
        None => None,
    };
    let conditions_runtime = state.ctx.store.condition_states(&record.id).await?;
    let events = state.ctx.store.strategy_events(&record.id).await?;

    let editable = record.status.is_editable();
    let capabilities = record.capabilities();
    let capability_reasons = record.capability_reasons();
    let trigger_group_status = record.trigger_group_status();
    let expire_at = record.effective_expire_at();
    Ok(StrategyDetailOut {
        id: record.id,
        description: record.description,
        market: record.market,
        trade_type: record.trade_type,
        symbols: record.symbols,
        currency: record.currency,
        upstream_only_activation: record.upstream_only_activation,
        activated_at: record.activated_at,
        logical_activated_at: record.logical_activated_at,
        expire_mode: record.expire_mode,
        expire_in_seconds: record.expire_in_seconds,
        expire_at,
        status: record.status,
        editable,
        editable_reason: (!editable)
            .then(|| "only PENDING_ACTIVATION / VERIFY_FAILED / PAUSED are editable".to_string()),
        capabilities,
        capability_reasons,
        condition_logic: record.condition_logic,
        conditions: record.conditions,
        trigger_group_status,
        conditions_runtime,
        trade_action: record.trade_action,
        next_strategy,
        upstream_strategy_id: record.upstream_strategy_id,
        anchor_price: record.anchor_price,
        events,
        created_at: record.created_at,
        updated_at: record.updated_at,
        version: record.version,
    })
}

pub async fn list_strategies(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<StrategySummaryOut>>> {
    let records = state.ctx.store.list_strategies().await?;
    Ok(Json(records.iter().map(StrategySummaryOut::from).collect()))
}

pub async fn create_strategy(
    State(state): State<AppState>,
    Json(input): Json<CreateStrategyInput>,
) -> ApiResult<Json<StrategyDetailOut>> {
    let record = state.ctx.store.create_strategy(input).await?;
    Ok(Json(build_detail(&state, record).await?))
}

pub async fn get_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StrategyDetailOut>> {
    let record = state.ctx.store.get_strategy(&id).await?;
    Ok(Json(build_detail(&state, record).await?))
}

pub async fn delete_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.ctx.store.soft_delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

pub async fn patch_basic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<BasicPatchInput>,
) -> ApiResult<Json<StrategyDetailOut>> {
    let record = state.ctx.store.patch_basic(&id, input).await?;
    Ok(Json(build_detail(&state, record).await?))
}

pub async fn put_conditions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ConditionsPutInput>,
) -> ApiResult<Json<StrategyDetailOut>> {
    let record = state.ctx.store.put_conditions(&id, input).await?;
    Ok(Json(build_detail(&state, record).await?))
}

pub async fn put_actions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ActionsPutInput>,
) -> ApiResult<Json<StrategyDetailOut>> {
    let record = state.ctx.store.put_actions(&id, input).await?;
    Ok(Json(build_detail(&state, record).await?))
}

fn control_response(record: &StrategyRecord, message: &'static str) -> ControlResponse {
    ControlResponse {
        strategy_id: record.id.clone(),
        status: record.status,
        message,
        updated_at: record.updated_at,
    }
}

pub async fn activate_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let record = state.ctx.store.activate(&id).await?;
    // Kick the preflight without waiting for the next scan cycle.
    let engine = state.engine.clone();
    let strategy_id = record.id.clone();
    tokio::spawn(async move {
        let _ = engine.process_strategy_once(&strategy_id).await;
    });
    Ok(Json(control_response(&record, "activation requested")))
}

pub async fn pause_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let record = state.ctx.store.pause(&id).await?;
    Ok(Json(control_response(&record, "paused")))
}

pub async fn resume_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let record = state.ctx.store.resume(&id).await?;
    Ok(Json(control_response(&record, "resumed")))
}

pub async fn cancel_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let record = state.ctx.store.cancel(&id).await?;
    Ok(Json(control_response(&record, "cancelled")))
}

pub async fn strategy_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<StrategyEvent>>> {
    // 404 on unknown strategy, empty list otherwise
    state.ctx.store.get_strategy(&id).await?;
    Ok(Json(state.ctx.store.strategy_events(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: i64,
}

fn default_events_limit() -> i64 {
    200
}

pub async fn global_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<StrategyEvent>>> {
    Ok(Json(
        state
            .ctx
            .store
            .global_events(query.limit.clamp(1, 1000))
            .await?,
    ))
}

pub async fn active_trade_instructions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<TradeInstruction>>> {
    Ok(Json(state.ctx.store.active_trade_instructions().await?))
}

pub async fn trade_logs(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<TradeLog>>> {
    Ok(Json(
        state.ctx.store.trade_logs(query.limit.clamp(1, 1000)).await?,
    ))
}

pub async fn condition_rules(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.ctx.rules_snapshot().export()))
}
