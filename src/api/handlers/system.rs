use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::api::state::AppState;
use crate::api::types::{ApiResult, HealthOut};
use crate::domain::{PortfolioSummary, PositionItem, SecType};
use crate::engine::scheduler::WorkerStatus;
use crate::gateway::with_timeout;

pub async fn health(State(state): State<AppState>) -> Json<HealthOut> {
    let gateway_reachable = state.ctx.gateway_available().await;
    let worker = state.engine.runtime_status();
    Json(HealthOut {
        status: "ok",
        trading_mode: state.ctx.config.ib_gateway.trading_mode.clone(),
        gateway_reachable,
        worker_running: worker.running,
    })
}

pub async fn worker_status(State(state): State<AppState>) -> Json<WorkerStatus> {
    Json(state.engine.runtime_status())
}

pub async fn portfolio_summary(State(state): State<AppState>) -> ApiResult<Json<PortfolioSummary>> {
    let summary = with_timeout(
        state.ctx.gateway_timeout(),
        state.ctx.gateway.account_snapshot(),
    )
    .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    #[serde(default)]
    pub sec_type: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
}

pub async fn positions(
    State(state): State<AppState>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult<Json<Vec<PositionItem>>> {
    let mut positions =
        with_timeout(state.ctx.gateway_timeout(), state.ctx.gateway.positions()).await?;
    if let Some(sec_type) = query
        .sec_type
        .as_deref()
        .and_then(|raw| SecType::try_from(raw).ok())
    {
        positions.retain(|p| p.sec_type == sec_type);
    }
    if let Some(symbol) = query.symbol.as_deref() {
        let symbol = symbol.trim().to_uppercase();
        positions.retain(|p| p.symbol == symbol);
    }
    Ok(Json(positions))
}
