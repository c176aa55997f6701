use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{
    Capabilities, CapabilityReasons, ConditionItem, ConditionLogic, ExpireMode, StrategyEvent,
    StrategyRecord, StrategyStatus, StrategySymbol, TradeAction, TradeType, TriggerGroupStatus,
};
use crate::error::SentraError;
use crate::store::ConditionRuntimeItem;

/// Error envelope: stable code + human message; locking errors carry
/// `lock_until` so the caller can retry.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
}

pub struct ApiError(pub SentraError);

impl From<SentraError> for ApiError {
    fn from(err: SentraError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            SentraError::Validation(_) | SentraError::Json(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SentraError::NotFound { .. } => StatusCode::NOT_FOUND,
            SentraError::StrategyLocked { .. }
            | SentraError::InvalidTransition { .. }
            | SentraError::VersionConflict(_)
            | SentraError::UpstreamOnlyActivation(_)
            | SentraError::CycleDetected { .. } => StatusCode::CONFLICT,
            SentraError::GatewayUnavailable(_) | SentraError::GatewayTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let lock_until = match &err {
            SentraError::StrategyLocked { lock_until, .. } => Some(*lock_until),
            _ => None,
        };
        let body = ErrorBody {
            code: err.code(),
            message: err.to_string(),
            lock_until,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct StrategySummaryOut {
    pub id: String,
    pub status: StrategyStatus,
    pub description: String,
    pub market: String,
    pub trade_type: TradeType,
    pub trigger_group_status: TriggerGroupStatus,
    pub updated_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub capabilities: Capabilities,
}

impl From<&StrategyRecord> for StrategySummaryOut {
    fn from(record: &StrategyRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            description: record.description.clone(),
            market: record.market.clone(),
            trade_type: record.trade_type,
            trigger_group_status: record.trigger_group_status(),
            updated_at: record.updated_at,
            expire_at: record.effective_expire_at(),
            capabilities: record.capabilities(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NextStrategyProjection {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StrategyDetailOut {
    pub id: String,
    pub description: String,
    pub market: String,
    pub trade_type: TradeType,
    pub symbols: Vec<StrategySymbol>,
    pub currency: String,
    pub upstream_only_activation: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub logical_activated_at: Option<DateTime<Utc>>,
    pub expire_mode: ExpireMode,
    pub expire_in_seconds: Option<i64>,
    pub expire_at: Option<DateTime<Utc>>,
    pub status: StrategyStatus,
    pub editable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editable_reason: Option<String>,
    pub capabilities: Capabilities,
    pub capability_reasons: CapabilityReasons,
    pub condition_logic: ConditionLogic,
    pub conditions: Vec<ConditionItem>,
    pub trigger_group_status: TriggerGroupStatus,
    pub conditions_runtime: Vec<ConditionRuntimeItem>,
    pub trade_action: Option<TradeAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_strategy: Option<NextStrategyProjection>,
    pub upstream_strategy_id: Option<String>,
    pub anchor_price: Option<f64>,
    pub events: Vec<StrategyEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub strategy_id: String,
    pub status: StrategyStatus,
    pub message: &'static str,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub trading_mode: String,
    pub gateway_reachable: bool,
    pub worker_running: bool,
}
