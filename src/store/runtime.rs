use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;

use super::strategies::normalize_id;
use super::SentraStore;
use crate::domain::ConditionState;
use crate::error::{Result, SentraError};

/// Runtime-state keys used by the engine
pub const STATE_SINCE_ACTIVATION_HIGH: &str = "since_activation_high";
pub const STATE_SINCE_ACTIVATION_LOW: &str = "since_activation_low";
pub const STATE_ANCHOR_PRICE: &str = "anchor_price";
pub const STATE_ROLLED_AT: &str = "rolled_at";
pub const STATE_TRIGGER_EVENT_ID: &str = "trigger_event_id";
pub const STATE_TRIGGERED_AT: &str = "triggered_at";
pub const STATE_LAST_EVALUATION_OUTCOME: &str = "last_evaluation_outcome";
pub const STATE_THROTTLE_GATEWAY_UNAVAILABLE: &str = "event_throttle:GATEWAY_UNAVAILABLE";
pub const STATE_THROTTLE_WAITING_FOR_DATA: &str = "event_throttle:WAITING_FOR_MARKET_DATA";

/// Read-model row for one condition's latest evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRuntimeItem {
    pub condition_id: String,
    pub state: ConditionState,
    pub last_value: Option<f64>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

/// Watermark map: condition_id -> contract key -> newest closed-bar end.
pub type MonitoringEndMap = HashMap<String, HashMap<String, DateTime<Utc>>>;

/// One strategy_runs row.
#[derive(Debug, Clone)]
pub struct StrategyRun {
    pub strategy_id: String,
    pub first_evaluated_at: Option<DateTime<Utc>>,
    pub evaluated_at: Option<DateTime<Utc>>,
    pub last_monitoring_data_end_at: MonitoringEndMap,
    pub suggested_next_monitor_at: Option<DateTime<Utc>>,
    pub condition_met: bool,
    pub decision_reason: Option<String>,
    pub last_outcome: Option<String>,
    pub run_count: i64,
    pub metrics: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl SentraStore {
    pub async fn get_runtime_state(
        &self,
        strategy_id: &str,
        state_key: &str,
    ) -> Result<Option<String>> {
        let value: Option<Option<String>> = sqlx::query_scalar(
            "SELECT state_value FROM strategy_runtime_states WHERE strategy_id = ? AND state_key = ?",
        )
        .bind(normalize_id(strategy_id))
        .bind(state_key)
        .fetch_optional(self.pool())
        .await?;
        Ok(value.flatten())
    }

    pub async fn set_runtime_state(
        &self,
        strategy_id: &str,
        state_key: &str,
        state_value: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_runtime_states (strategy_id, state_key, state_value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (strategy_id, state_key) DO UPDATE SET
              state_value = excluded.state_value,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(normalize_id(strategy_id))
        .bind(state_key)
        .bind(state_value)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_runtime_state_f64(
        &self,
        strategy_id: &str,
        state_key: &str,
    ) -> Result<Option<f64>> {
        Ok(self
            .get_runtime_state(strategy_id, state_key)
            .await?
            .and_then(|raw| raw.parse::<f64>().ok()))
    }

    pub async fn set_runtime_state_f64(
        &self,
        strategy_id: &str,
        state_key: &str,
        value: f64,
    ) -> Result<()> {
        self.set_runtime_state(strategy_id, state_key, Some(&value.to_string()))
            .await
    }

    /// Persist one condition's evaluation outcome. `last_evaluated_at` is
    /// only advanced, never cleared.
    pub async fn upsert_condition_state(
        &self,
        strategy_id: &str,
        item: &ConditionRuntimeItem,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO condition_states (
              strategy_id, condition_id, state, last_value, last_evaluated_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (strategy_id, condition_id) DO UPDATE SET
              state = excluded.state,
              last_value = excluded.last_value,
              last_evaluated_at = COALESCE(excluded.last_evaluated_at, condition_states.last_evaluated_at),
              updated_at = excluded.updated_at
            "#,
        )
        .bind(normalize_id(strategy_id))
        .bind(&item.condition_id)
        .bind(item.state.as_str())
        .bind(item.last_value)
        .bind(item.last_evaluated_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn condition_states(&self, strategy_id: &str) -> Result<Vec<ConditionRuntimeItem>> {
        let rows = sqlx::query(
            r#"
            SELECT condition_id, state, last_value, last_evaluated_at
            FROM condition_states
            WHERE strategy_id = ?
            ORDER BY condition_id ASC
            "#,
        )
        .bind(normalize_id(strategy_id))
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let state_raw: String = row.try_get("state")?;
                Ok(ConditionRuntimeItem {
                    condition_id: row.try_get("condition_id")?,
                    state: ConditionState::try_from(state_raw.as_str())
                        .map_err(SentraError::Internal)?,
                    last_value: row.try_get("last_value")?,
                    last_evaluated_at: row.try_get("last_evaluated_at")?,
                })
            })
            .collect()
    }

    pub async fn get_strategy_run(&self, strategy_id: &str) -> Result<Option<StrategyRun>> {
        let row = sqlx::query("SELECT * FROM strategy_runs WHERE strategy_id = ?")
            .bind(normalize_id(strategy_id))
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let watermark_json: String = row.try_get("last_monitoring_data_end_at")?;
        let metrics_json: Option<String> = row.try_get("metrics_json")?;
        Ok(Some(StrategyRun {
            strategy_id: row.try_get("strategy_id")?,
            first_evaluated_at: row.try_get("first_evaluated_at")?,
            evaluated_at: row.try_get("evaluated_at")?,
            last_monitoring_data_end_at: serde_json::from_str(&watermark_json)?,
            suggested_next_monitor_at: row.try_get("suggested_next_monitor_at")?,
            condition_met: row.try_get("condition_met")?,
            decision_reason: row.try_get("decision_reason")?,
            last_outcome: row.try_get("last_outcome")?,
            run_count: row.try_get("run_count")?,
            metrics: metrics_json.as_deref().map(serde_json::from_str).transpose()?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    /// Insert-or-update the strategy_runs row; `run_count` increments and
    /// `first_evaluated_at` is preserved across updates.
    pub async fn upsert_strategy_run(&self, run: &StrategyRun) -> Result<()> {
        let watermark_json = serde_json::to_string(&run.last_monitoring_data_end_at)?;
        let metrics_json = run.metrics.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO strategy_runs (
              strategy_id, first_evaluated_at, evaluated_at, last_monitoring_data_end_at,
              suggested_next_monitor_at, condition_met, decision_reason, last_outcome,
              run_count, metrics_json, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (strategy_id) DO UPDATE SET
              first_evaluated_at = COALESCE(strategy_runs.first_evaluated_at, excluded.first_evaluated_at),
              evaluated_at = COALESCE(excluded.evaluated_at, strategy_runs.evaluated_at),
              last_monitoring_data_end_at = excluded.last_monitoring_data_end_at,
              suggested_next_monitor_at = excluded.suggested_next_monitor_at,
              condition_met = excluded.condition_met,
              decision_reason = excluded.decision_reason,
              last_outcome = excluded.last_outcome,
              run_count = strategy_runs.run_count + 1,
              metrics_json = excluded.metrics_json,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(normalize_id(&run.strategy_id))
        .bind(run.first_evaluated_at)
        .bind(run.evaluated_at)
        .bind(watermark_json)
        .bind(run.suggested_next_monitor_at)
        .bind(run.condition_met)
        .bind(&run.decision_reason)
        .bind(&run.last_outcome)
        .bind(metrics_json)
        .bind(run.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_strategy_run(&self, strategy_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM strategy_runs WHERE strategy_id = ?")
            .bind(normalize_id(strategy_id))
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
