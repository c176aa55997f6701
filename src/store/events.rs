use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use super::strategies::normalize_id;
use super::SentraStore;
use crate::domain::{StrategyEvent, TradeLog, VerificationEvent};
use crate::error::Result;

/// Append one audit event inside the caller's transaction.
pub(crate) async fn append_event_tx(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    event_type: &str,
    detail: &str,
    ts: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO strategy_events (strategy_id, timestamp, event_type, detail)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(strategy_id)
    .bind(ts)
    .bind(event_type)
    .bind(detail)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_trade_log_tx(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    trade_id: &str,
    stage: &str,
    result: &str,
    detail: &str,
    ts: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO trade_logs (timestamp, strategy_id, trade_id, stage, result, detail)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ts)
    .bind(strategy_id)
    .bind(trade_id)
    .bind(stage)
    .bind(result)
    .bind(detail)
    .execute(conn)
    .await?;
    Ok(())
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StrategyEvent> {
    Ok(StrategyEvent {
        timestamp: row.try_get("timestamp")?,
        event_type: row.try_get("event_type")?,
        detail: row.try_get("detail")?,
        strategy_id: row.try_get("strategy_id")?,
    })
}

fn trade_log_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TradeLog> {
    Ok(TradeLog {
        timestamp: row.try_get("timestamp")?,
        strategy_id: row.try_get("strategy_id")?,
        trade_id: row.try_get("trade_id")?,
        stage: row.try_get("stage")?,
        result: row.try_get("result")?,
        detail: row.try_get("detail")?,
    })
}

impl SentraStore {
    /// Append an audit event outside any transaction.
    pub async fn append_event(
        &self,
        strategy_id: &str,
        event_type: &str,
        detail: &str,
    ) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        append_event_tx(&mut conn, strategy_id, event_type, detail, Utc::now()).await
    }

    /// Append one trade log row outside any transaction.
    pub async fn insert_trade_log(
        &self,
        strategy_id: &str,
        trade_id: &str,
        stage: &str,
        result: &str,
        detail: &str,
    ) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        insert_trade_log_tx(
            &mut conn,
            &normalize_id(strategy_id),
            trade_id,
            stage,
            result,
            detail,
            Utc::now(),
        )
        .await
    }

    /// Per-strategy event stream in insertion order.
    pub async fn strategy_events(&self, strategy_id: &str) -> Result<Vec<StrategyEvent>> {
        let rows = sqlx::query(
            "SELECT strategy_id, timestamp, event_type, detail FROM strategy_events WHERE strategy_id = ? ORDER BY id ASC",
        )
        .bind(normalize_id(strategy_id))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Global event stream, newest first.
    pub async fn global_events(&self, limit: i64) -> Result<Vec<StrategyEvent>> {
        let rows = sqlx::query(
            "SELECT strategy_id, timestamp, event_type, detail FROM strategy_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn trade_logs(&self, limit: i64) -> Result<Vec<TradeLog>> {
        let rows = sqlx::query(
            "SELECT timestamp, strategy_id, trade_id, stage, result, detail FROM trade_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(trade_log_from_row).collect()
    }

    pub async fn insert_verification_event(&self, event: &VerificationEvent) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        insert_verification_event_tx(&mut conn, event).await
    }

    pub async fn verification_events(&self, trade_id: &str) -> Result<Vec<VerificationEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, strategy_id, rule_id, rule_version, passed, reason, snapshot_json, created_at
            FROM verification_events
            WHERE trade_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(trade_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let snapshot_json: Option<String> = row.try_get("snapshot_json")?;
                let snapshot = snapshot_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?;
                Ok(VerificationEvent {
                    trade_id: row.try_get("trade_id")?,
                    strategy_id: row.try_get("strategy_id")?,
                    rule_id: row.try_get("rule_id")?,
                    rule_version: row.try_get("rule_version")?,
                    passed: row.try_get("passed")?,
                    reason: row.try_get("reason")?,
                    snapshot,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn verification_events_for_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<Vec<VerificationEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, strategy_id, rule_id, rule_version, passed, reason, snapshot_json, created_at
            FROM verification_events
            WHERE strategy_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(normalize_id(strategy_id))
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let snapshot_json: Option<String> = row.try_get("snapshot_json")?;
                let snapshot = snapshot_json
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?;
                Ok(VerificationEvent {
                    trade_id: row.try_get("trade_id")?,
                    strategy_id: row.try_get("strategy_id")?,
                    rule_id: row.try_get("rule_id")?,
                    rule_version: row.try_get("rule_version")?,
                    passed: row.try_get("passed")?,
                    reason: row.try_get("reason")?,
                    snapshot,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Insert the chain-activation row keyed by
    /// `(trigger_event_id, downstream)`. Returns false when the row already
    /// exists (at-most-once activation).
    pub async fn insert_activation(
        &self,
        upstream_strategy_id: &str,
        downstream_strategy_id: &str,
        trigger_event_id: &str,
        effective_activated_at: DateTime<Utc>,
        market_snapshot: Option<&serde_json::Value>,
        context: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let mut conn = self.pool().acquire().await?;
        insert_activation_tx(
            &mut conn,
            upstream_strategy_id,
            downstream_strategy_id,
            trigger_event_id,
            effective_activated_at,
            market_snapshot,
            context,
        )
        .await
    }

    pub async fn activation_count(&self, downstream_strategy_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM strategy_activations WHERE downstream_strategy_id = ?",
        )
        .bind(normalize_id(downstream_strategy_id))
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}

pub(crate) async fn insert_verification_event_tx(
    conn: &mut SqliteConnection,
    event: &VerificationEvent,
) -> Result<()> {
    let snapshot_json = event
        .snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    sqlx::query(
        r#"
        INSERT INTO verification_events (
          trade_id, strategy_id, rule_id, rule_version, passed, reason, snapshot_json, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.trade_id)
    .bind(&event.strategy_id)
    .bind(&event.rule_id)
    .bind(event.rule_version)
    .bind(event.passed)
    .bind(&event.reason)
    .bind(snapshot_json)
    .bind(event.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn insert_activation_tx(
    conn: &mut SqliteConnection,
    upstream_strategy_id: &str,
    downstream_strategy_id: &str,
    trigger_event_id: &str,
    effective_activated_at: DateTime<Utc>,
    market_snapshot: Option<&serde_json::Value>,
    context: Option<&serde_json::Value>,
) -> Result<bool> {
    let market_snapshot_json = market_snapshot.map(serde_json::to_string).transpose()?;
    let context_json = context.map(serde_json::to_string).transpose()?;
    let affected = sqlx::query(
        r#"
        INSERT INTO strategy_activations (
          upstream_strategy_id, downstream_strategy_id, trigger_event_id,
          effective_activated_at, market_snapshot_json, context_json, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (trigger_event_id, downstream_strategy_id) DO NOTHING
        "#,
    )
    .bind(upstream_strategy_id)
    .bind(downstream_strategy_id)
    .bind(trigger_event_id)
    .bind(effective_activated_at)
    .bind(market_snapshot_json)
    .bind(context_json)
    .bind(Utc::now())
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected > 0)
}
