use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::Row;

use super::events::{append_event_tx, insert_trade_log_tx};
use super::strategies::{apply_transition, normalize_id, TransitionMutations};
use super::SentraStore;
use crate::domain::{OrderRecord, OrderStatus, StrategyStatus, TradeInstruction};
use crate::error::{Result, SentraError};

/// One order leg to persist at submission time.
#[derive(Debug, Clone)]
pub struct NewOrderLeg {
    pub leg: i64,
    pub qty: Decimal,
    pub payload: serde_json::Value,
}

fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn f64_to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
    let status_raw: String = row.try_get("status")?;
    let payload_json: String = row.try_get("order_payload_json")?;
    let avg_fill_price: Option<f64> = row.try_get("avg_fill_price")?;
    Ok(OrderRecord {
        trade_id: row.try_get("trade_id")?,
        strategy_id: row.try_get("strategy_id")?,
        leg: row.try_get("leg")?,
        ib_order_id: row.try_get("ib_order_id")?,
        status: OrderStatus::try_from(status_raw.as_str()).map_err(SentraError::Internal)?,
        qty: f64_to_decimal(row.try_get("qty")?),
        filled_qty: f64_to_decimal(row.try_get("filled_qty")?),
        avg_fill_price: avg_fill_price.map(f64_to_decimal),
        order_payload: serde_json::from_str(&payload_json)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn instruction_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TradeInstruction> {
    Ok(TradeInstruction {
        trade_id: row.try_get("trade_id")?,
        strategy_id: row.try_get("strategy_id")?,
        instruction_summary: row.try_get("instruction_summary")?,
        status: row.try_get("status")?,
        expire_at: row.try_get("expire_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl SentraStore {
    /// C8 entry point: the `TRIGGERED -> ORDER_SUBMITTED` transition commits
    /// atomically with the Order, TradeInstruction and TradeLog rows, all
    /// keyed by `trade_id`.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_order_submission(
        &self,
        strategy_id: &str,
        expected_version: i64,
        trade_id: &str,
        instruction_summary: &str,
        expire_at: Option<DateTime<Utc>>,
        first_leg: NewOrderLeg,
    ) -> Result<()> {
        let strategy_id = normalize_id(strategy_id);
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        apply_transition(
            &mut tx,
            &strategy_id,
            StrategyStatus::Triggered,
            StrategyStatus::OrderSubmitted,
            Some(expected_version),
            &TransitionMutations::default(),
            Some(("ORDER_SUBMITTED", &format!("trade instruction {trade_id} submitted"))),
            now,
        )
        .await?;

        sqlx::query(
            r#"
            INSERT INTO trade_instructions (
              trade_id, strategy_id, instruction_summary, status, expire_at, updated_at
            ) VALUES (?, ?, ?, 'ORDER_SUBMITTED', ?, ?)
            "#,
        )
        .bind(trade_id)
        .bind(&strategy_id)
        .bind(instruction_summary)
        .bind(expire_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_order_leg_tx(&mut tx, trade_id, &strategy_id, &first_leg, now).await?;
        insert_trade_log_tx(
            &mut tx,
            &strategy_id,
            trade_id,
            "EXECUTION",
            "ORDER_SUBMITTED",
            instruction_summary,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Persist the follow-up leg of a roll once the close leg filled.
    pub async fn insert_order_leg(
        &self,
        trade_id: &str,
        strategy_id: &str,
        leg: NewOrderLeg,
    ) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        insert_order_leg_tx(&mut conn, trade_id, &normalize_id(strategy_id), &leg, Utc::now())
            .await
    }

    /// Attach the gateway order id once the gateway acknowledged.
    pub async fn attach_ib_order_id(
        &self,
        trade_id: &str,
        leg: i64,
        ib_order_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET ib_order_id = ?, updated_at = ? WHERE trade_id = ? AND leg = ?",
        )
        .bind(ib_order_id)
        .bind(Utc::now())
        .bind(trade_id)
        .bind(leg)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Persist a gateway status update for one leg.
    pub async fn update_order_status(
        &self,
        trade_id: &str,
        leg: i64,
        status: OrderStatus,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = ?, filled_qty = ?, avg_fill_price = ?, updated_at = ?
            WHERE trade_id = ? AND leg = ?
            "#,
        )
        .bind(status.as_str())
        .bind(decimal_to_f64(filled_qty))
        .bind(avg_fill_price.map(decimal_to_f64))
        .bind(Utc::now())
        .bind(trade_id)
        .bind(leg)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Update the external-facing instruction status and log the stage.
    pub async fn update_instruction_status(
        &self,
        trade_id: &str,
        strategy_id: &str,
        status: &str,
        detail: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let strategy_id = normalize_id(strategy_id);
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE trade_instructions SET status = ?, updated_at = ? WHERE trade_id = ?")
            .bind(status)
            .bind(now)
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        insert_trade_log_tx(&mut tx, &strategy_id, trade_id, "EXECUTION", status, detail, now)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close out the strategy from a terminal order status, atomically with
    /// the instruction update and audit rows.
    pub async fn settle_order_terminal(
        &self,
        strategy_id: &str,
        trade_id: &str,
        order_status: OrderStatus,
        strategy_status: StrategyStatus,
        detail: &str,
    ) -> Result<()> {
        let strategy_id = normalize_id(strategy_id);
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        apply_transition(
            &mut tx,
            &strategy_id,
            StrategyStatus::OrderSubmitted,
            strategy_status,
            None,
            &TransitionMutations::default(),
            Some((strategy_status.as_str(), detail)),
            now,
        )
        .await?;

        sqlx::query("UPDATE trade_instructions SET status = ?, updated_at = ? WHERE trade_id = ?")
            .bind(order_status.as_str())
            .bind(now)
            .bind(trade_id)
            .execute(&mut *tx)
            .await?;
        insert_trade_log_tx(
            &mut tx,
            &strategy_id,
            trade_id,
            "EXECUTION",
            order_status.as_str(),
            detail,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn orders_for_trade(&self, trade_id: &str) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE trade_id = ? ORDER BY leg ASC")
            .bind(trade_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    pub async fn orders_for_strategy(&self, strategy_id: &str) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE strategy_id = ? ORDER BY created_at ASC, leg ASC",
        )
        .bind(normalize_id(strategy_id))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    /// Most recent instruction for a strategy (status sync + recovery).
    pub async fn latest_instruction_for_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<Option<TradeInstruction>> {
        let row = sqlx::query(
            r#"
            SELECT trade_id, strategy_id, instruction_summary, status, expire_at, updated_at
            FROM trade_instructions
            WHERE strategy_id = ?
            ORDER BY updated_at DESC, trade_id DESC
            LIMIT 1
            "#,
        )
        .bind(normalize_id(strategy_id))
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(instruction_from_row).transpose()
    }

    /// Instructions still live on the gateway.
    pub async fn active_trade_instructions(&self) -> Result<Vec<TradeInstruction>> {
        let rows = sqlx::query(
            r#"
            SELECT trade_id, strategy_id, instruction_summary, status, expire_at, updated_at
            FROM trade_instructions
            WHERE status NOT IN ('FILLED', 'CANCELLED', 'FAILED')
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(instruction_from_row).collect()
    }
}

async fn insert_order_leg_tx(
    conn: &mut sqlx::SqliteConnection,
    trade_id: &str,
    strategy_id: &str,
    leg: &NewOrderLeg,
    now: DateTime<Utc>,
) -> Result<()> {
    let payload_json = serde_json::to_string(&leg.payload)?;
    sqlx::query(
        r#"
        INSERT INTO orders (
          trade_id, strategy_id, leg, status, qty, filled_qty, order_payload_json,
          created_at, updated_at
        ) VALUES (?, ?, ?, 'ORDER_SUBMITTED', ?, 0, ?, ?, ?)
        "#,
    )
    .bind(trade_id)
    .bind(strategy_id)
    .bind(leg.leg)
    .bind(decimal_to_f64(leg.qty))
    .bind(payload_json)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}
