use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use uuid::Uuid;

use super::events::append_event_tx;
use super::SentraStore;
use crate::domain::{
    resolve_market_profile, validate_trade_symbol_combo, ConditionItem, ConditionLogic,
    ExpireMode, StrategyRecord, StrategyStatus, StrategySymbol, TradeAction, TradeType,
};
use crate::error::{Result, SentraError};

pub const MAX_EXPIRE_IN_SECONDS: i64 = 604_800;

/// Payload for `create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateStrategyInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub description: String,
    pub market: String,
    pub trade_type: TradeType,
    pub symbols: Vec<StrategySymbol>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub upstream_only_activation: bool,
    #[serde(default = "default_expire_mode")]
    pub expire_mode: ExpireMode,
    #[serde(default = "default_expire_in_seconds")]
    pub expire_in_seconds: Option<i64>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Vec<ConditionItem>,
    #[serde(default)]
    pub trade_action: Option<TradeAction>,
    #[serde(default)]
    pub next_strategy_id: Option<String>,
    #[serde(default)]
    pub next_strategy_note: Option<String>,
}

fn default_expire_mode() -> ExpireMode {
    ExpireMode::Relative
}

fn default_expire_in_seconds() -> Option<i64> {
    Some(172_800)
}

/// Payload for `patchBasic`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BasicPatchInput {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub trade_type: Option<TradeType>,
    #[serde(default)]
    pub symbols: Option<Vec<StrategySymbol>>,
    #[serde(default)]
    pub upstream_only_activation: Option<bool>,
    #[serde(default)]
    pub expire_mode: Option<ExpireMode>,
    #[serde(default)]
    pub expire_in_seconds: Option<i64>,
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Payload for `putConditions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionsPutInput {
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default)]
    pub conditions: Vec<ConditionItem>,
}

/// Payload for `putActions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionsPutInput {
    #[serde(default)]
    pub trade_action: Option<TradeAction>,
    #[serde(default)]
    pub next_strategy_id: Option<String>,
    #[serde(default)]
    pub next_strategy_note: Option<String>,
}

/// Extra columns a transition may set atomically with the status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionMutations {
    pub activated_at: Option<DateTime<Utc>>,
    pub logical_activated_at: Option<DateTime<Utc>>,
    pub expire_at: Option<DateTime<Utc>>,
    pub anchor_price: Option<f64>,
    pub upstream_strategy_id: Option<String>,
    pub upstream_only_activation: Option<bool>,
    /// Preflight writes the contract-enriched conditions back
    pub conditions_json: Option<String>,
}

/// Scanner work item snapshot
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    pub id: String,
    pub status: StrategyStatus,
    pub version: i64,
}

pub(crate) fn normalize_id(value: &str) -> String {
    value.trim().to_uppercase()
}

fn normalize_optional_id(value: Option<&str>) -> Option<String> {
    let normalized = normalize_id(value?);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Assign stable condition ids (c1, c2, ...) to entries missing one.
fn normalize_conditions(conditions: &[ConditionItem]) -> Vec<ConditionItem> {
    conditions
        .iter()
        .enumerate()
        .map(|(idx, cond)| {
            let mut cond = cond.clone();
            let assigned = cond
                .condition_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("c{}", idx + 1));
            cond.condition_id = Some(assigned);
            if let Some(product) = cond.normalized_product() {
                cond.product = Some(product);
            }
            if let Some(product_b) = cond.normalized_product_b() {
                cond.product_b = Some(product_b);
            }
            cond
        })
        .collect()
}

fn validate_expiry(
    expire_mode: ExpireMode,
    expire_in_seconds: Option<i64>,
    expire_at: Option<DateTime<Utc>>,
) -> Result<()> {
    match expire_mode {
        ExpireMode::Relative => {
            let seconds = expire_in_seconds.ok_or_else(|| {
                SentraError::Validation(
                    "expire_mode=relative requires expire_in_seconds".to_string(),
                )
            })?;
            if !(1..=MAX_EXPIRE_IN_SECONDS).contains(&seconds) {
                return Err(SentraError::Validation(format!(
                    "expire_in_seconds must be in [1, {MAX_EXPIRE_IN_SECONDS}], got {seconds}"
                )));
            }
        }
        ExpireMode::Absolute => {
            if expire_at.is_none() {
                return Err(SentraError::Validation(
                    "expire_mode=absolute requires expire_at".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub(crate) fn record_from_row(row: &SqliteRow) -> Result<StrategyRecord> {
    let status_raw: String = row.try_get("status")?;
    let status = StrategyStatus::try_from(status_raw.as_str())
        .map_err(SentraError::Internal)?;
    let trade_type_raw: String = row.try_get("trade_type")?;
    let trade_type =
        TradeType::try_from(trade_type_raw.as_str()).map_err(SentraError::Internal)?;
    let expire_mode_raw: String = row.try_get("expire_mode")?;
    let expire_mode =
        ExpireMode::try_from(expire_mode_raw.as_str()).map_err(SentraError::Internal)?;
    let condition_logic_raw: String = row.try_get("condition_logic")?;
    let condition_logic = match condition_logic_raw.to_uppercase().as_str() {
        "OR" => ConditionLogic::Or,
        _ => ConditionLogic::And,
    };

    let conditions_json: String = row.try_get("conditions_json")?;
    let conditions: Vec<ConditionItem> = serde_json::from_str(&conditions_json)?;
    let trade_action_json: Option<String> = row.try_get("trade_action_json")?;
    let trade_action = trade_action_json
        .as_deref()
        .map(serde_json::from_str::<TradeAction>)
        .transpose()?;

    Ok(StrategyRecord {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        description: row.try_get("description")?,
        market: row.try_get("market")?,
        trade_type,
        symbols: Vec::new(),
        currency: row.try_get("currency")?,
        upstream_only_activation: row.try_get("upstream_only_activation")?,
        expire_mode,
        expire_in_seconds: row.try_get("expire_in_seconds")?,
        expire_at: row.try_get("expire_at")?,
        status,
        condition_logic,
        conditions,
        trade_action,
        next_strategy_id: row.try_get("next_strategy_id")?,
        next_strategy_note: row.try_get("next_strategy_note")?,
        upstream_strategy_id: row.try_get("upstream_strategy_id")?,
        anchor_price: row.try_get("anchor_price")?,
        activated_at: row.try_get("activated_at")?,
        logical_activated_at: row.try_get("logical_activated_at")?,
        lock_until: row.try_get("lock_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}

async fn load_symbols(conn: &mut SqliteConnection, strategy_id: &str) -> Result<Vec<StrategySymbol>> {
    let rows = sqlx::query(
        r#"
        SELECT code, trade_type, contract_id
        FROM strategy_symbols
        WHERE strategy_id = ?
        ORDER BY position ASC, id ASC
        "#,
    )
    .bind(strategy_id)
    .fetch_all(conn)
    .await?;

    rows.iter()
        .map(|row| {
            let trade_type_raw: String = row.try_get("trade_type")?;
            let trade_type = crate::domain::SymbolTradeType::try_from(trade_type_raw.as_str())
                .map_err(SentraError::Internal)?;
            Ok(StrategySymbol {
                code: row.try_get("code")?,
                trade_type,
                contract_id: row.try_get("contract_id")?,
            })
        })
        .collect()
}

async fn replace_symbols(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    symbols: &[StrategySymbol],
) -> Result<()> {
    sqlx::query("DELETE FROM strategy_symbols WHERE strategy_id = ?")
        .bind(strategy_id)
        .execute(&mut *conn)
        .await?;
    for (position, symbol) in symbols.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO strategy_symbols (strategy_id, code, trade_type, position, contract_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(strategy_id)
        .bind(&symbol.code)
        .bind(symbol.trade_type.as_str())
        .bind(position as i64)
        .bind(symbol.contract_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn reset_condition_states(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    conditions: &[ConditionItem],
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("DELETE FROM condition_states WHERE strategy_id = ?")
        .bind(strategy_id)
        .execute(&mut *conn)
        .await?;
    for condition in conditions {
        let Some(condition_id) = condition.condition_id.as_deref() else {
            continue;
        };
        sqlx::query(
            r#"
            INSERT INTO condition_states (strategy_id, condition_id, state, updated_at)
            VALUES (?, ?, 'NOT_EVALUATED', ?)
            "#,
        )
        .bind(strategy_id)
        .bind(condition_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Forward walk over `next_strategy_id` edges; errors with CYCLE_DETECTED
/// when setting `from_id -> next_id` would close a loop. Depth is bounded by
/// the total strategy count.
pub(crate) async fn detect_cycle(
    conn: &mut SqliteConnection,
    from_id: &str,
    next_id: &str,
) -> Result<()> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM strategies WHERE is_deleted = 0")
        .fetch_one(&mut *conn)
        .await?;

    let mut visited = vec![from_id.to_string()];
    let mut cursor = next_id.to_string();
    for _ in 0..=total {
        if visited.iter().any(|id| id == &cursor) {
            return Err(SentraError::CycleDetected {
                strategy_id: from_id.to_string(),
                via: cursor,
            });
        }
        visited.push(cursor.clone());
        let next: Option<Option<String>> = sqlx::query_scalar(
            "SELECT next_strategy_id FROM v_strategies_active WHERE id = ?",
        )
        .bind(&cursor)
        .fetch_optional(&mut *conn)
        .await?;
        match next.flatten() {
            Some(next) => cursor = next,
            None => return Ok(()),
        }
    }
    Ok(())
}

/// Guarded status update: the single write path for `status`. Applies
/// `mutations`, bumps `version`, appends the audit event, all inside the
/// caller's transaction. Rejects non-admissible transitions before touching
/// the row and never partially mutates.
pub(crate) async fn apply_transition(
    conn: &mut SqliteConnection,
    strategy_id: &str,
    from: StrategyStatus,
    to: StrategyStatus,
    expected_version: Option<i64>,
    mutations: &TransitionMutations,
    event: Option<(&str, &str)>,
    now: DateTime<Utc>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(SentraError::InvalidTransition {
            strategy_id: strategy_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let mut sets = vec![
        "status = ?".to_string(),
        "updated_at = ?".to_string(),
        "version = version + 1".to_string(),
    ];
    if mutations.activated_at.is_some() {
        sets.push("activated_at = ?".to_string());
    }
    if mutations.logical_activated_at.is_some() {
        sets.push("logical_activated_at = ?".to_string());
    }
    if mutations.expire_at.is_some() {
        sets.push("expire_at = ?".to_string());
    }
    if mutations.anchor_price.is_some() {
        sets.push("anchor_price = ?".to_string());
    }
    if mutations.upstream_strategy_id.is_some() {
        sets.push("upstream_strategy_id = ?".to_string());
    }
    if mutations.upstream_only_activation.is_some() {
        sets.push("upstream_only_activation = ?".to_string());
    }
    if mutations.conditions_json.is_some() {
        sets.push("conditions_json = ?".to_string());
    }

    let mut sql = format!(
        "UPDATE strategies SET {} WHERE id = ? AND status = ? AND is_deleted = 0",
        sets.join(", ")
    );
    if expected_version.is_some() {
        sql.push_str(" AND version = ?");
    }

    let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now);
    if let Some(activated_at) = mutations.activated_at {
        query = query.bind(activated_at);
    }
    if let Some(logical_activated_at) = mutations.logical_activated_at {
        query = query.bind(logical_activated_at);
    }
    if let Some(expire_at) = mutations.expire_at {
        query = query.bind(expire_at);
    }
    if let Some(anchor_price) = mutations.anchor_price {
        query = query.bind(anchor_price);
    }
    if let Some(upstream) = &mutations.upstream_strategy_id {
        query = query.bind(upstream);
    }
    if let Some(upstream_only) = mutations.upstream_only_activation {
        query = query.bind(upstream_only);
    }
    if let Some(conditions_json) = &mutations.conditions_json {
        query = query.bind(conditions_json);
    }
    query = query.bind(strategy_id).bind(from.as_str());
    if let Some(version) = expected_version {
        query = query.bind(version);
    }

    let affected = query.execute(&mut *conn).await?.rows_affected();
    if affected == 0 {
        let current = sqlx::query(
            "SELECT status, version FROM strategies WHERE id = ? AND is_deleted = 0",
        )
        .bind(strategy_id)
        .fetch_optional(&mut *conn)
        .await?;
        return match current {
            None => Err(SentraError::NotFound {
                resource: "strategy",
                id: strategy_id.to_string(),
            }),
            Some(row) => {
                let actual: String = row.try_get("status")?;
                if actual != from.as_str() {
                    Err(SentraError::InvalidTransition {
                        strategy_id: strategy_id.to_string(),
                        from: actual,
                        to: to.to_string(),
                    })
                } else {
                    Err(SentraError::VersionConflict(strategy_id.to_string()))
                }
            }
        };
    }

    if let Some((event_type, detail)) = event {
        append_event_tx(conn, strategy_id, event_type, detail, now).await?;
    }
    debug!(strategy_id, from = %from, to = %to, "strategy transition");
    Ok(())
}

impl SentraStore {
    pub async fn get_strategy(&self, id: &str) -> Result<StrategyRecord> {
        self.get_strategy_opt(id).await?.ok_or_else(|| SentraError::NotFound {
            resource: "strategy",
            id: normalize_id(id),
        })
    }

    pub async fn get_strategy_opt(&self, id: &str) -> Result<Option<StrategyRecord>> {
        let id = normalize_id(id);
        let mut conn = self.pool().acquire().await?;
        let row = sqlx::query("SELECT * FROM v_strategies_active WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = record_from_row(&row)?;
        record.symbols = load_symbols(&mut conn, &record.id).await?;
        Ok(Some(record))
    }

    pub async fn list_strategies(&self) -> Result<Vec<StrategyRecord>> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query("SELECT * FROM v_strategies_active ORDER BY updated_at DESC, id ASC")
            .fetch_all(&mut *conn)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            record.symbols = load_symbols(&mut conn, &record.id).await?;
            records.push(record);
        }
        Ok(records)
    }

    /// Create a strategy; an `idempotency_key` collision returns the
    /// existing record unchanged.
    pub async fn create_strategy(&self, input: CreateStrategyInput) -> Result<StrategyRecord> {
        let currency = input
            .currency
            .as_deref()
            .unwrap_or("USD")
            .trim()
            .to_uppercase();
        if currency != "USD" {
            return Err(SentraError::Validation(format!(
                "currency must be USD, got {currency}"
            )));
        }
        let profile = resolve_market_profile(&input.market, Some(input.trade_type))?;
        let symbols: Vec<StrategySymbol> = input
            .symbols
            .iter()
            .map(|s| StrategySymbol {
                code: normalize_id(&s.code),
                trade_type: s.trade_type,
                contract_id: s.contract_id,
            })
            .collect();
        validate_trade_symbol_combo(input.trade_type, &symbols)?;

        if input.conditions.len() > self.max_conditions_per_strategy() {
            return Err(SentraError::Validation(format!(
                "at most {} conditions per strategy, got {}",
                self.max_conditions_per_strategy(),
                input.conditions.len()
            )));
        }
        let conditions = normalize_conditions(&input.conditions);
        let symbol_codes: Vec<String> = symbols.iter().map(|s| s.code.clone()).collect();
        for condition in &conditions {
            condition.validate(&symbol_codes)?;
        }

        if let Some(action) = &input.trade_action {
            action.validate(input.trade_type)?;
            if !action.compatible_with(profile.sec_type) {
                return Err(SentraError::Validation(format!(
                    "market={} ({}) does not support action_type={}",
                    profile.market,
                    profile.sec_type,
                    action.action_type()
                )));
            }
        }

        validate_expiry(input.expire_mode, input.expire_in_seconds, input.expire_at)?;
        let expire_at = match input.expire_mode {
            // Relative expiry resolves to an absolute instant at activation.
            ExpireMode::Relative => None,
            ExpireMode::Absolute => input.expire_at,
        };

        let next_strategy_id = normalize_optional_id(input.next_strategy_id.as_deref());

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        if let Some(key) = input
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM v_strategies_active WHERE idempotency_key = ?",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing_id) = existing {
                tx.rollback().await?;
                info!(idempotency_key = key, strategy_id = %existing_id, "idempotent create hit");
                return self.get_strategy(&existing_id).await;
            }
        }

        let id = match normalize_optional_id(input.id.as_deref()) {
            Some(id) => id,
            None => format!("S-{}", &Uuid::new_v4().simple().to_string()[..8].to_uppercase()),
        };
        if let Some(next) = &next_strategy_id {
            if next == &id {
                return Err(SentraError::Validation(
                    "next_strategy_id must not reference the strategy itself".to_string(),
                ));
            }
        }
        let duplicate: Option<i64> = sqlx::query_scalar("SELECT 1 FROM strategies WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;
        if duplicate.is_some() {
            return Err(SentraError::Validation(format!(
                "strategy {id} already exists"
            )));
        }

        if let Some(next) = &next_strategy_id {
            detect_cycle(&mut tx, &id, next).await?;
        }

        let conditions_json = serde_json::to_string(&conditions)?;
        let trade_action_json = input
            .trade_action
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO strategies (
              id, idempotency_key, description, market, trade_type, currency,
              upstream_only_activation, expire_mode, expire_in_seconds, expire_at,
              status, condition_logic, conditions_json, trade_action_json,
              next_strategy_id, next_strategy_note, created_at, updated_at, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING_ACTIVATION', ?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&id)
        .bind(
            input
                .idempotency_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty()),
        )
        .bind(&input.description)
        .bind(profile.market)
        .bind(input.trade_type.as_str())
        .bind(&currency)
        .bind(input.upstream_only_activation)
        .bind(input.expire_mode.as_str())
        .bind(match input.expire_mode {
            ExpireMode::Relative => input.expire_in_seconds,
            ExpireMode::Absolute => None,
        })
        .bind(expire_at)
        .bind(input.condition_logic.as_str())
        .bind(&conditions_json)
        .bind(trade_action_json)
        .bind(&next_strategy_id)
        .bind(&input.next_strategy_note)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        replace_symbols(&mut tx, &id, &symbols).await?;
        reset_condition_states(&mut tx, &id, &conditions, now).await?;
        append_event_tx(&mut tx, &id, "CREATED", "strategy created", now).await?;

        tx.commit().await?;
        self.get_strategy(&id).await
    }

    /// Edit basic fields; allowed only while editable and resets status to
    /// PENDING_ACTIVATION with a version bump.
    pub async fn patch_basic(&self, id: &str, patch: BasicPatchInput) -> Result<StrategyRecord> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let record = self.load_editable(&mut tx, id, now).await?;

        let trade_type = patch.trade_type.unwrap_or(record.trade_type);
        let symbols: Vec<StrategySymbol> = match &patch.symbols {
            Some(symbols) => symbols
                .iter()
                .map(|s| StrategySymbol {
                    code: normalize_id(&s.code),
                    trade_type: s.trade_type,
                    contract_id: s.contract_id,
                })
                .collect(),
            None => record.symbols.clone(),
        };
        validate_trade_symbol_combo(trade_type, &symbols)?;
        let profile = resolve_market_profile(&record.market, Some(trade_type))?;
        if let Some(action) = &record.trade_action {
            action.validate(trade_type)?;
            if !action.compatible_with(profile.sec_type) {
                return Err(SentraError::Validation(format!(
                    "existing trade_action {} incompatible with trade_type={trade_type}",
                    action.action_type()
                )));
            }
        }

        let expire_mode = patch.expire_mode.unwrap_or(record.expire_mode);
        let expire_in_seconds = patch.expire_in_seconds.or(record.expire_in_seconds);
        let expire_at = match expire_mode {
            ExpireMode::Relative => None,
            ExpireMode::Absolute => patch.expire_at.or(record.expire_at),
        };
        validate_expiry(expire_mode, expire_in_seconds, expire_at)?;

        let description = patch.description.unwrap_or_else(|| record.description.clone());
        let upstream_only = patch
            .upstream_only_activation
            .unwrap_or(record.upstream_only_activation);

        let affected = sqlx::query(
            r#"
            UPDATE strategies
            SET description = ?,
                trade_type = ?,
                upstream_only_activation = ?,
                expire_mode = ?,
                expire_in_seconds = ?,
                expire_at = ?,
                status = 'PENDING_ACTIVATION',
                updated_at = ?,
                version = version + 1
            WHERE id = ? AND status = ? AND version = ? AND is_deleted = 0
            "#,
        )
        .bind(&description)
        .bind(trade_type.as_str())
        .bind(upstream_only)
        .bind(expire_mode.as_str())
        .bind(match expire_mode {
            ExpireMode::Relative => expire_in_seconds,
            ExpireMode::Absolute => None,
        })
        .bind(expire_at)
        .bind(now)
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(record.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(SentraError::VersionConflict(record.id));
        }

        if patch.symbols.is_some() {
            replace_symbols(&mut tx, &record.id, &symbols).await?;
        }
        append_event_tx(&mut tx, &record.id, "BASIC_UPDATED", "basic fields updated", now).await?;
        tx.commit().await?;
        self.get_strategy(&record.id).await
    }

    /// Replace the condition set; resets runtime state to NOT_EVALUATED.
    pub async fn put_conditions(
        &self,
        id: &str,
        input: ConditionsPutInput,
    ) -> Result<StrategyRecord> {
        if input.conditions.len() > self.max_conditions_per_strategy() {
            return Err(SentraError::Validation(format!(
                "at most {} conditions per strategy, got {}",
                self.max_conditions_per_strategy(),
                input.conditions.len()
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let record = self.load_editable(&mut tx, id, now).await?;

        let conditions = normalize_conditions(&input.conditions);
        let symbol_codes = record.symbol_codes();
        for condition in &conditions {
            condition.validate(&symbol_codes)?;
        }
        let conditions_json = serde_json::to_string(&conditions)?;

        let affected = sqlx::query(
            r#"
            UPDATE strategies
            SET condition_logic = ?,
                conditions_json = ?,
                status = 'PENDING_ACTIVATION',
                updated_at = ?,
                version = version + 1
            WHERE id = ? AND status = ? AND version = ? AND is_deleted = 0
            "#,
        )
        .bind(input.condition_logic.as_str())
        .bind(&conditions_json)
        .bind(now)
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(record.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(SentraError::VersionConflict(record.id));
        }

        reset_condition_states(&mut tx, &record.id, &conditions, now).await?;
        // Monitoring watermarks refer to the old condition set.
        sqlx::query("DELETE FROM strategy_runs WHERE strategy_id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await?;
        append_event_tx(&mut tx, &record.id, "CONDITIONS_UPDATED", "conditions updated", now)
            .await?;
        tx.commit().await?;
        self.get_strategy(&record.id).await
    }

    /// Replace trade action + chain link; validates action compatibility and
    /// rejects cycles.
    pub async fn put_actions(&self, id: &str, input: ActionsPutInput) -> Result<StrategyRecord> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let record = self.load_editable(&mut tx, id, now).await?;

        if let Some(action) = &input.trade_action {
            action.validate(record.trade_type)?;
            let profile = resolve_market_profile(&record.market, Some(record.trade_type))?;
            if !action.compatible_with(profile.sec_type) {
                return Err(SentraError::Validation(format!(
                    "market={} ({}) does not support action_type={}",
                    profile.market,
                    profile.sec_type,
                    action.action_type()
                )));
            }
        }

        let next_strategy_id = normalize_optional_id(input.next_strategy_id.as_deref());
        if let Some(next) = &next_strategy_id {
            if next == &record.id {
                return Err(SentraError::Validation(
                    "next_strategy_id must not reference the strategy itself".to_string(),
                ));
            }
            detect_cycle(&mut tx, &record.id, next).await?;
        }

        let trade_action_json = input
            .trade_action
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = sqlx::query(
            r#"
            UPDATE strategies
            SET trade_action_json = ?,
                next_strategy_id = ?,
                next_strategy_note = ?,
                status = 'PENDING_ACTIVATION',
                updated_at = ?,
                version = version + 1
            WHERE id = ? AND status = ? AND version = ? AND is_deleted = 0
            "#,
        )
        .bind(trade_action_json)
        .bind(&next_strategy_id)
        .bind(&input.next_strategy_note)
        .bind(now)
        .bind(&record.id)
        .bind(record.status.as_str())
        .bind(record.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(SentraError::VersionConflict(record.id));
        }

        append_event_tx(&mut tx, &record.id, "ACTIONS_UPDATED", "follow-up actions updated", now)
            .await?;
        tx.commit().await?;
        self.get_strategy(&record.id).await
    }

    /// Soft delete; downstream references to this strategy are cleared.
    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let id = normalize_id(id);
        let mut tx = self.pool().begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE strategies
            SET is_deleted = 1, deleted_at = ?, updated_at = ?, lock_until = NULL
            WHERE id = ? AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(SentraError::NotFound {
                resource: "strategy",
                id,
            });
        }
        sqlx::query("UPDATE strategies SET next_strategy_id = NULL WHERE next_strategy_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        append_event_tx(&mut tx, &id, "DELETED", "strategy deleted", now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The only public path that changes `status`.
    pub async fn transition(
        &self,
        id: &str,
        from: StrategyStatus,
        to: StrategyStatus,
        expected_version: Option<i64>,
        mutations: TransitionMutations,
        event: Option<(&str, &str)>,
    ) -> Result<StrategyRecord> {
        let id = normalize_id(id);
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        apply_transition(&mut tx, &id, from, to, expected_version, &mutations, event, now)
            .await?;
        tx.commit().await?;
        self.get_strategy(&id).await
    }

    // ==================== Control operations ====================

    /// Manual activation: eligibility gate, then PENDING_ACTIVATION -> VERIFYING.
    pub async fn activate(&self, id: &str) -> Result<StrategyRecord> {
        let record = self.get_strategy(id).await?;
        ensure_unlocked(&record)?;
        if record.status != StrategyStatus::PendingActivation {
            return Err(SentraError::InvalidTransition {
                strategy_id: record.id,
                from: record.status.to_string(),
                to: StrategyStatus::Verifying.to_string(),
            });
        }
        if record.upstream_only_activation {
            return Err(SentraError::UpstreamOnlyActivation(record.id));
        }
        if record.conditions.is_empty() {
            return Err(SentraError::Validation(
                "conditions not configured".to_string(),
            ));
        }
        if record.trade_action.is_none() && record.next_strategy_id.is_none() {
            return Err(SentraError::Validation(
                "follow-up actions not configured".to_string(),
            ));
        }
        self.transition(
            &record.id,
            StrategyStatus::PendingActivation,
            StrategyStatus::Verifying,
            Some(record.version),
            TransitionMutations::default(),
            Some(("ACTIVATION_REQUESTED", "manual activation requested")),
        )
        .await
    }

    pub async fn pause(&self, id: &str) -> Result<StrategyRecord> {
        let record = self.get_strategy(id).await?;
        ensure_unlocked(&record)?;
        self.transition(
            &record.id,
            StrategyStatus::Active,
            StrategyStatus::Paused,
            Some(record.version),
            TransitionMutations::default(),
            Some(("PAUSED", "strategy paused")),
        )
        .await
    }

    pub async fn resume(&self, id: &str) -> Result<StrategyRecord> {
        let record = self.get_strategy(id).await?;
        ensure_unlocked(&record)?;
        self.transition(
            &record.id,
            StrategyStatus::Paused,
            StrategyStatus::Active,
            Some(record.version),
            TransitionMutations::default(),
            Some(("RESUMED", "strategy resumed")),
        )
        .await
    }

    /// Cancel; a terminal strategy is a no-op, an in-flight order blocks.
    pub async fn cancel(&self, id: &str) -> Result<StrategyRecord> {
        let record = self.get_strategy(id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        ensure_unlocked(&record)?;
        if record.status == StrategyStatus::OrderSubmitted {
            return Err(SentraError::InvalidTransition {
                strategy_id: record.id,
                from: record.status.to_string(),
                to: StrategyStatus::Cancelled.to_string(),
            });
        }
        self.transition(
            &record.id,
            record.status,
            StrategyStatus::Cancelled,
            Some(record.version),
            TransitionMutations::default(),
            Some(("CANCELLED", "strategy cancelled")),
        )
        .await
    }

    /// Write a resolved contract id back onto a symbol row (preflight).
    pub async fn set_symbol_contract_id(
        &self,
        strategy_id: &str,
        code: &str,
        contract_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE strategy_symbols SET contract_id = ? WHERE strategy_id = ? AND code = ?",
        )
        .bind(contract_id)
        .bind(normalize_id(strategy_id))
        .bind(code)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Chain activation (C6): insert the `(trigger_event_id, downstream)`
    /// row and move the downstream PENDING_ACTIVATION -> VERIFYING in one
    /// transaction. Returns false when the activation already happened (row
    /// exists) or the downstream moved concurrently.
    #[allow(clippy::too_many_arguments)]
    pub async fn chain_activate(
        &self,
        upstream_id: &str,
        downstream_id: &str,
        trigger_event_id: &str,
        triggered_at: DateTime<Utc>,
        anchor_price: Option<f64>,
        market_snapshot: Option<&serde_json::Value>,
        context: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let upstream_id = normalize_id(upstream_id);
        let downstream_id = normalize_id(downstream_id);
        let mut tx = self.pool().begin().await?;

        let inserted = super::events::insert_activation_tx(
            &mut tx,
            &upstream_id,
            &downstream_id,
            trigger_event_id,
            triggered_at,
            market_snapshot,
            context,
        )
        .await?;
        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }

        let mutations = TransitionMutations {
            logical_activated_at: Some(triggered_at),
            upstream_strategy_id: Some(upstream_id.clone()),
            anchor_price,
            ..Default::default()
        };
        let detail = format!("activated by upstream strategy {upstream_id}");
        match apply_transition(
            &mut tx,
            &downstream_id,
            StrategyStatus::PendingActivation,
            StrategyStatus::Verifying,
            None,
            &mutations,
            Some(("CHAIN_ACTIVATION", &detail)),
            now,
        )
        .await
        {
            Ok(()) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(SentraError::InvalidTransition { .. }) => {
                tx.rollback().await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    // ==================== Leases ====================

    /// Acquire the exclusive execution lease for one run. Returns the
    /// `lock_until` token on success; `None` when the snapshot moved or the
    /// lease is held.
    pub async fn acquire_lease(
        &self,
        id: &str,
        expected_status: StrategyStatus,
        expected_version: i64,
        ttl_seconds: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let lock_until = now + Duration::seconds(ttl_seconds as i64);
        let affected = sqlx::query(
            r#"
            UPDATE strategies
            SET lock_until = ?
            WHERE id = ?
              AND status = ?
              AND version = ?
              AND is_deleted = 0
              AND (lock_until IS NULL OR lock_until <= ?)
            "#,
        )
        .bind(lock_until)
        .bind(normalize_id(id))
        .bind(expected_status.as_str())
        .bind(expected_version)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok((affected > 0).then_some(lock_until))
    }

    /// Release a lease while still holding the same token.
    pub async fn release_lease(&self, id: &str, token: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE strategies SET lock_until = NULL WHERE id = ? AND lock_until = ? AND is_deleted = 0",
        )
        .bind(normalize_id(id))
        .bind(token)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Re-read the leased row, confirming the token still holds.
    pub async fn get_leased(
        &self,
        id: &str,
        token: DateTime<Utc>,
    ) -> Result<Option<StrategyRecord>> {
        let id = normalize_id(id);
        let mut conn = self.pool().acquire().await?;
        let row = sqlx::query("SELECT * FROM v_strategies_active WHERE id = ? AND lock_until = ?")
            .bind(&id)
            .bind(token)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut record = record_from_row(&row)?;
        record.symbols = load_symbols(&mut conn, &record.id).await?;
        Ok(Some(record))
    }

    /// Clear leases whose `lock_until` already elapsed (boot recovery).
    pub async fn clear_stale_leases(&self) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE strategies SET lock_until = NULL WHERE lock_until IS NOT NULL AND lock_until <= ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(affected)
    }

    // ==================== Scan queries ====================

    /// Strategies the scheduler should pick up, oldest first.
    pub async fn list_scannable(&self) -> Result<Vec<ScanCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, version
            FROM v_strategies_active
            WHERE status IN ('VERIFYING', 'ACTIVE', 'TRIGGERED', 'ORDER_SUBMITTED')
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                let status_raw: String = row.try_get("status")?;
                Ok(ScanCandidate {
                    id: row.try_get("id")?,
                    status: StrategyStatus::try_from(status_raw.as_str())
                        .map_err(SentraError::Internal)?,
                    version: row.try_get("version")?,
                })
            })
            .collect()
    }

    /// Non-terminal strategies the expiry sweep must inspect.
    pub async fn list_expirable(&self) -> Result<Vec<StrategyRecord>> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM v_strategies_active
            WHERE status IN ('PENDING_ACTIVATION', 'VERIFY_FAILED', 'ACTIVE', 'PAUSED', 'TRIGGERED', 'ORDER_SUBMITTED')
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            record.symbols = load_symbols(&mut conn, &record.id).await?;
            records.push(record);
        }
        Ok(records)
    }

    /// Strategies with an in-flight order (boot reconciliation).
    pub async fn list_order_submitted(&self) -> Result<Vec<StrategyRecord>> {
        let mut conn = self.pool().acquire().await?;
        let rows = sqlx::query(
            "SELECT * FROM v_strategies_active WHERE status = 'ORDER_SUBMITTED' ORDER BY updated_at ASC",
        )
        .fetch_all(&mut *conn)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            record.symbols = load_symbols(&mut conn, &record.id).await?;
            records.push(record);
        }
        Ok(records)
    }

    // ==================== Internals ====================

    async fn load_editable(
        &self,
        tx: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<StrategyRecord> {
        let id = normalize_id(id);
        let row = sqlx::query("SELECT * FROM v_strategies_active WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| SentraError::NotFound {
                resource: "strategy",
                id: id.clone(),
            })?;
        let mut record = record_from_row(&row)?;
        record.symbols = load_symbols(&mut *tx, &record.id).await?;
        if let Some(lock_until) = record.lock_until {
            if lock_until > now {
                return Err(SentraError::StrategyLocked {
                    strategy_id: record.id,
                    lock_until,
                });
            }
        }
        if !record.status.is_editable() {
            return Err(SentraError::InvalidTransition {
                strategy_id: record.id.clone(),
                from: record.status.to_string(),
                to: StrategyStatus::PendingActivation.to_string(),
            });
        }
        Ok(record)
    }
}

/// Conflicting user operations on a leased strategy fail with
/// STRATEGY_LOCKED carrying `lock_until` so the caller can retry.
pub(crate) fn ensure_unlocked(record: &StrategyRecord) -> Result<()> {
    if let Some(lock_until) = record.lock_until {
        if lock_until > Utc::now() {
            return Err(SentraError::StrategyLocked {
                strategy_id: record.id.clone(),
                lock_until,
            });
        }
    }
    Ok(())
}
