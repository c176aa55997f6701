use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::action::TradeAction;
use crate::domain::condition::{ConditionItem, ConditionLogic};
use crate::domain::state::StrategyStatus;
use crate::error::{Result, SentraError};

/// Strategy-level trade intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Buy,
    Sell,
    Switch,
    Open,
    Close,
    Spread,
}

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "buy",
            TradeType::Sell => "sell",
            TradeType::Switch => "switch",
            TradeType::Open => "open",
            TradeType::Close => "close",
            TradeType::Spread => "spread",
        }
    }

    /// buy/sell/switch are stock intents; open/close/spread are futures.
    pub fn is_stock(&self) -> bool {
        matches!(self, TradeType::Buy | TradeType::Sell | TradeType::Switch)
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TradeType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(TradeType::Buy),
            "sell" => Ok(TradeType::Sell),
            "switch" => Ok(TradeType::Switch),
            "open" => Ok(TradeType::Open),
            "close" => Ok(TradeType::Close),
            "spread" => Ok(TradeType::Spread),
            other => Err(format!("Unknown trade_type: {}", other)),
        }
    }
}

/// Per-symbol leg intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolTradeType {
    Buy,
    Sell,
    Open,
    Close,
    /// Reference-only leg (monitored, never traded)
    Ref,
}

impl SymbolTradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolTradeType::Buy => "buy",
            SymbolTradeType::Sell => "sell",
            SymbolTradeType::Open => "open",
            SymbolTradeType::Close => "close",
            SymbolTradeType::Ref => "ref",
        }
    }
}

impl fmt::Display for SymbolTradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SymbolTradeType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(SymbolTradeType::Buy),
            "sell" => Ok(SymbolTradeType::Sell),
            "open" => Ok(SymbolTradeType::Open),
            "close" => Ok(SymbolTradeType::Close),
            "ref" => Ok(SymbolTradeType::Ref),
            other => Err(format!("Unknown symbol trade_type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpireMode {
    Relative,
    Absolute,
}

impl ExpireMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpireMode::Relative => "relative",
            ExpireMode::Absolute => "absolute",
        }
    }
}

impl fmt::Display for ExpireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExpireMode {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "relative" => Ok(ExpireMode::Relative),
            "absolute" => Ok(ExpireMode::Absolute),
            other => Err(format!("Unknown expire_mode: {}", other)),
        }
    }
}

/// Ordered symbol leg owned by a strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySymbol {
    pub code: String,
    pub trade_type: SymbolTradeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<i64>,
}

impl StrategySymbol {
    pub fn new(code: &str, trade_type: SymbolTradeType) -> Self {
        Self {
            code: code.trim().to_uppercase(),
            trade_type,
            contract_id: None,
        }
    }
}

/// Enforce the strategy/symbol trade-type pairing rules:
/// `{buy,sell,switch}` strategies only carry `{buy,sell,ref}` legs,
/// `{open,close,spread}` only `{open,close,ref}`, plus per-intent
/// minimum leg counts.
pub fn validate_trade_symbol_combo(
    trade_type: TradeType,
    symbols: &[StrategySymbol],
) -> Result<()> {
    if symbols.is_empty() {
        return Err(SentraError::Validation("symbols cannot be empty".to_string()));
    }
    for symbol in symbols {
        if symbol.code.trim().is_empty() {
            return Err(SentraError::Validation(
                "symbol code cannot be empty".to_string(),
            ));
        }
    }

    let count = |t: SymbolTradeType| symbols.iter().filter(|s| s.trade_type == t).count();
    let buys = count(SymbolTradeType::Buy);
    let sells = count(SymbolTradeType::Sell);
    let opens = count(SymbolTradeType::Open);
    let closes = count(SymbolTradeType::Close);
    let stock_legs = buys + sells;
    let fut_legs = opens + closes;

    if trade_type.is_stock() && fut_legs > 0 {
        return Err(SentraError::Validation(format!(
            "trade_type={trade_type} only allows symbol trade_type buy/sell/ref"
        )));
    }
    if !trade_type.is_stock() && stock_legs > 0 {
        return Err(SentraError::Validation(format!(
            "trade_type={trade_type} only allows symbol trade_type open/close/ref"
        )));
    }

    let missing = match trade_type {
        TradeType::Buy if buys < 1 => Some("at least one buy symbol"),
        TradeType::Sell if sells < 1 => Some("at least one sell symbol"),
        TradeType::Switch if buys < 1 || sells < 1 => Some("at least one buy and one sell symbol"),
        TradeType::Open if opens < 1 => Some("at least one open symbol"),
        TradeType::Close if closes < 1 => Some("at least one close symbol"),
        TradeType::Spread if opens < 1 || closes < 1 => {
            Some("at least one open and one close symbol")
        }
        _ => None,
    };
    if let Some(requirement) = missing {
        return Err(SentraError::Validation(format!(
            "trade_type={trade_type} requires {requirement}"
        )));
    }
    Ok(())
}

/// Full persistent strategy row, hydrated with its symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub idempotency_key: Option<String>,
    pub description: String,
    pub market: String,
    pub trade_type: TradeType,
    pub symbols: Vec<StrategySymbol>,
    pub currency: String,
    pub upstream_only_activation: bool,
    pub expire_mode: ExpireMode,
    pub expire_in_seconds: Option<i64>,
    pub expire_at: Option<DateTime<Utc>>,
    pub status: StrategyStatus,
    pub condition_logic: ConditionLogic,
    pub conditions: Vec<ConditionItem>,
    pub trade_action: Option<TradeAction>,
    pub next_strategy_id: Option<String>,
    pub next_strategy_note: Option<String>,
    pub upstream_strategy_id: Option<String>,
    pub anchor_price: Option<f64>,
    pub activated_at: Option<DateTime<Utc>>,
    pub logical_activated_at: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl StrategyRecord {
    /// Manual activation eligibility (capability + reason when blocked).
    pub fn activation_blocker(&self) -> Option<&'static str> {
        if self.status != StrategyStatus::PendingActivation {
            return Some("only PENDING_ACTIVATION can activate");
        }
        if self.upstream_only_activation {
            return Some("upstream_only_activation=true");
        }
        if self.conditions.is_empty() {
            return Some("conditions not configured");
        }
        if self.trade_action.is_none() && self.next_strategy_id.is_none() {
            return Some("follow-up actions not configured");
        }
        None
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_activate: self.activation_blocker().is_none(),
            can_pause: self.status == StrategyStatus::Active,
            can_resume: self.status == StrategyStatus::Paused,
            can_cancel: self.status.is_cancellable(),
        }
    }

    pub fn capability_reasons(&self) -> CapabilityReasons {
        CapabilityReasons {
            can_activate: self.activation_blocker().map(str::to_string),
            can_pause: (self.status != StrategyStatus::Active)
                .then(|| "only ACTIVE can pause".to_string()),
            can_resume: (self.status != StrategyStatus::Paused)
                .then(|| "only PAUSED can resume".to_string()),
            can_cancel: (!self.status.is_cancellable()).then(|| {
                if self.status == StrategyStatus::OrderSubmitted {
                    "order in flight; cancel the order instead".to_string()
                } else {
                    "terminal strategy cannot be cancelled".to_string()
                }
            }),
        }
    }

    /// Monitoring-group projection shown in summaries.
    pub fn trigger_group_status(&self) -> TriggerGroupStatus {
        if self.conditions.is_empty() {
            return TriggerGroupStatus::NotConfigured;
        }
        match self.status {
            StrategyStatus::Expired => TriggerGroupStatus::Expired,
            StrategyStatus::Triggered
            | StrategyStatus::OrderSubmitted
            | StrategyStatus::Filled => TriggerGroupStatus::Triggered,
            _ => TriggerGroupStatus::Monitoring,
        }
    }

    /// Effective expiry instant: the explicit column, else the relative
    /// window anchored at activation (resolved when activation commits).
    pub fn effective_expire_at(&self) -> Option<DateTime<Utc>> {
        if let Some(expire_at) = self.expire_at {
            return Some(expire_at);
        }
        if self.expire_mode == ExpireMode::Relative {
            let seconds = self.expire_in_seconds?;
            let base = self.activated_at?;
            return Some(base + chrono::Duration::seconds(seconds));
        }
        None
    }

    pub fn symbol_codes(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.code.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_activate: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_cancel: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityReasons {
    pub can_activate: Option<String>,
    pub can_pause: Option<String>,
    pub can_resume: Option<String>,
    pub can_cancel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerGroupStatus {
    NotConfigured,
    Monitoring,
    Triggered,
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(specs: &[(&str, SymbolTradeType)]) -> Vec<StrategySymbol> {
        specs
            .iter()
            .map(|(code, tt)| StrategySymbol::new(code, *tt))
            .collect()
    }

    #[test]
    fn test_stock_combos() {
        assert!(validate_trade_symbol_combo(
            TradeType::Buy,
            &symbols(&[("SLV", SymbolTradeType::Buy)])
        )
        .is_ok());

        assert!(validate_trade_symbol_combo(
            TradeType::Switch,
            &symbols(&[
                ("SLV", SymbolTradeType::Sell),
                ("GLD", SymbolTradeType::Buy),
            ])
        )
        .is_ok());

        // switch needs both sides
        assert!(validate_trade_symbol_combo(
            TradeType::Switch,
            &symbols(&[("SLV", SymbolTradeType::Buy)])
        )
        .is_err());

        // futures leg on a stock strategy
        assert!(validate_trade_symbol_combo(
            TradeType::Buy,
            &symbols(&[("SIH6", SymbolTradeType::Open)])
        )
        .is_err());
    }

    #[test]
    fn test_futures_combos() {
        assert!(validate_trade_symbol_combo(
            TradeType::Spread,
            &symbols(&[
                ("SIH6", SymbolTradeType::Close),
                ("SIK6", SymbolTradeType::Open),
            ])
        )
        .is_ok());

        assert!(validate_trade_symbol_combo(
            TradeType::Open,
            &symbols(&[("SIH6", SymbolTradeType::Ref)])
        )
        .is_err());

        assert!(validate_trade_symbol_combo(
            TradeType::Close,
            &symbols(&[("SLV", SymbolTradeType::Buy)])
        )
        .is_err());
    }

    #[test]
    fn test_empty_symbols_rejected() {
        assert!(validate_trade_symbol_combo(TradeType::Buy, &[]).is_err());
    }
}
