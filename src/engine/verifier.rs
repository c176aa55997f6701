//! Pre-trade verification (C7): an ordered, versioned rule set evaluated
//! against the action about to be submitted. Every rule evaluation is
//! recorded as a VerificationEvent; the first failure stops the chain and
//! the strategy goes TRIGGERED -> FAILED without an order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::EngineContext;
use crate::config::VerificationConfig;
use crate::domain::{resolve_market_profile, StrategyRecord, TradeAction, VerificationEvent};
use crate::error::Result;

/// Bumped whenever the built-in rule semantics change.
pub const RULE_SET_VERSION: i64 = 2;

#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub failed_rule: Option<String>,
    pub failed_reason: Option<String>,
}

struct RuleResult {
    rule_id: &'static str,
    passed: bool,
    reason: String,
    snapshot: serde_json::Value,
}

pub struct PreTradeVerifier;

impl PreTradeVerifier {
    /// Run the rule set for a minted trade_id. Rules are evaluated in
    /// order against the config snapshot pinned at run start.
    pub async fn verify(
        ctx: &EngineContext,
        record: &StrategyRecord,
        action: &TradeAction,
        trade_id: &str,
        price_proxy: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome> {
        let rules = ctx.config.verification.clone();
        let mut outcome = VerificationOutcome {
            passed: true,
            failed_rule: None,
            failed_reason: None,
        };

        for rule in [
            Self::rule_action_compatibility(record, action),
            Self::rule_notional_cap(&rules, action, price_proxy),
            Self::rule_order_type_allowlist(&rules, action),
        ] {
            ctx.store
                .insert_verification_event(&VerificationEvent {
                    trade_id: trade_id.to_string(),
                    strategy_id: record.id.clone(),
                    rule_id: rule.rule_id.to_string(),
                    rule_version: RULE_SET_VERSION,
                    passed: rule.passed,
                    reason: rule.reason.clone(),
                    snapshot: Some(rule.snapshot.clone()),
                    created_at: now,
                })
                .await?;

            if !rule.passed {
                warn!(
                    strategy_id = %record.id,
                    trade_id,
                    rule_id = rule.rule_id,
                    reason = %rule.reason,
                    "pre-trade verification failed"
                );
                outcome.passed = false;
                outcome.failed_rule = Some(rule.rule_id.to_string());
                outcome.failed_reason = Some(rule.reason);
                break;
            }
        }

        if outcome.passed {
            info!(strategy_id = %record.id, trade_id, "pre-trade verification passed");
        }
        Ok(outcome)
    }

    /// Sec-type and intent compatibility, re-checked at trade time.
    fn rule_action_compatibility(record: &StrategyRecord, action: &TradeAction) -> RuleResult {
        let snapshot = serde_json::json!({
            "trade_type": record.trade_type.as_str(),
            "market": record.market,
            "action_type": action.action_type(),
        });
        let result = resolve_market_profile(&record.market, Some(record.trade_type))
            .and_then(|profile| {
                if !action.compatible_with(profile.sec_type) {
                    return Err(crate::error::SentraError::Validation(format!(
                        "action_type={} incompatible with sec_type={}",
                        action.action_type(),
                        profile.sec_type
                    )));
                }
                action.validate(record.trade_type)
            });
        match result {
            Ok(()) => RuleResult {
                rule_id: "action_compatibility",
                passed: true,
                reason: "action compatible with market and intent".to_string(),
                snapshot,
            },
            Err(err) => RuleResult {
                rule_id: "action_compatibility",
                passed: false,
                reason: err.to_string(),
                snapshot,
            },
        }
    }

    /// quantity x price_proxy must stay inside max_notional_usd.
    fn rule_notional_cap(
        rules: &VerificationConfig,
        action: &TradeAction,
        price_proxy: Option<Decimal>,
    ) -> RuleResult {
        let quantity = action.quantity();
        let proxy = action.limit_price().or(price_proxy);
        let snapshot = serde_json::json!({
            "quantity": quantity,
            "price_proxy": proxy,
            "max_notional_usd": rules.max_notional_usd,
        });
        let Some(proxy) = proxy else {
            return RuleResult {
                rule_id: "notional_cap",
                passed: false,
                reason: "no price proxy available to bound notional".to_string(),
                snapshot,
            };
        };
        let notional = quantity * proxy;
        if notional <= rules.max_notional_usd {
            RuleResult {
                rule_id: "notional_cap",
                passed: true,
                reason: format!("notional {notional} within cap {}", rules.max_notional_usd),
                snapshot,
            }
        } else {
            RuleResult {
                rule_id: "notional_cap",
                passed: false,
                reason: format!("notional {notional} exceeds cap {}", rules.max_notional_usd),
                snapshot,
            }
        }
    }

    fn rule_order_type_allowlist(rules: &VerificationConfig, action: &TradeAction) -> RuleResult {
        let order_type = action.order_type().as_str();
        let snapshot = serde_json::json!({
            "order_type": order_type,
            "allowed_order_types": rules.allowed_order_types,
        });
        let allowed = rules
            .allowed_order_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(order_type));
        RuleResult {
            rule_id: "order_type_allowlist",
            passed: allowed,
            reason: if allowed {
                format!("order_type {order_type} allowed")
            } else {
                format!("order_type {order_type} not in allowlist")
            },
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSide, OrderType, TimeInForce};
    use rust_decimal_macros::dec;

    fn action(quantity: Decimal, order_type: OrderType, limit_price: Option<Decimal>) -> TradeAction {
        TradeAction::StockTrade {
            symbol: "SLV".to_string(),
            side: OrderSide::Buy,
            quantity,
            order_type,
            limit_price,
            tif: TimeInForce::Day,
            allow_overnight: false,
            cancel_on_expiry: false,
        }
    }

    fn rules(max_notional: Decimal) -> VerificationConfig {
        VerificationConfig {
            max_notional_usd: max_notional,
            allowed_order_types: vec!["MKT".to_string(), "LMT".to_string()],
        }
    }

    #[test]
    fn test_notional_cap() {
        // 100 x $60 = $6000 against a $5000 cap
        let result = PreTradeVerifier::rule_notional_cap(
            &rules(dec!(5000)),
            &action(dec!(100), OrderType::Market, None),
            Some(dec!(60)),
        );
        assert!(!result.passed);

        let result = PreTradeVerifier::rule_notional_cap(
            &rules(dec!(10000)),
            &action(dec!(100), OrderType::Market, None),
            Some(dec!(60)),
        );
        assert!(result.passed);
    }

    #[test]
    fn test_notional_prefers_limit_price() {
        // limit price wins over the market proxy
        let result = PreTradeVerifier::rule_notional_cap(
            &rules(dec!(5000)),
            &action(dec!(100), OrderType::Limit, Some(dec!(40))),
            Some(dec!(60)),
        );
        assert!(result.passed);
    }

    #[test]
    fn test_notional_requires_some_proxy() {
        let result = PreTradeVerifier::rule_notional_cap(
            &rules(dec!(5000)),
            &action(dec!(100), OrderType::Market, None),
            None,
        );
        assert!(!result.passed);
    }

    #[test]
    fn test_order_type_allowlist() {
        let mut only_limit = rules(dec!(5000));
        only_limit.allowed_order_types = vec!["LMT".to_string()];

        let result = PreTradeVerifier::rule_order_type_allowlist(
            &only_limit,
            &action(dec!(10), OrderType::Market, None),
        );
        assert!(!result.passed);

        let result = PreTradeVerifier::rule_order_type_allowlist(
            &only_limit,
            &action(dec!(10), OrderType::Limit, Some(dec!(1))),
        );
        assert!(result.passed);
    }
}
