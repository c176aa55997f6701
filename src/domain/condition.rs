use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SentraError};

/// Metric a condition observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metric {
    /// Window aggregate of the chosen price basis (USD)
    Price,
    /// max(0, (H - p) / H) against since-activation high (ratio)
    DrawdownPct,
    /// max(0, (p - L) / L) against since-activation low (ratio)
    RallyPct,
    /// aggregate(volume A) / aggregate(volume B) over window (ratio)
    VolumeRatio,
    /// aggregate(volume*price A) / aggregate(volume*price B) (ratio)
    AmountRatio,
    /// price(A) - price(B) on the chosen basis (USD)
    Spread,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Price => "PRICE",
            Metric::DrawdownPct => "DRAWDOWN_PCT",
            Metric::RallyPct => "RALLY_PCT",
            Metric::VolumeRatio => "VOLUME_RATIO",
            Metric::AmountRatio => "AMOUNT_RATIO",
            Metric::Spread => "SPREAD",
        }
    }

    /// Pair metrics need two products with time-aligned series.
    pub fn requires_pair(&self) -> bool {
        matches!(
            self,
            Metric::VolumeRatio | Metric::AmountRatio | Metric::Spread
        )
    }

    /// Drawdown/rally consume since-activation extrema runtime state.
    pub fn requires_extrema(&self) -> bool {
        matches!(self, Metric::DrawdownPct | Metric::RallyPct)
    }

    /// Value units: USD for PRICE/SPREAD, ratio in (0, 1] for the rest.
    pub fn value_is_ratio(&self) -> bool {
        !matches!(self, Metric::Price | Metric::Spread)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the threshold comparison is confirmed over the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerMode {
    LevelInstant,
    LevelConfirm,
    CrossUpInstant,
    CrossUpConfirm,
    CrossDownInstant,
    CrossDownConfirm,
}

impl TriggerMode {
    pub const ALL: [TriggerMode; 6] = [
        TriggerMode::LevelInstant,
        TriggerMode::LevelConfirm,
        TriggerMode::CrossUpInstant,
        TriggerMode::CrossUpConfirm,
        TriggerMode::CrossDownInstant,
        TriggerMode::CrossDownConfirm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::LevelInstant => "LEVEL_INSTANT",
            TriggerMode::LevelConfirm => "LEVEL_CONFIRM",
            TriggerMode::CrossUpInstant => "CROSS_UP_INSTANT",
            TriggerMode::CrossUpConfirm => "CROSS_UP_CONFIRM",
            TriggerMode::CrossDownInstant => "CROSS_DOWN_INSTANT",
            TriggerMode::CrossDownConfirm => "CROSS_DOWN_CONFIRM",
        }
    }

    pub fn is_cross(&self) -> bool {
        matches!(
            self,
            TriggerMode::CrossUpInstant
                | TriggerMode::CrossUpConfirm
                | TriggerMode::CrossDownInstant
                | TriggerMode::CrossDownConfirm
        )
    }

    pub fn is_cross_up(&self) -> bool {
        matches!(self, TriggerMode::CrossUpInstant | TriggerMode::CrossUpConfirm)
    }

    pub fn is_confirm(&self) -> bool {
        matches!(
            self,
            TriggerMode::LevelConfirm
                | TriggerMode::CrossUpConfirm
                | TriggerMode::CrossDownConfirm
        )
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Threshold comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gte => ">=",
            Operator::Lte => "<=",
        }
    }

    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Operator::Gte => observed >= threshold,
            Operator::Lte => observed <= threshold,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scalar extracted from each bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceBasis {
    #[default]
    Close,
    High,
    Low,
    /// WAP when the bar carries one, else OHLC/4
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    SingleProduct,
    PairProducts,
}

/// AND/OR combinator over a strategy's conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

impl ConditionLogic {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionLogic::And => "AND",
            ConditionLogic::Or => "OR",
        }
    }
}

impl fmt::Display for ConditionLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single configured condition, stored as one element of the strategy's
/// `conditions_json` array. Contract ids are resolved during activation
/// preflight and written back into the stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionItem {
    #[serde(default)]
    pub condition_id: Option<String>,
    pub condition_type: ConditionType,
    pub metric: Metric,
    pub trigger_mode: TriggerMode,
    pub evaluation_window: String,
    #[serde(default)]
    pub window_price_basis: PriceBasis,
    pub operator: Operator,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_id_b: Option<i64>,
}

impl ConditionItem {
    /// Caller-facing validation run on create and on putConditions.
    /// Contract resolution and rules-config checks happen later, at
    /// preflight/prepare time.
    pub fn validate(&self, symbol_codes: &[String]) -> Result<()> {
        let cid = self.condition_id.as_deref().unwrap_or("<unassigned>");

        if !self.value.is_finite() {
            return Err(SentraError::Validation(format!(
                "condition {cid}: value must be a finite number"
            )));
        }
        if self.metric.value_is_ratio() && (self.value <= 0.0 || self.value > 1.0) {
            return Err(SentraError::Validation(format!(
                "condition {cid}: {} value must be a ratio in (0, 1], got {}",
                self.metric, self.value
            )));
        }

        match self.condition_type {
            ConditionType::SingleProduct => {
                let product = normalized(self.product.as_deref()).ok_or_else(|| {
                    SentraError::Validation(format!(
                        "condition {cid}: SINGLE_PRODUCT requires product"
                    ))
                })?;
                if self.metric.requires_pair() {
                    return Err(SentraError::Validation(format!(
                        "condition {cid}: metric {} requires PAIR_PRODUCTS",
                        self.metric
                    )));
                }
                if !symbol_codes.iter().any(|code| code == &product) {
                    return Err(SentraError::Validation(format!(
                        "condition {cid}: product {product} not found in strategy symbols"
                    )));
                }
            }
            ConditionType::PairProducts => {
                let product = normalized(self.product.as_deref()).ok_or_else(|| {
                    SentraError::Validation(format!(
                        "condition {cid}: PAIR_PRODUCTS requires product"
                    ))
                })?;
                let product_b = normalized(self.product_b.as_deref()).ok_or_else(|| {
                    SentraError::Validation(format!(
                        "condition {cid}: PAIR_PRODUCTS requires product_b"
                    ))
                })?;
                if product == product_b {
                    return Err(SentraError::Validation(format!(
                        "condition {cid}: product and product_b must differ"
                    )));
                }
                if !self.metric.requires_pair() {
                    return Err(SentraError::Validation(format!(
                        "condition {cid}: metric {} takes a single product",
                        self.metric
                    )));
                }
                for code in [&product, &product_b] {
                    if !symbol_codes.iter().any(|c| c == code) {
                        return Err(SentraError::Validation(format!(
                            "condition {cid}: product {code} not found in strategy symbols"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn normalized_product(&self) -> Option<String> {
        normalized(self.product.as_deref())
    }

    pub fn normalized_product_b(&self) -> Option<String> {
        normalized(self.product_b.as_deref())
    }
}

fn normalized(value: Option<&str>) -> Option<String> {
    let v = value?.trim().to_uppercase();
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

/// Parse a compact window ("1m", "5m", "2h", "1d") into seconds.
pub fn window_to_seconds(window: &str) -> Option<u64> {
    let text = window.trim().to_lowercase();
    if text.len() < 2 {
        return None;
    }
    let (amount_raw, unit) = text.split_at(text.len() - 1);
    let amount: u64 = amount_raw.parse().ok()?;
    if amount == 0 {
        return None;
    }
    match unit {
        "m" => Some(amount * 60),
        "h" => Some(amount * 3600),
        "d" => Some(amount * 86400),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(metric: Metric, condition_type: ConditionType) -> ConditionItem {
        ConditionItem {
            condition_id: Some("c1".to_string()),
            condition_type,
            metric,
            trigger_mode: TriggerMode::LevelInstant,
            evaluation_window: "1m".to_string(),
            window_price_basis: PriceBasis::Close,
            operator: Operator::Lte,
            value: 60.0,
            product: Some("SLV".to_string()),
            product_b: None,
            contract_id: None,
            contract_id_b: None,
        }
    }

    fn symbols() -> Vec<String> {
        vec!["SLV".to_string(), "SPY".to_string(), "QQQ".to_string()]
    }

    #[test]
    fn test_window_to_seconds() {
        assert_eq!(window_to_seconds("1m"), Some(60));
        assert_eq!(window_to_seconds("30m"), Some(1800));
        assert_eq!(window_to_seconds("4h"), Some(14400));
        assert_eq!(window_to_seconds("2d"), Some(172800));
        assert_eq!(window_to_seconds("0m"), None);
        assert_eq!(window_to_seconds("1w"), None);
        assert_eq!(window_to_seconds(""), None);
    }

    #[test]
    fn test_single_product_validation() {
        let cond = condition(Metric::Price, ConditionType::SingleProduct);
        assert!(cond.validate(&symbols()).is_ok());

        let mut missing = cond.clone();
        missing.product = Some("GLD".to_string());
        assert!(missing.validate(&symbols()).is_err());

        let mut pair_metric = cond;
        pair_metric.metric = Metric::Spread;
        assert!(pair_metric.validate(&symbols()).is_err());
    }

    #[test]
    fn test_pair_products_validation() {
        let mut cond = condition(Metric::Spread, ConditionType::PairProducts);
        cond.product = Some("SPY".to_string());
        cond.product_b = Some("QQQ".to_string());
        cond.value = -120.0;
        assert!(cond.validate(&symbols()).is_ok());

        let mut same = cond.clone();
        same.product_b = Some("SPY".to_string());
        assert!(same.validate(&symbols()).is_err());

        let mut missing_b = cond;
        missing_b.product_b = None;
        assert!(missing_b.validate(&symbols()).is_err());
    }

    #[test]
    fn test_ratio_value_range() {
        let mut cond = condition(Metric::DrawdownPct, ConditionType::SingleProduct);
        cond.operator = Operator::Gte;
        cond.value = 0.1;
        assert!(cond.validate(&symbols()).is_ok());

        cond.value = 1.5;
        assert!(cond.validate(&symbols()).is_err());

        cond.value = 0.0;
        assert!(cond.validate(&symbols()).is_err());
    }

    #[test]
    fn test_condition_json_round_trip() {
        let raw = r#"{
            "condition_id": "c1",
            "condition_type": "SINGLE_PRODUCT",
            "metric": "PRICE",
            "trigger_mode": "LEVEL_INSTANT",
            "evaluation_window": "1m",
            "window_price_basis": "CLOSE",
            "operator": "<=",
            "value": 60.0,
            "product": "SLV"
        }"#;
        let cond: ConditionItem = serde_json::from_str(raw).unwrap();
        assert_eq!(cond.metric, Metric::Price);
        assert_eq!(cond.operator, Operator::Lte);
        assert_eq!(cond.trigger_mode, TriggerMode::LevelInstant);
    }
}
