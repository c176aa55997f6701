//! Single-condition prepare/evaluate (C2). `prepare` validates a condition
//! against the rules snapshot and derives its per-contract data
//! requirements; `evaluate` folds the fetched series plus runtime state into
//! TRUE / FALSE / WAITING with an observed value and a reason.

use std::collections::HashMap;

use crate::domain::{ConditionItem, ConditionState, ConditionType, Metric, Operator, PriceBasis, TriggerMode};
use crate::error::{Result, SentraError};
use crate::marketdata::HistoricalBar;
use crate::rules::{ConfirmRule, MissingDataPolicy, ResolvedPolicy, RulesConfig};

/// Per-contract bar requirement derived from the rules config.
#[derive(Debug, Clone)]
pub struct ContractRequirement {
    pub contract_id: i64,
    pub product: String,
    pub base_bar: String,
    pub required_points: usize,
    pub include_partial_bar: bool,
    /// DRAWDOWN_PCT consumes since_activation_high
    pub needs_high: bool,
    /// RALLY_PCT consumes since_activation_low
    pub needs_low: bool,
}

/// Validated condition plus its data requirement.
#[derive(Debug, Clone)]
pub struct PreparedCondition {
    pub condition_id: String,
    pub metric: Metric,
    pub trigger_mode: TriggerMode,
    pub operator: Operator,
    pub threshold: f64,
    pub basis: PriceBasis,
    pub policy: ResolvedPolicy,
    pub contracts: Vec<ContractRequirement>,
    /// Pair metrics need tail-aligned series
    pub require_time_alignment: bool,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionEvaluation {
    pub state: ConditionState,
    pub observed_value: Option<f64>,
    pub reason: String,
}

impl ConditionEvaluation {
    fn waiting(reason: &str) -> Self {
        Self {
            state: ConditionState::Waiting,
            observed_value: None,
            reason: reason.to_string(),
        }
    }

    fn decided(passed: bool, observed_value: f64) -> Self {
        Self {
            state: if passed {
                ConditionState::True
            } else {
                ConditionState::False
            },
            observed_value: Some(observed_value),
            reason: "evaluated".to_string(),
        }
    }
}

/// Inputs gathered by the scheduler for one condition.
#[derive(Debug, Clone, Default)]
pub struct EvaluationInput {
    /// Per-bar metric source values, oldest first, keyed by contract id
    pub series_by_contract: HashMap<i64, Vec<f64>>,
    pub since_activation_high: Option<f64>,
    pub since_activation_low: Option<f64>,
}

/// Validate a condition against the rules snapshot and derive its data
/// requirement. Contract ids must already be resolved (activation
/// preflight writes them back into the stored conditions).
pub fn prepare(condition: &ConditionItem, rules: &RulesConfig) -> Result<PreparedCondition> {
    let condition_id = condition
        .condition_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SentraError::Validation("condition_id is required".to_string()))?
        .to_string();

    let policy = rules.resolve_policy(condition.trigger_mode, &condition.evaluation_window)?;

    if !rules
        .allowed_rules(condition.metric)
        .contains(&(condition.trigger_mode, condition.operator))
    {
        return Err(SentraError::Validation(format!(
            "metric={} does not allow trigger_mode={} with operator={}",
            condition.metric, condition.trigger_mode, condition.operator
        )));
    }
    if !rules
        .allowed_windows(condition.metric)
        .contains(&policy.evaluation_window)
    {
        return Err(SentraError::Validation(format!(
            "metric={} does not allow evaluation_window={}",
            condition.metric, policy.evaluation_window
        )));
    }
    if !condition.value.is_finite() {
        return Err(SentraError::Validation("value must be a number".to_string()));
    }

    let contract_id = condition.contract_id.ok_or_else(|| {
        SentraError::Validation(format!("condition {condition_id}: contract_id not resolved"))
    })?;
    let product = condition.normalized_product().ok_or_else(|| {
        SentraError::Validation(format!("condition {condition_id}: product is required"))
    })?;

    let required_points = required_points(&policy);
    let mut contracts = vec![ContractRequirement {
        contract_id,
        product,
        base_bar: policy.base_bar.clone(),
        required_points,
        include_partial_bar: policy.include_partial_bar,
        needs_high: condition.metric == Metric::DrawdownPct,
        needs_low: condition.metric == Metric::RallyPct,
    }];

    if condition.metric.requires_pair() {
        if condition.condition_type != ConditionType::PairProducts {
            return Err(SentraError::Validation(format!(
                "condition {condition_id}: metric {} requires PAIR_PRODUCTS",
                condition.metric
            )));
        }
        let contract_id_b = condition.contract_id_b.ok_or_else(|| {
            SentraError::Validation(format!(
                "condition {condition_id}: contract_id_b not resolved"
            ))
        })?;
        let product_b = condition.normalized_product_b().ok_or_else(|| {
            SentraError::Validation(format!("condition {condition_id}: product_b is required"))
        })?;
        contracts.push(ContractRequirement {
            contract_id: contract_id_b,
            product: product_b,
            base_bar: policy.base_bar.clone(),
            required_points,
            include_partial_bar: policy.include_partial_bar,
            needs_high: false,
            needs_low: false,
        });
    }

    Ok(PreparedCondition {
        condition_id,
        metric: condition.metric,
        trigger_mode: condition.trigger_mode,
        operator: condition.operator,
        threshold: condition.value,
        basis: condition.window_price_basis,
        policy,
        contracts,
        require_time_alignment: condition.metric.requires_pair(),
    })
}

/// Minimum base-bars each contract series must provide.
fn required_points(policy: &ResolvedPolicy) -> usize {
    match policy.trigger_mode {
        TriggerMode::LevelInstant => 1,
        TriggerMode::CrossUpInstant | TriggerMode::CrossDownInstant => 2,
        _ => {
            let confirm = confirm_count(policy);
            if policy.trigger_mode.is_cross() {
                confirm + 1
            } else {
                confirm
            }
        }
    }
}

/// Number of confirming bars a confirm-mode policy demands.
fn confirm_count(policy: &ResolvedPolicy) -> usize {
    let base_points = window_base_points(policy);
    match policy.confirm {
        ConfirmRule::Consecutive(n) => (n as usize).max(1),
        ConfirmRule::Ratio(r) => ((r * base_points as f64).ceil() as usize).max(1),
    }
}

/// Bars spanned by the evaluation window at the policy's base bar size.
fn window_base_points(policy: &ResolvedPolicy) -> usize {
    let window_seconds = crate::domain::window_to_seconds(&policy.evaluation_window).unwrap_or(0);
    let base_seconds = crate::domain::window_to_seconds(&policy.base_bar).unwrap_or(0);
    if window_seconds == 0 || base_seconds == 0 {
        1
    } else {
        ((window_seconds + base_seconds - 1) / base_seconds).max(1) as usize
    }
}

/// Extract the per-bar metric source value.
pub fn bar_value_for_metric(metric: Metric, basis: PriceBasis, bar: &HistoricalBar) -> Option<f64> {
    match metric {
        Metric::Price | Metric::DrawdownPct | Metric::RallyPct | Metric::Spread => {
            Some(bar_price(basis, bar))
        }
        Metric::VolumeRatio => bar.volume,
        Metric::AmountRatio => bar.volume.map(|v| v * bar_price(basis, bar)),
    }
}

fn bar_price(basis: PriceBasis, bar: &HistoricalBar) -> f64 {
    match basis {
        PriceBasis::Close => bar.close,
        PriceBasis::High => bar.high,
        PriceBasis::Low => bar.low,
        PriceBasis::Avg => bar
            .wap
            .unwrap_or((bar.open + bar.high + bar.low + bar.close) / 4.0),
    }
}

/// Evaluate a prepared condition over its gathered inputs.
///
/// Missing inputs resolve per the policy: `best_effort` yields WAITING,
/// `reject` a typed evaluation error (logged upstream, never a transition).
pub fn evaluate(
    prepared: &PreparedCondition,
    input: &EvaluationInput,
) -> Result<ConditionEvaluation> {
    let mut series: Vec<&[f64]> = Vec::with_capacity(prepared.contracts.len());
    for contract in &prepared.contracts {
        let Some(values) = input.series_by_contract.get(&contract.contract_id) else {
            return short_input(prepared, &format!("missing_contract_values:{}", contract.contract_id));
        };
        if values.len() < contract.required_points {
            return short_input(
                prepared,
                &format!("insufficient_points:{}", contract.contract_id),
            );
        }
        series.push(values.as_slice());
    }
    let Some(primary) = series.first() else {
        return short_input(prepared, "missing_contract_requirements");
    };

    // Pair metrics combine tail-aligned samples.
    let aligned_len = if series.len() > 1 {
        series.iter().map(|s| s.len()).min().unwrap_or(0)
    } else {
        primary.len()
    };
    if aligned_len == 0 {
        return short_input(prepared, "missing_metric_inputs");
    }

    let mut observed = Vec::with_capacity(aligned_len);
    for idx in 0..aligned_len {
        let primary_value = series[0][series[0].len() - aligned_len + idx];
        let secondary_value = series
            .get(1)
            .map(|s| s[s.len() - aligned_len + idx]);
        match metric_observed_value(prepared, input, primary_value, secondary_value)? {
            Some(value) => observed.push(value),
            None => return short_input(prepared, "missing_metric_inputs"),
        }
    }
    let observed_value = observed[observed.len() - 1];

    let passed = match prepared.trigger_mode {
        TriggerMode::LevelInstant => prepared.operator.compare(observed_value, prepared.threshold),
        TriggerMode::LevelConfirm => level_confirmed(prepared, &observed),
        TriggerMode::CrossUpInstant | TriggerMode::CrossDownInstant => {
            if observed.len() < 2 {
                return short_input(prepared, "missing_cross_inputs");
            }
            find_cross(prepared, &observed).is_some()
        }
        TriggerMode::CrossUpConfirm | TriggerMode::CrossDownConfirm => {
            if observed.len() < 2 {
                return short_input(prepared, "missing_cross_inputs");
            }
            cross_confirmed(prepared, &observed)
        }
    };

    Ok(ConditionEvaluation::decided(passed, observed_value))
}

fn short_input(prepared: &PreparedCondition, reason: &str) -> Result<ConditionEvaluation> {
    match prepared.policy.missing_data_policy {
        MissingDataPolicy::BestEffort => Ok(ConditionEvaluation::waiting(reason)),
        MissingDataPolicy::Reject => Err(SentraError::Evaluation(format!(
            "condition {}: {reason}",
            prepared.condition_id
        ))),
    }
}

/// `Ok(None)` marks a gap tolerable under best_effort; reject raises.
fn missing_value(prepared: &PreparedCondition, reason: &str) -> Result<Option<f64>> {
    match prepared.policy.missing_data_policy {
        MissingDataPolicy::BestEffort => Ok(None),
        MissingDataPolicy::Reject => Err(SentraError::Evaluation(format!(
            "condition {}: {reason}",
            prepared.condition_id
        ))),
    }
}

fn metric_observed_value(
    prepared: &PreparedCondition,
    input: &EvaluationInput,
    primary: f64,
    secondary: Option<f64>,
) -> Result<Option<f64>> {
    let value = match prepared.metric {
        Metric::Price => Some(primary),
        Metric::DrawdownPct => match input.since_activation_high {
            Some(high) if high > 0.0 => Some(((high - primary) / high).max(0.0)),
            _ => return missing_value(prepared, "missing_since_activation_high"),
        },
        Metric::RallyPct => match input.since_activation_low {
            Some(low) if low > 0.0 => Some(((primary - low) / low).max(0.0)),
            _ => return missing_value(prepared, "missing_since_activation_low"),
        },
        Metric::Spread => secondary.map(|b| primary - b),
        Metric::VolumeRatio | Metric::AmountRatio => match secondary {
            Some(b) if b > 0.0 => Some(primary / b),
            _ => None,
        },
    };
    Ok(value)
}

/// LEVEL_CONFIRM: trailing `confirm_consecutive` bars all satisfy, or the
/// satisfying fraction over the window reaches `confirm_ratio`.
fn level_confirmed(prepared: &PreparedCondition, observed: &[f64]) -> bool {
    match prepared.policy.confirm {
        ConfirmRule::Consecutive(n) => {
            let n = (n as usize).max(1);
            observed.len() >= n
                && observed[observed.len() - n..]
                    .iter()
                    .all(|value| prepared.operator.compare(*value, prepared.threshold))
        }
        ConfirmRule::Ratio(ratio) => {
            let satisfying = observed
                .iter()
                .filter(|value| prepared.operator.compare(**value, prepared.threshold))
                .count();
            (satisfying as f64) / (observed.len() as f64) >= ratio
        }
    }
}

fn is_cross(prepared: &PreparedCondition, prev: f64, curr: f64) -> bool {
    let threshold = prepared.threshold;
    if prepared.trigger_mode.is_cross_up() {
        prev < threshold && curr >= threshold
    } else {
        prev > threshold && curr <= threshold
    }
}

/// Index of the first bar that crosses the threshold, if any.
fn find_cross(prepared: &PreparedCondition, observed: &[f64]) -> Option<usize> {
    observed
        .windows(2)
        .position(|pair| is_cross(prepared, pair[0], pair[1]))
        .map(|idx| idx + 1)
}

/// CROSS_*_CONFIRM: some cross followed by `confirm_count` bars holding on
/// the crossed side (counting the crossing bar itself).
fn cross_confirmed(prepared: &PreparedCondition, observed: &[f64]) -> bool {
    let confirm = confirm_count(&prepared.policy);
    observed.windows(2).enumerate().any(|(idx, pair)| {
        if !is_cross(prepared, pair[0], pair[1]) {
            return false;
        }
        let tail = &observed[idx + 1..];
        tail.len() >= confirm
            && tail[..confirm]
                .iter()
                .all(|value| prepared.operator.compare(*value, prepared.threshold))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RulesConfig;

    fn condition(
        metric: Metric,
        trigger_mode: TriggerMode,
        operator: Operator,
        value: f64,
        window: &str,
    ) -> ConditionItem {
        let pair = metric.requires_pair();
        ConditionItem {
            condition_id: Some("c1".to_string()),
            condition_type: if pair {
                ConditionType::PairProducts
            } else {
                ConditionType::SingleProduct
            },
            metric,
            trigger_mode,
            evaluation_window: window.to_string(),
            window_price_basis: PriceBasis::Close,
            operator,
            value,
            product: Some("SLV".to_string()),
            product_b: pair.then(|| "GLD".to_string()),
            contract_id: Some(11),
            contract_id_b: pair.then_some(22),
        }
    }

    fn input(values: Vec<f64>) -> EvaluationInput {
        EvaluationInput {
            series_by_contract: HashMap::from([(11, values)]),
            ..Default::default()
        }
    }

    fn prepare_ok(cond: &ConditionItem) -> PreparedCondition {
        prepare(cond, &RulesConfig::default()).unwrap()
    }

    #[test]
    fn test_prepare_rejects_disallowed_pairs() {
        let rules = RulesConfig::default();
        // DRAWDOWN_PCT with <= is not allowed
        let cond = condition(
            Metric::DrawdownPct,
            TriggerMode::LevelInstant,
            Operator::Lte,
            0.1,
            "5m",
        );
        assert!(prepare(&cond, &rules).is_err());

        // ratio metric on a minute window is not allowed
        let cond = condition(
            Metric::VolumeRatio,
            TriggerMode::LevelConfirm,
            Operator::Gte,
            0.5,
            "5m",
        );
        assert!(prepare(&cond, &rules).is_err());
    }

    #[test]
    fn test_prepare_requires_resolved_contracts() {
        let rules = RulesConfig::default();
        let mut cond = condition(
            Metric::Price,
            TriggerMode::LevelInstant,
            Operator::Lte,
            60.0,
            "1m",
        );
        cond.contract_id = None;
        assert!(prepare(&cond, &rules).is_err());
    }

    #[test]
    fn test_required_points() {
        let instant = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::LevelInstant,
            Operator::Lte,
            60.0,
            "1m",
        ));
        assert_eq!(instant.contracts[0].required_points, 1);

        let cross = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::CrossUpInstant,
            Operator::Gte,
            60.0,
            "1m",
        ));
        assert_eq!(cross.contracts[0].required_points, 2);

        // LEVEL_CONFIRM 1h on 5m base, confirm_consecutive=2
        let confirm = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::LevelConfirm,
            Operator::Lte,
            60.0,
            "1h",
        ));
        assert_eq!(confirm.contracts[0].required_points, 2);
    }

    #[test]
    fn test_level_instant_uses_latest_basis() {
        let prepared = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::LevelInstant,
            Operator::Lte,
            60.0,
            "1m",
        ));

        // dips below earlier but finishes above: latest decides
        let result = evaluate(&prepared, &input(vec![59.0, 61.0])).unwrap();
        assert_eq!(result.state, ConditionState::False);
        assert_eq!(result.observed_value, Some(61.0));

        let result = evaluate(&prepared, &input(vec![61.0, 60.0])).unwrap();
        assert_eq!(result.state, ConditionState::True);
        assert_eq!(result.observed_value, Some(60.0));
    }

    #[test]
    fn test_cross_up_instant() {
        let prepared = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::CrossUpInstant,
            Operator::Gte,
            100.0,
            "1m",
        ));

        let result = evaluate(&prepared, &input(vec![95.0, 101.0])).unwrap();
        assert_eq!(result.state, ConditionState::True);

        // already above: no cross
        let result = evaluate(&prepared, &input(vec![101.0, 102.0])).unwrap();
        assert_eq!(result.state, ConditionState::False);

        // single sample cannot cross
        let result = evaluate(&prepared, &input(vec![101.0])).unwrap();
        assert_eq!(result.state, ConditionState::Waiting);
    }

    #[test]
    fn test_cross_down_confirm() {
        let mut cond = condition(
            Metric::Price,
            TriggerMode::CrossDownConfirm,
            Operator::Lte,
            60.0,
            "5m",
        );
        cond.evaluation_window = "5m".to_string();
        let prepared = prepare_ok(&cond);
        // default 5m confirm window: base 1m, confirm_consecutive=4

        // cross then 4 bars at/below threshold
        let result = evaluate(
            &prepared,
            &input(vec![61.0, 60.0, 59.8, 59.5, 59.9]),
        )
        .unwrap();
        assert_eq!(result.state, ConditionState::True);

        // cross but bounces back above: not confirmed
        let result = evaluate(
            &prepared,
            &input(vec![61.0, 60.0, 60.5, 59.5, 59.9]),
        )
        .unwrap();
        assert_eq!(result.state, ConditionState::False);
    }

    #[test]
    fn test_level_confirm_consecutive() {
        let prepared = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::LevelConfirm,
            Operator::Lte,
            60.0,
            "1h",
        ));
        // confirm_consecutive = 2 on the default 1h window

        let result = evaluate(&prepared, &input(vec![61.0, 59.9, 59.8])).unwrap();
        assert_eq!(result.state, ConditionState::True);

        let result = evaluate(&prepared, &input(vec![59.9, 61.0, 59.8])).unwrap();
        assert_eq!(result.state, ConditionState::False);
    }

    #[test]
    fn test_drawdown_against_high() {
        let prepared = prepare_ok(&condition(
            Metric::DrawdownPct,
            TriggerMode::LevelInstant,
            Operator::Gte,
            0.1,
            "1m",
        ));

        let mut eval_input = input(vec![100.8]);
        eval_input.since_activation_high = Some(112.0);
        let result = evaluate(&prepared, &eval_input).unwrap();
        assert_eq!(result.state, ConditionState::True);
        let observed = result.observed_value.unwrap();
        assert!((observed - 0.1).abs() < 1e-9);

        // missing extrema -> waiting under best_effort
        let result = evaluate(&prepared, &input(vec![100.8])).unwrap();
        assert_eq!(result.state, ConditionState::Waiting);
    }

    #[test]
    fn test_rally_against_low() {
        let prepared = prepare_ok(&condition(
            Metric::RallyPct,
            TriggerMode::LevelInstant,
            Operator::Gte,
            0.05,
            "1m",
        ));
        let mut eval_input = input(vec![105.0]);
        eval_input.since_activation_low = Some(100.0);
        let result = evaluate(&prepared, &eval_input).unwrap();
        assert_eq!(result.state, ConditionState::True);
        assert_eq!(result.observed_value, Some(0.05));
    }

    #[test]
    fn test_spread_alignment() {
        let mut cond = condition(
            Metric::Spread,
            TriggerMode::LevelConfirm,
            Operator::Lte,
            -120.0,
            "1h",
        );
        cond.value = -120.0;
        let prepared = prepare_ok(&cond);

        // secondary longer than primary: tail-aligned, confirm_consecutive=2
        let mut eval_input = EvaluationInput {
            series_by_contract: HashMap::from([
                (11, vec![480.0, 479.0]),
                (22, vec![610.0, 601.0, 600.0]),
            ]),
            ..Default::default()
        };
        let result = evaluate(&prepared, &eval_input).unwrap();
        assert_eq!(result.state, ConditionState::True);
        assert_eq!(result.observed_value, Some(-121.0));

        // only one aligned bar satisfying: not confirmed
        eval_input.series_by_contract.insert(11, vec![490.0, 479.0]);
        let result = evaluate(&prepared, &eval_input).unwrap();
        assert_eq!(result.state, ConditionState::False);
    }

    #[test]
    fn test_insufficient_points_waits() {
        let prepared = prepare_ok(&condition(
            Metric::Price,
            TriggerMode::LevelConfirm,
            Operator::Lte,
            60.0,
            "1h",
        ));
        let result = evaluate(&prepared, &input(vec![59.0])).unwrap();
        assert_eq!(result.state, ConditionState::Waiting);
        assert!(result.reason.starts_with("insufficient_points"));
    }

    #[test]
    fn test_reject_policy_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "trigger_mode_windows": {
                    "LEVEL_INSTANT": {
                        "1m": { "base_bar": "1m", "missing_data_policy": "reject",
                                "include_partial_bar": true }
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let rules = RulesConfig::load_from(Some(&path)).unwrap();

        let cond = condition(
            Metric::Price,
            TriggerMode::LevelInstant,
            Operator::Lte,
            60.0,
            "1m",
        );
        let prepared = prepare(&cond, &rules).unwrap();
        let result = evaluate(&prepared, &EvaluationInput::default());
        assert!(matches!(result, Err(SentraError::Evaluation(_))));
    }

    #[test]
    fn test_bar_value_for_metric() {
        let bar = HistoricalBar {
            ts: chrono::Utc::now(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: Some(500.0),
            wap: Some(10.6),
            count: None,
        };
        assert_eq!(
            bar_value_for_metric(Metric::Price, PriceBasis::Close, &bar),
            Some(11.0)
        );
        assert_eq!(
            bar_value_for_metric(Metric::Price, PriceBasis::High, &bar),
            Some(12.0)
        );
        assert_eq!(
            bar_value_for_metric(Metric::Price, PriceBasis::Avg, &bar),
            Some(10.6)
        );
        assert_eq!(
            bar_value_for_metric(Metric::VolumeRatio, PriceBasis::Close, &bar),
            Some(500.0)
        );
        assert_eq!(
            bar_value_for_metric(Metric::AmountRatio, PriceBasis::Close, &bar),
            Some(500.0 * 10.6)
        );

        let no_volume = HistoricalBar::new(chrono::Utc::now(), 10.0, 12.0, 9.0, 11.0);
        assert_eq!(
            bar_value_for_metric(Metric::VolumeRatio, PriceBasis::Close, &no_volume),
            None
        );
    }
}
