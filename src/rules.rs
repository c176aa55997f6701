//! Condition-rules configuration: per trigger-mode/window evaluation
//! policies plus per-metric allowlists. Built-in defaults are merged with an
//! optional JSON file and frozen into an immutable snapshot; every run pins
//! the snapshot it started with.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::domain::{Metric, Operator, TriggerMode};
use crate::error::{Result, SentraError};

/// How a confirm-mode window decides the condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmRule {
    /// At least N recent base-bars satisfy the comparison
    Consecutive(u32),
    /// At least this fraction of window bars satisfy the comparison
    Ratio(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Typed failure surfaced as a runtime error event
    Reject,
    /// Evaluate with what is available; report WAITING when short
    #[default]
    BestEffort,
}

/// Policy for one (trigger_mode, evaluation_window) cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowPolicy {
    pub base_bar: String,
    pub confirm: ConfirmRule,
    pub include_partial_bar: bool,
    pub missing_data_policy: MissingDataPolicy,
}

/// Raw JSON shape of one window entry. `confirm_consecutive` and
/// `confirm_ratio` are mutually exclusive; setting both is a config error.
#[derive(Debug, Clone, Deserialize)]
struct RawWindowPolicy {
    base_bar: String,
    #[serde(default)]
    confirm_consecutive: Option<u32>,
    #[serde(default)]
    confirm_ratio: Option<f64>,
    #[serde(default)]
    include_partial_bar: Option<bool>,
    #[serde(default)]
    missing_data_policy: Option<MissingDataPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMetricRule {
    trigger_mode: TriggerMode,
    operator: Operator,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawMetricRules {
    #[serde(default)]
    allowed_windows: BTreeMap<Metric, Vec<String>>,
    #[serde(default)]
    allowed_rules: BTreeMap<Metric, Vec<RawMetricRule>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRulesFile {
    #[serde(default)]
    trigger_mode_windows: BTreeMap<TriggerMode, BTreeMap<String, RawWindowPolicy>>,
    #[serde(default)]
    metric_trigger_operator_rules: RawMetricRules,
}

/// Fully-resolved policy handed to the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    pub trigger_mode: TriggerMode,
    pub evaluation_window: String,
    pub base_bar: String,
    pub confirm: ConfirmRule,
    pub include_partial_bar: bool,
    pub missing_data_policy: MissingDataPolicy,
}

/// Immutable rules snapshot.
#[derive(Debug, Clone)]
pub struct RulesConfig {
    windows: BTreeMap<TriggerMode, BTreeMap<String, WindowPolicy>>,
    metric_windows: BTreeMap<Metric, BTreeSet<String>>,
    metric_rules: BTreeMap<Metric, BTreeSet<(TriggerMode, Operator)>>,
}

pub type RulesSnapshot = Arc<RulesConfig>;

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            windows: default_trigger_mode_windows(),
            metric_windows: default_metric_windows(),
            metric_rules: default_metric_rules(),
        }
    }
}

impl RulesConfig {
    /// Load the JSON rules file (when present) merged over the defaults.
    pub fn load_from(path: Option<&Path>) -> Result<RulesSnapshot> {
        let mut cfg = RulesConfig::default();
        let Some(path) = path else {
            return Ok(Arc::new(cfg));
        };
        if !path.exists() {
            return Ok(Arc::new(cfg));
        }
        let raw_text = std::fs::read_to_string(path)?;
        let raw: RawRulesFile = serde_json::from_str(&raw_text)?;
        cfg.merge(raw)?;
        Ok(Arc::new(cfg))
    }

    fn merge(&mut self, raw: RawRulesFile) -> Result<()> {
        for (mode, windows) in raw.trigger_mode_windows {
            let parsed = windows
                .into_iter()
                .map(|(window, policy)| {
                    let window = window.trim().to_lowercase();
                    let confirm = match (policy.confirm_consecutive, policy.confirm_ratio) {
                        (Some(_), Some(_)) => {
                            return Err(SentraError::ConfigInvalid(format!(
                                "condition rules: {mode}/{window} sets both confirm_consecutive \
                                 and confirm_ratio; pick one"
                            )));
                        }
                        (Some(n), None) => ConfirmRule::Consecutive(n.max(1)),
                        (None, Some(r)) => ConfirmRule::Ratio(r.clamp(0.0, 1.0)),
                        (None, None) => ConfirmRule::Consecutive(1),
                    };
                    Ok((
                        window,
                        WindowPolicy {
                            base_bar: policy.base_bar.trim().to_lowercase(),
                            confirm,
                            include_partial_bar: policy.include_partial_bar.unwrap_or(false),
                            missing_data_policy: policy.missing_data_policy.unwrap_or_default(),
                        },
                    ))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;
            if !parsed.is_empty() {
                self.windows.insert(mode, parsed);
            }
        }

        for (metric, windows) in raw.metric_trigger_operator_rules.allowed_windows {
            let parsed: BTreeSet<String> = windows
                .into_iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.metric_windows.insert(metric, parsed);
            }
        }
        for (metric, rules) in raw.metric_trigger_operator_rules.allowed_rules {
            let parsed: BTreeSet<(TriggerMode, Operator)> = rules
                .into_iter()
                .map(|r| (r.trigger_mode, r.operator))
                .collect();
            if !parsed.is_empty() {
                self.metric_rules.insert(metric, parsed);
            }
        }
        Ok(())
    }

    /// Resolve the policy for one (trigger_mode, evaluation_window) cell.
    pub fn resolve_policy(
        &self,
        trigger_mode: TriggerMode,
        evaluation_window: &str,
    ) -> Result<ResolvedPolicy> {
        let window = evaluation_window.trim().to_lowercase();
        let policy = self
            .windows
            .get(&trigger_mode)
            .and_then(|windows| windows.get(&window))
            .ok_or_else(|| {
                SentraError::Validation(format!(
                    "trigger_mode={trigger_mode} does not allow evaluation_window={window}"
                ))
            })?;
        Ok(ResolvedPolicy {
            trigger_mode,
            evaluation_window: window,
            base_bar: policy.base_bar.clone(),
            confirm: policy.confirm,
            include_partial_bar: policy.include_partial_bar,
            missing_data_policy: policy.missing_data_policy,
        })
    }

    /// (trigger_mode, operator) pairs permitted for a metric.
    pub fn allowed_rules(&self, metric: Metric) -> &BTreeSet<(TriggerMode, Operator)> {
        static EMPTY: std::sync::OnceLock<BTreeSet<(TriggerMode, Operator)>> =
            std::sync::OnceLock::new();
        self.metric_rules
            .get(&metric)
            .unwrap_or_else(|| EMPTY.get_or_init(BTreeSet::new))
    }

    /// Evaluation windows permitted for a metric.
    pub fn allowed_windows(&self, metric: Metric) -> &BTreeSet<String> {
        static EMPTY: std::sync::OnceLock<BTreeSet<String>> = std::sync::OnceLock::new();
        self.metric_windows
            .get(&metric)
            .unwrap_or_else(|| EMPTY.get_or_init(BTreeSet::new))
    }

    /// Snapshot exported on the API for UI consumption.
    pub fn export(&self) -> serde_json::Value {
        let trigger_mode_windows: BTreeMap<&str, BTreeMap<&String, serde_json::Value>> = self
            .windows
            .iter()
            .map(|(mode, windows)| {
                let exported = windows
                    .iter()
                    .map(|(window, policy)| {
                        let mut entry = serde_json::Map::new();
                        entry.insert("base_bar".to_string(), serde_json::json!(policy.base_bar));
                        match policy.confirm {
                            ConfirmRule::Consecutive(n) => {
                                entry.insert(
                                    "confirm_consecutive".to_string(),
                                    serde_json::json!(n),
                                );
                            }
                            ConfirmRule::Ratio(r) => {
                                entry.insert("confirm_ratio".to_string(), serde_json::json!(r));
                            }
                        }
                        entry.insert(
                            "include_partial_bar".to_string(),
                            serde_json::json!(policy.include_partial_bar),
                        );
                        entry.insert(
                            "missing_data_policy".to_string(),
                            serde_json::json!(policy.missing_data_policy),
                        );
                        (window, serde_json::Value::Object(entry))
                    })
                    .collect();
                (mode.as_str(), exported)
            })
            .collect();

        let allowed_windows: BTreeMap<&str, &BTreeSet<String>> = self
            .metric_windows
            .iter()
            .map(|(metric, windows)| (metric.as_str(), windows))
            .collect();

        let allowed_rules: BTreeMap<&str, Vec<serde_json::Value>> = self
            .metric_rules
            .iter()
            .map(|(metric, pairs)| {
                let rules = pairs
                    .iter()
                    .map(|(mode, op)| {
                        serde_json::json!({
                            "trigger_mode": mode.as_str(),
                            "operator": op.as_str(),
                        })
                    })
                    .collect();
                (metric.as_str(), rules)
            })
            .collect();

        serde_json::json!({
            "trigger_mode_windows": trigger_mode_windows,
            "metric_trigger_operator_rules": {
                "allowed_windows": allowed_windows,
                "allowed_rules": allowed_rules,
            },
        })
    }
}

fn instant_windows() -> BTreeMap<String, WindowPolicy> {
    let policy = |base: &str| WindowPolicy {
        base_bar: base.to_string(),
        confirm: ConfirmRule::Consecutive(1),
        include_partial_bar: true,
        missing_data_policy: MissingDataPolicy::BestEffort,
    };
    BTreeMap::from([
        ("1m".to_string(), policy("1m")),
        ("5m".to_string(), policy("1m")),
        ("30m".to_string(), policy("5m")),
        ("1h".to_string(), policy("5m")),
    ])
}

fn confirm_windows() -> BTreeMap<String, WindowPolicy> {
    let policy = |base: &str, consecutive: u32| WindowPolicy {
        base_bar: base.to_string(),
        confirm: ConfirmRule::Consecutive(consecutive),
        include_partial_bar: false,
        missing_data_policy: MissingDataPolicy::BestEffort,
    };
    BTreeMap::from([
        ("5m".to_string(), policy("1m", 4)),
        ("30m".to_string(), policy("5m", 2)),
        ("1h".to_string(), policy("5m", 2)),
        ("2h".to_string(), policy("15m", 2)),
        ("4h".to_string(), policy("15m", 2)),
        ("1d".to_string(), policy("1h", 2)),
        ("2d".to_string(), policy("1h", 2)),
    ])
}

fn default_trigger_mode_windows() -> BTreeMap<TriggerMode, BTreeMap<String, WindowPolicy>> {
    TriggerMode::ALL
        .into_iter()
        .map(|mode| {
            let windows = if mode.is_confirm() {
                confirm_windows()
            } else {
                instant_windows()
            };
            (mode, windows)
        })
        .collect()
}

fn default_metric_windows() -> BTreeMap<Metric, BTreeSet<String>> {
    let minute_windows: BTreeSet<String> =
        ["1m", "5m", "30m", "1h"].iter().map(|w| w.to_string()).collect();
    let hour_day_windows: BTreeSet<String> = ["1h", "2h", "4h", "1d", "2d"]
        .iter()
        .map(|w| w.to_string())
        .collect();
    BTreeMap::from([
        (Metric::Price, minute_windows.clone()),
        (Metric::DrawdownPct, minute_windows.clone()),
        (Metric::RallyPct, minute_windows.clone()),
        (Metric::Spread, minute_windows),
        (Metric::VolumeRatio, hour_day_windows.clone()),
        (Metric::AmountRatio, hour_day_windows),
    ])
}

fn default_metric_rules() -> BTreeMap<Metric, BTreeSet<(TriggerMode, Operator)>> {
    use Operator::{Gte, Lte};
    use TriggerMode::*;

    let price_rules: BTreeSet<(TriggerMode, Operator)> = BTreeSet::from([
        (LevelInstant, Gte),
        (LevelInstant, Lte),
        (LevelConfirm, Gte),
        (LevelConfirm, Lte),
        (CrossUpInstant, Gte),
        (CrossUpConfirm, Gte),
        (CrossDownInstant, Lte),
        (CrossDownConfirm, Lte),
    ]);
    let level_gte: BTreeSet<(TriggerMode, Operator)> =
        BTreeSet::from([(LevelInstant, Gte), (LevelConfirm, Gte)]);
    let ratio_rules: BTreeSet<(TriggerMode, Operator)> =
        BTreeSet::from([(LevelConfirm, Gte), (LevelConfirm, Lte)]);
    // SPREAD is confirm-only
    let spread_rules: BTreeSet<(TriggerMode, Operator)> = BTreeSet::from([
        (LevelConfirm, Gte),
        (LevelConfirm, Lte),
        (CrossUpConfirm, Gte),
        (CrossDownConfirm, Lte),
    ]);

    BTreeMap::from([
        (Metric::Price, price_rules),
        (Metric::DrawdownPct, level_gte.clone()),
        (Metric::RallyPct, level_gte),
        (Metric::VolumeRatio, ratio_rules.clone()),
        (Metric::AmountRatio, ratio_rules),
        (Metric::Spread, spread_rules),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_resolution() {
        let rules = RulesConfig::default();

        let policy = rules
            .resolve_policy(TriggerMode::LevelInstant, "1m")
            .unwrap();
        assert_eq!(policy.base_bar, "1m");
        assert_eq!(policy.confirm, ConfirmRule::Consecutive(1));
        assert!(policy.include_partial_bar);

        let policy = rules
            .resolve_policy(TriggerMode::LevelConfirm, "1h")
            .unwrap();
        assert_eq!(policy.base_bar, "5m");
        assert_eq!(policy.confirm, ConfirmRule::Consecutive(2));
        assert!(!policy.include_partial_bar);
    }

    #[test]
    fn test_instant_mode_rejects_day_window() {
        let rules = RulesConfig::default();
        assert!(rules
            .resolve_policy(TriggerMode::LevelInstant, "1d")
            .is_err());
    }

    #[test]
    fn test_spread_is_confirm_only_by_default() {
        let rules = RulesConfig::default();
        let spread = rules.allowed_rules(Metric::Spread);
        assert!(spread.contains(&(TriggerMode::LevelConfirm, Operator::Lte)));
        assert!(!spread
            .iter()
            .any(|(mode, _)| matches!(mode, TriggerMode::LevelInstant)));
    }

    #[test]
    fn test_ratio_metrics_use_hour_day_windows() {
        let rules = RulesConfig::default();
        let windows = rules.allowed_windows(Metric::VolumeRatio);
        assert!(windows.contains("1h"));
        assert!(windows.contains("2d"));
        assert!(!windows.contains("1m"));
    }

    #[test]
    fn test_merge_rejects_both_confirm_fields() {
        let mut cfg = RulesConfig::default();
        let raw: RawRulesFile = serde_json::from_str(
            r#"{
                "trigger_mode_windows": {
                    "LEVEL_CONFIRM": {
                        "1h": {
                            "base_bar": "5m",
                            "confirm_consecutive": 3,
                            "confirm_ratio": 0.8
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert!(cfg.merge(raw).is_err());
    }

    #[test]
    fn test_merge_overrides_window_policy() {
        let mut cfg = RulesConfig::default();
        let raw: RawRulesFile = serde_json::from_str(
            r#"{
                "trigger_mode_windows": {
                    "LEVEL_CONFIRM": {
                        "1h": { "base_bar": "15m", "confirm_ratio": 0.6 }
                    }
                }
            }"#,
        )
        .unwrap();
        cfg.merge(raw).unwrap();

        let policy = cfg.resolve_policy(TriggerMode::LevelConfirm, "1h").unwrap();
        assert_eq!(policy.base_bar, "15m");
        assert_eq!(policy.confirm, ConfirmRule::Ratio(0.6));
        // whole mode table replaced by the override
        assert!(cfg.resolve_policy(TriggerMode::LevelConfirm, "2h").is_err());
    }

    #[test]
    fn test_export_shape() {
        let rules = RulesConfig::default();
        let exported = rules.export();
        assert!(exported["trigger_mode_windows"]["LEVEL_INSTANT"]["1m"].is_object());
        assert!(exported["metric_trigger_operator_rules"]["allowed_windows"]["PRICE"].is_array());
    }
}
