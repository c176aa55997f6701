use serde::{Deserialize, Serialize};
use std::fmt;

/// Strategy lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    /// Created or edited, waiting for activation
    PendingActivation,
    /// Activation preflight in progress
    Verifying,
    /// Preflight failed; editable again
    VerifyFailed,
    /// Monitored by the scheduler
    Active,
    /// Monitoring suspended by the user
    Paused,
    /// Combined conditions evaluated TRUE
    Triggered,
    /// Order handed to the gateway, fills pending
    OrderSubmitted,
    /// Terminal: filled (or chain-only completion)
    Filled,
    /// Terminal: expire_at elapsed before trigger/fill
    Expired,
    /// Terminal: cancelled by the user or by expiry-cancel
    Cancelled,
    /// Terminal: verification reject, gateway reject, or unrecoverable error
    Failed,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::PendingActivation => "PENDING_ACTIVATION",
            StrategyStatus::Verifying => "VERIFYING",
            StrategyStatus::VerifyFailed => "VERIFY_FAILED",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Paused => "PAUSED",
            StrategyStatus::Triggered => "TRIGGERED",
            StrategyStatus::OrderSubmitted => "ORDER_SUBMITTED",
            StrategyStatus::Filled => "FILLED",
            StrategyStatus::Expired => "EXPIRED",
            StrategyStatus::Cancelled => "CANCELLED",
            StrategyStatus::Failed => "FAILED",
        }
    }

    /// Check if this state can transition to another state.
    ///
    /// Transitions not listed here are forbidden; the store's `transition`
    /// gate consults this table before touching the row.
    pub fn can_transition_to(&self, target: StrategyStatus) -> bool {
        use StrategyStatus::*;

        // Any non-terminal state may fail on an unrecoverable error.
        if target == Failed && !self.is_terminal() {
            return true;
        }

        match (self, target) {
            // Activation path
            (PendingActivation, Verifying) => true, // activate() or chain activation
            (Verifying, Active) => true,            // preflight passed
            (Verifying, VerifyFailed) => true,      // preflight failed
            (VerifyFailed, PendingActivation) => true, // config edit
            (PendingActivation, PendingActivation) => true, // config edit
            (Paused, PendingActivation) => true,       // config edit while paused

            // Monitoring
            (Active, Paused) => true,
            (Paused, Active) => true,
            (Active, Triggered) => true,

            // Execution
            (Triggered, OrderSubmitted) => true, // submitter accepted
            (Triggered, Filled) => true,         // chain-only, no trade action
            (OrderSubmitted, Filled) => true,
            (OrderSubmitted, Cancelled) => true,

            // Expiry (no live order)
            (PendingActivation, Expired) => true,
            (VerifyFailed, Expired) => true,
            (Active, Expired) => true,
            (Paused, Expired) => true,
            (Triggered, Expired) => true,

            // User cancel
            (PendingActivation, Cancelled) => true,
            (Active, Cancelled) => true,
            (Paused, Cancelled) => true,

            // All other transitions are invalid
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<StrategyStatus> {
        use StrategyStatus::*;

        match self {
            PendingActivation => vec![PendingActivation, Verifying, Expired, Cancelled, Failed],
            Verifying => vec![Active, VerifyFailed, Failed],
            VerifyFailed => vec![PendingActivation, Expired, Failed],
            Active => vec![Paused, Triggered, Expired, Cancelled, Failed],
            Paused => vec![PendingActivation, Active, Expired, Cancelled, Failed],
            Triggered => vec![OrderSubmitted, Filled, Expired, Failed],
            OrderSubmitted => vec![Filled, Cancelled, Failed],
            Filled | Expired | Cancelled | Failed => vec![],
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Filled
                | StrategyStatus::Expired
                | StrategyStatus::Cancelled
                | StrategyStatus::Failed
        )
    }

    /// Config edits (basic/conditions/actions) are only allowed here.
    pub fn is_editable(&self) -> bool {
        matches!(
            self,
            StrategyStatus::PendingActivation
                | StrategyStatus::VerifyFailed
                | StrategyStatus::Paused
        )
    }

    /// States the scheduler picks up for a run.
    pub fn is_scannable(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Verifying
                | StrategyStatus::Active
                | StrategyStatus::Triggered
                | StrategyStatus::OrderSubmitted
        )
    }

    /// States the expiry sweep may move straight to EXPIRED.
    pub fn is_expirable(&self) -> bool {
        matches!(
            self,
            StrategyStatus::PendingActivation
                | StrategyStatus::VerifyFailed
                | StrategyStatus::Active
                | StrategyStatus::Paused
                | StrategyStatus::Triggered
        )
    }

    /// `cancel()` is allowed iff non-terminal and no order is live.
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal() && *self != StrategyStatus::OrderSubmitted
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StrategyStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING_ACTIVATION" => Ok(StrategyStatus::PendingActivation),
            "VERIFYING" => Ok(StrategyStatus::Verifying),
            "VERIFY_FAILED" => Ok(StrategyStatus::VerifyFailed),
            "ACTIVE" => Ok(StrategyStatus::Active),
            "PAUSED" => Ok(StrategyStatus::Paused),
            "TRIGGERED" => Ok(StrategyStatus::Triggered),
            "ORDER_SUBMITTED" => Ok(StrategyStatus::OrderSubmitted),
            "FILLED" => Ok(StrategyStatus::Filled),
            "EXPIRED" => Ok(StrategyStatus::Expired),
            "CANCELLED" => Ok(StrategyStatus::Cancelled),
            "FAILED" => Ok(StrategyStatus::Failed),
            other => Err(format!("Unknown status: {}", other)),
        }
    }
}

/// Per-condition runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionState {
    True,
    False,
    Waiting,
    NotEvaluated,
}

impl ConditionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionState::True => "TRUE",
            ConditionState::False => "FALSE",
            ConditionState::Waiting => "WAITING",
            ConditionState::NotEvaluated => "NOT_EVALUATED",
        }
    }
}

impl fmt::Display for ConditionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ConditionState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "TRUE" => Ok(ConditionState::True),
            "FALSE" => Ok(ConditionState::False),
            "WAITING" => Ok(ConditionState::Waiting),
            "NOT_EVALUATED" => Ok(ConditionState::NotEvaluated),
            other => Err(format!("Unknown condition state: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use StrategyStatus::*;

        assert!(PendingActivation.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Active));
        assert!(Verifying.can_transition_to(VerifyFailed));
        assert!(VerifyFailed.can_transition_to(PendingActivation));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Triggered));
        assert!(Triggered.can_transition_to(OrderSubmitted));
        assert!(Triggered.can_transition_to(Filled));
        assert!(OrderSubmitted.can_transition_to(Filled));
        assert!(OrderSubmitted.can_transition_to(Cancelled));

        // Invalid transitions
        assert!(!PendingActivation.can_transition_to(Active));
        assert!(!Active.can_transition_to(OrderSubmitted));
        assert!(!OrderSubmitted.can_transition_to(Expired));
        assert!(!OrderSubmitted.can_transition_to(Active));
        assert!(!Filled.can_transition_to(PendingActivation));
        assert!(!Paused.can_transition_to(Triggered));
    }

    #[test]
    fn test_any_non_terminal_can_fail() {
        use StrategyStatus::*;

        for status in [
            PendingActivation,
            Verifying,
            VerifyFailed,
            Active,
            Paused,
            Triggered,
            OrderSubmitted,
        ] {
            assert!(status.can_transition_to(Failed), "{status} -> FAILED");
        }
        for status in [Filled, Expired, Cancelled, Failed] {
            assert!(!status.can_transition_to(Failed), "{status} -> FAILED");
        }
    }

    #[test]
    fn test_expiry_edges() {
        use StrategyStatus::*;

        for status in [PendingActivation, VerifyFailed, Active, Paused, Triggered] {
            assert!(status.is_expirable());
            assert!(status.can_transition_to(Expired));
        }
        // An in-flight order never expires directly; it is cancelled or fills.
        assert!(!OrderSubmitted.is_expirable());
        assert!(!OrderSubmitted.can_transition_to(Expired));
    }

    #[test]
    fn test_cancellable() {
        use StrategyStatus::*;

        assert!(PendingActivation.is_cancellable());
        assert!(Active.is_cancellable());
        assert!(Paused.is_cancellable());
        assert!(!OrderSubmitted.is_cancellable());
        assert!(!Filled.is_cancellable());
        assert!(!Cancelled.is_cancellable());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(
            StrategyStatus::try_from("ORDER_SUBMITTED").unwrap(),
            StrategyStatus::OrderSubmitted
        );
        assert_eq!(
            StrategyStatus::try_from("pending_activation").unwrap(),
            StrategyStatus::PendingActivation
        );
        assert!(StrategyStatus::try_from("INVALID").is_err());
    }

    #[test]
    fn test_valid_transition_lists_match_table() {
        use StrategyStatus::*;

        let all = [
            PendingActivation,
            Verifying,
            VerifyFailed,
            Active,
            Paused,
            Triggered,
            OrderSubmitted,
            Filled,
            Expired,
            Cancelled,
            Failed,
        ];
        for from in all {
            for to in all {
                let listed = from.valid_transitions().contains(&to);
                assert_eq!(
                    listed,
                    from.can_transition_to(to),
                    "mismatch for {from} -> {to}"
                );
            }
        }
    }
}
