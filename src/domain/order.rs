use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalized order status derived from raw gateway statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    OrderSubmitted,
    PartialFill,
    Filled,
    Cancelled,
    Failed,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::OrderSubmitted => "ORDER_SUBMITTED",
            OrderStatus::PartialFill => "PARTIAL_FILL",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "ORDER_SUBMITTED" => Ok(OrderStatus::OrderSubmitted),
            "PARTIAL_FILL" => Ok(OrderStatus::PartialFill),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "FAILED" => Ok(OrderStatus::Failed),
            "UNKNOWN" => Ok(OrderStatus::Unknown),
            other => Err(format!("Unknown order status: {}", other)),
        }
    }
}

/// Map a raw gateway status plus fill counters into a normalized status.
/// Mirrors the status vocabulary of the IB-style gateway: pending/submitted
/// shapes stay live, `INACTIVE` is a reject, and fill counters win when the
/// raw status is silent.
pub fn normalize_order_status(
    raw_status: &str,
    filled_qty: Decimal,
    remaining_qty: Decimal,
) -> OrderStatus {
    let status = raw_status.trim().to_uppercase();
    match status.as_str() {
        "FILLED" => return OrderStatus::Filled,
        "CANCELLED" | "APICANCELLED" => return OrderStatus::Cancelled,
        "INACTIVE" | "REJECTED" => return OrderStatus::Failed,
        "PENDINGSUBMIT" | "PRESUBMITTED" | "SUBMITTED" | "PENDINGCANCEL" => {
            if filled_qty > Decimal::ZERO && remaining_qty > Decimal::ZERO {
                return OrderStatus::PartialFill;
            }
            return OrderStatus::OrderSubmitted;
        }
        _ => {}
    }
    if filled_qty > Decimal::ZERO && remaining_qty <= Decimal::ZERO {
        OrderStatus::Filled
    } else if filled_qty > Decimal::ZERO {
        OrderStatus::PartialFill
    } else if !status.is_empty() {
        OrderStatus::OrderSubmitted
    } else {
        OrderStatus::Unknown
    }
}

/// Persistent order row; FUT_ROLL strategies carry two legs under one trade_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub trade_id: String,
    pub strategy_id: String,
    pub leg: i64,
    pub ib_order_id: Option<i64>,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub order_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// External-facing projection of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeInstruction {
    pub trade_id: String,
    pub strategy_id: String,
    pub instruction_summary: String,
    pub status: String,
    pub expire_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry per strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub detail: String,
    pub strategy_id: Option<String>,
}

/// Merged verification/execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLog {
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub trade_id: String,
    pub stage: String,
    pub result: String,
    pub detail: String,
}

/// Audit of one verification rule evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub trade_id: String,
    pub strategy_id: String,
    pub rule_id: String,
    pub rule_version: i64,
    pub passed: bool,
    pub reason: String,
    pub snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Gateway-level portfolio projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub net_liquidation: Decimal,
    pub available_funds: Decimal,
    pub daily_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Gateway-level position projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionItem {
    pub sec_type: super::SecType,
    pub symbol: String,
    pub position_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub market_value: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_normalize_terminal_statuses() {
        assert_eq!(
            normalize_order_status("Filled", dec!(100), dec!(0)),
            OrderStatus::Filled
        );
        assert_eq!(
            normalize_order_status("ApiCancelled", dec!(0), dec!(100)),
            OrderStatus::Cancelled
        );
        assert_eq!(
            normalize_order_status("Inactive", dec!(0), dec!(100)),
            OrderStatus::Failed
        );
    }

    #[test]
    fn test_normalize_live_statuses() {
        assert_eq!(
            normalize_order_status("Submitted", dec!(0), dec!(100)),
            OrderStatus::OrderSubmitted
        );
        assert_eq!(
            normalize_order_status("Submitted", dec!(40), dec!(60)),
            OrderStatus::PartialFill
        );
        assert_eq!(
            normalize_order_status("PendingCancel", dec!(0), dec!(100)),
            OrderStatus::OrderSubmitted
        );
    }

    #[test]
    fn test_normalize_from_fill_counters() {
        assert_eq!(
            normalize_order_status("", dec!(100), dec!(0)),
            OrderStatus::Filled
        );
        assert_eq!(
            normalize_order_status("", dec!(40), dec!(60)),
            OrderStatus::PartialFill
        );
        assert_eq!(
            normalize_order_status("", dec!(0), dec!(0)),
            OrderStatus::Unknown
        );
        assert_eq!(
            normalize_order_status("SomethingNew", dec!(0), dec!(100)),
            OrderStatus::OrderSubmitted
        );
    }

    #[test]
    fn test_terminal_flag() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(!OrderStatus::PartialFill.is_terminal());
        assert!(!OrderStatus::OrderSubmitted.is_terminal());
    }
}
