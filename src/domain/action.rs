use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::market::SecType;
use crate::domain::strategy::TradeType;
use crate::error::{Result, SentraError};

/// Order side sent to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MKT")]
    Market,
    #[serde(rename = "LMT")]
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit => "LMT",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time in force. Orders always go out DAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    #[default]
    Day,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DAY")
    }
}

/// The action a strategy carries out when triggered, stored as
/// `trade_action_json`. Tagged by `action_type`; one shape per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type")]
pub enum TradeAction {
    #[serde(rename = "STOCK_TRADE")]
    StockTrade {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        order_type: OrderType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<Decimal>,
        #[serde(default)]
        tif: TimeInForce,
        #[serde(default)]
        allow_overnight: bool,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
    #[serde(rename = "FUT_POSITION")]
    FutPosition {
        symbol: String,
        side: OrderSide,
        quantity: Decimal,
        order_type: OrderType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<Decimal>,
        /// Contract month, e.g. "202603"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contract: Option<String>,
        #[serde(default)]
        tif: TimeInForce,
        #[serde(default)]
        allow_overnight: bool,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
    /// Close the near contract, then open the far one for the same quantity.
    #[serde(rename = "FUT_ROLL")]
    FutRoll {
        symbol: String,
        near_contract: String,
        far_contract: String,
        quantity: Decimal,
        order_type: OrderType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_price: Option<Decimal>,
        #[serde(default)]
        tif: TimeInForce,
        #[serde(default)]
        cancel_on_expiry: bool,
    },
}

impl TradeAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            TradeAction::StockTrade { .. } => "STOCK_TRADE",
            TradeAction::FutPosition { .. } => "FUT_POSITION",
            TradeAction::FutRoll { .. } => "FUT_ROLL",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            TradeAction::StockTrade { symbol, .. }
            | TradeAction::FutPosition { symbol, .. }
            | TradeAction::FutRoll { symbol, .. } => symbol,
        }
    }

    pub fn quantity(&self) -> Decimal {
        match self {
            TradeAction::StockTrade { quantity, .. }
            | TradeAction::FutPosition { quantity, .. }
            | TradeAction::FutRoll { quantity, .. } => *quantity,
        }
    }

    pub fn order_type(&self) -> OrderType {
        match self {
            TradeAction::StockTrade { order_type, .. }
            | TradeAction::FutPosition { order_type, .. }
            | TradeAction::FutRoll { order_type, .. } => *order_type,
        }
    }

    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            TradeAction::StockTrade { limit_price, .. }
            | TradeAction::FutPosition { limit_price, .. }
            | TradeAction::FutRoll { limit_price, .. } => *limit_price,
        }
    }

    pub fn cancel_on_expiry(&self) -> bool {
        match self {
            TradeAction::StockTrade {
                cancel_on_expiry, ..
            }
            | TradeAction::FutPosition {
                cancel_on_expiry, ..
            }
            | TradeAction::FutRoll {
                cancel_on_expiry, ..
            } => *cancel_on_expiry,
        }
    }

    /// Sec-type compatibility: STK => STOCK_TRADE, FUT => FUT_POSITION | FUT_ROLL.
    pub fn compatible_with(&self, sec_type: SecType) -> bool {
        match self {
            TradeAction::StockTrade { .. } => sec_type == SecType::Stk,
            TradeAction::FutPosition { .. } | TradeAction::FutRoll { .. } => {
                sec_type == SecType::Fut
            }
        }
    }

    /// Validate the action against the owning strategy's intent.
    pub fn validate(&self, trade_type: TradeType) -> Result<()> {
        let expected_stock = trade_type.is_stock();
        match self {
            TradeAction::StockTrade { .. } if !expected_stock => {
                return Err(SentraError::Validation(format!(
                    "trade_type={trade_type} only allows action_type in FUT_POSITION/FUT_ROLL"
                )));
            }
            TradeAction::FutPosition { .. } | TradeAction::FutRoll { .. } if expected_stock => {
                return Err(SentraError::Validation(format!(
                    "trade_type={trade_type} only allows action_type=STOCK_TRADE"
                )));
            }
            _ => {}
        }

        if self.quantity() <= Decimal::ZERO {
            return Err(SentraError::Validation(
                "trade_action.quantity must be > 0".to_string(),
            ));
        }
        if self.symbol().trim().is_empty() {
            return Err(SentraError::Validation(
                "trade_action.symbol is required".to_string(),
            ));
        }
        if self.order_type() == OrderType::Limit {
            match self.limit_price() {
                Some(price) if price > Decimal::ZERO => {}
                _ => {
                    return Err(SentraError::Validation(
                        "trade_action.limit_price must be > 0 when order_type=LMT".to_string(),
                    ));
                }
            }
        }
        if let TradeAction::FutRoll {
            near_contract,
            far_contract,
            ..
        } = self
        {
            if near_contract.trim().is_empty() || far_contract.trim().is_empty() {
                return Err(SentraError::Validation(
                    "FUT_ROLL requires near_contract and far_contract".to_string(),
                ));
            }
            if near_contract == far_contract {
                return Err(SentraError::Validation(
                    "FUT_ROLL near_contract and far_contract must differ".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Human-readable one-liner shown on trade instructions,
    /// e.g. `STOCK_TRADE SELL 100 SLV MKT` or `FUT_ROLL SIH6 -> SIK6 qty=2`.
    pub fn instruction_summary(&self) -> String {
        match self {
            TradeAction::StockTrade {
                symbol,
                side,
                quantity,
                order_type,
                limit_price,
                ..
            }
            | TradeAction::FutPosition {
                symbol,
                side,
                quantity,
                order_type,
                limit_price,
                ..
            } => {
                let mut summary = format!(
                    "{} {side} {quantity} {symbol} {order_type}",
                    self.action_type()
                );
                if let Some(price) = limit_price {
                    summary.push_str(&format!(" @ {price}"));
                }
                summary
            }
            TradeAction::FutRoll {
                near_contract,
                far_contract,
                quantity,
                ..
            } => format!("FUT_ROLL {near_contract} -> {far_contract} qty={quantity}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stock_sell() -> TradeAction {
        TradeAction::StockTrade {
            symbol: "SLV".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(100),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            allow_overnight: false,
            cancel_on_expiry: false,
        }
    }

    #[test]
    fn test_action_type_tagging() {
        let json = serde_json::to_value(stock_sell()).unwrap();
        assert_eq!(json["action_type"], "STOCK_TRADE");
        assert_eq!(json["side"], "SELL");
        assert_eq!(json["order_type"], "MKT");

        let parsed: TradeAction = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, stock_sell());
    }

    #[test]
    fn test_trade_type_compatibility() {
        assert!(stock_sell().validate(TradeType::Sell).is_ok());
        assert!(stock_sell().validate(TradeType::Open).is_err());

        let roll = TradeAction::FutRoll {
            symbol: "SI".to_string(),
            near_contract: "202603".to_string(),
            far_contract: "202605".to_string(),
            quantity: dec!(2),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            cancel_on_expiry: true,
        };
        assert!(roll.validate(TradeType::Spread).is_ok());
        assert!(roll.validate(TradeType::Buy).is_err());
    }

    #[test]
    fn test_limit_requires_price() {
        let mut action = stock_sell();
        if let TradeAction::StockTrade {
            order_type,
            limit_price,
            ..
        } = &mut action
        {
            *order_type = OrderType::Limit;
            *limit_price = None;
        }
        assert!(action.validate(TradeType::Sell).is_err());

        if let TradeAction::StockTrade { limit_price, .. } = &mut action {
            *limit_price = Some(dec!(91.20));
        }
        assert!(action.validate(TradeType::Sell).is_ok());
    }

    #[test]
    fn test_roll_contract_validation() {
        let roll = TradeAction::FutRoll {
            symbol: "SI".to_string(),
            near_contract: "202603".to_string(),
            far_contract: "202603".to_string(),
            quantity: dec!(2),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            cancel_on_expiry: false,
        };
        assert!(roll.validate(TradeType::Spread).is_err());
    }

    #[test]
    fn test_instruction_summary() {
        assert_eq!(stock_sell().instruction_summary(), "STOCK_TRADE SELL 100 SLV MKT");

        let roll = TradeAction::FutRoll {
            symbol: "SI".to_string(),
            near_contract: "SIH6".to_string(),
            far_contract: "SIK6".to_string(),
            quantity: dec!(2),
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
            cancel_on_expiry: false,
        };
        assert_eq!(roll.instruction_summary(), "FUT_ROLL SIH6 -> SIK6 qty=2");
    }
}
