use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::strategy::TradeType;
use crate::error::{Result, SentraError};

/// Security type routed through the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecType {
    Stk,
    Fut,
}

impl SecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecType::Stk => "STK",
            SecType::Fut => "FUT",
        }
    }
}

impl fmt::Display for SecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SecType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "STK" => Ok(SecType::Stk),
            "FUT" => Ok(SecType::Fut),
            other => Err(format!("Unknown sec_type: {}", other)),
        }
    }
}

/// Deterministic `market -> (sec_type, exchange, currency)` mapping.
/// Only USD markets are supported.
#[derive(Debug, Clone, Serialize)]
pub struct MarketProfile {
    pub market: &'static str,
    pub sec_type: SecType,
    pub exchange: &'static str,
    pub currency: &'static str,
    pub allowed_trade_types: &'static [TradeType],
}

const STOCK_TRADE_TYPES: &[TradeType] = &[TradeType::Buy, TradeType::Sell, TradeType::Switch];
const FUT_TRADE_TYPES: &[TradeType] = &[TradeType::Open, TradeType::Close, TradeType::Spread];

const PROFILES: &[MarketProfile] = &[
    MarketProfile {
        market: "US_STOCK",
        sec_type: SecType::Stk,
        exchange: "SMART",
        currency: "USD",
        allowed_trade_types: STOCK_TRADE_TYPES,
    },
    MarketProfile {
        market: "US_ETF",
        sec_type: SecType::Stk,
        exchange: "SMART",
        currency: "USD",
        allowed_trade_types: STOCK_TRADE_TYPES,
    },
    MarketProfile {
        market: "US_METAL_FUT",
        sec_type: SecType::Fut,
        exchange: "COMEX",
        currency: "USD",
        allowed_trade_types: FUT_TRADE_TYPES,
    },
    MarketProfile {
        market: "US_ENERGY_FUT",
        sec_type: SecType::Fut,
        exchange: "NYMEX",
        currency: "USD",
        allowed_trade_types: FUT_TRADE_TYPES,
    },
    MarketProfile {
        market: "US_INDEX_FUT",
        sec_type: SecType::Fut,
        exchange: "CME",
        currency: "USD",
        allowed_trade_types: FUT_TRADE_TYPES,
    },
];

/// Resolve a market profile and check the trade type is allowed there.
pub fn resolve_market_profile(market: &str, trade_type: Option<TradeType>) -> Result<&'static MarketProfile> {
    let normalized = market.trim().to_uppercase();
    if normalized.is_empty() {
        return Err(SentraError::Validation("market is required".to_string()));
    }
    let profile = PROFILES
        .iter()
        .find(|p| p.market == normalized)
        .ok_or_else(|| {
            let supported: Vec<&str> = PROFILES.iter().map(|p| p.market).collect();
            SentraError::Validation(format!(
                "unsupported market={normalized}, supported: {}",
                supported.join(", ")
            ))
        })?;
    if let Some(tt) = trade_type {
        if !profile.allowed_trade_types.contains(&tt) {
            return Err(SentraError::Validation(format!(
                "market={} does not allow trade_type={}",
                profile.market, tt
            )));
        }
    }
    Ok(profile)
}

/// All known profiles keyed by market name (for the API rules export).
pub fn market_profiles() -> BTreeMap<&'static str, &'static MarketProfile> {
    PROFILES.iter().map(|p| (p.market, p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_stock_market() {
        let profile = resolve_market_profile("us_stock", Some(TradeType::Buy)).unwrap();
        assert_eq!(profile.sec_type, SecType::Stk);
        assert_eq!(profile.exchange, "SMART");
        assert_eq!(profile.currency, "USD");
    }

    #[test]
    fn test_trade_type_gate() {
        assert!(resolve_market_profile("US_STOCK", Some(TradeType::Open)).is_err());
        assert!(resolve_market_profile("US_METAL_FUT", Some(TradeType::Buy)).is_err());
        assert!(resolve_market_profile("US_METAL_FUT", Some(TradeType::Spread)).is_ok());
    }

    #[test]
    fn test_unknown_market() {
        assert!(resolve_market_profile("EU_STOCK", None).is_err());
        assert!(resolve_market_profile("", None).is_err());
    }
}
