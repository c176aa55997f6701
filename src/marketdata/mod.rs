//! Market-data types and the rolling-window bar cache.

mod cache;

pub use cache::MarketDataCache;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::window_to_seconds;
use crate::error::Result;

/// OHLCV sample over one contiguous time bucket. `ts` is the bucket start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    /// Volume-weighted average price when the feed provides one
    #[serde(default)]
    pub wap: Option<f64>,
    #[serde(default)]
    pub count: Option<i64>,
}

impl HistoricalBar {
    pub fn new(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            ts,
            open,
            high,
            low,
            close,
            volume: None,
            wap: None,
            count: None,
        }
    }
}

/// Contract reference handed to the gateway: market + normalized symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractRef {
    pub market: String,
    pub code: String,
}

impl ContractRef {
    pub fn new(market: &str, code: &str) -> Self {
        Self {
            market: market.trim().to_uppercase(),
            code: code.trim().to_uppercase(),
        }
    }

    /// Stable cache-key fragment.
    pub fn key(&self) -> String {
        format!("{}:{}", self.market, self.code)
    }
}

#[derive(Debug, Clone)]
pub struct HistoricalBarsRequest {
    pub contract: ContractRef,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Compact bar size: "1m", "5m", "15m", "1h", "1d"
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
    pub include_partial_bar: bool,
    pub max_bars: Option<usize>,
    pub page_size: Option<usize>,
}

impl HistoricalBarsRequest {
    pub fn new(
        contract: ContractRef,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        bar_size: &str,
    ) -> Self {
        Self {
            contract,
            start_time,
            end_time,
            bar_size: bar_size.trim().to_lowercase(),
            what_to_show: "TRADES".to_string(),
            use_rth: true,
            include_partial_bar: false,
            max_bars: None,
            page_size: Some(500),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BarsMeta {
    pub timezone: &'static str,
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
    pub include_partial_bar: bool,
    pub cache_hit_ratio: f64,
    pub has_gaps: bool,
    pub fetched_segments: Vec<Segment>,
    pub covered_segments: Vec<Segment>,
    pub returned_bars: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct HistoricalBarsResult {
    pub bars: Vec<HistoricalBar>,
    pub meta: BarsMeta,
}

/// Upstream source the cache pulls cold ranges from (the gateway adapter).
#[async_trait]
pub trait BarsFetcher: Send + Sync {
    async fn fetch(
        &self,
        contract: &ContractRef,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        bar_size: &str,
        what_to_show: &str,
        use_rth: bool,
    ) -> Result<Vec<HistoricalBar>>;
}

/// Compact bar size to its bucket duration.
pub fn bar_size_to_duration(bar_size: &str) -> Option<Duration> {
    window_to_seconds(bar_size).map(|secs| Duration::seconds(secs as i64))
}

/// End time of the newest bar that is already closed at `now`, if any.
pub fn latest_closed_bar_end(
    bars: &[HistoricalBar],
    bar_duration: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    bars.iter()
        .map(|bar| bar.ts + bar_duration)
        .filter(|end| *end <= now)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bar_size_to_duration() {
        assert_eq!(bar_size_to_duration("1m"), Some(Duration::minutes(1)));
        assert_eq!(bar_size_to_duration("15m"), Some(Duration::minutes(15)));
        assert_eq!(bar_size_to_duration("1h"), Some(Duration::hours(1)));
        assert_eq!(bar_size_to_duration("bogus"), None);
    }

    #[test]
    fn test_latest_closed_bar_end() {
        let t0 = Utc.with_ymd_and_hms(2026, 2, 20, 14, 0, 0).unwrap();
        let bars: Vec<HistoricalBar> = (0..5)
            .map(|i| HistoricalBar::new(t0 + Duration::minutes(i), 10.0, 11.0, 9.0, 10.5))
            .collect();

        // now is mid-way through the 3rd bar: bars 0 and 1 are closed
        let now = t0 + Duration::seconds(150);
        assert_eq!(
            latest_closed_bar_end(&bars, Duration::minutes(1), now),
            Some(t0 + Duration::minutes(2))
        );

        // nothing closed yet
        assert_eq!(
            latest_closed_bar_end(&bars, Duration::minutes(1), t0),
            None
        );
    }

    #[test]
    fn test_contract_key_normalizes() {
        let contract = ContractRef::new(" us_stock ", "slv");
        assert_eq!(contract.key(), "US_STOCK:SLV");
    }
}
