//! SQLite-backed historical-bar cache (C1). Coverage is tracked as merged
//! half-open `[start, end)` segments per cache key; only uncovered
//! sub-ranges hit the gateway, in page-sized chunks, and fetched bars are
//! upserted so re-fetches are idempotent.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{
    bar_size_to_duration, BarsFetcher, BarsMeta, HistoricalBar, HistoricalBarsRequest,
    HistoricalBarsResult, Segment,
};
use crate::error::{Result, SentraError};

type Range = (DateTime<Utc>, DateTime<Utc>);

pub struct MarketDataCache {
    pool: SqlitePool,
    fetcher: Arc<dyn BarsFetcher>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl MarketDataCache {
    pub async fn connect(db_path: &str, fetcher: Arc<dyn BarsFetcher>) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_bars (
              cache_key TEXT NOT NULL,
              ts TEXT NOT NULL,
              open REAL NOT NULL,
              high REAL NOT NULL,
              low REAL NOT NULL,
              close REAL NOT NULL,
              volume REAL,
              wap REAL,
              count INTEGER,
              updated_at TEXT NOT NULL,
              PRIMARY KEY (cache_key, ts)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_coverage (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              cache_key TEXT NOT NULL,
              start_ts TEXT NOT NULL,
              end_ts TEXT NOT NULL,
              CHECK (start_ts < end_ts)
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_market_coverage_key_start ON market_coverage (cache_key, start_ts, end_ts)",
        )
        .execute(&pool)
        .await?;

        info!(db_path, "market data cache initialized");
        Ok(Self {
            pool,
            fetcher,
            key_locks: DashMap::new(),
        })
    }

    fn key_lock(&self, cache_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Serve a rolling-window read: compute the minimal uncached sub-ranges,
    /// pull them from the gateway in page-sized slices, persist, and return
    /// the merged series plus cache meta.
    #[instrument(skip(self), fields(contract = %request.contract.key(), bar_size = %request.bar_size))]
    pub async fn get_historical_bars(
        &self,
        request: &HistoricalBarsRequest,
    ) -> Result<HistoricalBarsResult> {
        if request.start_time >= request.end_time {
            return Err(SentraError::Validation(
                "start_time must be earlier than end_time".to_string(),
            ));
        }
        if request.bar_size.trim().is_empty() {
            return Err(SentraError::Validation("bar_size cannot be empty".to_string()));
        }
        if matches!(request.max_bars, Some(0)) {
            return Err(SentraError::Validation("max_bars must be positive".to_string()));
        }
        if matches!(request.page_size, Some(0)) {
            return Err(SentraError::Validation("page_size must be positive".to_string()));
        }

        let cache_key = cache_key(request);
        let bar_duration = bar_size_to_duration(&request.bar_size);
        let lock = self.key_lock(&cache_key);
        let _guard = lock.lock().await;

        let mut coverage = self.load_coverage(&cache_key).await?;
        let missing = missing_segments(request.start_time, request.end_time, &coverage);
        debug!(
            coverage_segments = coverage.len(),
            missing_segments = missing.len(),
            "historical bars cache lookup"
        );

        // A bar that started inside the last bucket may still be open, so
        // coverage never extends past this horizon: the live edge gets
        // re-fetched (and re-upserted) until its bars are final.
        let live_horizon = bar_duration.map(|duration| Utc::now() - duration);

        let mut fetched_segments = Vec::new();
        for (gap_start, gap_end) in &missing {
            for (chunk_start, chunk_end) in
                split_by_page_size(*gap_start, *gap_end, bar_duration, request.page_size)
            {
                let bars = self
                    .fetcher
                    .fetch(
                        &request.contract,
                        chunk_start,
                        chunk_end,
                        &request.bar_size,
                        &request.what_to_show,
                        request.use_rth,
                    )
                    .await?;
                self.store_bars(&cache_key, &bars, chunk_start, chunk_end).await?;
                fetched_segments.push(Segment {
                    start: chunk_start,
                    end: chunk_end,
                });
                let coverage_end = match live_horizon {
                    Some(horizon) => chunk_end.min(horizon),
                    None => chunk_end,
                };
                if chunk_start < coverage_end {
                    coverage.push((chunk_start, coverage_end));
                }
            }
        }
        if !missing.is_empty() {
            self.replace_coverage(&cache_key, &coverage).await?;
        }

        let mut bars = self
            .read_bars(&cache_key, request.start_time, request.end_time)
            .await?;
        if !request.include_partial_bar {
            if let Some(duration) = bar_duration {
                let now = Utc::now();
                bars.retain(|bar| bar.ts + duration <= now);
            }
        }

        let mut truncated = false;
        if let Some(max_bars) = request.max_bars {
            if bars.len() > max_bars {
                // Never silently drop: keep the newest max_bars and flag it.
                bars.drain(..bars.len() - max_bars);
                truncated = true;
            }
        }

        let merged = merge_segments(&coverage);
        let covered_segments = intersect_segments(request.start_time, request.end_time, &merged);
        let requested_seconds = (request.end_time - request.start_time).num_seconds() as f64;
        let missing_seconds: f64 = missing
            .iter()
            .map(|(start, end)| (*end - *start).num_seconds() as f64)
            .sum();
        let cache_hit_ratio = if requested_seconds > 0.0 {
            ((requested_seconds - missing_seconds) / requested_seconds).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let meta = BarsMeta {
            timezone: "UTC",
            bar_size: request.bar_size.clone(),
            what_to_show: request.what_to_show.clone(),
            use_rth: request.use_rth,
            include_partial_bar: request.include_partial_bar,
            cache_hit_ratio,
            has_gaps: !missing.is_empty(),
            fetched_segments,
            covered_segments: covered_segments
                .into_iter()
                .map(|(start, end)| Segment { start, end })
                .collect(),
            returned_bars: bars.len(),
            truncated,
        };
        debug!(
            returned_bars = meta.returned_bars,
            cache_hit_ratio = meta.cache_hit_ratio,
            truncated = meta.truncated,
            "historical bars served"
        );
        Ok(HistoricalBarsResult { bars, meta })
    }

    async fn load_coverage(&self, cache_key: &str) -> Result<Vec<Range>> {
        let rows = sqlx::query(
            "SELECT start_ts, end_ts FROM market_coverage WHERE cache_key = ? ORDER BY start_ts ASC",
        )
        .bind(cache_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("start_ts")?, row.try_get("end_ts")?)))
            .collect()
    }

    async fn replace_coverage(&self, cache_key: &str, segments: &[Range]) -> Result<()> {
        let merged = merge_segments(segments);
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM market_coverage WHERE cache_key = ?")
            .bind(cache_key)
            .execute(&mut *tx)
            .await?;
        for (start, end) in merged {
            sqlx::query(
                "INSERT INTO market_coverage (cache_key, start_ts, end_ts) VALUES (?, ?, ?)",
            )
            .bind(cache_key)
            .bind(start)
            .bind(end)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store_bars(
        &self,
        cache_key: &str,
        bars: &[HistoricalBar],
        segment_start: DateTime<Utc>,
        segment_end: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for bar in bars {
            if bar.ts < segment_start || bar.ts >= segment_end {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO market_bars (
                  cache_key, ts, open, high, low, close, volume, wap, count, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (cache_key, ts) DO UPDATE SET
                  open = excluded.open,
                  high = excluded.high,
                  low = excluded.low,
                  close = excluded.close,
                  volume = excluded.volume,
                  wap = excluded.wap,
                  count = excluded.count,
                  updated_at = excluded.updated_at
                "#,
            )
            .bind(cache_key)
            .bind(bar.ts)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.wap)
            .bind(bar.count)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_bars(
        &self,
        cache_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoricalBar>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, open, high, low, close, volume, wap, count
            FROM market_bars
            WHERE cache_key = ? AND ts >= ? AND ts < ?
            ORDER BY ts ASC
            "#,
        )
        .bind(cache_key)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(HistoricalBar {
                    ts: row.try_get("ts")?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: row.try_get("volume")?,
                    wap: row.try_get("wap")?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }
}

fn cache_key(request: &HistoricalBarsRequest) -> String {
    format!(
        "{}|{}|{}|{}",
        request.contract.key(),
        request.bar_size.trim().to_lowercase(),
        request.what_to_show.trim().to_uppercase(),
        if request.use_rth { "1" } else { "0" }
    )
}

/// Merge overlapping/adjacent segments into a minimal sorted cover.
fn merge_segments(segments: &[Range]) -> Vec<Range> {
    if segments.is_empty() {
        return Vec::new();
    }
    let mut ordered = segments.to_vec();
    ordered.sort_by_key(|(start, _)| *start);
    let mut merged = Vec::new();
    let (mut cur_start, mut cur_end) = ordered[0];
    for (start, end) in ordered.into_iter().skip(1) {
        if start <= cur_end {
            cur_end = cur_end.max(end);
        } else {
            merged.push((cur_start, cur_end));
            cur_start = start;
            cur_end = end;
        }
    }
    merged.push((cur_start, cur_end));
    merged
}

/// Sub-ranges of [start, end) not covered by the sorted coverage list.
fn missing_segments(start: DateTime<Utc>, end: DateTime<Utc>, coverage: &[Range]) -> Vec<Range> {
    if start >= end {
        return Vec::new();
    }
    let mut gaps = Vec::new();
    let mut cursor = start;
    for (seg_start, seg_end) in merge_segments(coverage) {
        if seg_end <= cursor {
            continue;
        }
        if seg_start > cursor {
            gaps.push((cursor, seg_start.min(end)));
        }
        cursor = cursor.max(seg_end);
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    gaps.retain(|(s, e)| s < e);
    gaps
}

fn intersect_segments(start: DateTime<Utc>, end: DateTime<Utc>, coverage: &[Range]) -> Vec<Range> {
    coverage
        .iter()
        .filter_map(|(seg_start, seg_end)| {
            let hit_start = start.max(*seg_start);
            let hit_end = end.min(*seg_end);
            (hit_start < hit_end).then_some((hit_start, hit_end))
        })
        .collect()
}

/// Split a gap into page-sized chunks so one gateway call never asks for
/// more than `page_size` bars.
fn split_by_page_size(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    bar_duration: Option<Duration>,
    page_size: Option<usize>,
) -> Vec<Range> {
    let (Some(duration), Some(page_size)) = (bar_duration, page_size) else {
        return vec![(start, end)];
    };
    if page_size == 0 || duration <= Duration::zero() {
        return vec![(start, end)];
    }
    let chunk = duration * page_size as i32;
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let chunk_end = (cursor + chunk).min(end);
        out.push((cursor, chunk_end));
        cursor = chunk_end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 20, 14, minute, 0).unwrap()
    }

    #[test]
    fn test_merge_segments() {
        let merged = merge_segments(&[(ts(10), ts(20)), (ts(0), ts(12)), (ts(30), ts(40))]);
        assert_eq!(merged, vec![(ts(0), ts(20)), (ts(30), ts(40))]);

        // adjacent segments fuse
        let merged = merge_segments(&[(ts(0), ts(10)), (ts(10), ts(20))]);
        assert_eq!(merged, vec![(ts(0), ts(20))]);
    }

    #[test]
    fn test_missing_segments() {
        let coverage = vec![(ts(5), ts(10)), (ts(20), ts(25))];
        let gaps = missing_segments(ts(0), ts(30), &coverage);
        assert_eq!(
            gaps,
            vec![(ts(0), ts(5)), (ts(10), ts(20)), (ts(25), ts(30))]
        );

        // fully covered
        assert!(missing_segments(ts(6), ts(9), &coverage).is_empty());

        // no coverage at all
        assert_eq!(missing_segments(ts(0), ts(3), &[]), vec![(ts(0), ts(3))]);
    }

    #[test]
    fn test_intersect_segments() {
        let coverage = vec![(ts(0), ts(10)), (ts(20), ts(30))];
        let hits = intersect_segments(ts(5), ts(25), &coverage);
        assert_eq!(hits, vec![(ts(5), ts(10)), (ts(20), ts(25))]);
    }

    #[test]
    fn test_split_by_page_size() {
        let chunks = split_by_page_size(ts(0), ts(25), Some(Duration::minutes(1)), Some(10));
        assert_eq!(
            chunks,
            vec![(ts(0), ts(10)), (ts(10), ts(20)), (ts(20), ts(25))]
        );

        // no paging info: one chunk
        let chunks = split_by_page_size(ts(0), ts(25), None, Some(10));
        assert_eq!(chunks, vec![(ts(0), ts(25))]);
    }
}
