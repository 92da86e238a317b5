// =============================================================================
// Market data persistence — candles, feature cache, precompute queue, archival
// =============================================================================
//
// Candle inserts are INSERT OR IGNORE on (symbol, interval, open_time_ms), so
// re-pulling an overlapping kline window is harmless. Cache rows carry the
// feature version in their primary key: versions coexist and a writer can
// never clobber another version's rows. Archival moves closed ranges into the
// *_history twins with insert-ignore + delete on the same range, making
// re-runs no-ops.
// =============================================================================

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::types::{Candle, TaskStatus};

/// One cached feature row.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub open_time_ms: i64,
    pub feature_version: i64,
    pub features_json: String,
}

/// One precompute task.
#[derive(Debug, Clone)]
pub struct PrecomputeTask {
    pub symbol: String,
    pub interval: String,
    pub open_time_ms: i64,
    pub feature_version: i64,
    pub status: TaskStatus,
    pub try_count: i64,
}

/// Hot tables eligible for archival, paired with their history twins.
/// A closed set so table names never come from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTable {
    MarketData,
    MarketDataCache,
}

impl ArchiveTable {
    pub fn hot(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::MarketDataCache => "market_data_cache",
        }
    }

    pub fn history(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data_history",
            Self::MarketDataCache => "market_data_cache_history",
        }
    }
}

/// Outcome of one archival run over one table.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOutcome {
    pub moved_rows: u64,
    pub batches: u32,
}

impl Database {
    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// The newest stored bar-open time for (symbol, interval).
    pub async fn latest_open_time(&self, symbol: &str, interval: &str) -> Result<Option<i64>> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            let t = conn
                .query_row(
                    "SELECT MAX(open_time_ms) FROM market_data
                     WHERE symbol = ?1 AND interval = ?2",
                    params![symbol, interval],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten();
            Ok(t)
        })
        .await
    }

    /// Insert candles with INSERT OR IGNORE semantics; returns how many rows
    /// were actually new.
    pub async fn insert_candles(
        &self,
        symbol: &str,
        interval: &str,
        candles: &[Candle],
    ) -> Result<u64> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        let candles = candles.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0u64;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO market_data
                         (symbol, interval, open_time_ms, open, high, low, close,
                          volume, close_time_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for c in &candles {
                    inserted += stmt.execute(params![
                        symbol,
                        interval,
                        c.open_time_ms,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                        c.close_time_ms,
                    ])? as u64;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    /// The most recent `limit` candles at or before `up_to_open_ms`, oldest
    /// first — the indicator look-back window for one bar.
    pub async fn candles_up_to(
        &self,
        symbol: &str,
        interval: &str,
        up_to_open_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT open_time_ms, open, high, low, close, volume, close_time_ms
                 FROM market_data
                 WHERE symbol = ?1 AND interval = ?2 AND open_time_ms <= ?3
                 ORDER BY open_time_ms DESC
                 LIMIT ?4",
            )?;
            let mut rows = stmt
                .query_map(params![symbol, interval, up_to_open_ms, limit], |row| {
                    Ok(Candle {
                        open_time_ms: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                        close_time_ms: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    /// Close prices up to `up_to_open_ms`, oldest first (correlation input).
    pub async fn closes_up_to(
        &self,
        symbol: &str,
        interval: &str,
        up_to_open_ms: i64,
        limit: u32,
    ) -> Result<Vec<f64>> {
        let candles = self.candles_up_to(symbol, interval, up_to_open_ms, limit).await?;
        Ok(candles.into_iter().map(|c| c.close).collect())
    }

    /// Stored bar-open times in `[from_ms, to_ms]` ascending, for gap scans.
    pub async fn open_times_between(
        &self,
        symbol: &str,
        interval: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<i64>> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT open_time_ms FROM market_data
                 WHERE symbol = ?1 AND interval = ?2
                   AND open_time_ms BETWEEN ?3 AND ?4
                 ORDER BY open_time_ms",
            )?;
            let times = stmt
                .query_map(params![symbol, interval, from_ms, to_ms], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            Ok(times)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Feature cache
    // -------------------------------------------------------------------------

    /// Write one cache row at a feature version. INSERT OR IGNORE: versions
    /// coexist and an existing row is never overwritten. Returns whether the
    /// row was new.
    pub async fn write_cache(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
        features_json: &str,
        created_at_ms: i64,
    ) -> Result<bool> {
        let (symbol, interval, features_json) = (
            symbol.to_string(),
            interval.to_string(),
            features_json.to_string(),
        );
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO market_data_cache
                     (symbol, interval, open_time_ms, feature_version,
                      features_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    symbol,
                    interval,
                    open_time_ms,
                    feature_version,
                    features_json,
                    created_at_ms
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    /// Latest cache row at `feature_version`.
    pub async fn latest_cache(
        &self,
        symbol: &str,
        interval: &str,
        feature_version: i64,
    ) -> Result<Option<CacheRow>> {
        let rows = self.last_n_cache(symbol, interval, feature_version, 1).await?;
        Ok(rows.into_iter().next_back())
    }

    /// Last two cache rows at `feature_version`, oldest first — the prev/now
    /// pair the entry template compares.
    pub async fn last_two_cache(
        &self,
        symbol: &str,
        interval: &str,
        feature_version: i64,
    ) -> Result<Vec<CacheRow>> {
        self.last_n_cache(symbol, interval, feature_version, 2).await
    }

    async fn last_n_cache(
        &self,
        symbol: &str,
        interval: &str,
        feature_version: i64,
        n: u32,
    ) -> Result<Vec<CacheRow>> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT open_time_ms, feature_version, features_json
                 FROM market_data_cache
                 WHERE symbol = ?1 AND interval = ?2 AND feature_version = ?3
                 ORDER BY open_time_ms DESC
                 LIMIT ?4",
            )?;
            let mut rows = stmt
                .query_map(params![symbol, interval, feature_version, n], |row| {
                    Ok(CacheRow {
                        open_time_ms: row.get(0)?,
                        feature_version: row.get(1)?,
                        features_json: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    /// Whether a cache row exists for one bar at one version.
    pub async fn cache_exists(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
    ) -> Result<bool> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM market_data_cache
                    WHERE symbol = ?1 AND interval = ?2
                      AND open_time_ms = ?3 AND feature_version = ?4
                )",
                params![symbol, interval, open_time_ms, feature_version],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Precompute queue
    // -------------------------------------------------------------------------

    /// Enqueue a PENDING precompute task; a task already queued for the same
    /// (symbol, interval, bar, version) is left untouched.
    pub async fn enqueue_precompute_task(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
        trace_id: &str,
    ) -> Result<bool> {
        let (symbol, interval, trace_id) = (
            symbol.to_string(),
            interval.to_string(),
            trace_id.to_string(),
        );
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO precompute_tasks
                     (symbol, interval, open_time_ms, feature_version, status,
                      try_count, trace_id)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5)",
                params![symbol, interval, open_time_ms, feature_version, trace_id],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    /// Force a task back to PENDING with a fresh try budget. Used by gap
    /// healing, where the underlying bar was re-pulled and a previously DONE
    /// or parked task must recompute.
    pub async fn requeue_precompute_task(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
        trace_id: &str,
    ) -> Result<()> {
        let (symbol, interval, trace_id) = (
            symbol.to_string(),
            interval.to_string(),
            trace_id.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO precompute_tasks
                     (symbol, interval, open_time_ms, feature_version, status,
                      try_count, trace_id)
                 VALUES (?1, ?2, ?3, ?4, 'PENDING', 0, ?5)
                 ON CONFLICT(symbol, interval, open_time_ms, feature_version)
                 DO UPDATE SET status = 'PENDING', try_count = 0,
                               last_error = NULL, trace_id = ?5",
                params![symbol, interval, open_time_ms, feature_version, trace_id],
            )?;
            Ok(())
        })
        .await
    }

    /// PENDING tasks for one symbol at one version, newest bar first — fresh
    /// bars feed the tick loop; historical backfill drains behind them.
    pub async fn pending_tasks(
        &self,
        symbol: &str,
        feature_version: i64,
        limit: u32,
    ) -> Result<Vec<PrecomputeTask>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, interval, open_time_ms, feature_version, status, try_count
                 FROM precompute_tasks
                 WHERE symbol = ?1 AND feature_version = ?2 AND status = 'PENDING'
                 ORDER BY open_time_ms DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![symbol, feature_version, limit], |row| {
                    let status: String = row.get(4)?;
                    Ok(PrecomputeTask {
                        symbol: row.get(0)?,
                        interval: row.get(1)?,
                        open_time_ms: row.get(2)?,
                        feature_version: row.get(3)?,
                        status: match status.as_str() {
                            "DONE" => TaskStatus::Done,
                            "ERROR" => TaskStatus::Error,
                            _ => TaskStatus::Pending,
                        },
                        try_count: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Mark a task DONE.
    pub async fn complete_task(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
    ) -> Result<()> {
        let (symbol, interval) = (symbol.to_string(), interval.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE precompute_tasks SET status = 'DONE'
                 WHERE symbol = ?1 AND interval = ?2
                   AND open_time_ms = ?3 AND feature_version = ?4",
                params![symbol, interval, open_time_ms, feature_version],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a task failure: bump try_count, keep it PENDING until
    /// `max_tries`, then park it as ERROR with the last error message.
    pub async fn fail_task(
        &self,
        symbol: &str,
        interval: &str,
        open_time_ms: i64,
        feature_version: i64,
        error: &str,
        max_tries: i64,
    ) -> Result<()> {
        let (symbol, interval, error) = (
            symbol.to_string(),
            interval.to_string(),
            error.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE precompute_tasks
                 SET try_count = try_count + 1,
                     last_error = ?5,
                     status = CASE WHEN try_count + 1 >= ?6
                                   THEN 'ERROR' ELSE 'PENDING' END
                 WHERE symbol = ?1 AND interval = ?2
                   AND open_time_ms = ?3 AND feature_version = ?4",
                params![symbol, interval, open_time_ms, feature_version, error, max_tries],
            )?;
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Archival
    // -------------------------------------------------------------------------

    /// Move rows with `open_time_ms < cutoff_ms` from `table`'s hot side to
    /// its history twin, in bounded batches, one transaction per batch, and
    /// record each range in `archive_audit`. Safe to re-run for the same
    /// cutoff: insert-ignore + delete over identical ranges moves 0 rows.
    pub async fn archive_older_than(
        &self,
        table: ArchiveTable,
        cutoff_ms: i64,
        batch_rows: usize,
        trace_id: &str,
        now_ms: i64,
    ) -> Result<ArchiveOutcome> {
        let trace_id = trace_id.to_string();
        self.with_conn(move |conn| {
            let hot = table.hot();
            let history = table.history();
            let mut outcome = ArchiveOutcome::default();

            loop {
                // Upper bound of this batch: the open time `batch_rows` deep
                // into the remaining backlog (or the cutoff itself).
                let bound: Option<i64> = conn
                    .query_row(
                        &format!(
                            "SELECT open_time_ms FROM {hot}
                             WHERE open_time_ms < ?1
                             ORDER BY open_time_ms
                             LIMIT 1 OFFSET ?2"
                        ),
                        params![cutoff_ms, batch_rows as i64 - 1],
                        |row| row.get(0),
                    )
                    .optional()?;

                let range_end = bound.unwrap_or(cutoff_ms - 1);

                let range_start: Option<i64> = conn
                    .query_row(
                        &format!(
                            "SELECT MIN(open_time_ms) FROM {hot}
                             WHERE open_time_ms <= ?1"
                        ),
                        params![range_end],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();

                let Some(range_start) = range_start else {
                    break; // Nothing left below the cutoff.
                };

                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {history}
                         SELECT * FROM {hot}
                         WHERE open_time_ms >= ?1 AND open_time_ms <= ?2"
                    ),
                    params![range_start, range_end],
                )?;
                let deleted = tx.execute(
                    &format!(
                        "DELETE FROM {hot}
                         WHERE open_time_ms >= ?1 AND open_time_ms <= ?2"
                    ),
                    params![range_start, range_end],
                )?;
                tx.execute(
                    "INSERT INTO archive_audit
                         (table_name, from_open_time, to_open_time, moved_rows,
                          trace_id, status, message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'OK', NULL, ?6)",
                    params![hot, range_start, range_end, deleted as i64, trace_id, now_ms],
                )?;
                tx.commit().context("archive batch commit failed")?;

                outcome.moved_rows += deleted as u64;
                outcome.batches += 1;

                if deleted == 0 {
                    break;
                }
            }

            Ok(outcome)
        })
        .await
    }

    /// Total rows recorded as moved for one table (test support).
    #[cfg(test)]
    pub async fn audited_moved_rows(&self, table: ArchiveTable) -> Result<i64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COALESCE(SUM(moved_rows), 0) FROM archive_audit
                 WHERE table_name = ?1",
                params![table.hot()],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    #[cfg(test)]
    pub async fn history_row_count(&self, table: ArchiveTable) -> Result<i64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.history()),
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const IV: i64 = 900_000;

    fn bars(n: usize, start_ms: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let open_time = start_ms + i as i64 * IV;
                let base = 100.0 + i as f64;
                Candle::new(open_time, base, base + 1.0, base - 1.0, base + 0.5, 10.0, open_time + IV - 1)
            })
            .collect()
    }

    #[tokio::test]
    async fn candle_insert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let candles = bars(10, 0);
        assert_eq!(db.insert_candles("BTCUSDT", "15m", &candles).await.unwrap(), 10);
        assert_eq!(db.insert_candles("BTCUSDT", "15m", &candles).await.unwrap(), 0);
        assert_eq!(db.latest_open_time("BTCUSDT", "15m").await.unwrap(), Some(9 * IV));
    }

    #[tokio::test]
    async fn candles_up_to_returns_window_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        db.insert_candles("BTCUSDT", "15m", &bars(20, 0)).await.unwrap();
        let window = db.candles_up_to("BTCUSDT", "15m", 10 * IV, 5).await.unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].open_time_ms, 6 * IV);
        assert_eq!(window[4].open_time_ms, 10 * IV);
    }

    #[tokio::test]
    async fn feature_versions_are_isolated() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.write_cache("BTCUSDT", "15m", 0, 1, r#"{"v":1}"#, 10).await.unwrap());
        // Writing at v=2 does not mutate the v=1 row.
        assert!(db.write_cache("BTCUSDT", "15m", 0, 2, r#"{"v":2}"#, 20).await.unwrap());
        // Re-writing v=1 never overwrites.
        assert!(!db.write_cache("BTCUSDT", "15m", 0, 1, r#"{"v":"other"}"#, 30).await.unwrap());

        let v1 = db.latest_cache("BTCUSDT", "15m", 1).await.unwrap().unwrap();
        assert_eq!(v1.features_json, r#"{"v":1}"#);
        let v2 = db.latest_cache("BTCUSDT", "15m", 2).await.unwrap().unwrap();
        assert_eq!(v2.features_json, r#"{"v":2}"#);
        // Reading at v=3 sees nothing.
        assert!(db.latest_cache("BTCUSDT", "15m", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_two_cache_is_prev_then_now() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..3 {
            db.write_cache("BTCUSDT", "15m", i * IV, 1, &format!(r#"{{"bar":{i}}}"#), 0)
                .await
                .unwrap();
        }
        let pair = db.last_two_cache("BTCUSDT", "15m", 1).await.unwrap();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0].open_time_ms, IV);
        assert_eq!(pair[1].open_time_ms, 2 * IV);
    }

    #[tokio::test]
    async fn precompute_task_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.enqueue_precompute_task("BTCUSDT", "15m", 0, 1, "t").await.unwrap());
        assert!(!db.enqueue_precompute_task("BTCUSDT", "15m", 0, 1, "t").await.unwrap());

        let pending = db.pending_tasks("BTCUSDT", 1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].try_count, 0);

        // Two failures below the cap keep it pending.
        db.fail_task("BTCUSDT", "15m", 0, 1, "no data yet", 3).await.unwrap();
        db.fail_task("BTCUSDT", "15m", 0, 1, "still no data", 3).await.unwrap();
        let pending = db.pending_tasks("BTCUSDT", 1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].try_count, 2);

        // Third failure parks it as ERROR.
        db.fail_task("BTCUSDT", "15m", 0, 1, "gave up", 3).await.unwrap();
        assert!(db.pending_tasks("BTCUSDT", 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_resurrects_done_and_parked_tasks() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue_precompute_task("BTCUSDT", "15m", 0, 1, "t").await.unwrap();
        db.complete_task("BTCUSDT", "15m", 0, 1).await.unwrap();
        assert!(db.pending_tasks("BTCUSDT", 1, 10).await.unwrap().is_empty());

        // Gap healing re-pulled the bar: the task must run again.
        db.requeue_precompute_task("BTCUSDT", "15m", 0, 1, "t2").await.unwrap();
        let pending = db.pending_tasks("BTCUSDT", 1, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].try_count, 0);

        // A plain enqueue never resurrects existing rows.
        db.complete_task("BTCUSDT", "15m", 0, 1).await.unwrap();
        assert!(!db.enqueue_precompute_task("BTCUSDT", "15m", 0, 1, "t3").await.unwrap());
        assert!(db.pending_tasks("BTCUSDT", 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completing_a_task_removes_it_from_pending() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue_precompute_task("BTCUSDT", "15m", 0, 1, "t").await.unwrap();
        db.complete_task("BTCUSDT", "15m", 0, 1).await.unwrap();
        assert!(db.pending_tasks("BTCUSDT", 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archival_moves_rows_and_reruns_move_zero() {
        let db = Database::open_in_memory().unwrap();
        db.insert_candles("BTCUSDT", "15m", &bars(100, 0)).await.unwrap();

        let cutoff = 50 * IV;
        let first = db
            .archive_older_than(ArchiveTable::MarketData, cutoff, 20, "trace-a", 999)
            .await
            .unwrap();
        assert_eq!(first.moved_rows, 50);
        assert!(first.batches >= 3, "bounded batches expected, got {}", first.batches);

        // History holds exactly the audited count.
        assert_eq!(db.history_row_count(ArchiveTable::MarketData).await.unwrap(), 50);
        assert_eq!(db.audited_moved_rows(ArchiveTable::MarketData).await.unwrap(), 50);

        // Hot side keeps the newer rows.
        assert_eq!(db.latest_open_time("BTCUSDT", "15m").await.unwrap(), Some(99 * IV));
        let remaining = db.open_times_between("BTCUSDT", "15m", 0, 100 * IV).await.unwrap();
        assert_eq!(remaining.len(), 50);
        assert_eq!(remaining[0], 50 * IV);

        // Re-run: zero rows moved.
        let rerun = db
            .archive_older_than(ArchiveTable::MarketData, cutoff, 20, "trace-b", 1000)
            .await
            .unwrap();
        assert_eq!(rerun.moved_rows, 0);
        assert_eq!(db.history_row_count(ArchiveTable::MarketData).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn cache_archival_keeps_versions_distinct() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..10i64 {
            db.write_cache("BTCUSDT", "15m", i * IV, 1, "{}", 0).await.unwrap();
            db.write_cache("BTCUSDT", "15m", i * IV, 2, "{}", 0).await.unwrap();
        }
        let out = db
            .archive_older_than(ArchiveTable::MarketDataCache, 5 * IV, 100, "t", 0)
            .await
            .unwrap();
        assert_eq!(out.moved_rows, 10); // five bars × two versions
        assert_eq!(db.history_row_count(ArchiveTable::MarketDataCache).await.unwrap(), 10);
        assert_eq!(db.last_two_cache("BTCUSDT", "15m", 1).await.unwrap().len(), 2);
    }
}
