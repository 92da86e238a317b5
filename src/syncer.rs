// =============================================================================
// Data Syncer — incremental candle ingestion, feature precompute, archival
// =============================================================================
//
// Per pass and per symbol:
//   1. Pull klines from the gateway starting after the newest stored bar,
//      page by page, keeping only closed candles.
//   2. INSERT-IGNORE into market_data.
//   3. Scan the recent window for gaps; enqueue a precompute task per missing
//      bar and re-pull the hole.
//   4. Enqueue precompute tasks for stored bars missing a cache row at the
//      current feature version, then drain the pending queue: compute the
//      indicator set and write market_data_cache. Failures bump try_count.
//   5. Emit a DATA_LAG alert (per-symbol cooldown) when the newest bar close
//      is older than the configured threshold.
//
// Once per HK day at midnight, rows older than the retention window move to
// the *_history tables in bounded transactional batches, audited per range.
// Uncaught per-symbol errors land on the order-event stream as ERROR rows
// with service="data-syncer" so the audit trail stays unified.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{bar_open_ms, format_hk, format_utc, hk_date_key, Clock};
use crate::control::ControlHandle;
use crate::db::market::ArchiveTable;
use crate::db::orders::OrderEventRecord;
use crate::db::Database;
use crate::exchange::gateway::ExchangeGateway;
use crate::features::{compute_features, CORRELATION_BARS, MIN_BARS};
use crate::ids::new_trace_id;
use crate::notify::{system_alert, Notifier};
use crate::settings::Settings;
use crate::types::{reason, OrderEventType, Side};

pub const SERVICE: &str = "data-syncer";

/// Kline page size requested from the gateway.
const KLINE_PAGE_LIMIT: u32 = 500;

/// How far back a cold database back-fills on first sync.
const INITIAL_BACKFILL_BARS: i64 = 200;

/// Bars covered by the gap scan each pass.
const GAP_SCAN_BARS: i64 = 200;

/// Precompute attempts before a task parks as ERROR.
const TASK_MAX_TRIES: i64 = 5;

/// Pending tasks drained per symbol per pass.
const TASK_BATCH: u32 = 64;

/// Seconds between sync passes.
const SYNC_LOOP_SECONDS: u64 = 30;

/// Reference symbol for the best-effort correlation feature.
const CORRELATION_REFERENCE: &str = "BTCUSDT";

pub struct DataSyncer {
    db: Database,
    gateway: Arc<ExchangeGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    control: Arc<ControlHandle>,
    settings: Settings,
    instance_id: String,
    /// Last DATA_LAG alert per symbol, UTC ms.
    lag_alerted_at: Mutex<HashMap<String, i64>>,
    /// HK date key of the last completed archival run.
    last_archive_day: Mutex<Option<i64>>,
}

impl DataSyncer {
    pub fn new(
        db: Database,
        gateway: Arc<ExchangeGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        control: Arc<ControlHandle>,
        settings: Settings,
        instance_id: String,
    ) -> Self {
        Self {
            db,
            gateway,
            notifier,
            clock,
            control,
            settings,
            instance_id,
            lag_alerted_at: Mutex::new(HashMap::new()),
            last_archive_day: Mutex::new(None),
        }
    }

    /// Run sync passes forever.
    pub async fn run(self: Arc<Self>) {
        info!(symbols = ?self.settings.symbols, "data syncer started");
        let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_LOOP_SECONDS));
        loop {
            ticker.tick().await;
            self.pass().await;
        }
    }

    /// One full pass over all symbols plus housekeeping.
    pub async fn pass(&self) {
        for symbol in &self.settings.symbols {
            if let Err(e) = self.sync_symbol(symbol).await {
                error!(symbol = %symbol, error = %e, "symbol sync failed");
                self.record_loop_error(symbol, &e).await;
            }
            if let Err(e) = self.check_lag(symbol).await {
                warn!(symbol = %symbol, error = %e, "lag check failed");
            }
        }

        if let Err(e) = self.maybe_archive().await {
            error!(error = %e, "archival run failed");
        }
        if let Err(e) = self.heartbeat().await {
            warn!(error = %e, "syncer heartbeat failed");
        }
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Pull, heal, and precompute one symbol.
    pub async fn sync_symbol(&self, symbol: &str) -> Result<()> {
        let tf = &self.settings.timeframe;
        let iv = self.settings.interval_ms();
        let now_ms = self.clock.now_ms();

        // 1/2. Incremental pull from the bar after the newest stored one.
        let latest = self.db.latest_open_time(symbol, tf).await?;
        let mut start = match latest {
            Some(t) => t + iv,
            None => bar_open_ms(now_ms, iv) - INITIAL_BACKFILL_BARS * iv,
        };

        loop {
            let page = self
                .gateway
                .get_klines(symbol, tf, Some(start), KLINE_PAGE_LIMIT)
                .await
                .with_context(|| format!("kline pull failed for {symbol} from {start}"))?;

            // Never store a bar whose close time is in the future.
            let closed: Vec<_> = page
                .iter()
                .filter(|c| c.close_time_ms <= now_ms)
                .cloned()
                .collect();
            if closed.is_empty() {
                break;
            }

            let inserted = self.db.insert_candles(symbol, tf, &closed).await?;
            debug!(symbol, inserted, page = closed.len(), "candles stored");

            let last_open = closed.last().map(|c| c.open_time_ms).unwrap_or(start);
            if page.len() < KLINE_PAGE_LIMIT as usize || closed.len() < page.len() {
                break;
            }
            start = last_open + iv;
        }

        // 3. Gap detection over the recent window.
        self.heal_gaps(symbol, now_ms).await?;

        // 4. Feature precompute at the current version.
        self.precompute(symbol).await?;

        Ok(())
    }

    /// Find holes between consecutive stored bars, enqueue tasks, re-pull.
    async fn heal_gaps(&self, symbol: &str, now_ms: i64) -> Result<()> {
        let tf = &self.settings.timeframe;
        let iv = self.settings.interval_ms();
        let version = self.control.load().feature_version;

        let from = bar_open_ms(now_ms, iv) - GAP_SCAN_BARS * iv;
        let stored = self
            .db
            .open_times_between(symbol, tf, from, now_ms)
            .await?;

        let mut missing: Vec<i64> = Vec::new();
        for pair in stored.windows(2) {
            let mut t = pair[0] + iv;
            while t < pair[1] {
                missing.push(t);
                t += iv;
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        warn!(symbol, holes = missing.len(), "gap detected in market data");
        let trace_id = new_trace_id();

        for &open_time in &missing {
            self.db
                .requeue_precompute_task(symbol, tf, open_time, version, &trace_id)
                .await?;
        }

        // Re-pull each hole; contiguous runs come back in one page.
        let first = *missing.first().unwrap_or(&from);
        let last = *missing.last().unwrap_or(&from);
        let span_bars = ((last - first) / iv + 1).clamp(1, KLINE_PAGE_LIMIT as i64);
        let refill = self
            .gateway
            .get_klines(symbol, tf, Some(first), span_bars as u32)
            .await?;
        let closed: Vec<_> = refill
            .into_iter()
            .filter(|c| c.close_time_ms <= now_ms)
            .collect();
        let healed = self.db.insert_candles(symbol, tf, &closed).await?;
        info!(symbol, healed, "gap back-fill completed");

        Ok(())
    }

    /// Enqueue tasks for uncached bars and drain the pending queue.
    async fn precompute(&self, symbol: &str) -> Result<()> {
        let tf = &self.settings.timeframe;
        let iv = self.settings.interval_ms();
        let version = self.control.load().feature_version;
        let now_ms = self.clock.now_ms();

        // Tasks for recent bars missing a cache row at this version.
        let from = bar_open_ms(now_ms, iv) - GAP_SCAN_BARS * iv;
        let recent = self
            .db
            .open_times_between(symbol, tf, from, now_ms)
            .await?;
        let trace_id = new_trace_id();
        for open_time in recent {
            if !self.db.cache_exists(symbol, tf, open_time, version).await? {
                self.db
                    .enqueue_precompute_task(symbol, tf, open_time, version, &trace_id)
                    .await?;
            }
        }

        // Drain.
        let tasks = self.db.pending_tasks(symbol, version, TASK_BATCH).await?;
        for task in tasks {
            match self.compute_one(symbol, task.open_time_ms, version).await {
                Ok(true) => {
                    self.db
                        .complete_task(symbol, tf, task.open_time_ms, version)
                        .await?;
                }
                Ok(false) => {
                    // Bar still missing from market_data (unhealed gap).
                    self.db
                        .fail_task(
                            symbol,
                            tf,
                            task.open_time_ms,
                            version,
                            "bar not present in market_data",
                            TASK_MAX_TRIES,
                        )
                        .await?;
                }
                Err(e) => {
                    self.db
                        .fail_task(symbol, tf, task.open_time_ms, version, &e.to_string(), TASK_MAX_TRIES)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Compute and cache the feature set for one bar. `Ok(false)` when the
    /// look-back window cannot be built yet.
    async fn compute_one(&self, symbol: &str, open_time_ms: i64, version: i64) -> Result<bool> {
        let tf = &self.settings.timeframe;
        let lookback = (MIN_BARS + CORRELATION_BARS) as u32;

        let candles = self
            .db
            .candles_up_to(symbol, tf, open_time_ms, lookback)
            .await?;
        // The bar itself must exist; the cache row is written strictly after
        // its market_data row.
        if candles.last().map(|c| c.open_time_ms) != Some(open_time_ms) {
            return Ok(false);
        }
        if candles.len() < MIN_BARS {
            return Ok(false);
        }

        let btc_closes = if symbol == CORRELATION_REFERENCE {
            None
        } else {
            let closes = self
                .db
                .closes_up_to(CORRELATION_REFERENCE, tf, open_time_ms, lookback)
                .await
                .unwrap_or_default();
            (!closes.is_empty()).then_some(closes)
        };

        let Some(features) = compute_features(&candles, btc_closes.as_deref()) else {
            return Ok(false);
        };

        let json = serde_json::to_string(&features).context("feature serialization failed")?;
        self.db
            .write_cache(symbol, tf, open_time_ms, version, &json, self.clock.now_ms())
            .await?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Lag alert
    // -------------------------------------------------------------------------

    async fn check_lag(&self, symbol: &str) -> Result<()> {
        let tf = &self.settings.timeframe;
        let iv = self.settings.interval_ms();
        let now_ms = self.clock.now_ms();

        let Some(latest_open) = self.db.latest_open_time(symbol, tf).await? else {
            return Ok(());
        };
        let latest_close = latest_open + iv - 1;
        let lag_seconds = (now_ms - latest_close) / 1000;

        if lag_seconds <= self.settings.market_data_lag_alert_seconds {
            return Ok(());
        }

        {
            let mut alerted = self.lag_alerted_at.lock();
            let cooldown_ms = self.settings.market_data_lag_alert_cooldown_seconds * 1000;
            if let Some(last) = alerted.get(symbol) {
                if now_ms - last < cooldown_ms {
                    return Ok(());
                }
            }
            alerted.insert(symbol.to_string(), now_ms);
        }

        let trace_id = new_trace_id();
        warn!(
            symbol,
            lag_seconds,
            reason_code = reason::DATA_LAG,
            "market data lagging behind wall clock"
        );
        system_alert(
            &self.notifier,
            &self.clock,
            reason::DATA_LAG,
            &trace_id,
            &[
                ("symbol", symbol),
                ("lag_seconds", &lag_seconds.to_string()),
            ],
        )
        .await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Archival
    // -------------------------------------------------------------------------

    /// Run the daily archival once per HK day, at HK midnight.
    pub async fn maybe_archive(&self) -> Result<()> {
        let hk = self.clock.now_hk();
        let today = hk_date_key(hk);

        if chrono::Timelike::hour(&hk) != 0 {
            return Ok(());
        }
        {
            let last = self.last_archive_day.lock();
            if *last == Some(today) {
                return Ok(());
            }
        }

        let cutoff = self.clock.now_ms() - self.settings.archive_retention_days * 86_400_000;
        let trace_id = new_trace_id();
        info!(cutoff, trace_id = %trace_id, "daily archival starting");

        for table in [ArchiveTable::MarketData, ArchiveTable::MarketDataCache] {
            let outcome = self
                .db
                .archive_older_than(
                    table,
                    cutoff,
                    self.settings.archive_batch_rows,
                    &trace_id,
                    self.clock.now_ms(),
                )
                .await?;
            info!(
                table = table.hot(),
                moved = outcome.moved_rows,
                batches = outcome.batches,
                "archival table done"
            );
        }

        *self.last_archive_day.lock() = Some(today);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Heartbeat & loop-boundary errors
    // -------------------------------------------------------------------------

    async fn heartbeat(&self) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let mut lags = serde_json::Map::new();
        for symbol in &self.settings.symbols {
            if let Some(open) = self.db.latest_open_time(symbol, &self.settings.timeframe).await? {
                let close = open + self.settings.interval_ms() - 1;
                lags.insert(symbol.clone(), serde_json::json!((now_ms - close) / 1000));
            }
        }

        let status = serde_json::json!({
            "last_pass_utc": format_utc(now_ms),
            "last_pass_hk": format_hk(now_ms),
            "sync_lag_seconds": lags,
            "halt_trading": self.control.load().halt_trading,
        });
        self.db
            .upsert_service_status(SERVICE, &self.instance_id, &status.to_string(), now_ms)
            .await
    }

    /// Loop-boundary failures become ERROR rows so the audit stream stays
    /// unified across services.
    async fn record_loop_error(&self, symbol: &str, error: &anyhow::Error) {
        let trace_id = new_trace_id();
        let mut record = OrderEventRecord::new(
            &trace_id,
            SERVICE,
            self.gateway.exchange_name(),
            symbol,
            &format!("{SERVICE}-{}", &trace_id[..8]),
            OrderEventType::Error,
            Side::Long,
            0.0,
            reason::EXCHANGE_SYNC_ERROR,
            &format!("sync loop error: {error:#}"),
            self.clock.now_ms(),
        );
        record.action = "SYNC".to_string();
        record.actor = SERVICE.to_string();
        if let Err(e) = self.db.append_order_event(&record).await {
            error!(error = %e, "failed to record syncer loop error");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::control::{ControlHandle, ControlState};
    use crate::exchange::paper::PaperExchange;
    use crate::exchange::rate_limit::AdaptiveRateLimiter;
    use crate::features::FeatureSet;
    use crate::notify::RecordingNotifier;
    use crate::types::Candle;

    const IV: i64 = 900_000;

    fn candles(n: i64, start: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let open_time = start + i * IV;
                let base = 100.0 + (i as f64 * 0.35).sin() * 3.0 + i as f64 * 0.05;
                Candle::new(
                    open_time,
                    base,
                    base + 1.2,
                    base - 1.2,
                    base + 0.4,
                    10.0 + (i % 7) as f64,
                    open_time + IV - 1,
                )
            })
            .collect()
    }

    struct Fixture {
        db: Database,
        paper: Arc<PaperExchange>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
        syncer: DataSyncer,
    }

    fn fixture(now_ms: i64) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let paper = Arc::new(PaperExchange::new("paper", 500.0));
        let limiter = Arc::new(AdaptiveRateLimiter::new(1200, 1200, 300, None));
        let gateway = Arc::new(ExchangeGateway::new(paper.clone(), limiter));
        let clock = Arc::new(ManualClock::at_ms(now_ms));
        let notifier = Arc::new(RecordingNotifier::new());
        let control = ControlHandle::new(ControlState::initial(1));
        let settings = Settings::default();

        let syncer = DataSyncer::new(
            db.clone(),
            gateway,
            notifier.clone() as Arc<dyn Notifier>,
            clock.clone() as Arc<dyn Clock>,
            control,
            settings,
            "test-1".into(),
        );
        Fixture {
            db,
            paper,
            clock,
            notifier,
            syncer,
        }
    }

    #[tokio::test]
    async fn cold_sync_stores_closed_bars_and_caches_features() {
        let bars = candles(120, 0);
        let now = 120 * IV + 5_000;
        let f = fixture(now);
        f.paper.seed_klines("BTCUSDT", "15m", bars);

        f.syncer.sync_symbol("BTCUSDT").await.unwrap();

        let latest = f.db.latest_open_time("BTCUSDT", "15m").await.unwrap().unwrap();
        assert_eq!(latest, 119 * IV);

        // Features exist at the configured version for the newest bar.
        let cached = f.db.latest_cache("BTCUSDT", "15m", 1).await.unwrap().unwrap();
        assert_eq!(cached.open_time_ms, 119 * IV);
        let parsed: FeatureSet = serde_json::from_str(&cached.features_json).unwrap();
        assert!(parsed.close > 0.0);
    }

    #[tokio::test]
    async fn future_bars_are_never_stored() {
        let bars = candles(10, 0);
        // Clock sits inside bar 8: bars 8 and 9 are not yet closed.
        let f = fixture(8 * IV + 10);
        f.paper.seed_klines("BTCUSDT", "15m", bars);

        f.syncer.sync_symbol("BTCUSDT").await.unwrap();
        let latest = f.db.latest_open_time("BTCUSDT", "15m").await.unwrap().unwrap();
        assert_eq!(latest, 7 * IV);
    }

    #[tokio::test]
    async fn incremental_sync_only_adds_new_bars() {
        let f = fixture(100 * IV + 5_000);
        f.paper.seed_klines("BTCUSDT", "15m", candles(100, 0));
        f.syncer.sync_symbol("BTCUSDT").await.unwrap();

        // Two more bars close.
        f.paper.seed_klines("BTCUSDT", "15m", candles(102, 0));
        f.clock.set_ms(102 * IV + 5_000);
        f.syncer.sync_symbol("BTCUSDT").await.unwrap();

        let latest = f.db.latest_open_time("BTCUSDT", "15m").await.unwrap().unwrap();
        assert_eq!(latest, 101 * IV);
    }

    #[tokio::test]
    async fn gap_is_healed_with_task_and_matching_cache_row() {
        let now = 120 * IV + 5_000;
        let f = fixture(now);
        f.paper.seed_klines("BTCUSDT", "15m", candles(120, 0));
        f.syncer.sync_symbol("BTCUSDT").await.unwrap();

        // Delete a middle bar and its cache row.
        let hole = 110 * IV;
        f.db.with_conn(move |conn| {
            conn.execute("DELETE FROM market_data WHERE open_time_ms = ?1", [hole])?;
            conn.execute("DELETE FROM market_data_cache WHERE open_time_ms = ?1", [hole])?;
            Ok(())
        })
        .await
        .unwrap();
        assert!(f.db.open_times_between("BTCUSDT", "15m", hole, hole).await.unwrap().is_empty());

        // Next pass heals the hole and re-caches it at the current version.
        f.syncer.sync_symbol("BTCUSDT").await.unwrap();
        assert_eq!(
            f.db.open_times_between("BTCUSDT", "15m", hole, hole).await.unwrap(),
            vec![hole]
        );
        assert!(f.db.cache_exists("BTCUSDT", "15m", hole, 1).await.unwrap());

        // The healed bar carries the exchange's OHLCV.
        let window = f.db.candles_up_to("BTCUSDT", "15m", hole, 1).await.unwrap();
        let expected = &candles(120, 0)[110];
        assert_eq!(&window[0], expected);
    }

    #[tokio::test]
    async fn lag_alert_fires_once_per_cooldown() {
        let now = 10 * IV;
        let f = fixture(now);
        f.db.insert_candles("BTCUSDT", "15m", &candles(5, 0)).await.unwrap();

        // Bar 4 closed at 5*IV-1; clock is far past the 120 s threshold.
        f.syncer.check_lag("BTCUSDT").await.unwrap();
        assert_eq!(f.notifier.system_events(reason::DATA_LAG).len(), 1);

        // Within the cooldown: no second alert.
        f.clock.advance_ms(60_000);
        f.syncer.check_lag("BTCUSDT").await.unwrap();
        assert_eq!(f.notifier.system_events(reason::DATA_LAG).len(), 1);

        // After the cooldown: alert again.
        f.clock.advance_ms(300_000);
        f.syncer.check_lag("BTCUSDT").await.unwrap();
        assert_eq!(f.notifier.system_events(reason::DATA_LAG).len(), 2);
    }

    #[tokio::test]
    async fn archival_runs_once_per_hk_midnight() {
        use chrono::TimeZone;
        // 2026-03-06 00:10 HK.
        let midnight = crate::clock::hk_offset()
            .with_ymd_and_hms(2026, 3, 6, 0, 10, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        let f = fixture(midnight);

        // Bars ancient enough to fall past the 90-day retention.
        f.db.insert_candles("BTCUSDT", "15m", &candles(50, 0)).await.unwrap();

        f.syncer.maybe_archive().await.unwrap();
        assert_eq!(f.db.history_row_count(ArchiveTable::MarketData).await.unwrap(), 50);

        // Same HK day: no second run even if called again.
        f.clock.advance_ms(60_000);
        f.syncer.maybe_archive().await.unwrap();
        assert_eq!(f.db.audited_moved_rows(ArchiveTable::MarketData).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn archival_skips_outside_midnight_hour() {
        use chrono::TimeZone;
        let afternoon = crate::clock::hk_offset()
            .with_ymd_and_hms(2026, 3, 6, 15, 0, 1)
            .single()
            .unwrap()
            .timestamp_millis();
        let f = fixture(afternoon);
        f.db.insert_candles("BTCUSDT", "15m", &candles(10, 0)).await.unwrap();

        f.syncer.maybe_archive().await.unwrap();
        assert_eq!(f.db.history_row_count(ArchiveTable::MarketData).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_errors_land_on_the_event_stream() {
        let f = fixture(10 * IV);
        f.syncer
            .record_loop_error("BTCUSDT", &anyhow::anyhow!("exchange unreachable"))
            .await;
        let errors = f.db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].service, SERVICE);
        assert!(errors[0].reason.contains("exchange unreachable"));
    }

    #[tokio::test]
    async fn heartbeat_upserts_service_status() {
        let f = fixture(10 * IV);
        f.db.insert_candles("BTCUSDT", "15m", &candles(5, 0)).await.unwrap();
        f.syncer.heartbeat().await.unwrap();

        let (json, _) = f.db.service_status(SERVICE, "test-1").await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["sync_lag_seconds"]["BTCUSDT"].is_number());
        assert_eq!(parsed["halt_trading"], false);
    }
}
