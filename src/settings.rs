// =============================================================================
// Settings — environment-driven configuration for all services
// =============================================================================
//
// Every tunable the control plane recognizes is collected once at startup
// into a `Settings` struct. Values come from the process environment (with
// `.env` support via dotenv in main); each field has a safe default so a
// bare environment still boots into paper mode.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

/// Top-level settings shared by the strategy engine, data syncer, and
/// exchange gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Trading universe ----------------------------------------------------
    pub symbols: Vec<String>,
    pub timeframe: String,
    pub enable_trading: bool,
    pub paper_trading: bool,

    // --- Exchange ------------------------------------------------------------
    pub exchange_name: String,
    pub exchange_base_url: String,
    pub api_key: String,
    pub api_secret: String,

    // --- Persistence & coordination -----------------------------------------
    /// Embedded database file; `:memory:` for tests.
    pub database_path: String,
    /// Redis URL for the distributed trade lock; absent means the
    /// process-local lock manager is used (paper mode, tests).
    pub redis_url: Option<String>,
    pub trade_lock_ttl_seconds: u64,

    // --- Scheduling ----------------------------------------------------------
    pub tick_budget_seconds: u64,
    pub control_poll_seconds: u64,
    pub position_snapshot_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub order_confirm_timeout_seconds: u64,

    // --- Features ------------------------------------------------------------
    pub feature_version: i64,
    pub market_data_lag_alert_seconds: i64,
    pub market_data_lag_alert_cooldown_seconds: i64,

    // --- Strategy tunables ---------------------------------------------------
    pub adx_min: f64,
    pub vol_ratio_min: f64,
    pub ai_score_min: f64,
    pub ai_model_impl: String,
    pub max_leverage: u32,
    /// Account equity assumed in paper mode (live mode reads the exchange).
    pub paper_equity: f64,

    // --- Rate limiter ceilings ----------------------------------------------
    pub rate_limit_market_ceiling: u32,
    pub rate_limit_account_ceiling: u32,
    pub rate_limit_order_ceiling: u32,

    // --- Archival ------------------------------------------------------------
    pub archive_retention_days: i64,
    pub archive_batch_rows: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            timeframe: "15m".to_string(),
            enable_trading: true,
            paper_trading: true,
            exchange_name: "binance-futures".to_string(),
            exchange_base_url: "https://fapi.binance.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            database_path: "asv8.db".to_string(),
            redis_url: None,
            trade_lock_ttl_seconds: 30,
            tick_budget_seconds: 10,
            control_poll_seconds: 2,
            position_snapshot_interval_seconds: 300,
            heartbeat_interval_seconds: 30,
            order_confirm_timeout_seconds: 8,
            feature_version: 1,
            market_data_lag_alert_seconds: 120,
            market_data_lag_alert_cooldown_seconds: 300,
            adx_min: 20.0,
            vol_ratio_min: 1.5,
            ai_score_min: 50.0,
            ai_model_impl: "online_lr".to_string(),
            max_leverage: 5,
            paper_equity: 1000.0,
            rate_limit_market_ceiling: 1200,
            rate_limit_account_ceiling: 1200,
            rate_limit_order_ceiling: 300,
            archive_retention_days: 90,
            archive_batch_rows: 5000,
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests inject a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        let symbols = get("SYMBOLS")
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_uppercase())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(d.symbols);

        let settings = Self {
            symbols,
            timeframe: get("TIMEFRAME").unwrap_or(d.timeframe),
            enable_trading: parse_or(&get, "ENABLE_TRADING", d.enable_trading),
            paper_trading: parse_or(&get, "PAPER_TRADING", d.paper_trading),
            exchange_name: get("EXCHANGE_NAME").unwrap_or(d.exchange_name),
            exchange_base_url: get("EXCHANGE_BASE_URL").unwrap_or(d.exchange_base_url),
            api_key: get("EXCHANGE_API_KEY").unwrap_or(d.api_key),
            api_secret: get("EXCHANGE_API_SECRET").unwrap_or(d.api_secret),
            database_path: get("DATABASE_PATH").unwrap_or(d.database_path),
            redis_url: get("REDIS_URL").filter(|s| !s.is_empty()),
            trade_lock_ttl_seconds: parse_or(&get, "TRADE_LOCK_TTL_SECONDS", d.trade_lock_ttl_seconds),
            tick_budget_seconds: parse_or(&get, "TICK_BUDGET_SECONDS", d.tick_budget_seconds),
            control_poll_seconds: parse_or(&get, "CONTROL_POLL_SECONDS", d.control_poll_seconds),
            position_snapshot_interval_seconds: parse_or(
                &get,
                "POSITION_SNAPSHOT_INTERVAL_SECONDS",
                d.position_snapshot_interval_seconds,
            ),
            heartbeat_interval_seconds: parse_or(
                &get,
                "HEARTBEAT_INTERVAL_SECONDS",
                d.heartbeat_interval_seconds,
            ),
            order_confirm_timeout_seconds: parse_or(
                &get,
                "ORDER_CONFIRM_TIMEOUT",
                d.order_confirm_timeout_seconds,
            ),
            feature_version: parse_or(&get, "FEATURE_VERSION", d.feature_version),
            market_data_lag_alert_seconds: parse_or(
                &get,
                "MARKET_DATA_LAG_ALERT_SECONDS",
                d.market_data_lag_alert_seconds,
            ),
            market_data_lag_alert_cooldown_seconds: parse_or(
                &get,
                "MARKET_DATA_LAG_ALERT_COOLDOWN_SECONDS",
                d.market_data_lag_alert_cooldown_seconds,
            ),
            adx_min: parse_or(&get, "ADX_MIN", d.adx_min),
            vol_ratio_min: parse_or(&get, "VOL_RATIO_MIN", d.vol_ratio_min),
            ai_score_min: parse_or(&get, "AI_SCORE_MIN", d.ai_score_min),
            ai_model_impl: get("AI_MODEL_IMPL").unwrap_or(d.ai_model_impl),
            max_leverage: parse_or(&get, "MAX_LEVERAGE", d.max_leverage),
            paper_equity: parse_or(&get, "PAPER_EQUITY", d.paper_equity),
            rate_limit_market_ceiling: parse_or(
                &get,
                "RATE_LIMIT_MARKET_CEILING",
                d.rate_limit_market_ceiling,
            ),
            rate_limit_account_ceiling: parse_or(
                &get,
                "RATE_LIMIT_ACCOUNT_CEILING",
                d.rate_limit_account_ceiling,
            ),
            rate_limit_order_ceiling: parse_or(
                &get,
                "RATE_LIMIT_ORDER_CEILING",
                d.rate_limit_order_ceiling,
            ),
            archive_retention_days: parse_or(&get, "ARCHIVE_RETENTION_DAYS", d.archive_retention_days),
            archive_batch_rows: parse_or(&get, "ARCHIVE_BATCH_ROWS", d.archive_batch_rows),
        };

        info!(
            symbols = ?settings.symbols,
            timeframe = %settings.timeframe,
            paper_trading = settings.paper_trading,
            feature_version = settings.feature_version,
            "settings loaded"
        );

        settings
    }

    /// Bar length of the configured timeframe in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        // 15m if the configured label is unparseable; the control plane is
        // built around fixed-interval candles and must not run with a zero
        // interval.
        crate::clock::interval_ms(&self.timeframe).unwrap_or(900_000)
    }
}

/// Parse an env value, falling back to `default` when absent or malformed.
fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
