// =============================================================================
// Shared test fixture for the strategy engine scenarios
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::breaker::BreakerSignal;
use crate::clock::{Clock, ManualClock};
use crate::control::{ControlHandle, ControlState};
use crate::db::Database;
use crate::engine::StrategyEngine;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::paper::PaperExchange;
use crate::exchange::rate_limit::AdaptiveRateLimiter;
use crate::features::FeatureSet;
use crate::lock::LocalLockManager;
use crate::notify::{Notifier, RecordingNotifier};
use crate::settings::Settings;

pub const IV: i64 = 900_000;

/// The tick bar used across scenarios: bar 96 fires the tick, bar 95 is the
/// just-closed bar the decision evaluates.
pub const TICK_BAR: i64 = 96 * IV;
pub const NOW_MS: i64 = TICK_BAR + 1_000;
pub const DECISION_BAR_OPEN: i64 = TICK_BAR - IV;

pub struct EngineFixture {
    pub db: Database,
    pub paper: Arc<PaperExchange>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub control: Arc<ControlHandle>,
    pub engine: Arc<StrategyEngine>,
    pub breaker_rx: UnboundedReceiver<BreakerSignal>,
}

pub async fn engine_fixture(equity: f64, settings: Settings) -> EngineFixture {
    let db = Database::open_in_memory().unwrap();
    let paper = Arc::new(PaperExchange::new("paper", equity));
    paper.set_last_price("BTCUSDT", 100.0);

    let limiter = Arc::new(AdaptiveRateLimiter::new(1200, 1200, 300, None));
    let gateway = Arc::new(ExchangeGateway::new(paper.clone(), limiter));
    let clock = Arc::new(ManualClock::at_ms(NOW_MS));
    let notifier = Arc::new(RecordingNotifier::new());
    let control = ControlHandle::new(ControlState::initial(settings.feature_version));
    let (breaker_tx, breaker_rx) = unbounded_channel();

    let engine = StrategyEngine::new(
        db.clone(),
        gateway,
        Arc::new(LocalLockManager::new()),
        notifier.clone() as Arc<dyn Notifier>,
        clock.clone() as Arc<dyn Clock>,
        control.clone(),
        settings,
        breaker_tx,
        "test-1".into(),
    )
    .await
    .unwrap();

    EngineFixture {
        db,
        paper,
        clock,
        notifier,
        control,
        engine,
        breaker_rx,
    }
}

/// Feature pair satisfying Setup B on the decision bar: ADX 28, +DI 24 over
/// -DI 12, squeeze released, momentum -0.5 -> +0.3, vol ratio 2.1.
pub fn setup_b_features() -> (FeatureSet, FeatureSet) {
    let prev = FeatureSet {
        close: 99.5,
        adx: 25.0,
        plus_di: 19.0,
        minus_di: 15.0,
        ema21: 99.2,
        ema55: 98.0,
        squeeze_on: true,
        momentum: -0.5,
        vol_ratio: 1.1,
        rsi: 47.0,
        rsi_slope: -0.8,
        btc_corr: None,
    };
    let now = FeatureSet {
        close: 100.0,
        adx: 28.0,
        plus_di: 24.0,
        minus_di: 12.0,
        ema21: 99.6,
        ema55: 98.2,
        squeeze_on: false,
        momentum: 0.3,
        vol_ratio: 2.1,
        rsi: 56.0,
        rsi_slope: 2.2,
        btc_corr: Some(0.5),
    };
    (prev, now)
}

/// Write the (prev, now) cached feature pair for the decision bar.
pub async fn seed_decision_pair(db: &Database, version: i64, prev: &FeatureSet, now: &FeatureSet) {
    db.write_cache(
        "BTCUSDT",
        "15m",
        DECISION_BAR_OPEN - IV,
        version,
        &serde_json::to_string(prev).unwrap(),
        0,
    )
    .await
    .unwrap();
    db.write_cache(
        "BTCUSDT",
        "15m",
        DECISION_BAR_OPEN,
        version,
        &serde_json::to_string(now).unwrap(),
        0,
    )
    .await
    .unwrap();
}

/// Count order events of one type for a client-order-id LIKE pattern.
pub async fn count_events_like(db: &Database, event_type: &str, pattern: &str) -> i64 {
    let (event_type, pattern) = (event_type.to_string(), pattern.to_string());
    db.with_conn(move |conn| {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_events
             WHERE event_type = ?1 AND client_order_id LIKE ?2",
            rusqlite::params![event_type, pattern],
            |row| row.get(0),
        )?;
        Ok(n)
    })
    .await
    .unwrap()
}
