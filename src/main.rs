// =============================================================================
// asv8 — trading control plane entry point
// =============================================================================
//
// Startup order matters: migrations run before any worker spawns (a failure
// exits non-zero), the control snapshot is primed from the database, and the
// readiness line only prints after the first successful heartbeat.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod ai;
mod breaker;
mod clock;
mod control;
mod db;
mod engine;
mod exchange;
mod exits;
mod features;
mod ids;
mod indicators;
mod lock;
mod notify;
mod risk;
mod scrub;
mod settings;
mod signal;
mod syncer;
#[cfg(test)]
mod testkit;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::breaker::{BreakerThresholds, CircuitBreaker};
use crate::clock::{Clock, SystemClock};
use crate::control::{ControlConsumer, ControlHandle, ControlState};
use crate::db::Database;
use crate::engine::StrategyEngine;
use crate::exchange::binance::BinanceFuturesClient;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::paper::PaperExchange;
use crate::exchange::rate_limit::AdaptiveRateLimiter;
use crate::exchange::Exchange;
use crate::lock::{LocalLockManager, LockManager, RedisLockManager};
use crate::notify::{LogNotifier, Notifier};
use crate::settings::Settings;
use crate::syncer::DataSyncer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("asv8 trading control plane starting");

    let settings = Settings::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let instance_id = crate::ids::new_trace_id()[..8].to_string();

    // ── 2. Database & migrations (fatal on failure) ──────────────────────
    let db = Database::open(&settings.database_path)?;

    // ── 3. Control snapshot ──────────────────────────────────────────────
    let control = ControlHandle::new(ControlState::initial(settings.feature_version));
    control.refresh(&db).await?;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    // ── 4. Circuit breaker ───────────────────────────────────────────────
    let (breaker_tx, breaker_rx) = tokio::sync::mpsc::unbounded_channel();
    let breaker = CircuitBreaker::new(
        db.clone(),
        notifier.clone(),
        clock.clone(),
        BreakerThresholds::default(),
    );
    tokio::spawn(breaker.run(breaker_rx));

    // ── 5. Exchange gateway (single choke point, shared limiter) ─────────
    let limiter = Arc::new(AdaptiveRateLimiter::new(
        settings.rate_limit_market_ceiling,
        settings.rate_limit_account_ceiling,
        settings.rate_limit_order_ceiling,
        Some(breaker_tx.clone()),
    ));
    let exchange: Arc<dyn Exchange> = if settings.paper_trading {
        info!(equity = settings.paper_equity, "paper trading mode");
        Arc::new(PaperExchange::new("paper", settings.paper_equity))
    } else {
        Arc::new(BinanceFuturesClient::new(
            settings.exchange_name.clone(),
            settings.exchange_base_url.clone(),
            settings.api_key.clone(),
            settings.api_secret.clone(),
        ))
    };
    let gateway = Arc::new(ExchangeGateway::new(exchange, limiter));

    // ── 6. Distributed trade lock ────────────────────────────────────────
    let locks: Arc<dyn LockManager> = match &settings.redis_url {
        Some(url) => {
            info!("redis trade lock backend");
            Arc::new(RedisLockManager::new(url)?)
        }
        None => {
            warn!("no REDIS_URL — using process-local trade locks");
            Arc::new(LocalLockManager::new())
        }
    };

    // ── 7. Data syncer ───────────────────────────────────────────────────
    let syncer = Arc::new(DataSyncer::new(
        db.clone(),
        gateway.clone(),
        notifier.clone(),
        clock.clone(),
        control.clone(),
        settings.clone(),
        instance_id.clone(),
    ));
    tokio::spawn(syncer.run());

    // ── 8. Control command consumer ──────────────────────────────────────
    let consumer = ControlConsumer::new(
        db.clone(),
        control.clone(),
        notifier.clone(),
        clock.clone(),
        Duration::from_secs(settings.control_poll_seconds),
    );
    tokio::spawn(consumer.run());

    // ── 9. Strategy engine ───────────────────────────────────────────────
    let engine = StrategyEngine::new(
        db,
        gateway,
        locks,
        notifier,
        clock,
        control,
        settings,
        breaker_tx,
        instance_id.clone(),
    )
    .await?;

    tokio::spawn(engine.clone().run_scheduler());
    tokio::spawn(engine.clone().run_exit_monitor());
    tokio::spawn(engine.clone().run_snapshots());
    tokio::spawn(engine.clone().run_heartbeat());

    // ── 10. Readiness after the first successful heartbeat ───────────────
    engine.heartbeat().await?;
    info!(instance = %instance_id, "all services running — ready");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");
    Ok(())
}
