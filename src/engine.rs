// =============================================================================
// Strategy Engine — the per-symbol tick loop
// =============================================================================
//
// Scheduling runs on the Hong Kong wall clock: a tick fires once per
// 15-minute boundary, within the first three seconds, and carries a hard
// budget. Symbols execute concurrently, serialized per symbol through the
// distributed trade lock; symbols that miss the budget are deferred to the
// next tick with a TICK_TIMEOUT log line.
//
// Per-symbol pipeline: reconcile unconfirmed submissions, staleness-check
// the feature cache, evaluate Setup B plus the AI gate, size under the 3 %
// risk budget, then drive the order state machine CREATED → SUBMITTED →
// FILLED through the gateway with the idempotent client order id, arm the
// protective stop, and record every transition on the event stream. The
// stream is the authoritative state; restarts re-derive everything from it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::ai::{feature_vector, load_scorer, Scorer, COLD_START_SCORE, ENTRY_MODEL_NAME};
use crate::breaker::BreakerSignal;
use crate::clock::{bar_open_ms, format_hk, format_utc, in_tick_window, Clock};
use crate::control::ControlHandle;
use crate::db::orders::{OrderEventRecord, TradeOpen};
use crate::db::Database;
use crate::exchange::gateway::ExchangeGateway;
use crate::exchange::{OrderRequest, OrderState, OrderStatus, StopRequest};
use crate::features::FeatureSet;
use crate::ids::{bar_attempt_pattern, client_order_id, new_trace_id, stop_order_id};
use crate::lock::{trade_lock_key, LockManager};
use crate::notify::{system_alert, trade_alert, Notifier};
use crate::risk::{size_position, stop_distance_pct, RiskOutcome};
use crate::scrub::scrubbed_json;
use crate::settings::Settings;
use crate::signal::evaluate_setup_b;
use crate::types::{reason, OrderEventType, Side};

pub const SERVICE: &str = "strategy-engine";

/// Scheduler wake-up granularity.
const SCHEDULER_POLL_MS: u64 = 500;

/// Interval between fill polls while confirming an order.
const FILL_POLL_MS: u64 = 250;

/// A protective stop tracked in software after exchange arming failed.
#[derive(Debug, Clone)]
pub(crate) struct SoftwareStop {
    pub parent_order_id: String,
    pub side: Side,
    pub qty: f64,
    pub stop_price: f64,
}

pub struct StrategyEngine {
    pub(crate) db: Database,
    pub(crate) gateway: Arc<ExchangeGateway>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) control: Arc<ControlHandle>,
    pub(crate) settings: Settings,
    pub(crate) scorer: TokioMutex<Box<dyn Scorer>>,
    pub(crate) breaker_tx: UnboundedSender<BreakerSignal>,
    pub(crate) last_tick_bar: Mutex<Option<i64>>,
    pub(crate) software_stops: Mutex<HashMap<String, SoftwareStop>>,
    /// Feature vectors of open entries, for partial_fit at close. Best
    /// effort: lost on restart, in which case the label is skipped.
    pub(crate) entry_features: Mutex<HashMap<String, Vec<f64>>>,
    pub(crate) instance_id: String,
}

impl StrategyEngine {
    /// Build the engine, restoring the current scorer from the model store
    /// (impl tag from the model row, then config, then settings).
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        db: Database,
        gateway: Arc<ExchangeGateway>,
        locks: Arc<dyn LockManager>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        control: Arc<ControlHandle>,
        settings: Settings,
        breaker_tx: UnboundedSender<BreakerSignal>,
        instance_id: String,
    ) -> Result<Arc<Self>> {
        let stored = db.load_current_model(ENTRY_MODEL_NAME).await?;
        let tag = stored
            .as_ref()
            .map(|m| m.impl_tag.clone())
            .or_else(|| control.load().ai_model_impl.clone())
            .unwrap_or_else(|| settings.ai_model_impl.clone());
        let scorer = load_scorer(&tag, stored.as_ref().map(|m| m.blob.as_str()));
        info!(
            impl_tag = scorer.impl_tag(),
            samples = scorer.samples(),
            "entry scorer loaded"
        );

        // Rebuild software-tracked fallback stops from the event stream so a
        // restart keeps watching them.
        let mut software_stops = HashMap::new();
        for trade in db.open_trades().await? {
            let stop_id = stop_order_id(&trade.client_order_id);
            let armed_reason = db
                .order_event_reason(
                    gateway.exchange_name(),
                    &trade.symbol,
                    &stop_id,
                    OrderEventType::StopArmed,
                )
                .await?;
            if armed_reason.as_deref() == Some(reason::STOP_ARM_FAILED_FALLBACK) {
                info!(symbol = %trade.symbol, stop_price = trade.stop_price, "software stop restored");
                software_stops.insert(
                    trade.symbol.clone(),
                    SoftwareStop {
                        parent_order_id: trade.client_order_id.clone(),
                        side: trade.side,
                        qty: trade.qty,
                        stop_price: trade.stop_price,
                    },
                );
            }
        }

        Ok(Arc::new(Self {
            db,
            gateway,
            locks,
            notifier,
            clock,
            control,
            settings,
            scorer: TokioMutex::new(scorer),
            breaker_tx,
            last_tick_bar: Mutex::new(None),
            software_stops: Mutex::new(software_stops),
            entry_features: Mutex::new(HashMap::new()),
            instance_id,
        }))
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Fire ticks at HK 15-minute boundaries, once per bar.
    pub async fn run_scheduler(self: Arc<Self>) {
        info!(timeframe = %self.settings.timeframe, "tick scheduler started");
        loop {
            tokio::time::sleep(Duration::from_millis(SCHEDULER_POLL_MS)).await;

            if !in_tick_window(self.clock.now_hk()) {
                continue;
            }
            let iv = self.settings.interval_ms();
            let tick_bar = bar_open_ms(self.clock.now_ms(), iv);
            {
                let mut last = self.last_tick_bar.lock();
                if *last == Some(tick_bar) {
                    continue;
                }
                *last = Some(tick_bar);
            }

            info!(tick_bar, hk = %format_hk(tick_bar), "tick firing");
            self.tick(tick_bar).await;
        }
    }

    /// One tick over all symbols, bounded by the tick budget. Symbols that
    /// miss the budget are aborted and deferred to the next tick.
    pub async fn tick(self: &Arc<Self>, tick_bar_open_ms: i64) {
        let budget = Duration::from_secs(self.settings.tick_budget_seconds);
        let deadline = tokio::time::Instant::now() + budget;

        let mut tasks = JoinSet::new();
        for symbol in self.settings.symbols.clone() {
            let engine = self.clone();
            tasks.spawn(async move {
                engine.process_symbol(&symbol, tick_bar_open_ms).await;
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    let deferred = tasks.len();
                    tasks.abort_all();
                    warn!(
                        reason_code = reason::TICK_TIMEOUT,
                        deferred,
                        budget_seconds = self.settings.tick_budget_seconds,
                        "tick budget exhausted — deferring remaining symbols"
                    );
                    break;
                }
            }
        }
    }

    async fn process_symbol(&self, symbol: &str, tick_bar_open_ms: i64) {
        if let Err(e) = self.symbol_pipeline(symbol, tick_bar_open_ms).await {
            error!(symbol, error = %e, "symbol pipeline failed");
            self.record_pipeline_error(symbol, &e).await;
        }
    }

    // -------------------------------------------------------------------------
    // Per-symbol pipeline
    // -------------------------------------------------------------------------

    async fn symbol_pipeline(&self, symbol: &str, _tick_bar_open_ms: i64) -> Result<()> {
        let state = self.control.load();
        let open_position = self.db.open_trade_for_symbol(symbol).await?;

        // HALT blocks entries only; exit management continues elsewhere.
        let entries_allowed = self.settings.enable_trading && !state.halt_trading;
        if !entries_allowed && open_position.is_none() {
            debug!(symbol, "halted with no position — skipping");
            return Ok(());
        }

        let trace_id = new_trace_id();
        let key = trade_lock_key(symbol);
        let ttl = Duration::from_secs(self.settings.trade_lock_ttl_seconds);
        if !self.locks.acquire(&key, &trace_id, ttl).await? {
            debug!(symbol, "trade lock contended — skipping this tick");
            return Ok(());
        }

        let result = self
            .locked_pipeline(symbol, &trace_id, entries_allowed, open_position.is_some())
            .await;

        if let Err(e) = self.locks.release(&key, &trace_id).await {
            warn!(symbol, error = %e, "trade lock release failed (TTL will reap)");
        }
        result
    }

    async fn locked_pipeline(
        &self,
        symbol: &str,
        trace_id: &str,
        entries_allowed: bool,
        has_position: bool,
    ) -> Result<()> {
        // Close out anything the previous tick left unconfirmed.
        self.reconcile_symbol(symbol).await?;

        if has_position || !entries_allowed {
            return Ok(());
        }

        let tf = &self.settings.timeframe;
        let iv = self.settings.interval_ms();
        let version = self.control.load().feature_version;

        // Feature pair, staleness-gated.
        let pair = self.db.last_two_cache(symbol, tf, version).await?;
        let now_ms = self.clock.now_ms();
        let fresh = pair
            .last()
            .map(|row| now_ms - row.open_time_ms <= 2 * iv)
            .unwrap_or(false);
        if pair.len() < 2 || !fresh {
            debug!(
                symbol,
                reason_code = reason::STALE_CACHE,
                rows = pair.len(),
                "feature cache stale or missing — skipping"
            );
            return Ok(());
        }

        let prev: FeatureSet =
            serde_json::from_str(&pair[0].features_json).context("prev feature row unreadable")?;
        let now_f: FeatureSet =
            serde_json::from_str(&pair[1].features_json).context("latest feature row unreadable")?;

        // Setup B.
        let signal = match evaluate_setup_b(
            &prev,
            &now_f,
            self.settings.adx_min,
            self.settings.vol_ratio_min,
        ) {
            Ok(signal) => signal,
            Err(detail) => {
                debug!(symbol, detail = %detail, "entry template not satisfied");
                return Ok(());
            }
        };

        // AI gate. Cold start scores the default and forbids amplification.
        let features = feature_vector(&now_f);
        let (ai_score, cold_start) = {
            let scorer = self.scorer.lock().await;
            let cold = scorer.samples() == 0;
            let score = if cold {
                COLD_START_SCORE
            } else {
                scorer.score(&features)
            };
            (score, cold)
        };
        if ai_score < self.settings.ai_score_min {
            debug!(symbol, ai_score, "AI score below threshold");
            return Ok(());
        }

        // One attempt per bar, across restarts: the event stream remembers.
        let bar_close_ts = pair[1].open_time_ms + iv - 1;
        let pattern = bar_attempt_pattern(symbol, tf, bar_close_ts);
        if self
            .db
            .bar_already_attempted(self.gateway.exchange_name(), &pattern)
            .await?
        {
            debug!(symbol, bar_close_ts, "bar already attempted — suppressing duplicate");
            return Ok(());
        }

        // Risk sizing against live equity.
        let account = self
            .gateway
            .get_account()
            .await
            .map_err(|e| anyhow::anyhow!("equity fetch failed: {e}"))?;
        let entry_price = now_f.close;
        let stop_dist = stop_distance_pct(&now_f);
        let coid = client_order_id(symbol, Side::Long, tf, bar_close_ts, trace_id);

        let size = match size_position(
            account.equity,
            entry_price,
            stop_dist,
            ai_score,
            cold_start,
            self.settings.max_leverage,
            Side::Long,
        ) {
            RiskOutcome::Approved(size) => size,
            RiskOutcome::Rejected { reason_code, reason } => {
                warn!(symbol, reason_code, reason = %reason, "risk budget rejection");
                let mut record = self.event(trace_id, symbol, &coid, OrderEventType::Rejected);
                record.qty = 0.0;
                record.price = Some(entry_price);
                record.reason_code = reason_code.to_string();
                record.reason = reason;
                self.db.append_order_event(&record).await?;
                return Ok(());
            }
        };

        self.submit_entry(
            symbol, trace_id, &coid, entry_price, &size, &signal.reason, signal.reason_code,
            ai_score, features,
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Order state machine
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn submit_entry(
        &self,
        symbol: &str,
        trace_id: &str,
        coid: &str,
        entry_price: f64,
        size: &crate::risk::PositionSize,
        open_reason: &str,
        open_reason_code: &'static str,
        ai_score: f64,
        features: Vec<f64>,
    ) -> Result<()> {
        // CREATED always precedes any submission outcome.
        let mut created = self.event(trace_id, symbol, coid, OrderEventType::Created);
        created.qty = size.qty;
        created.price = Some(entry_price);
        created.reason_code = open_reason_code.to_string();
        created.reason = open_reason.to_string();
        self.db.append_order_event(&created).await?;

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side: Side::Long,
            qty: size.qty,
            price: Some(entry_price),
            client_order_id: coid.to_string(),
            reduce_only: false,
        };

        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(err) => {
                self.record_order_failure(trace_id, symbol, coid, size.qty, &err).await?;
                return Ok(());
            }
        };

        let mut submitted = self.event(trace_id, symbol, coid, OrderEventType::Submitted);
        submitted.qty = size.qty;
        submitted.price = Some(entry_price);
        submitted.exchange_order_id = ack.exchange_order_id.clone();
        submitted.reason_code = open_reason_code.to_string();
        submitted.reason = open_reason.to_string();
        submitted.raw_payload_json = Some(scrubbed_json(&ack.raw));
        self.db.append_order_event(&submitted).await?;

        // Confirm the fill within the deadline; timeout defers to the next
        // tick's reconciliation pass.
        let confirm_window = Duration::from_secs(self.settings.order_confirm_timeout_seconds);
        let confirmed =
            tokio::time::timeout(confirm_window, self.poll_until_terminal(symbol, coid)).await;

        let order_state = match confirmed {
            Ok(Ok(state)) if state.status == OrderStatus::Filled => state,
            Ok(Ok(state)) => {
                // Canceled/rejected/expired on the exchange side.
                let mut record = self.event(trace_id, symbol, coid, OrderEventType::Canceled);
                record.qty = size.qty;
                record.status = state.status.as_str().to_string();
                record.reason_code = reason::EXCHANGE_TERMINAL.to_string();
                record.reason = format!("order ended {} on the exchange", state.status.as_str());
                record.raw_payload_json = Some(scrubbed_json(&state.raw));
                self.db.append_order_event(&record).await?;
                let _ = self.breaker_tx.send(BreakerSignal::OrderError);
                return Ok(());
            }
            Ok(Err(err)) => {
                self.record_order_failure(trace_id, symbol, coid, size.qty, &err).await?;
                return Ok(());
            }
            Err(_) => {
                warn!(
                    symbol,
                    coid,
                    reason_code = reason::ORDER_CONFIRM_TIMEOUT,
                    "fill confirmation timed out — reconciliation will settle it"
                );
                let mut record = self.event(trace_id, symbol, coid, OrderEventType::Error);
                record.qty = size.qty;
                record.reason_code = reason::ORDER_CONFIRM_TIMEOUT.to_string();
                record.reason = format!(
                    "no terminal state within {}s",
                    self.settings.order_confirm_timeout_seconds
                );
                self.db.append_order_event(&record).await?;
                let _ = self.breaker_tx.send(BreakerSignal::OrderError);
                return Ok(());
            }
        };

        let fill_price = order_state.avg_price.unwrap_or(entry_price);
        let now_ms = self.clock.now_ms();

        let mut filled = self.event(trace_id, symbol, coid, OrderEventType::Filled);
        filled.qty = order_state.executed_qty;
        filled.price = Some(fill_price);
        filled.reason_code = open_reason_code.to_string();
        filled.reason = open_reason.to_string();
        filled.raw_payload_json = Some(scrubbed_json(&order_state.raw));
        self.db.append_order_event(&filled).await?;

        self.db
            .insert_trade_open(&TradeOpen {
                symbol: symbol.to_string(),
                side: Side::Long,
                qty: order_state.executed_qty,
                leverage: size.leverage,
                entry_price: fill_price,
                stop_price: size.stop_price,
                stop_dist_pct: size.stop_dist_pct,
                client_order_id: coid.to_string(),
                exchange_order_id: ack.exchange_order_id.clone(),
                robot_score: Some(ai_score),
                ai_prob: Some(ai_score / 100.0),
                open_reason_code: open_reason_code.to_string(),
                open_reason: open_reason.to_string(),
                entry_time_ms: now_ms,
            })
            .await?;

        let meta = serde_json::json!({
            "note": "fill",
            "trace_id": trace_id,
            "reason_code": open_reason_code,
            "reason": open_reason,
        });
        self.db
            .insert_position_snapshot(symbol, order_state.executed_qty, fill_price, &meta.to_string(), now_ms)
            .await?;

        self.entry_features.lock().insert(coid.to_string(), features);
        let _ = self.breaker_tx.send(BreakerSignal::OrderSuccess);

        info!(
            symbol,
            coid,
            fill_price,
            qty = order_state.executed_qty,
            leverage = size.leverage,
            reason_code = open_reason_code,
            "position opened"
        );
        trade_alert(
            &self.notifier,
            &self.clock,
            open_reason_code,
            trace_id,
            &[
                ("symbol", symbol),
                ("side", Side::Long.as_str()),
                ("qty", &order_state.executed_qty.to_string()),
                ("price", &fill_price.to_string()),
                ("reason", open_reason),
            ],
        )
        .await;

        self.arm_stop(symbol, trace_id, coid, size).await;
        Ok(())
    }

    /// Poll the gateway until the order reaches a terminal state.
    async fn poll_until_terminal(
        &self,
        symbol: &str,
        coid: &str,
    ) -> Result<OrderState, crate::exchange::gateway::GatewayError> {
        loop {
            let state = self.gateway.get_order(symbol, coid).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(Duration::from_millis(FILL_POLL_MS)).await;
        }
    }

    /// Arm the protective stop, falling back to software tracking.
    async fn arm_stop(
        &self,
        symbol: &str,
        trace_id: &str,
        parent_coid: &str,
        size: &crate::risk::PositionSize,
    ) {
        let stop_id = stop_order_id(parent_coid);
        let request = StopRequest {
            symbol: symbol.to_string(),
            side: Side::Long.closing(),
            qty: size.qty,
            stop_price: size.stop_price,
            client_order_id: stop_id.clone(),
        };

        match self.gateway.set_stop(&request).await {
            Ok(ack) => {
                let mut record = self.event(trace_id, symbol, &stop_id, OrderEventType::StopArmed);
                record.side = Side::Long.closing();
                record.qty = size.qty;
                record.price = Some(size.stop_price);
                record.exchange_order_id = ack.exchange_order_id;
                record.action = "STOP_ARM".to_string();
                record.reason_code = reason::STOP_LOSS.to_string();
                record.reason = format!("protective stop armed at {:.8}", size.stop_price);
                record.raw_payload_json = Some(scrubbed_json(&ack.raw));
                if let Err(e) = self.db.append_order_event(&record).await {
                    error!(symbol, error = %e, "failed to record STOP_ARMED");
                }
            }
            Err(err) => {
                warn!(
                    symbol,
                    reason_code = reason::STOP_ARM_FAILED_FALLBACK,
                    error = %err,
                    "exchange stop arming failed — tracking stop in software"
                );
                self.software_stops.lock().insert(
                    symbol.to_string(),
                    SoftwareStop {
                        parent_order_id: parent_coid.to_string(),
                        side: Side::Long,
                        qty: size.qty,
                        stop_price: size.stop_price,
                    },
                );
                let mut record = self.event(trace_id, symbol, &stop_id, OrderEventType::StopArmed);
                record.side = Side::Long.closing();
                record.qty = size.qty;
                record.price = Some(size.stop_price);
                record.action = "STOP_FALLBACK".to_string();
                record.reason_code = reason::STOP_ARM_FAILED_FALLBACK.to_string();
                record.reason = format!("exchange stop failed ({err}); software stop armed");
                if let Err(e) = self.db.append_order_event(&record).await {
                    error!(symbol, error = %e, "failed to record stop fallback");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Settle orders whose confirmation was cut short: query the exchange
    /// and append a RECONCILED event with the observed state. A fill that
    /// arrived late also opens the missing trade-log row.
    pub(crate) async fn reconcile_symbol(&self, symbol: &str) -> Result<()> {
        let pending = self
            .db
            .unconfirmed_submissions(self.gateway.exchange_name())
            .await?;

        for submission in pending.iter().filter(|p| p.symbol == symbol) {
            let coid = &submission.client_order_id;
            let state = match self.gateway.get_order(symbol, coid).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(symbol, coid, error = %e, "reconcile query failed — retrying next tick");
                    continue;
                }
            };

            info!(
                symbol,
                coid,
                status = state.status.as_str(),
                "reconciling unconfirmed submission"
            );

            if state.status == OrderStatus::Filled {
                let fill_price = state.avg_price.unwrap_or(0.0);
                let mut filled =
                    self.event(&submission.trace_id, symbol, coid, OrderEventType::Filled);
                filled.qty = state.executed_qty;
                filled.price = Some(fill_price);
                filled.reason_code = submission.reason_code.clone();
                filled.reason = "fill discovered during reconciliation".to_string();
                filled.raw_payload_json = Some(scrubbed_json(&state.raw));
                self.db.append_order_event(&filled).await?;

                if self.db.open_trade_for_symbol(symbol).await?.is_none() {
                    self.db
                        .insert_trade_open(&TradeOpen {
                            symbol: symbol.to_string(),
                            side: Side::parse(&submission.side).unwrap_or(Side::Long),
                            qty: state.executed_qty,
                            leverage: 1,
                            entry_price: fill_price,
                            stop_price: 0.0,
                            stop_dist_pct: 0.0,
                            client_order_id: coid.clone(),
                            exchange_order_id: None,
                            robot_score: None,
                            ai_prob: None,
                            open_reason_code: submission.reason_code.clone(),
                            open_reason: "reconciled late fill".to_string(),
                            entry_time_ms: self.clock.now_ms(),
                        })
                        .await?;
                }
            }

            let mut reconciled =
                self.event(&submission.trace_id, symbol, coid, OrderEventType::Reconciled);
            reconciled.qty = submission.qty;
            reconciled.status = state.status.as_str().to_string();
            reconciled.action = "RECONCILE".to_string();
            reconciled.reason_code = submission.reason_code.clone();
            reconciled.reason = format!("exchange reports {}", state.status.as_str());
            self.db.append_order_event(&reconciled).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Heartbeat & periodic snapshots
    // -------------------------------------------------------------------------

    /// Write the heartbeat row. Returns the status JSON for readiness logs.
    pub async fn heartbeat(&self) -> Result<String> {
        let now_ms = self.clock.now_ms();
        let state = self.control.load();
        let open = self.db.open_trades().await?;
        let last_tick = *self.last_tick_bar.lock();

        let status = serde_json::json!({
            "last_tick_utc": last_tick.map(format_utc),
            "last_tick_hk": last_tick.map(format_hk),
            "halt_trading": state.halt_trading,
            "emergency_exit": state.emergency_exit,
            "open_positions": open.len(),
            "rate_limiter": self.gateway.limiter().metrics(),
        })
        .to_string();

        self.db
            .upsert_service_status(SERVICE, &self.instance_id, &status, now_ms)
            .await?;
        Ok(status)
    }

    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.heartbeat_interval_seconds));
        loop {
            ticker.tick().await;
            if let Err(e) = self.heartbeat().await {
                warn!(error = %e, "heartbeat failed");
            }
        }
    }

    /// Periodic snapshots for every open position.
    pub async fn snapshot_positions(&self) -> Result<()> {
        let now_ms = self.clock.now_ms();
        for trade in self.db.open_trades().await? {
            let meta = serde_json::json!({ "note": "periodic_snapshot" });
            self.db
                .insert_position_snapshot(
                    &trade.symbol,
                    trade.qty,
                    trade.entry_price,
                    &meta.to_string(),
                    now_ms,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn run_snapshots(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.settings.position_snapshot_interval_seconds,
        ));
        loop {
            ticker.tick().await;
            if let Err(e) = self.snapshot_positions().await {
                warn!(error = %e, "periodic snapshot failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------------

    /// Base event record bound to this engine's identity.
    pub(crate) fn event(
        &self,
        trace_id: &str,
        symbol: &str,
        coid: &str,
        event_type: OrderEventType,
    ) -> OrderEventRecord {
        OrderEventRecord::new(
            trace_id,
            SERVICE,
            self.gateway.exchange_name(),
            symbol,
            coid,
            event_type,
            Side::Long,
            0.0,
            reason::SETUP_B_SQUEEZE_RELEASE,
            "",
            self.clock.now_ms(),
        )
    }

    async fn record_order_failure(
        &self,
        trace_id: &str,
        symbol: &str,
        coid: &str,
        qty: f64,
        err: &crate::exchange::gateway::GatewayError,
    ) -> Result<()> {
        warn!(symbol, coid, reason_code = err.reason_code(), error = %err, "order failed");

        let mut record = self.event(trace_id, symbol, coid, OrderEventType::Error);
        record.qty = qty;
        record.reason_code = err.reason_code().to_string();
        record.reason = err.to_string();
        self.db.append_order_event(&record).await?;

        let _ = self.breaker_tx.send(BreakerSignal::OrderError);

        system_alert(
            &self.notifier,
            &self.clock,
            err.reason_code(),
            trace_id,
            &[("symbol", symbol), ("client_order_id", coid), ("error", &err.to_string())],
        )
        .await;
        Ok(())
    }

    async fn record_pipeline_error(&self, symbol: &str, error: &anyhow::Error) {
        let trace_id = new_trace_id();
        let mut record = self.event(
            &trace_id,
            symbol,
            &format!("{SERVICE}-{}", &trace_id[..8]),
            OrderEventType::Error,
        );
        record.action = "PIPELINE".to_string();
        record.reason_code = reason::TICK_PIPELINE_ERROR.to_string();
        record.reason = format!("pipeline error: {error:#}");
        if let Err(e) = self.db.append_order_event(&record).await {
            error!(symbol, error = %e, "failed to record pipeline error");
        }
    }
}
