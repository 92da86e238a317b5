// =============================================================================
// Exit management — stops, emergency exit, and position close bookkeeping
// =============================================================================
//
// Runs between ticks: a short-interval monitor that
//   1. drains an asserted EMERGENCY_EXIT flag by closing every open position
//      at market, then stands the flag down;
//   2. watches exchange-armed protective stops for fills;
//   3. evaluates software-tracked fallback stops against the latest cached
//      close and closes through the normal order pipeline when breached.
//
// Every close settles the same way: FILLED on the close order, the trade-log
// row flipped to CLOSED with its close reason, a final snapshot, an online
// partial_fit with the realized label (model persisted), and a drawdown
// signal to the circuit breaker.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::ai::ENTRY_MODEL_NAME;
use crate::breaker::BreakerSignal;
use crate::clock::hk_day_start_ms;
use crate::db::control::config_keys;
use crate::db::orders::TradeRow;
use crate::engine::{StrategyEngine, SERVICE};
use crate::exchange::{OrderRequest, OrderStatus};
use crate::features::FeatureSet;
use crate::ids::{new_trace_id, stop_order_id};
use crate::notify::trade_alert;
use crate::scrub::scrubbed_json;
use crate::types::{reason, OrderEventType, Side};

/// Seconds between exit-monitor passes. Short enough that operator commands
/// round-trip well inside the 3 s contract.
const EXIT_MONITOR_SECONDS: u64 = 1;

impl StrategyEngine {
    /// Run the exit monitor forever.
    pub async fn run_exit_monitor(self: Arc<Self>) {
        info!(interval_secs = EXIT_MONITOR_SECONDS, "exit monitor started");
        let mut ticker = tokio::time::interval(Duration::from_secs(EXIT_MONITOR_SECONDS));
        loop {
            ticker.tick().await;
            if let Err(e) = self.monitor_pass().await {
                error!(error = %e, "exit monitor pass failed");
            }
        }
    }

    /// One monitor pass: emergency flag, exchange stops, software stops.
    pub async fn monitor_pass(&self) -> Result<()> {
        if self.control.load().emergency_exit {
            self.emergency_exit_all().await?;
        }
        self.check_exchange_stops().await?;
        self.check_software_stops().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Emergency exit
    // -------------------------------------------------------------------------

    /// Close every open position at market, then stand the flag down so the
    /// exit runs exactly once per assertion.
    async fn emergency_exit_all(&self) -> Result<()> {
        let open = self.db.open_trades().await?;
        warn!(positions = open.len(), "EMERGENCY_EXIT asserted — closing all positions");

        for trade in open {
            let trace_id = new_trace_id();
            if let Err(e) = self
                .close_position(&trade, reason::EMERGENCY_EXIT, "emergency exit", &trace_id)
                .await
            {
                error!(symbol = %trade.symbol, error = %e, "emergency close failed — will retry");
            }
        }

        // Only clear the flag once nothing is left open.
        if self.db.open_trades().await?.is_empty() {
            let trace_id = new_trace_id();
            self.db
                .write_system_config(
                    config_keys::EMERGENCY_EXIT,
                    "false",
                    SERVICE,
                    &trace_id,
                    reason::EMERGENCY_EXIT,
                    "emergency exit completed; flag stood down",
                    self.clock.now_ms(),
                )
                .await?;
            self.control.refresh(&self.db).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exchange-armed stops
    // -------------------------------------------------------------------------

    async fn check_exchange_stops(&self) -> Result<()> {
        for trade in self.db.open_trades().await? {
            if self.software_stops.lock().contains_key(&trade.symbol) {
                continue; // software path owns this one
            }

            let stop_id = stop_order_id(&trade.client_order_id);
            let state = match self.gateway.get_order(&trade.symbol, &stop_id).await {
                Ok(state) => state,
                Err(e) => {
                    debug!(symbol = %trade.symbol, error = %e, "stop order query failed");
                    continue;
                }
            };
            if state.status != OrderStatus::Filled {
                continue;
            }

            let trace_id = new_trace_id();
            let exit_price = state.avg_price.unwrap_or(trade.stop_price);
            info!(
                symbol = %trade.symbol,
                exit_price,
                reason_code = reason::STOP_LOSS,
                "exchange stop filled"
            );

            let mut triggered =
                self.event(&trace_id, &trade.symbol, &stop_id, OrderEventType::StopTriggered);
            triggered.side = trade.side.closing();
            triggered.qty = trade.qty;
            triggered.price = Some(trade.stop_price);
            triggered.action = "STOP".to_string();
            triggered.reason_code = reason::STOP_LOSS.to_string();
            triggered.reason = "exchange stop order triggered".to_string();
            self.db.append_order_event(&triggered).await?;

            let mut filled =
                self.event(&trace_id, &trade.symbol, &stop_id, OrderEventType::StopFilled);
            filled.side = trade.side.closing();
            filled.qty = state.executed_qty;
            filled.price = Some(exit_price);
            filled.action = "STOP".to_string();
            filled.reason_code = reason::STOP_LOSS.to_string();
            filled.reason = format!("stop filled at {exit_price:.8}");
            filled.raw_payload_json = Some(scrubbed_json(&state.raw));
            self.db.append_order_event(&filled).await?;

            self.settle_close(
                &trade,
                exit_price,
                reason::STOP_LOSS,
                "protective stop filled on exchange",
                &trace_id,
            )
            .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Software-tracked fallback stops
    // -------------------------------------------------------------------------

    async fn check_software_stops(&self) -> Result<()> {
        let stops: Vec<(String, crate::engine::SoftwareStop)> = {
            let map = self.software_stops.lock();
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (symbol, stop) in stops {
            let Some(trade) = self.db.open_trade_for_symbol(&symbol).await? else {
                self.software_stops.lock().remove(&symbol);
                continue;
            };

            let version = self.control.load().feature_version;
            let Some(row) = self
                .db
                .latest_cache(&symbol, &self.settings.timeframe, version)
                .await?
            else {
                continue;
            };
            let features: FeatureSet =
                serde_json::from_str(&row.features_json).context("cached features unreadable")?;

            let breached = match stop.side {
                Side::Long => features.close <= stop.stop_price,
                Side::Short => features.close >= stop.stop_price,
            };
            if !breached {
                continue;
            }

            let trace_id = new_trace_id();
            let stop_id = stop_order_id(&stop.parent_order_id);
            warn!(
                symbol = %symbol,
                close = features.close,
                stop_price = stop.stop_price,
                reason_code = reason::STOP_LOSS,
                "software stop breached"
            );

            let mut triggered = self.event(&trace_id, &symbol, &stop_id, OrderEventType::StopTriggered);
            triggered.side = stop.side.closing();
            triggered.qty = stop.qty;
            triggered.price = Some(stop.stop_price);
            triggered.action = "STOP_SOFTWARE".to_string();
            triggered.reason_code = reason::STOP_LOSS.to_string();
            triggered.reason = format!(
                "software stop breached: close {:.8} vs stop {:.8}",
                features.close, stop.stop_price
            );
            self.db.append_order_event(&triggered).await?;

            self.close_position(&trade, reason::STOP_LOSS, "software stop breached", &trace_id)
                .await?;

            // The stop is terminal once it has closed the position.
            if self.db.open_trade_for_symbol(&symbol).await?.is_none() {
                let mut filled = self.event(&trace_id, &symbol, &stop_id, OrderEventType::StopFilled);
                filled.side = stop.side.closing();
                filled.qty = stop.qty;
                filled.price = Some(stop.stop_price);
                filled.action = "STOP_SOFTWARE".to_string();
                filled.reason_code = reason::STOP_LOSS.to_string();
                filled.reason = "software stop exit completed".to_string();
                self.db.append_order_event(&filled).await?;
                self.software_stops.lock().remove(&symbol);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Close pipeline
    // -------------------------------------------------------------------------

    /// Close one position with a market order through the normal CREATED →
    /// SUBMITTED → FILLED pipeline, then settle the books.
    pub(crate) async fn close_position(
        &self,
        trade: &TradeRow,
        close_reason_code: &'static str,
        close_reason: &str,
        trace_id: &str,
    ) -> Result<()> {
        let close_id = format!("{}-close", trade.client_order_id);
        let side = trade.side.closing();

        let mut created = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Created);
        created.side = side;
        created.qty = trade.qty;
        created.action = "CLOSE".to_string();
        created.reason_code = close_reason_code.to_string();
        created.reason = close_reason.to_string();
        self.db.append_order_event(&created).await?;

        let request = OrderRequest {
            symbol: trade.symbol.clone(),
            side,
            qty: trade.qty,
            price: None,
            client_order_id: close_id.clone(),
            reduce_only: true,
        };

        let ack = match self.gateway.place_order(&request).await {
            Ok(ack) => ack,
            Err(err) => {
                let mut record = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Error);
                record.side = side;
                record.qty = trade.qty;
                record.action = "CLOSE".to_string();
                record.reason_code = err.reason_code().to_string();
                record.reason = format!("close order failed: {err}");
                self.db.append_order_event(&record).await?;
                let _ = self.breaker_tx.send(BreakerSignal::OrderError);
                anyhow::bail!("close order placement failed: {err}");
            }
        };

        let mut submitted = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Submitted);
        submitted.side = side;
        submitted.qty = trade.qty;
        submitted.action = "CLOSE".to_string();
        submitted.exchange_order_id = ack.exchange_order_id;
        submitted.reason_code = close_reason_code.to_string();
        submitted.reason = close_reason.to_string();
        submitted.raw_payload_json = Some(scrubbed_json(&ack.raw));
        self.db.append_order_event(&submitted).await?;

        let window = Duration::from_secs(self.settings.order_confirm_timeout_seconds);
        let state = match tokio::time::timeout(
            window,
            self.poll_close_fill(&trade.symbol, &close_id),
        )
        .await
        {
            Ok(Ok(state)) => state,
            Ok(Err(err)) => {
                let mut record = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Error);
                record.action = "CLOSE".to_string();
                record.reason_code = err.reason_code().to_string();
                record.reason = format!("close confirmation failed: {err}");
                self.db.append_order_event(&record).await?;
                anyhow::bail!("close confirmation failed: {err}");
            }
            Err(_) => {
                let mut record = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Error);
                record.action = "CLOSE".to_string();
                record.reason_code = reason::ORDER_CONFIRM_TIMEOUT.to_string();
                record.reason = "close order not confirmed in time".to_string();
                self.db.append_order_event(&record).await?;
                anyhow::bail!("close confirmation timed out");
            }
        };

        let exit_price = state.avg_price.unwrap_or(trade.entry_price);
        let mut filled = self.event(trace_id, &trade.symbol, &close_id, OrderEventType::Filled);
        filled.side = side;
        filled.qty = state.executed_qty;
        filled.price = Some(exit_price);
        filled.action = "CLOSE".to_string();
        filled.reason_code = close_reason_code.to_string();
        filled.reason = close_reason.to_string();
        filled.raw_payload_json = Some(scrubbed_json(&state.raw));
        self.db.append_order_event(&filled).await?;

        self.settle_close(trade, exit_price, close_reason_code, close_reason, trace_id)
            .await
    }

    async fn poll_close_fill(
        &self,
        symbol: &str,
        close_id: &str,
    ) -> Result<crate::exchange::OrderState, crate::exchange::gateway::GatewayError> {
        loop {
            let state = self.gateway.get_order(symbol, close_id).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Settle the books after the position is flat: trade log, snapshot,
    /// online learning, drawdown signal, alert.
    async fn settle_close(
        &self,
        trade: &TradeRow,
        exit_price: f64,
        close_reason_code: &'static str,
        close_reason: &str,
        trace_id: &str,
    ) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let direction = match trade.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        let pnl = (exit_price - trade.entry_price) * trade.qty * direction;

        self.db
            .close_trade(
                &trade.client_order_id,
                exit_price,
                pnl,
                close_reason_code,
                close_reason,
                now_ms,
            )
            .await?;

        let meta = serde_json::json!({
            "note": "close",
            "trace_id": trace_id,
            "reason_code": close_reason_code,
            "reason": close_reason,
            "pnl": pnl,
        });
        self.db
            .insert_position_snapshot(&trade.symbol, 0.0, trade.entry_price, &meta.to_string(), now_ms)
            .await?;

        // Online learning with the realized label, model persisted after.
        let entry_features = self.entry_features.lock().remove(&trade.client_order_id);
        if let Some(features) = entry_features {
            let label = if pnl > 0.0 { 1.0 } else { 0.0 };
            let mut scorer = self.scorer.lock().await;
            scorer.partial_fit(&features, label);
            let metrics = serde_json::json!({ "samples": scorer.samples() }).to_string();
            self.db
                .save_model(
                    ENTRY_MODEL_NAME,
                    scorer.impl_tag(),
                    &scorer.serialize(),
                    Some(&metrics),
                    now_ms,
                )
                .await?;
        } else {
            debug!(
                symbol = %trade.symbol,
                "no retained entry features (restart?) — skipping partial_fit"
            );
        }

        // Realized drawdown for the day feeds the breaker.
        let day_start = hk_day_start_ms(self.clock.now_hk());
        let day_pnl = self.db.realized_pnl_since(day_start).await?;
        if day_pnl < 0.0 {
            if let Ok(account) = self.gateway.get_account().await {
                if account.equity > 0.0 {
                    let dd = -day_pnl / account.equity;
                    let _ = self.breaker_tx.send(BreakerSignal::DrawdownPct(dd));
                }
            }
        }

        info!(
            symbol = %trade.symbol,
            exit_price,
            pnl,
            reason_code = close_reason_code,
            "position closed"
        );
        trade_alert(
            &self.notifier,
            &self.clock,
            close_reason_code,
            trace_id,
            &[
                ("symbol", &trade.symbol),
                ("exit_price", &exit_price.to_string()),
                ("pnl", &format!("{pnl:.4}")),
                ("reason", close_reason),
            ],
        )
        .await;
        Ok(())
    }
}

// =============================================================================
// Tests — exit scenarios
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::Fault;
    use crate::settings::Settings;
    use crate::testkit::{
        count_events_like, engine_fixture, seed_decision_pair, setup_b_features, EngineFixture,
        DECISION_BAR_OPEN, IV, NOW_MS, TICK_BAR,
    };
    use crate::types::TradeStatus;

    /// Open a position through the normal entry pipeline.
    async fn open_position(f: &EngineFixture) -> crate::db::orders::TradeRow {
        let (prev, now) = setup_b_features();
        seed_decision_pair(&f.db, 1, &prev, &now).await;
        f.engine.tick(TICK_BAR).await;
        f.db.open_trade_for_symbol("BTCUSDT").await.unwrap().unwrap()
    }

    async fn closed_trade_reason(f: &EngineFixture, coid: &str) -> (String, f64) {
        let coid = coid.to_string();
        f.db.with_conn(move |conn| {
            let row = conn.query_row(
                "SELECT close_reason_code, pnl FROM trade_logs WHERE client_order_id = ?1",
                rusqlite::params![coid],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?;
            Ok(row)
        })
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_stop_fill_closes_the_position() {
        let f = engine_fixture(500.0, Settings::default()).await;
        let trade = open_position(&f).await;
        let stop_id = stop_order_id(&trade.client_order_id);

        // Nothing to do while the stop rests.
        f.engine.monitor_pass().await.unwrap();
        assert!(f.db.open_trade_for_symbol("BTCUSDT").await.unwrap().is_some());

        // The exchange fills the stop.
        assert!(f.paper.trigger_stop(&stop_id));
        f.engine.monitor_pass().await.unwrap();

        assert!(
            f.db.has_order_event("paper", "BTCUSDT", &stop_id, OrderEventType::StopTriggered)
                .await
                .unwrap()
        );
        assert!(
            f.db.has_order_event("paper", "BTCUSDT", &stop_id, OrderEventType::StopFilled)
                .await
                .unwrap()
        );
        assert!(f.db.open_trade_for_symbol("BTCUSDT").await.unwrap().is_none());

        let (code, pnl) = closed_trade_reason(&f, &trade.client_order_id).await;
        assert_eq!(code, reason::STOP_LOSS);
        assert!(pnl < 0.0, "long stopped below entry should realize a loss, got {pnl}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_arm_failure_falls_back_to_software_and_triggers() {
        let f = engine_fixture(500.0, Settings::default()).await;
        f.paper.inject_stop_fault(Fault::Terminal {
            code: "-2021".into(),
            message: "would trigger immediately".into(),
        });
        let trade = open_position(&f).await;
        let stop_id = stop_order_id(&trade.client_order_id);

        // Fallback recorded on the stream with its reason code.
        let armed_reason = f
            .db
            .order_event_reason("paper", "BTCUSDT", &stop_id, OrderEventType::StopArmed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(armed_reason, reason::STOP_ARM_FAILED_FALLBACK);

        // A later bar closes through the stop.
        let (_, mut below) = setup_b_features();
        below.close = trade.stop_price - 0.5;
        f.db.write_cache(
            "BTCUSDT",
            "15m",
            DECISION_BAR_OPEN + IV,
            1,
            &serde_json::to_string(&below).unwrap(),
            NOW_MS,
        )
        .await
        .unwrap();
        f.paper.set_last_price("BTCUSDT", below.close);

        f.engine.monitor_pass().await.unwrap();

        assert!(
            f.db.has_order_event("paper", "BTCUSDT", &stop_id, OrderEventType::StopTriggered)
                .await
                .unwrap()
        );
        assert!(
            f.db.has_order_event("paper", "BTCUSDT", &stop_id, OrderEventType::StopFilled)
                .await
                .unwrap()
        );
        let (code, _) = closed_trade_reason(&f, &trade.client_order_id).await;
        assert_eq!(code, reason::STOP_LOSS);

        // The fallback is terminal: nothing left to watch.
        f.engine.monitor_pass().await.unwrap();
        assert_eq!(count_events_like(&f.db, "STOP_TRIGGERED", "asv8-BTCUSDT-%").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn software_stop_ignores_unbreached_closes() {
        let f = engine_fixture(500.0, Settings::default()).await;
        f.paper.inject_stop_fault(Fault::Terminal {
            code: "-2021".into(),
            message: "would trigger immediately".into(),
        });
        let trade = open_position(&f).await;

        // Price stays above the stop: no exit.
        let (_, mut above) = setup_b_features();
        above.close = trade.stop_price + 1.0;
        f.db.write_cache(
            "BTCUSDT",
            "15m",
            DECISION_BAR_OPEN + IV,
            1,
            &serde_json::to_string(&above).unwrap(),
            NOW_MS,
        )
        .await
        .unwrap();

        f.engine.monitor_pass().await.unwrap();
        assert!(f.db.open_trade_for_symbol("BTCUSDT").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_exit_flattens_everything_and_stands_down() {
        let f = engine_fixture(500.0, Settings::default()).await;
        let trade = open_position(&f).await;

        // Operator asserts the emergency through the audited config path.
        f.db.write_system_config(
            config_keys::HALT_TRADING,
            "true",
            "admin:op1",
            "t-emergency",
            reason::EMERGENCY_EXIT,
            "flatten now",
            NOW_MS,
        )
        .await
        .unwrap();
        f.db.write_system_config(
            config_keys::EMERGENCY_EXIT,
            "true",
            "admin:op1",
            "t-emergency",
            reason::EMERGENCY_EXIT,
            "flatten now",
            NOW_MS,
        )
        .await
        .unwrap();
        f.control.refresh(&f.db).await.unwrap();

        f.engine.monitor_pass().await.unwrap();

        // Position closed with the emergency reason.
        let (code, _) = closed_trade_reason(&f, &trade.client_order_id).await;
        assert_eq!(code, reason::EMERGENCY_EXIT);
        assert!(f.db.open_trades().await.unwrap().is_empty());

        // Close order has its own lifecycle on the stream.
        let close_id = format!("{}-close", trade.client_order_id);
        for event in [
            OrderEventType::Created,
            OrderEventType::Submitted,
            OrderEventType::Filled,
        ] {
            assert!(
                f.db.has_order_event("paper", "BTCUSDT", &close_id, event).await.unwrap(),
                "missing {event} on close order"
            );
        }

        // Flag stood down; HALT remains asserted.
        let state = f.control.load();
        assert!(!state.emergency_exit);
        assert!(state.halt_trading);

        // Final snapshot (qty 0) joined the fill snapshot, and the close was
        // alerted with the emergency reason.
        assert_eq!(f.db.snapshot_count("BTCUSDT").await.unwrap(), 2);
        assert!(f
            .notifier
            .trade
            .lock()
            .iter()
            .any(|s| s.iter().any(|(k, v)| k == "event" && v == reason::EMERGENCY_EXIT)));
    }

    #[tokio::test(start_paused = true)]
    async fn losing_close_feeds_the_scorer_and_breaker() {
        let mut f = engine_fixture(500.0, Settings::default()).await;
        let trade = open_position(&f).await;
        let stop_id = stop_order_id(&trade.client_order_id);

        {
            let scorer = f.engine.scorer.lock().await;
            assert_eq!(scorer.samples(), 0);
        }

        assert!(f.paper.trigger_stop(&stop_id));
        f.engine.monitor_pass().await.unwrap();

        // partial_fit ran and the model was persisted.
        {
            let scorer = f.engine.scorer.lock().await;
            assert_eq!(scorer.samples(), 1);
        }
        let model = f.db.load_current_model(ENTRY_MODEL_NAME).await.unwrap().unwrap();
        assert_eq!(model.version, 1);

        // A drawdown signal reached the breaker channel.
        let mut saw_drawdown = false;
        while let Ok(signal) = f.breaker_rx.try_recv() {
            if let BreakerSignal::DrawdownPct(pct) = signal {
                assert!(pct > 0.0);
                saw_drawdown = true;
            }
        }
        assert!(saw_drawdown, "expected a drawdown signal after a losing close");

        let closed = f.db.open_trade_for_symbol("BTCUSDT").await.unwrap();
        assert!(closed.is_none());
        let trade_status = {
            let coid = trade.client_order_id.clone();
            f.db.with_conn(move |conn| {
                let s: String = conn.query_row(
                    "SELECT status FROM trade_logs WHERE client_order_id = ?1",
                    rusqlite::params![coid],
                    |row| row.get(0),
                )?;
                Ok(s)
            })
            .await
            .unwrap()
        };
        assert_eq!(trade_status, TradeStatus::Closed.as_str());
    }
}
