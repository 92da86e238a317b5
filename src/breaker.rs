// =============================================================================
// Circuit Breaker — aggregates failure signals and self-HALTs the system
// =============================================================================
//
// Signals arrive on a channel from the order pipeline (errors/successes), the
// rate limiter (429 hits), and the exit path (realized drawdown). Any
// threshold breach writes HALT_TRADING=true through the audited config path
// and emits a system alert. The breaker never clears the halt: resumption is
// an explicit operator command.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::db::control::config_keys;
use crate::db::Database;
use crate::exchange::Group;
use crate::ids::new_trace_id;
use crate::notify::{system_alert, Notifier};
use crate::types::reason;

/// One observation feeding the breaker.
#[derive(Debug, Clone)]
pub enum BreakerSignal {
    /// An order pipeline operation failed.
    OrderError,
    /// An order pipeline operation succeeded (resets the consecutive count).
    OrderSuccess,
    /// The rate limiter absorbed a 429/418.
    RateLimited { group: Group },
    /// Realized drawdown fraction of equity (0.06 = 6 %).
    DrawdownPct(f64),
}

/// Breach thresholds.
#[derive(Debug, Clone)]
pub struct BreakerThresholds {
    pub consecutive_order_errors: usize,
    pub rate_limit_hits: usize,
    pub window: Duration,
    pub max_drawdown_pct: f64,
}

impl Default for BreakerThresholds {
    fn default() -> Self {
        Self {
            consecutive_order_errors: 5,
            rate_limit_hits: 10,
            window: Duration::from_secs(60),
            max_drawdown_pct: 0.05,
        }
    }
}

pub struct CircuitBreaker {
    db: Database,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    thresholds: BreakerThresholds,
    order_errors: VecDeque<Instant>,
    rate_hits: VecDeque<Instant>,
}

impl CircuitBreaker {
    pub fn new(
        db: Database,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        thresholds: BreakerThresholds,
    ) -> Self {
        Self {
            db,
            notifier,
            clock,
            thresholds,
            order_errors: VecDeque::new(),
            rate_hits: VecDeque::new(),
        }
    }

    /// Consume signals until the channel closes.
    pub async fn run(mut self, mut rx: UnboundedReceiver<BreakerSignal>) {
        info!(thresholds = ?self.thresholds, "circuit breaker armed");
        while let Some(signal) = rx.recv().await {
            if let Err(e) = self.handle_signal(signal).await {
                error!(error = %e, "circuit breaker failed to process signal");
            }
        }
        warn!("circuit breaker channel closed — breaker stopped");
    }

    /// Apply one signal; trips the breaker on a threshold breach.
    pub async fn handle_signal(&mut self, signal: BreakerSignal) -> Result<()> {
        let now = Instant::now();
        prune(&mut self.order_errors, now, self.thresholds.window);
        prune(&mut self.rate_hits, now, self.thresholds.window);

        match signal {
            BreakerSignal::OrderSuccess => {
                self.order_errors.clear();
            }
            BreakerSignal::OrderError => {
                self.order_errors.push_back(now);
                if self.order_errors.len() >= self.thresholds.consecutive_order_errors {
                    let detail = format!(
                        "{} consecutive order errors within {}s",
                        self.order_errors.len(),
                        self.thresholds.window.as_secs()
                    );
                    self.order_errors.clear();
                    self.trip(reason::CIRCUIT_BREAKER_ORDER_ERRORS, &detail).await?;
                }
            }
            BreakerSignal::RateLimited { group } => {
                self.rate_hits.push_back(now);
                if self.rate_hits.len() >= self.thresholds.rate_limit_hits {
                    let detail = format!(
                        "{} rate-limit hits within {}s (last group: {group})",
                        self.rate_hits.len(),
                        self.thresholds.window.as_secs()
                    );
                    self.rate_hits.clear();
                    self.trip(reason::CIRCUIT_BREAKER_RATE_LIMIT, &detail).await?;
                }
            }
            BreakerSignal::DrawdownPct(pct) => {
                if pct > self.thresholds.max_drawdown_pct {
                    let detail = format!(
                        "realized drawdown {:.2}% exceeds {:.2}%",
                        pct * 100.0,
                        self.thresholds.max_drawdown_pct * 100.0
                    );
                    self.trip(reason::CIRCUIT_BREAKER_DRAWDOWN, &detail).await?;
                }
            }
        }
        Ok(())
    }

    /// Set HALT_TRADING through the audited path and alert the operator.
    /// The breaker only asserts the halt; it never clears it.
    async fn trip(&self, reason_code: &str, detail: &str) -> Result<()> {
        let trace_id = new_trace_id();
        warn!(reason_code, detail, trace_id = %trace_id, "circuit breaker tripped — halting trading");

        self.db
            .write_system_config(
                config_keys::HALT_TRADING,
                "true",
                "circuit-breaker",
                &trace_id,
                reason_code,
                detail,
                self.clock.now_ms(),
            )
            .await?;

        system_alert(
            &self.notifier,
            &self.clock,
            reason_code,
            &trace_id,
            &[("detail", detail), ("halt_trading", "true")],
        )
        .await;

        Ok(())
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > span {
            window.pop_front();
        } else {
            break;
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
    use crate::notify::RecordingNotifier;

    fn breaker(db: &Database, notifier: &Arc<RecordingNotifier>) -> CircuitBreaker {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_ms(1_750_000_000_000));
        CircuitBreaker::new(
            db.clone(),
            notifier.clone() as Arc<dyn Notifier>,
            clock,
            BreakerThresholds::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn five_consecutive_order_errors_halt_trading() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        for _ in 0..4 {
            cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        }
        assert!(!db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());

        cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        assert!(db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());

        let alerts = notifier.system_events(reason::CIRCUIT_BREAKER_ORDER_ERRORS);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].iter().any(|(k, _)| k == "trace_id"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_consecutive_count() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        for _ in 0..4 {
            cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        }
        cb.handle_signal(BreakerSignal::OrderSuccess).await.unwrap();
        for _ in 0..4 {
            cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        }
        assert!(!db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_outside_the_window_do_not_count() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        for _ in 0..4 {
            cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        cb.handle_signal(BreakerSignal::OrderError).await.unwrap();
        assert!(!db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ten_rate_limit_hits_in_window_halt_trading() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        for _ in 0..10 {
            cb.handle_signal(BreakerSignal::RateLimited { group: Group::Order })
                .await
                .unwrap();
        }
        assert!(db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());
        assert_eq!(notifier.system_events(reason::CIRCUIT_BREAKER_RATE_LIMIT).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drawdown_breach_halts_trading() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        cb.handle_signal(BreakerSignal::DrawdownPct(0.04)).await.unwrap();
        assert!(!db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());

        cb.handle_signal(BreakerSignal::DrawdownPct(0.06)).await.unwrap();
        assert!(db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_never_self_clears() {
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let mut cb = breaker(&db, &notifier);

        cb.handle_signal(BreakerSignal::DrawdownPct(0.10)).await.unwrap();
        assert!(db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());

        // A run of clean successes later, the halt is still asserted.
        for _ in 0..20 {
            cb.handle_signal(BreakerSignal::OrderSuccess).await.unwrap();
        }
        assert!(db.get_config_flag(config_keys::HALT_TRADING).await.unwrap());
    }
}
