// =============================================================================
// Adaptive Rate Limiter — header-driven budgets with exponential backoff
// =============================================================================
//
// One process-wide limiter owns three independent budgets (market, account,
// order). Consumed weight tracks what the exchange advertises in its response
// headers, topped up by local counting between responses. A 429/418 arms an
// exponential backoff (base 500 ms, factor 2, cap 30 s, ±20 % jitter) floored
// by any Retry-After header; one successful non-rate-limited response resets
// the schedule. Every 429 also signals the circuit breaker.
//
// No exchange call may bypass `acquire`/`observe` — the gateway is the only
// caller and routes every request through both.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Group, ResponseMeta};
use crate::breaker::BreakerSignal;
use crate::types::reason;

/// First backoff step.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Exponential factor per consecutive rate-limit hit.
const BACKOFF_FACTOR: u32 = 2;
/// Hard cap on any single backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Jitter applied to every computed backoff (fraction of the delay).
const BACKOFF_JITTER: f64 = 0.2;
/// Rolling window for per-group usage and 429 frequency.
const WINDOW: Duration = Duration::from_secs(60);
/// Sleep granularity while waiting for budget with no armed backoff.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Retained backoff events (newest kept).
const EVENT_LOG_CAP: usize = 100;

/// One recorded backoff decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffEvent {
    pub group: Group,
    pub status: u16,
    pub delay_ms: u64,
    pub reason_code: String,
}

/// Per-group metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetrics {
    pub group: Group,
    pub requests_total: u64,
    pub rate_limited_total: u64,
    pub wait_seconds_total: f64,
    pub backoff_remaining_ms: u64,
    pub used: u32,
    pub ceiling: u32,
}

struct GroupState {
    ceiling: u32,
    used: u32,
    window_started: Instant,
    backoff_until: Option<Instant>,
    backoff_step: u32,
    requests_total: u64,
    rate_limited_total: u64,
    wait_total: Duration,
}

impl GroupState {
    fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            used: 0,
            window_started: Instant::now(),
            backoff_until: None,
            backoff_step: 0,
            requests_total: 0,
            rate_limited_total: 0,
            wait_total: Duration::ZERO,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_started) >= WINDOW {
            self.used = 0;
            self.window_started = now;
        }
    }
}

/// Process-wide adaptive rate limiter shared by all exchange I/O.
pub struct AdaptiveRateLimiter {
    groups: Mutex<[GroupState; 3]>,
    events: Mutex<VecDeque<BackoffEvent>>,
    breaker_tx: Option<UnboundedSender<BreakerSignal>>,
}

impl AdaptiveRateLimiter {
    pub fn new(
        market_ceiling: u32,
        account_ceiling: u32,
        order_ceiling: u32,
        breaker_tx: Option<UnboundedSender<BreakerSignal>>,
    ) -> Self {
        Self {
            groups: Mutex::new([
                GroupState::new(market_ceiling),
                GroupState::new(account_ceiling),
                GroupState::new(order_ceiling),
            ]),
            events: Mutex::new(VecDeque::new()),
            breaker_tx,
        }
    }

    // -------------------------------------------------------------------------
    // acquire
    // -------------------------------------------------------------------------

    /// Block cooperatively until `group` is under its ceiling and any armed
    /// backoff has elapsed, then take one permit.
    pub async fn acquire(&self, group: Group) {
        loop {
            let wait = {
                let mut groups = self.groups.lock();
                let state = &mut groups[idx(group)];
                let now = Instant::now();
                state.roll_window(now);

                let backoff_wait = match state.backoff_until {
                    Some(until) if until > now => Some(until - now),
                    Some(_) => {
                        state.backoff_until = None;
                        None
                    }
                    None => None,
                };

                match backoff_wait {
                    Some(w) => Some(w),
                    None if state.used < state.ceiling => None,
                    // Over budget: wait out the remainder of the window.
                    None => Some(
                        (state.window_started + WINDOW)
                            .duration_since(now)
                            .max(POLL_INTERVAL),
                    ),
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    {
                        let mut groups = self.groups.lock();
                        groups[idx(group)].wait_total += delay;
                    }
                    debug!(group = %group, wait_ms = delay.as_millis() as u64, "rate limiter waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let mut groups = self.groups.lock();
        let state = &mut groups[idx(group)];
        state.used += 1;
        state.requests_total += 1;
    }

    // -------------------------------------------------------------------------
    // observe
    // -------------------------------------------------------------------------

    /// Feed one response (success or failure) back into the budget.
    pub fn observe(&self, group: Group, meta: &ResponseMeta) {
        let mut groups = self.groups.lock();
        let state = &mut groups[idx(group)];
        let now = Instant::now();
        state.roll_window(now);

        // Header-advertised usage replaces local counting.
        if group == Group::Order {
            if let Some(count) = meta.order_count {
                state.used = count;
            }
        } else if let Some(weight) = meta.used_weight {
            state.used = weight;
        }

        match meta.status {
            429 | 418 => {
                state.rate_limited_total += 1;
                state.backoff_step += 1;

                let exponential = exponential_backoff(state.backoff_step);
                let floor = meta
                    .retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::ZERO);
                let delay = exponential.max(floor).min(BACKOFF_CAP.max(floor));

                state.backoff_until = Some(now + delay);

                warn!(
                    group = %group,
                    status = meta.status,
                    backoff_ms = delay.as_millis() as u64,
                    step = state.backoff_step,
                    reason_code = reason::RATE_LIMIT_BACKOFF,
                    "rate limited — backing off"
                );

                let mut events = self.events.lock();
                if events.len() == EVENT_LOG_CAP {
                    events.pop_front();
                }
                events.push_back(BackoffEvent {
                    group,
                    status: meta.status,
                    delay_ms: delay.as_millis() as u64,
                    reason_code: reason::RATE_LIMIT_BACKOFF.to_string(),
                });

                if let Some(tx) = &self.breaker_tx {
                    let _ = tx.send(BreakerSignal::RateLimited { group });
                }
            }
            s if s < 400 => {
                // One clean response resets the schedule.
                state.backoff_step = 0;
                state.backoff_until = None;
            }
            _ => {
                // Other failures neither arm nor clear the backoff.
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Per-group snapshot for heartbeats and tests.
    pub fn metrics(&self) -> Vec<GroupMetrics> {
        let groups = self.groups.lock();
        let now = Instant::now();
        Group::ALL
            .iter()
            .map(|&g| {
                let s = &groups[idx(g)];
                GroupMetrics {
                    group: g,
                    requests_total: s.requests_total,
                    rate_limited_total: s.rate_limited_total,
                    wait_seconds_total: s.wait_total.as_secs_f64(),
                    backoff_remaining_ms: s
                        .backoff_until
                        .map(|u| u.duration_since(now).as_millis() as u64)
                        .unwrap_or(0),
                    used: s.used,
                    ceiling: s.ceiling,
                }
            })
            .collect()
    }

    /// Recorded backoff events, oldest first.
    pub fn backoff_events(&self) -> Vec<BackoffEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Remaining backoff for one group.
    pub fn backoff_remaining(&self, group: Group) -> Duration {
        let groups = self.groups.lock();
        groups[idx(group)]
            .backoff_until
            .map(|u| u.duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// The backoff schedule shared with the gateway's transient-retry path.
    pub fn retry_delay(attempt: u32) -> Duration {
        exponential_backoff(attempt.max(1))
    }
}

fn idx(group: Group) -> usize {
    match group {
        Group::Market => 0,
        Group::Account => 1,
        Group::Order => 2,
    }
}

/// base · factor^(step-1), jittered ±20 %, capped at 30 s.
fn exponential_backoff(step: u32) -> Duration {
    let exp = BACKOFF_FACTOR.saturating_pow(step.saturating_sub(1));
    let raw = BACKOFF_BASE.saturating_mul(exp).min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    let jittered = raw.mul_f64(jitter);
    jittered.min(BACKOFF_CAP)
}
