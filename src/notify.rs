// =============================================================================
// Notifier — abstract alert transport with deterministic summaries
// =============================================================================
//
// The concrete transport (Telegram, etc.) lives outside the core; the core
// only composes summaries and hands them to this trait. Every alert carries
// `ts_hk`, `ts_utc`, `event`, and `trace_id` first, then the remaining keys
// in sorted order, so downstream formatting and tests are deterministic.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::{format_hk, format_utc, Clock};

/// Ordered key-value summary of one alert.
pub type AlertSummary = Vec<(String, String)>;

/// Compose an alert summary: injected keys first, remaining keys sorted.
pub fn compose_alert(
    event: &str,
    trace_id: &str,
    now_utc_ms: i64,
    fields: &[(&str, &str)],
) -> AlertSummary {
    let mut summary: AlertSummary = vec![
        ("ts_hk".to_string(), format_hk(now_utc_ms)),
        ("ts_utc".to_string(), format_utc(now_utc_ms)),
        ("event".to_string(), event.to_string()),
        ("trace_id".to_string(), trace_id.to_string()),
    ];

    let mut rest: Vec<(String, String)> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    rest.sort();
    summary.extend(rest);
    summary
}

/// Abstract alert sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_system_alert(&self, summary: AlertSummary);
    async fn send_trade_alert(&self, summary: AlertSummary);
}

/// Default sink: structured log lines. Operators wire a real transport at the
/// process boundary; the core never knows the difference.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_system_alert(&self, summary: AlertSummary) {
        warn!(target: "asv8::alerts", alert = ?summary, "system alert");
    }

    async fn send_trade_alert(&self, summary: AlertSummary) {
        info!(target: "asv8::alerts", alert = ?summary, "trade alert");
    }
}

/// Convenience: compose and send a system alert in one call.
pub async fn system_alert(
    notifier: &Arc<dyn Notifier>,
    clock: &Arc<dyn Clock>,
    event: &str,
    trace_id: &str,
    fields: &[(&str, &str)],
) {
    let summary = compose_alert(event, trace_id, clock.now_ms(), fields);
    notifier.send_system_alert(summary).await;
}

/// Convenience: compose and send a trade alert in one call.
pub async fn trade_alert(
    notifier: &Arc<dyn Notifier>,
    clock: &Arc<dyn Clock>,
    event: &str,
    trace_id: &str,
    fields: &[(&str, &str)],
) {
    let summary = compose_alert(event, trace_id, clock.now_ms(), fields);
    notifier.send_trade_alert(summary).await;
}

// =============================================================================
// Recording notifier for tests
// =============================================================================

#[cfg(test)]
pub struct RecordingNotifier {
    pub system: parking_lot::Mutex<Vec<AlertSummary>>,
    pub trade: parking_lot::Mutex<Vec<AlertSummary>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            system: parking_lot::Mutex::new(Vec::new()),
            trade: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// All system alerts whose `event` field equals `event`.
    pub fn system_events(&self, event: &str) -> Vec<AlertSummary> {
        self.system
            .lock()
            .iter()
            .filter(|s| s.iter().any(|(k, v)| k == "event" && v == event))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_system_alert(&self, summary: AlertSummary) {
        self.system.lock().push(summary);
    }

    async fn send_trade_alert(&self, summary: AlertSummary) {
        self.trade.lock().push(summary);
    }
}
