// =============================================================================
// Identifiers — trace ids and idempotent client order ids
// =============================================================================
//
// The client order id is the idempotency key for one order decision:
//
//   asv8-{symbol}-{side}-{timeframe}-{bar_close_ts}-{nonce}
//
// The nonce is a stable short hash of the decision's trace id, so every retry
// of the same decision reuses the same id while distinct decisions on the
// same bar remain distinguishable. Protective stops derive their id from the
// parent order.
// =============================================================================

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::Side;

/// Prefix carried by every client order id issued by this system.
pub const ORDER_ID_PREFIX: &str = "asv8";

/// Suffix appended to a parent order id to form its protective stop id.
pub const STOP_SUFFIX: &str = "stop";

/// Fresh trace id for one operator action or one tick decision.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stable 8-hex-digit nonce derived from a trace id.
pub fn nonce_from_trace(trace_id: &str) -> String {
    let digest = Sha256::digest(trace_id.as_bytes());
    hex::encode(&digest[..4])
}

/// Build the idempotent client order id for an entry decision.
pub fn client_order_id(
    symbol: &str,
    side: Side,
    timeframe: &str,
    bar_close_ts: i64,
    trace_id: &str,
) -> String {
    format!(
        "{ORDER_ID_PREFIX}-{symbol}-{side}-{timeframe}-{bar_close_ts}-{}",
        nonce_from_trace(trace_id)
    )
}

/// Client order id of the protective stop for `parent`.
pub fn stop_order_id(parent: &str) -> String {
    format!("{parent}-{STOP_SUFFIX}")
}

/// SQL LIKE pattern matching every entry attempt for a (symbol, timeframe,
/// bar) triple, regardless of side and nonce. Drives restart duplicate
/// suppression.
pub fn bar_attempt_pattern(symbol: &str, timeframe: &str, bar_close_ts: i64) -> String {
    format!("{ORDER_ID_PREFIX}-{symbol}-%-{timeframe}-{bar_close_ts}-%")
}

/// Parsed components of a client order id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOrderId {
    pub symbol: String,
    pub side: Side,
    pub timeframe: String,
    pub bar_close_ts: i64,
    pub nonce: String,
}

/// Parse a client order id back into its components.
///
/// Returns `None` for ids not issued by this system (wrong prefix, wrong
/// segment count, unknown side, non-numeric timestamp). Stop ids carry the
/// extra `-stop` suffix and are rejected here; strip it first if needed.
pub fn parse_client_order_id(id: &str) -> Option<ParsedOrderId> {
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() != 6 || parts[0] != ORDER_ID_PREFIX {
        return None;
    }
    let side = Side::parse(parts[2])?;
    let bar_close_ts: i64 = parts[4].parse().ok()?;
    Some(ParsedOrderId {
        symbol: parts[1].to_string(),
        side,
        timeframe: parts[3].to_string(),
        bar_close_ts,
        nonce: parts[5].to_string(),
    })
}
