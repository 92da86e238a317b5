// =============================================================================
// Shared types used across the asv8 trading control plane
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle as stored in `market_data`.
///
/// All timestamps are UTC milliseconds. A candle is only ever persisted once
/// it has closed; the syncer never stores a bar whose close time is in the
/// future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time_ms: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time_ms: i64,
    ) -> Self {
        Self {
            open_time_ms,
            close_time_ms,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Order side. Persisted as "LONG"/"SHORT" and embedded in client order ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }

    /// The order side that closes a position opened on this side.
    pub fn closing(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event types on the append-only order-event stream.
///
/// A given (exchange, symbol, client_order_id) can carry at most one row per
/// event type; the stream is the authoritative order state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventType {
    Created,
    Submitted,
    Ack,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Error,
    Reconciled,
    StopArmed,
    StopTriggered,
    StopFilled,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Ack => "ACK",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Error => "ERROR",
            Self::Reconciled => "RECONCILED",
            Self::StopArmed => "STOP_ARMED",
            Self::StopTriggered => "STOP_TRIGGERED",
            Self::StopFilled => "STOP_FILLED",
        }
    }
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a queued control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    New,
    Processed,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processed => "PROCESSED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PROCESSED" => Some(Self::Processed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Status of a feature precompute task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

/// Lifecycle status of a trade-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }
}

/// Machine-matchable reason codes attached to events, alerts, and audits.
///
/// Codes are grouped by prefix; the human-readable `reason` sentence always
/// travels next to the code.
pub mod reason {
    pub const SETUP_B_SQUEEZE_RELEASE: &str = "SETUP_B_SQUEEZE_RELEASE";
    pub const RISK_BUDGET_EXCEEDED: &str = "RISK_BUDGET_EXCEEDED";
    pub const RATE_LIMIT_BACKOFF: &str = "RATE_LIMIT_BACKOFF";
    pub const STALE_CACHE: &str = "STALE_CACHE";
    pub const TICK_TIMEOUT: &str = "TICK_TIMEOUT";
    pub const ORDER_CONFIRM_TIMEOUT: &str = "ORDER_CONFIRM_TIMEOUT";
    pub const STOP_ARM_FAILED_FALLBACK: &str = "STOP_ARM_FAILED_FALLBACK";
    pub const STOP_LOSS: &str = "STOP_LOSS";
    pub const EMERGENCY_EXIT: &str = "EMERGENCY_EXIT";
    pub const MANUAL_CLOSE: &str = "MANUAL_CLOSE";
    pub const MANUAL_CONFIG: &str = "MANUAL_CONFIG";
    pub const DATA_LAG: &str = "DATA_LAG";
    pub const EXCHANGE_TERMINAL: &str = "EXCHANGE_TERMINAL";
    pub const EXCHANGE_RETRY_EXHAUSTED: &str = "EXCHANGE_RETRY_EXHAUSTED";
    pub const EXCHANGE_SYNC_ERROR: &str = "EXCHANGE_SYNC_ERROR";
    pub const TICK_PIPELINE_ERROR: &str = "TICK_PIPELINE_ERROR";
    pub const CIRCUIT_BREAKER_ORDER_ERRORS: &str = "CIRCUIT_BREAKER_ORDER_ERRORS";
    pub const CIRCUIT_BREAKER_RATE_LIMIT: &str = "CIRCUIT_BREAKER_RATE_LIMIT";
    pub const CIRCUIT_BREAKER_DRAWDOWN: &str = "CIRCUIT_BREAKER_DRAWDOWN";
}
