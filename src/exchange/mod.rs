// =============================================================================
// Exchange abstraction — transport trait, request/response types, taxonomy
// =============================================================================
//
// Every exchange implementation (live REST client, paper simulator) speaks
// this trait. Implementations never retry and never throttle — the gateway
// owns both, routing every call through the adaptive rate limiter. Failures
// map onto three categories the gateway's retry policy keys on:
//
//   Transient   — timeout, 5xx, connection reset: retried with backoff.
//   RateLimited — 429/418: retried after the limiter's backoff window.
//   Terminal    — other 4xx / validation: surfaced immediately.
// =============================================================================

pub mod binance;
pub mod gateway;
pub mod paper;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Candle, Side};

/// Rate-limit budget groups. Each gateway call declares exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    Market,
    Account,
    Order,
}

impl Group {
    pub const ALL: [Group; 3] = [Group::Market, Group::Account, Group::Order];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Account => "account",
            Self::Order => "order",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit relevant facts extracted from one exchange response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMeta {
    pub status: u16,
    /// Used request weight advertised by the exchange for the window.
    pub used_weight: Option<u32>,
    /// Order count advertised by the exchange for the window.
    pub order_count: Option<u32>,
    /// Retry-After header, seconds.
    pub retry_after_secs: Option<u64>,
}

impl ResponseMeta {
    pub fn ok() -> Self {
        Self {
            status: 200,
            ..Self::default()
        }
    }
}

/// Exchange failure taxonomy.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("transient exchange failure: {message}")]
    Transient { message: String },

    #[error("rate limited (status {status})")]
    RateLimited {
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("terminal exchange error [{code}]: {message}")]
    Terminal { code: String, message: String },
}

impl ExchangeError {
    /// HTTP-status view of this failure for the limiter's observe path.
    pub fn response_meta(&self) -> ResponseMeta {
        match self {
            Self::Transient { .. } => ResponseMeta {
                status: 500,
                ..ResponseMeta::default()
            },
            Self::RateLimited {
                status,
                retry_after_secs,
            } => ResponseMeta {
                status: *status,
                retry_after_secs: *retry_after_secs,
                ..ResponseMeta::default()
            },
            Self::Terminal { .. } => ResponseMeta {
                status: 400,
                ..ResponseMeta::default()
            },
        }
    }
}

/// Result of one raw exchange call: payload plus the response facts the
/// limiter observes.
pub type ApiResult<T> = Result<(T, ResponseMeta), ExchangeError>;

/// Exchange-side status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }
}

/// New-order request. `client_order_id` is the idempotency key; retries of
/// the same decision must reuse it verbatim.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    /// Limit price; `None` submits a market order.
    pub price: Option<f64>,
    pub client_order_id: String,
    pub reduce_only: bool,
}

/// Protective stop request derived from a parent order.
#[derive(Debug, Clone)]
pub struct StopRequest {
    pub symbol: String,
    /// Side that closes the position (opposite of the entry).
    pub side: Side,
    pub qty: f64,
    pub stop_price: f64,
    pub client_order_id: String,
}

/// Acknowledgement returned for placement/cancel/stop calls.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub raw: serde_json::Value,
}

/// Point-in-time order state from `get_order`.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
    pub raw: serde_json::Value,
}

/// Account snapshot; `equity` feeds the risk budget.
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub equity: f64,
}

/// Raw exchange transport. All methods are single attempts; the gateway adds
/// throttling and retries.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange identity persisted into every order event.
    fn name(&self) -> &str;

    async fn place_order(&self, req: &OrderRequest) -> ApiResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ApiResult<OrderAck>;

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ApiResult<OrderState>;

    /// Klines starting at `start_ms` (exclusive of anything older), capped at
    /// `limit` bars, oldest first. `None` starts from the earliest available.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> ApiResult<Vec<Candle>>;

    async fn get_account(&self) -> ApiResult<AccountState>;

    async fn set_stop(&self, req: &StopRequest) -> ApiResult<OrderAck>;
}
