// =============================================================================
// Exchange Gateway — the single choke point for all exchange I/O
// =============================================================================
//
// Every call declares its budget group and flows acquire → attempt → observe
// through the adaptive rate limiter; there is no alternate path. Retry policy
// by failure category:
//
//   Transient   — retried up to `max_retries` with the limiter's exponential
//                 schedule between attempts, client_order_id preserved.
//   RateLimited — retried within the same budget; the next acquire() blocks
//                 until the armed backoff (Retry-After floor included) ends.
//   Terminal    — returned immediately with a reason code derived from the
//                 exchange error.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::rate_limit::AdaptiveRateLimiter;
use super::{
    AccountState, ApiResult, Exchange, ExchangeError, Group, OrderAck, OrderRequest, OrderState,
    StopRequest,
};
use crate::types::{reason, Candle};

/// Default retry budget for transient and rate-limited failures.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failure surfaced to gateway callers after policy is applied.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("terminal exchange error [{code}]: {message}")]
    Terminal { code: String, message: String },

    #[error("retry budget exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

impl GatewayError {
    /// Machine-matchable reason code for order events and alerts.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Terminal { .. } => reason::EXCHANGE_TERMINAL,
            Self::RetriesExhausted { .. } => reason::EXCHANGE_RETRY_EXHAUSTED,
        }
    }
}

/// Facade over one exchange transport plus the shared rate limiter.
pub struct ExchangeGateway {
    exchange: Arc<dyn Exchange>,
    limiter: Arc<AdaptiveRateLimiter>,
    max_retries: u32,
}

impl ExchangeGateway {
    pub fn new(exchange: Arc<dyn Exchange>, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self {
            exchange,
            limiter,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    #[cfg(test)]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Exchange identity persisted into order events.
    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    /// Shared limiter (heartbeats export its metrics).
    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    // -------------------------------------------------------------------------
    // Public calls
    // -------------------------------------------------------------------------

    pub async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck, GatewayError> {
        self.call(Group::Order, "place_order", || self.exchange.place_order(req))
            .await
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderAck, GatewayError> {
        self.call(Group::Order, "cancel_order", || {
            self.exchange.cancel_order(symbol, client_order_id)
        })
        .await
    }

    pub async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<OrderState, GatewayError> {
        self.call(Group::Order, "get_order", || {
            self.exchange.get_order(symbol, client_order_id)
        })
        .await
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.call(Group::Market, "get_klines", || {
            self.exchange.get_klines(symbol, interval, start_ms, limit)
        })
        .await
    }

    pub async fn get_account(&self) -> Result<AccountState, GatewayError> {
        self.call(Group::Account, "get_account", || self.exchange.get_account())
            .await
    }

    pub async fn set_stop(&self, req: &StopRequest) -> Result<OrderAck, GatewayError> {
        self.call(Group::Order, "set_stop", || self.exchange.set_stop(req))
            .await
    }

    // -------------------------------------------------------------------------
    // Retry loop
    // -------------------------------------------------------------------------

    async fn call<T, F, Fut>(&self, group: Group, label: &str, attempt_fn: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let mut attempts = 0u32;

        loop {
            self.limiter.acquire(group).await;
            attempts += 1;

            match attempt_fn().await {
                Ok((value, meta)) => {
                    self.limiter.observe(group, &meta);
                    if attempts > 1 {
                        debug!(call = label, attempts, "exchange call recovered after retries");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.limiter.observe(group, &err.response_meta());

                    match err {
                        ExchangeError::Terminal { code, message } => {
                            warn!(call = label, code = %code, message = %message, "terminal exchange error");
                            return Err(GatewayError::Terminal { code, message });
                        }
                        ExchangeError::Transient { message } => {
                            if attempts > self.max_retries {
                                return Err(GatewayError::RetriesExhausted { attempts, message });
                            }
                            let delay = AdaptiveRateLimiter::retry_delay(attempts);
                            warn!(
                                call = label,
                                attempts,
                                delay_ms = delay.as_millis() as u64,
                                message = %message,
                                "transient exchange failure — retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        ExchangeError::RateLimited { status, .. } => {
                            if attempts > self.max_retries {
                                return Err(GatewayError::RetriesExhausted {
                                    attempts,
                                    message: format!("rate limited (status {status})"),
                                });
                            }
                            // The observe above armed the backoff; the next
                            // acquire() blocks until it elapses.
                            warn!(call = label, attempts, status, "rate limited — will retry after backoff");
                        }
                    }
                }
            }
        }
    }
}
