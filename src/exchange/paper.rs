// =============================================================================
// Paper exchange — in-process simulator behind the Exchange trait
// =============================================================================
//
// Drives PAPER_TRADING mode and every test that exercises the order pipeline.
// Orders fill instantly at the requested price (or the seeded last price for
// market orders). Fault scripts let tests inject rate limits, transient
// failures, and terminal rejections on the next placement or stop call.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use super::{
    AccountState, ApiResult, Exchange, ExchangeError, OrderAck, OrderRequest, OrderState,
    OrderStatus, ResponseMeta, StopRequest,
};
use crate::types::{Candle, Side};

/// A scripted failure consumed by the next matching call.
#[derive(Debug, Clone)]
pub enum Fault {
    RateLimited { retry_after_secs: Option<u64> },
    Transient,
    Terminal { code: String, message: String },
}

impl Fault {
    fn into_error(self) -> ExchangeError {
        match self {
            Self::RateLimited { retry_after_secs } => ExchangeError::RateLimited {
                status: 429,
                retry_after_secs,
            },
            Self::Transient => ExchangeError::Transient {
                message: "injected transient failure".into(),
            },
            Self::Terminal { code, message } => ExchangeError::Terminal { code, message },
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    side: Side,
    qty: f64,
    fill_price: f64,
    status: OrderStatus,
    stop_price: Option<f64>,
}

#[derive(Default)]
struct PaperState {
    equity: f64,
    last_price: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
    klines: HashMap<(String, String), Vec<Candle>>,
    place_faults: VecDeque<Fault>,
    stop_faults: VecDeque<Fault>,
    place_attempts: u32,
    hold_fills: bool,
}

/// Simulated exchange. Clones share state.
pub struct PaperExchange {
    name: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, equity: f64) -> Self {
        let name = name.into();
        info!(exchange = %name, equity, "paper exchange initialised");
        Self {
            name,
            state: Mutex::new(PaperState {
                equity,
                ..PaperState::default()
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Test / paper-mode scripting
    // -------------------------------------------------------------------------

    pub fn set_last_price(&self, symbol: &str, price: f64) {
        self.state.lock().last_price.insert(symbol.to_string(), price);
    }

    pub fn seed_klines(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        if let Some(last) = candles.last() {
            self.set_last_price(symbol, last.close);
        }
        self.state
            .lock()
            .klines
            .insert((symbol.to_string(), interval.to_string()), candles);
    }

    /// Queue a failure for an upcoming `place_order` call.
    pub fn inject_place_fault(&self, fault: Fault) {
        self.state.lock().place_faults.push_back(fault);
    }

    /// Queue a failure for an upcoming `set_stop` call.
    pub fn inject_stop_fault(&self, fault: Fault) {
        self.state.lock().stop_faults.push_back(fault);
    }

    /// Total `place_order` attempts, including faulted ones.
    pub fn place_attempts(&self) -> u32 {
        self.state.lock().place_attempts
    }

    /// Exchange-side status of one order, if it exists.
    pub fn order_status(&self, client_order_id: &str) -> Option<OrderStatus> {
        self.state
            .lock()
            .orders
            .get(client_order_id)
            .map(|o| o.status)
    }

    /// When held, placed orders stay NEW until released — drives the
    /// confirm-timeout and reconciliation paths in tests.
    pub fn set_hold_fills(&self, hold: bool) {
        self.state.lock().hold_fills = hold;
    }

    /// Fill a held order.
    pub fn release_fill(&self, client_order_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.orders.get_mut(client_order_id) {
            Some(order) => {
                order.status = OrderStatus::Filled;
                true
            }
            None => false,
        }
    }

    /// Simulate the exchange filling an armed stop order.
    pub fn trigger_stop(&self, client_order_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.orders.get_mut(client_order_id) {
            Some(order) if order.stop_price.is_some() => {
                order.status = OrderStatus::Filled;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, req: &OrderRequest) -> ApiResult<OrderAck> {
        let mut state = self.state.lock();
        state.place_attempts += 1;

        if let Some(fault) = state.place_faults.pop_front() {
            debug!(client_order_id = %req.client_order_id, ?fault, "paper: injected fault");
            return Err(fault.into_error());
        }

        let fill_price = req
            .price
            .or_else(|| state.last_price.get(&req.symbol).copied())
            .unwrap_or(0.0);

        // Re-placement with a known id is idempotent: same ack again.
        let initial_status = if state.hold_fills {
            OrderStatus::New
        } else {
            OrderStatus::Filled
        };
        let order = state
            .orders
            .entry(req.client_order_id.clone())
            .or_insert(PaperOrder {
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                fill_price,
                status: initial_status,
                stop_price: None,
            })
            .clone();

        debug!(
            client_order_id = %req.client_order_id,
            symbol = %order.symbol,
            qty = order.qty,
            fill_price = order.fill_price,
            "paper: order filled"
        );

        Ok((
            OrderAck {
                exchange_order_id: Some(format!("paper-{}", state.orders.len())),
                status: OrderStatus::New,
                raw: json!({
                    "clientOrderId": req.client_order_id,
                    "symbol": req.symbol,
                    "status": "NEW",
                }),
            },
            ResponseMeta::ok(),
        ))
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> ApiResult<OrderAck> {
        let mut state = self.state.lock();
        match state.orders.get_mut(client_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok((
                    OrderAck {
                        exchange_order_id: None,
                        status: OrderStatus::Canceled,
                        raw: json!({"clientOrderId": client_order_id, "status": "CANCELED"}),
                    },
                    ResponseMeta::ok(),
                ))
            }
            Some(_) => Err(ExchangeError::Terminal {
                code: "-2011".into(),
                message: "order already terminal".into(),
            }),
            None => Err(ExchangeError::Terminal {
                code: "-2013".into(),
                message: "unknown order".into(),
            }),
        }
    }

    async fn get_order(&self, _symbol: &str, client_order_id: &str) -> ApiResult<OrderState> {
        let state = self.state.lock();
        match state.orders.get(client_order_id) {
            Some(order) => Ok((
                OrderState {
                    status: order.status,
                    executed_qty: if order.status == OrderStatus::Filled {
                        order.qty
                    } else {
                        0.0
                    },
                    avg_price: (order.status == OrderStatus::Filled).then_some(order.fill_price),
                    raw: json!({
                        "clientOrderId": client_order_id,
                        "status": order.status.as_str(),
                        "side": order.side.as_str(),
                    }),
                },
                ResponseMeta::ok(),
            )),
            None => Err(ExchangeError::Terminal {
                code: "-2013".into(),
                message: "unknown order".into(),
            }),
        }
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> ApiResult<Vec<Candle>> {
        let state = self.state.lock();
        let all = state
            .klines
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .unwrap_or_default();

        let from = start_ms.unwrap_or(i64::MIN);
        let window: Vec<Candle> = all
            .into_iter()
            .filter(|c| c.open_time_ms >= from)
            .take(limit as usize)
            .collect();

        Ok((window, ResponseMeta::ok()))
    }

    async fn get_account(&self) -> ApiResult<AccountState> {
        let state = self.state.lock();
        Ok((
            AccountState {
                equity: state.equity,
            },
            ResponseMeta::ok(),
        ))
    }

    async fn set_stop(&self, req: &StopRequest) -> ApiResult<OrderAck> {
        let mut state = self.state.lock();

        if let Some(fault) = state.stop_faults.pop_front() {
            debug!(client_order_id = %req.client_order_id, ?fault, "paper: injected stop fault");
            return Err(fault.into_error());
        }

        state.orders.insert(
            req.client_order_id.clone(),
            PaperOrder {
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                fill_price: req.stop_price,
                status: OrderStatus::New,
                stop_price: Some(req.stop_price),
            },
        );

        Ok((
            OrderAck {
                exchange_order_id: Some(format!("paper-stop-{}", state.orders.len())),
                status: OrderStatus::New,
                raw: json!({
                    "clientOrderId": req.client_order_id,
                    "stopPrice": req.stop_price,
                    "status": "NEW",
                }),
            },
            ResponseMeta::ok(),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn request(coid: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: 0.01,
            price: Some(50_000.0),
            client_order_id: coid.into(),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn orders_fill_instantly_and_idempotently() {
        let paper = PaperExchange::new("paper", 500.0);
        let (ack, _) = paper.place_order(&request("c1")).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);

        let (state, _) = paper.get_order("BTCUSDT", "c1").await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.avg_price, Some(50_000.0));

        // Replacing the same id does not create a second order.
        paper.place_order(&request("c1")).await.unwrap();
        assert_eq!(paper.place_attempts(), 2);
        let (state, _) = paper.get_order("BTCUSDT", "c1").await.unwrap();
        assert_eq!(state.executed_qty, 0.01);
    }

    #[tokio::test]
    async fn faults_are_consumed_in_order() {
        let paper = PaperExchange::new("paper", 500.0);
        paper.inject_place_fault(Fault::RateLimited {
            retry_after_secs: Some(2),
        });
        paper.inject_place_fault(Fault::Transient);

        let err = paper.place_order(&request("c2")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited { .. }));
        let err = paper.place_order(&request("c2")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transient { .. }));
        // Script drained: the third attempt succeeds.
        assert!(paper.place_order(&request("c2")).await.is_ok());
        assert_eq!(paper.place_attempts(), 3);
    }

    #[tokio::test]
    async fn stops_arm_and_trigger() {
        let paper = PaperExchange::new("paper", 500.0);
        let stop = StopRequest {
            symbol: "BTCUSDT".into(),
            side: Side::Short,
            qty: 0.01,
            stop_price: 49_000.0,
            client_order_id: "c1-stop".into(),
        };
        let (ack, _) = paper.set_stop(&stop).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(paper.order_status("c1-stop"), Some(OrderStatus::New));

        assert!(paper.trigger_stop("c1-stop"));
        let (state, _) = paper.get_order("BTCUSDT", "c1-stop").await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn klines_respect_start_and_limit() {
        let paper = PaperExchange::new("paper", 500.0);
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 900_000, 1.0, 2.0, 0.5, 1.5, 10.0, (i + 1) * 900_000 - 1))
            .collect();
        paper.seed_klines("BTCUSDT", "15m", candles);

        let (window, _) = paper
            .get_klines("BTCUSDT", "15m", Some(3 * 900_000), 4)
            .await
            .unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].open_time_ms, 3 * 900_000);

        let (account, _) = paper.get_account().await.unwrap();
        assert!((account.equity - 500.0).abs() < f64::EPSILON);
    }
}
