// =============================================================================
// Binance USDT-M Futures REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the exchange.
//
// This client is a single-attempt transport: it classifies failures into the
// gateway's taxonomy and surfaces rate-limit headers, nothing more.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{
    AccountState, ApiResult, Exchange, ExchangeError, OrderAck, OrderRequest, OrderState,
    OrderStatus, ResponseMeta, StopRequest,
};
use crate::types::{Candle, Side};

type HmacSha256 = Hmac<Sha256>;

/// recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance futures REST client.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    name: String,
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name: name.into(),
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow, and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// One HTTP attempt; classifies the outcome and extracts rate-limit
    /// headers from both success and failure responses.
    async fn send(&self, method: Method, path: &str, query: &str) -> ApiResult<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .client
            .request(method, &url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status();
        let meta = meta_from_headers(status, resp.headers());

        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        if status.is_success() {
            return Ok((body, meta));
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            warn!(path, status = status.as_u16(), "exchange rate limited");
            return Err(ExchangeError::RateLimited {
                status: status.as_u16(),
                retry_after_secs: meta.retry_after_secs,
            });
        }

        if status.is_server_error() {
            return Err(ExchangeError::Transient {
                message: format!("{path} returned {status}: {body}"),
            });
        }

        let code = body
            .get("code")
            .map(|c| c.to_string())
            .unwrap_or_else(|| status.as_u16().to_string());
        let message = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("no message")
            .to_string();
        Err(ExchangeError::Terminal { code, message })
    }

    fn ack_from_body(body: serde_json::Value) -> OrderAck {
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .and_then(OrderStatus::parse)
            .unwrap_or(OrderStatus::New);
        OrderAck {
            exchange_order_id: body.get("orderId").map(|v| v.to_string()),
            status,
            raw: body,
        }
    }

    /// Parse a JSON value that may be either a string or a number into f64.
    fn json_f64(val: &serde_json::Value) -> Option<f64> {
        val.as_f64().or_else(|| val.as_str()?.parse().ok())
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_order(&self, req: &OrderRequest) -> ApiResult<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&quantity={}&newClientOrderId={}",
            req.symbol,
            order_side(req.side),
            req.qty,
            req.client_order_id
        );
        match req.price {
            Some(price) => params.push_str(&format!("&type=LIMIT&price={price}&timeInForce=GTC")),
            None => params.push_str("&type=MARKET"),
        }
        if req.reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(symbol = %req.symbol, side = %req.side, qty = req.qty, "placing order");

        let (body, meta) = self
            .send(Method::POST, "/fapi/v1/order", &self.signed_query(&params))
            .await?;
        Ok((Self::ack_from_body(body), meta))
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ApiResult<OrderAck> {
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        let (body, meta) = self
            .send(Method::DELETE, "/fapi/v1/order", &self.signed_query(&params))
            .await?;
        Ok((Self::ack_from_body(body), meta))
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ApiResult<OrderState> {
        let params = format!("symbol={symbol}&origClientOrderId={client_order_id}");
        let (body, meta) = self
            .send(Method::GET, "/fapi/v1/order", &self.signed_query(&params))
            .await?;

        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .and_then(OrderStatus::parse)
            .unwrap_or(OrderStatus::New);
        let executed_qty = body
            .get("executedQty")
            .and_then(Self::json_f64)
            .unwrap_or(0.0);
        let avg_price = body
            .get("avgPrice")
            .and_then(Self::json_f64)
            .filter(|p| *p > 0.0);

        Ok((
            OrderState {
                status,
                executed_qty,
                avg_price,
                raw: body,
            },
            meta,
        ))
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> ApiResult<Vec<Candle>> {
        let mut params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(start) = start_ms {
            params.push_str(&format!("&startTime={start}"));
        }

        let (body, meta) = self.send(Method::GET, "/fapi/v1/klines", &params).await?;

        let raw = body.as_array().ok_or_else(|| ExchangeError::Terminal {
            code: "KLINES_SHAPE".into(),
            message: "klines response is not an array".into(),
        })?;

        // Array layout: [0] openTime, [1] open, [2] high, [3] low, [4] close,
        // [5] volume, [6] closeTime, ...
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 7 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let parse = |i: usize| Self::json_f64(&arr[i]).unwrap_or(0.0);
            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                parse(1),
                parse(2),
                parse(3),
                parse(4),
                parse(5),
                arr[6].as_i64().unwrap_or(0),
            ));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok((candles, meta))
    }

    async fn get_account(&self) -> ApiResult<AccountState> {
        let (body, meta) = self
            .send(Method::GET, "/fapi/v2/account", &self.signed_query(""))
            .await?;

        let equity = body
            .get("totalWalletBalance")
            .and_then(Self::json_f64)
            .ok_or_else(|| ExchangeError::Terminal {
                code: "ACCOUNT_SHAPE".into(),
                message: "account response missing totalWalletBalance".into(),
            })?;

        Ok((AccountState { equity }, meta))
    }

    async fn set_stop(&self, req: &StopRequest) -> ApiResult<OrderAck> {
        let params = format!(
            "symbol={}&side={}&type=STOP_MARKET&stopPrice={}&quantity={}\
             &reduceOnly=true&newClientOrderId={}",
            req.symbol,
            order_side(req.side),
            req.stop_price,
            req.qty,
            req.client_order_id
        );
        let (body, meta) = self
            .send(Method::POST, "/fapi/v1/order", &self.signed_query(&params))
            .await?;
        Ok((Self::ack_from_body(body), meta))
    }
}

fn order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ExchangeError::Transient {
            message: err.to_string(),
        }
    } else {
        ExchangeError::Terminal {
            code: "HTTP_CLIENT".into(),
            message: err.to_string(),
        }
    }
}

fn meta_from_headers(status: StatusCode, headers: &HeaderMap) -> ResponseMeta {
    let header_u64 = |name: &str| -> Option<u64> {
        headers
            .get(name)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
    };

    ResponseMeta {
        status: status.as_u16(),
        used_weight: header_u64("X-MBX-USED-WEIGHT-1M").map(|w| w as u32),
        order_count: header_u64("X-MBX-ORDER-COUNT-1M")
            .or_else(|| header_u64("X-MBX-ORDER-COUNT-10S"))
            .map(|c| c as u32),
        retry_after_secs: header_u64("Retry-After"),
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
