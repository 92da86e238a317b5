// =============================================================================
// Order stream persistence — events, trade logs, position snapshots
// =============================================================================
//
// `order_events` is append-only and immutable. Idempotency rests on the
// UNIQUE(exchange, symbol, client_order_id, event_type) key: re-appending the
// same lifecycle event is a silent no-op and the caller learns whether the
// row was new. Lifecycle ordering is additionally enforced here: a SUBMITTED
// append requires a prior CREATED, and a PARTIAL/FILLED append requires a
// prior SUBMITTED for the same order.
// =============================================================================

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::Database;
use crate::clock::format_hk;
use crate::types::{OrderEventType, Side, TradeStatus};

/// One row destined for the order-event stream.
#[derive(Debug, Clone)]
pub struct OrderEventRecord {
    pub trace_id: String,
    pub service: String,
    pub exchange: String,
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub event_type: OrderEventType,
    pub side: Side,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: String,
    pub reason_code: String,
    pub reason: String,
    pub action: String,
    pub actor: String,
    pub event_ts_utc: i64,
    /// Scrubbed exchange payload; scrub before constructing the record.
    pub raw_payload_json: Option<String>,
}

impl OrderEventRecord {
    /// Minimal record; callers fill the optional fields they have.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: &str,
        service: &str,
        exchange: &str,
        symbol: &str,
        client_order_id: &str,
        event_type: OrderEventType,
        side: Side,
        qty: f64,
        reason_code: &str,
        reason: &str,
        event_ts_utc: i64,
    ) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            service: service.to_string(),
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            client_order_id: client_order_id.to_string(),
            exchange_order_id: None,
            event_type,
            side,
            qty,
            price: None,
            status: event_type.as_str().to_string(),
            reason_code: reason_code.to_string(),
            reason: reason.to_string(),
            action: "OPEN".to_string(),
            actor: "engine".to_string(),
            event_ts_utc,
            raw_payload_json: None,
        }
    }
}

/// Slim view of an order event used by reconciliation and health queries.
#[derive(Debug, Clone)]
pub struct OrderEventView {
    pub trace_id: String,
    pub service: String,
    pub exchange: String,
    pub symbol: String,
    pub client_order_id: String,
    pub event_type: String,
    pub side: String,
    pub qty: f64,
    pub reason_code: String,
    pub reason: String,
    pub event_ts_utc: i64,
}

/// Arguments for opening a trade-log row.
#[derive(Debug, Clone)]
pub struct TradeOpen {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub stop_price: f64,
    pub stop_dist_pct: f64,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub robot_score: Option<f64>,
    pub ai_prob: Option<f64>,
    pub open_reason_code: String,
    pub open_reason: String,
    pub entry_time_ms: i64,
}

/// An open (or closed) trade-log row.
#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub stop_price: f64,
    pub stop_dist_pct: f64,
    pub client_order_id: String,
    pub ai_prob: Option<f64>,
    pub entry_time_ms: i64,
    pub status: TradeStatus,
}

impl Database {
    // -------------------------------------------------------------------------
    // Order events
    // -------------------------------------------------------------------------

    /// Append one event to the stream. Returns `true` when the row was newly
    /// inserted, `false` when the idempotency key already existed.
    pub async fn append_order_event(&self, record: &OrderEventRecord) -> Result<bool> {
        let record = record.clone();
        self.with_conn(move |conn| {
            enforce_lifecycle_order(conn, &record)?;

            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO order_events (
                        trace_id, service, exchange, symbol, client_order_id,
                        exchange_order_id, event_type, side, qty, price, status,
                        reason_code, reason, action, actor,
                        event_ts_utc, event_ts_hk, raw_payload_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                              ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                    params![
                        record.trace_id,
                        record.service,
                        record.exchange,
                        record.symbol,
                        record.client_order_id,
                        record.exchange_order_id,
                        record.event_type.as_str(),
                        record.side.as_str(),
                        record.qty,
                        record.price,
                        record.status,
                        record.reason_code,
                        record.reason,
                        record.action,
                        record.actor,
                        record.event_ts_utc,
                        format_hk(record.event_ts_utc),
                        record.raw_payload_json,
                    ],
                )
                .context("failed to append order event")?;

            Ok(inserted > 0)
        })
        .await
    }

    /// Whether the stream holds an event of `event_type` for this order.
    pub async fn has_order_event(
        &self,
        exchange: &str,
        symbol: &str,
        client_order_id: &str,
        event_type: OrderEventType,
    ) -> Result<bool> {
        let (exchange, symbol, client_order_id) = (
            exchange.to_string(),
            symbol.to_string(),
            client_order_id.to_string(),
        );
        self.with_conn(move |conn| {
            has_event(conn, &exchange, &symbol, &client_order_id, event_type)
        })
        .await
    }

    /// Reason code recorded on one event, if the row exists.
    pub async fn order_event_reason(
        &self,
        exchange: &str,
        symbol: &str,
        client_order_id: &str,
        event_type: OrderEventType,
    ) -> Result<Option<String>> {
        let (exchange, symbol, client_order_id) = (
            exchange.to_string(),
            symbol.to_string(),
            client_order_id.to_string(),
        );
        self.with_conn(move |conn| {
            let code = conn
                .query_row(
                    "SELECT reason_code FROM order_events
                     WHERE exchange = ?1 AND symbol = ?2
                       AND client_order_id = ?3 AND event_type = ?4",
                    params![exchange, symbol, client_order_id, event_type.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(code)
        })
        .await
    }

    /// Whether any entry attempt (CREATED event) exists for a bar, matching
    /// `client_order_id LIKE pattern`. Drives restart duplicate suppression.
    pub async fn bar_already_attempted(&self, exchange: &str, pattern: &str) -> Result<bool> {
        let (exchange, pattern) = (exchange.to_string(), pattern.to_string());
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM order_events
                    WHERE exchange = ?1 AND event_type = 'CREATED'
                      AND client_order_id LIKE ?2
                )",
                params![exchange, pattern],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    /// Orders with a SUBMITTED event but no terminal event yet — the input
    /// to the next tick's reconciliation pass.
    pub async fn unconfirmed_submissions(&self, exchange: &str) -> Result<Vec<OrderEventView>> {
        let exchange = exchange.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT trace_id, service, exchange, symbol, client_order_id,
                        event_type, side, qty, reason_code, reason, event_ts_utc
                 FROM order_events s
                 WHERE s.exchange = ?1 AND s.event_type = 'SUBMITTED'
                   AND NOT EXISTS (
                       SELECT 1 FROM order_events t
                       WHERE t.exchange = s.exchange AND t.symbol = s.symbol
                         AND t.client_order_id = s.client_order_id
                         AND t.event_type IN
                             ('FILLED','CANCELED','REJECTED','RECONCILED')
                   )
                 ORDER BY s.event_ts_utc",
            )?;
            let rows = stmt
                .query_map(params![exchange], map_event_view)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// The most recent ERROR events, newest first (health surface).
    pub async fn recent_errors(&self, limit: u32) -> Result<Vec<OrderEventView>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT trace_id, service, exchange, symbol, client_order_id,
                        event_type, side, qty, reason_code, reason, event_ts_utc
                 FROM order_events
                 WHERE event_type = 'ERROR'
                 ORDER BY event_ts_utc DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], map_event_view)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Count of events per type for one order, in lifecycle assertions.
    #[cfg(test)]
    pub async fn count_events(&self, client_order_id: &str) -> Result<i64> {
        let client_order_id = client_order_id.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM order_events WHERE client_order_id = ?1",
                params![client_order_id],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Trade logs
    // -------------------------------------------------------------------------

    /// Open a trade-log row. The client order id is unique per position.
    pub async fn insert_trade_open(&self, trade: &TradeOpen) -> Result<i64> {
        let trade = trade.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trade_logs (
                    symbol, side, qty, leverage, entry_price, stop_price,
                    stop_dist_pct, client_order_id, exchange_order_id,
                    robot_score, ai_prob, open_reason_code, open_reason,
                    entry_time_ms, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                          ?13, ?14, 'OPEN')",
                params![
                    trade.symbol,
                    trade.side.as_str(),
                    trade.qty,
                    trade.leverage,
                    trade.entry_price,
                    trade.stop_price,
                    trade.stop_dist_pct,
                    trade.client_order_id,
                    trade.exchange_order_id,
                    trade.robot_score,
                    trade.ai_prob,
                    trade.open_reason_code,
                    trade.open_reason,
                    trade.entry_time_ms,
                ],
            )
            .context("failed to insert trade log")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Close a trade-log row. Returns `false` when the row was not OPEN.
    pub async fn close_trade(
        &self,
        client_order_id: &str,
        exit_price: f64,
        pnl: f64,
        close_reason_code: &str,
        close_reason: &str,
        exit_time_ms: i64,
    ) -> Result<bool> {
        let (client_order_id, close_reason_code, close_reason) = (
            client_order_id.to_string(),
            close_reason_code.to_string(),
            close_reason.to_string(),
        );
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE trade_logs
                 SET exit_price = ?2, pnl = ?3, close_reason_code = ?4,
                     close_reason = ?5, exit_time_ms = ?6, status = 'CLOSED'
                 WHERE client_order_id = ?1 AND status = 'OPEN'",
                params![
                    client_order_id,
                    exit_price,
                    pnl,
                    close_reason_code,
                    close_reason,
                    exit_time_ms
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// All OPEN trades.
    pub async fn open_trades(&self) -> Result<Vec<TradeRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{TRADE_SELECT} WHERE status = 'OPEN' ORDER BY entry_time_ms"
            ))?;
            let rows = stmt
                .query_map([], map_trade_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// The OPEN trade for `symbol`, if any (one open position per symbol).
    pub async fn open_trade_for_symbol(&self, symbol: &str) -> Result<Option<TradeRow>> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "{TRADE_SELECT} WHERE symbol = ?1 AND status = 'OPEN'
                         ORDER BY entry_time_ms DESC LIMIT 1"
                    ),
                    params![symbol],
                    map_trade_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Realized PnL summed over trades closed at or after `since_ms`.
    pub async fn realized_pnl_since(&self, since_ms: i64) -> Result<f64> {
        self.with_conn(move |conn| {
            let pnl: f64 = conn.query_row(
                "SELECT COALESCE(SUM(pnl), 0.0) FROM trade_logs
                 WHERE status = 'CLOSED' AND exit_time_ms >= ?1",
                params![since_ms],
                |row| row.get(0),
            )?;
            Ok(pnl)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Position snapshots
    // -------------------------------------------------------------------------

    pub async fn insert_position_snapshot(
        &self,
        symbol: &str,
        base_qty: f64,
        avg_entry_price: f64,
        meta_json: &str,
        created_at_ms: i64,
    ) -> Result<i64> {
        let (symbol, meta_json) = (symbol.to_string(), meta_json.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO position_snapshots
                     (symbol, base_qty, avg_entry_price, meta_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![symbol, base_qty, avg_entry_price, meta_json, created_at_ms],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    #[cfg(test)]
    pub async fn snapshot_count(&self, symbol: &str) -> Result<i64> {
        let symbol = symbol.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM position_snapshots WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )?;
            Ok(n)
        })
        .await
    }
}

const TRADE_SELECT: &str = "SELECT id, symbol, side, qty, leverage, entry_price,
        stop_price, stop_dist_pct, client_order_id, ai_prob, entry_time_ms, status
 FROM trade_logs";

fn map_trade_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    let side_str: String = row.get(2)?;
    let status_str: String = row.get(11)?;
    Ok(TradeRow {
        id: row.get(0)?,
        symbol: row.get(1)?,
        side: Side::parse(&side_str).unwrap_or(Side::Long),
        qty: row.get(3)?,
        leverage: row.get(4)?,
        entry_price: row.get(5)?,
        stop_price: row.get(6)?,
        stop_dist_pct: row.get(7)?,
        client_order_id: row.get(8)?,
        ai_prob: row.get(9)?,
        entry_time_ms: row.get(10)?,
        status: if status_str == "CLOSED" {
            TradeStatus::Closed
        } else {
            TradeStatus::Open
        },
    })
}

fn map_event_view(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderEventView> {
    Ok(OrderEventView {
        trace_id: row.get(0)?,
        service: row.get(1)?,
        exchange: row.get(2)?,
        symbol: row.get(3)?,
        client_order_id: row.get(4)?,
        event_type: row.get(5)?,
        side: row.get(6)?,
        qty: row.get(7)?,
        reason_code: row.get(8)?,
        reason: row.get(9)?,
        event_ts_utc: row.get(10)?,
    })
}

fn has_event(
    conn: &Connection,
    exchange: &str,
    symbol: &str,
    client_order_id: &str,
    event_type: OrderEventType,
) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM order_events
            WHERE exchange = ?1 AND symbol = ?2
              AND client_order_id = ?3 AND event_type = ?4
        )",
        params![exchange, symbol, client_order_id, event_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Lifecycle ordering guards: SUBMITTED requires CREATED, and PARTIAL/FILLED
/// require SUBMITTED, for the same (exchange, symbol, client_order_id).
fn enforce_lifecycle_order(conn: &Connection, record: &OrderEventRecord) -> Result<()> {
    let required = match record.event_type {
        OrderEventType::Submitted => Some(OrderEventType::Created),
        OrderEventType::Partial | OrderEventType::Filled => Some(OrderEventType::Submitted),
        _ => None,
    };

    if let Some(prior) = required {
        if !has_event(
            conn,
            &record.exchange,
            &record.symbol,
            &record.client_order_id,
            prior,
        )? {
            bail!(
                "order event {} for {} requires a prior {} event",
                record.event_type,
                record.client_order_id,
                prior
            );
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::reason;

    fn record(coid: &str, event_type: OrderEventType) -> OrderEventRecord {
        OrderEventRecord::new(
            "trace-1",
            "strategy-engine",
            "binance-futures",
            "BTCUSDT",
            coid,
            event_type,
            Side::Long,
            0.01,
            reason::SETUP_B_SQUEEZE_RELEASE,
            "squeeze released with momentum cross",
            1_750_000_000_000,
        )
    }

    #[tokio::test]
    async fn append_is_idempotent_per_event_type() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.append_order_event(&record("c1", OrderEventType::Created)).await.unwrap());
        // Same event type again: silently ignored.
        assert!(!db.append_order_event(&record("c1", OrderEventType::Created)).await.unwrap());
        assert_eq!(db.count_events("c1").await.unwrap(), 1);
        // A different event type for the same order is a new row.
        assert!(db.append_order_event(&record("c1", OrderEventType::Submitted)).await.unwrap());
        assert_eq!(db.count_events("c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn order_events_reject_update_and_delete() {
        let db = Database::open_in_memory().unwrap();
        db.append_order_event(&record("immutable", OrderEventType::Created)).await.unwrap();

        let update = db
            .with_conn(|conn| {
                conn.execute("UPDATE order_events SET reason = 'tampered'", [])?;
                Ok(())
            })
            .await;
        assert!(update.unwrap_err().to_string().contains("append-only"));

        let delete = db
            .with_conn(|conn| {
                conn.execute("DELETE FROM order_events", [])?;
                Ok(())
            })
            .await;
        assert!(delete.unwrap_err().to_string().contains("append-only"));

        assert_eq!(db.count_events("immutable").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn submitted_requires_created() {
        let db = Database::open_in_memory().unwrap();
        let err = db
            .append_order_event(&record("orphan", OrderEventType::Submitted))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CREATED"));
    }

    #[tokio::test]
    async fn fill_requires_submission() {
        let db = Database::open_in_memory().unwrap();
        db.append_order_event(&record("c2", OrderEventType::Created)).await.unwrap();
        let err = db
            .append_order_event(&record("c2", OrderEventType::Filled))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SUBMITTED"));

        db.append_order_event(&record("c2", OrderEventType::Submitted)).await.unwrap();
        assert!(db.append_order_event(&record("c2", OrderEventType::Filled)).await.unwrap());
    }

    #[tokio::test]
    async fn bar_attempt_pattern_detects_prior_attempts() {
        let db = Database::open_in_memory().unwrap();
        let coid = "asv8-BTCUSDT-LONG-15m-900000-abcd1234";
        db.append_order_event(&record(coid, OrderEventType::Created)).await.unwrap();

        let pattern = crate::ids::bar_attempt_pattern("BTCUSDT", "15m", 900_000);
        assert!(db.bar_already_attempted("binance-futures", &pattern).await.unwrap());

        let other_bar = crate::ids::bar_attempt_pattern("BTCUSDT", "15m", 1_800_000);
        assert!(!db.bar_already_attempted("binance-futures", &other_bar).await.unwrap());
    }

    #[tokio::test]
    async fn unconfirmed_submissions_exclude_terminal_orders() {
        let db = Database::open_in_memory().unwrap();
        for coid in ["a", "b"] {
            db.append_order_event(&record(coid, OrderEventType::Created)).await.unwrap();
            db.append_order_event(&record(coid, OrderEventType::Submitted)).await.unwrap();
        }
        db.append_order_event(&record("a", OrderEventType::Filled)).await.unwrap();

        let pending = db.unconfirmed_submissions("binance-futures").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_order_id, "b");
    }

    #[tokio::test]
    async fn recent_errors_limited_and_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..15 {
            let mut r = record(&format!("err-{i}"), OrderEventType::Error);
            r.event_ts_utc = 1_000 + i;
            r.reason_code = reason::EXCHANGE_TERMINAL.to_string();
            db.append_order_event(&r).await.unwrap();
        }
        let errors = db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 10);
        assert_eq!(errors[0].client_order_id, "err-14");
    }

    #[tokio::test]
    async fn trade_log_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let open = TradeOpen {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: 0.01,
            leverage: 3,
            entry_price: 50_000.0,
            stop_price: 49_000.0,
            stop_dist_pct: 0.02,
            client_order_id: "c-open".into(),
            exchange_order_id: Some("ex-1".into()),
            robot_score: Some(0.8),
            ai_prob: Some(0.61),
            open_reason_code: reason::SETUP_B_SQUEEZE_RELEASE.into(),
            open_reason: "squeeze released".into(),
            entry_time_ms: 1_750_000_000_000,
        };
        db.insert_trade_open(&open).await.unwrap();

        let fetched = db.open_trade_for_symbol("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(fetched.client_order_id, "c-open");
        assert_eq!(fetched.status, TradeStatus::Open);
        assert_eq!(db.open_trades().await.unwrap().len(), 1);

        assert!(db
            .close_trade("c-open", 51_000.0, 10.0, reason::STOP_LOSS, "stop hit", 1_750_000_900_000)
            .await
            .unwrap());
        assert!(db.open_trade_for_symbol("BTCUSDT").await.unwrap().is_none());
        // Closing twice is a no-op.
        assert!(!db
            .close_trade("c-open", 51_000.0, 10.0, reason::STOP_LOSS, "stop hit", 1_750_000_900_000)
            .await
            .unwrap());

        assert!((db.realized_pnl_since(0).await.unwrap() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn snapshots_accumulate() {
        let db = Database::open_in_memory().unwrap();
        db.insert_position_snapshot("BTCUSDT", 0.01, 50_000.0, r#"{"note":"periodic_snapshot"}"#, 1)
            .await
            .unwrap();
        db.insert_position_snapshot("BTCUSDT", 0.01, 50_000.0, r#"{"note":"fill"}"#, 2)
            .await
            .unwrap();
        assert_eq!(db.snapshot_count("BTCUSDT").await.unwrap(), 2);
    }
}
