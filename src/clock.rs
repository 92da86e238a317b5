// =============================================================================
// Clock — UTC time source with Hong Kong scheduling helpers
// =============================================================================
//
// All persisted timestamps are UTC milliseconds. Scheduling (tick boundaries,
// daily archival) happens on the Hong Kong wall clock, a fixed UTC+8 offset
// with no DST. Services take the clock as a trait object so tests can drive
// the boundary logic deterministically.
// =============================================================================

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};

/// Hong Kong is UTC+8 with no daylight saving.
pub const HK_OFFSET_SECONDS: i32 = 8 * 3600;

/// Width of the tick firing window at a 15-minute boundary, in seconds.
/// A tick fires at :00 through :03 inclusive; :04 is too late.
pub const TICK_WINDOW_SECONDS: u32 = 3;

/// The fixed Hong Kong offset.
pub fn hk_offset() -> FixedOffset {
    FixedOffset::east_opt(HK_OFFSET_SECONDS).expect("UTC+8 is a valid offset")
}

/// Abstract time source. Production uses [`SystemClock`]; tests inject a
/// manual clock to remove flakiness from boundary assertions.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current UTC time in epoch milliseconds.
    fn now_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }

    /// Current wall-clock time in Hong Kong.
    fn now_hk(&self) -> DateTime<FixedOffset> {
        self.now_utc().with_timezone(&hk_offset())
    }
}

/// Real wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Format a UTC millisecond timestamp for display in Hong Kong time.
pub fn format_hk(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt
            .with_timezone(&hk_offset())
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("invalid-ts({ts_ms})"),
    }
}

/// Format a UTC millisecond timestamp as RFC-3339 UTC.
pub fn format_utc(ts_ms: i64) -> String {
    match Utc.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.to_rfc3339(),
        None => format!("invalid-ts({ts_ms})"),
    }
}

/// Parse a timeframe label ("1m", "5m", "15m", "1h", "4h", "1d") into its
/// bar length in milliseconds. Unknown labels return `None`.
pub fn interval_ms(timeframe: &str) -> Option<i64> {
    let (num, unit) = timeframe.split_at(timeframe.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

/// The open time of the bar containing `ts_ms` for the given bar length.
pub fn bar_open_ms(ts_ms: i64, interval_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(interval_ms)
}

/// True when the Hong Kong wall clock sits inside a 15-minute tick window:
/// `minute % 15 == 0` within the first `TICK_WINDOW_SECONDS` seconds.
pub fn in_tick_window(hk: DateTime<FixedOffset>) -> bool {
    hk.minute() % 15 == 0 && hk.second() <= TICK_WINDOW_SECONDS
}

/// The Hong Kong calendar date as an integer key (e.g. 20260801), used to
/// run the daily archival exactly once per HK day.
pub fn hk_date_key(hk: DateTime<FixedOffset>) -> i64 {
    hk.year() as i64 * 10_000 + hk.month() as i64 * 100 + hk.day() as i64
}

/// UTC epoch milliseconds of the current HK day's midnight (daily PnL and
/// drawdown accumulate from here).
pub fn hk_day_start_ms(hk: DateTime<FixedOffset>) -> i64 {
    let midnight = hk
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time");
    match hk_offset().from_local_datetime(&midnight).single() {
        Some(dt) => dt.timestamp_millis(),
        None => hk.timestamp_millis(),
    }
}

// =============================================================================
// Test clock
// =============================================================================

/// Manually advanced clock for tests.
#[cfg(test)]
pub struct ManualClock(pub std::sync::atomic::AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub fn at_ms(ms: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(ms))
    }

    pub fn set_ms(&self, ms: i64) {
        self.0.store(ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.0.fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let ms = self.0.load(std::sync::atomic::Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms)
            .single()
            .expect("manual clock holds a valid timestamp")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Epoch ms for a Hong Kong wall-clock instant.
    fn hk_ms(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        hk_offset()
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(interval_ms("15m"), Some(900_000));
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("1h"), Some(3_600_000));
        assert_eq!(interval_ms("1d"), Some(86_400_000));
        assert_eq!(interval_ms("15x"), None);
        assert_eq!(interval_ms(""), None);
        assert_eq!(interval_ms("m"), None);
    }

    #[test]
    fn bar_open_alignment() {
        let iv = interval_ms("15m").unwrap();
        let ts = hk_ms(2026, 3, 5, 15, 7, 30);
        let open = bar_open_ms(ts, iv);
        assert_eq!(open % iv, 0);
        assert!(open <= ts && ts - open < iv);
    }

    #[test]
    fn tick_window_boundaries() {
        // Exactly 15:00:00 HK fires.
        let clock = ManualClock::at_ms(hk_ms(2026, 3, 5, 15, 0, 0));
        assert!(in_tick_window(clock.now_hk()));

        // 15:00:03 still fires.
        clock.set_ms(hk_ms(2026, 3, 5, 15, 0, 3));
        assert!(in_tick_window(clock.now_hk()));

        // 15:00:04 does not.
        clock.set_ms(hk_ms(2026, 3, 5, 15, 0, 4));
        assert!(!in_tick_window(clock.now_hk()));

        // Non-boundary minute never fires.
        clock.set_ms(hk_ms(2026, 3, 5, 15, 7, 0));
        assert!(!in_tick_window(clock.now_hk()));

        // :45 is a boundary.
        clock.set_ms(hk_ms(2026, 3, 5, 15, 45, 1));
        assert!(in_tick_window(clock.now_hk()));
    }

    #[test]
    fn hk_date_rolls_at_hk_midnight() {
        // 23:59 HK and 00:01 HK the next day straddle UTC 16:00.
        let before = ManualClock::at_ms(hk_ms(2026, 3, 5, 23, 59, 0));
        let after = ManualClock::at_ms(hk_ms(2026, 3, 6, 0, 1, 0));
        assert_eq!(hk_date_key(before.now_hk()), 20260305);
        assert_eq!(hk_date_key(after.now_hk()), 20260306);
    }

    #[test]
    fn hk_day_start_is_hk_midnight() {
        let afternoon = ManualClock::at_ms(hk_ms(2026, 3, 5, 15, 30, 0));
        let start = hk_day_start_ms(afternoon.now_hk());
        assert_eq!(start, hk_ms(2026, 3, 5, 0, 0, 0));
    }

    #[test]
    fn format_hk_is_utc_plus_8() {
        let ts = hk_ms(2026, 3, 5, 8, 0, 0); // 08:00 HK == 00:00 UTC
        assert_eq!(format_hk(ts), "2026-03-05 08:00:00");
        assert!(format_utc(ts).starts_with("2026-03-05T00:00:00"));
    }
}
