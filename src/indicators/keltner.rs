// =============================================================================
// Keltner Channel and squeeze detection
// =============================================================================
//
// Keltner channel: EMA(period) of closes ± mult · ATR(period).
//
// The market is "in a squeeze" when both Bollinger bands sit inside the
// Keltner channel — volatility compressed below its typical range. The entry
// template fires on the bar where the squeeze releases (on → off).
// =============================================================================

use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::ema::latest_ema;
use crate::types::Candle;

/// Keltner channel values for the most recent bar.
#[derive(Debug, Clone, Copy)]
pub struct KeltnerChannel {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate the Keltner channel over the trailing `period` bars.
pub fn calculate_keltner(candles: &[Candle], period: usize, mult: f64) -> Option<KeltnerChannel> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let middle = latest_ema(&closes, period)?;
    let atr = calculate_atr(candles, period)?;

    let channel = KeltnerChannel {
        upper: middle + mult * atr,
        middle,
        lower: middle - mult * atr,
    };

    (channel.upper.is_finite() && channel.lower.is_finite()).then_some(channel)
}

/// Whether the most recent bar is inside a volatility squeeze: Bollinger
/// bands (period, 2σ) fully inside the Keltner channel (period, 1.5·ATR).
///
/// `None` when either channel cannot be computed yet.
pub fn squeeze_on(candles: &[Candle], period: usize) -> Option<bool> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let bb = calculate_bollinger(&closes, period, 2.0)?;
    let kc = calculate_keltner(candles, period, 1.5)?;
    Some(bb.upper < kc.upper && bb.lower > kc.lower)
}
