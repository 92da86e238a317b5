// =============================================================================
// Feature computation — the versioned indicator set cached per closed bar
// =============================================================================
//
// One `FeatureSet` is computed for every closed candle and persisted to
// `market_data_cache` keyed by (symbol, interval, open_time_ms,
// feature_version). The JSON layout of this struct IS the feature-version
// contract: any change to fields or semantics requires bumping
// FEATURE_VERSION so old and new rows coexist.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::adx::calculate_dmi;
use crate::indicators::ema::latest_ema;
use crate::indicators::keltner::squeeze_on;
use crate::indicators::rsi::rsi_with_slope;
use crate::types::Candle;

pub const ADX_PERIOD: usize = 14;
pub const EMA_FAST: usize = 21;
pub const EMA_SLOW: usize = 55;
pub const SQUEEZE_PERIOD: usize = 20;
pub const MOMENTUM_PERIOD: usize = 20;
pub const VOL_PERIOD: usize = 20;
pub const RSI_PERIOD: usize = 14;
/// Rolling window for the best-effort BTC correlation.
pub const CORRELATION_BARS: usize = 96;

/// Minimum closed bars required before a full feature set exists.
/// EMA-55 is the longest look-back; one extra bar feeds the RSI slope.
pub const MIN_BARS: usize = EMA_SLOW + 2;

/// The full indicator set for one closed bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub close: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub ema21: f64,
    pub ema55: f64,
    pub squeeze_on: bool,
    pub momentum: f64,
    pub vol_ratio: f64,
    pub rsi: f64,
    pub rsi_slope: f64,
    /// Rolling correlation of close returns against BTCUSDT; absent when the
    /// reference series is unavailable or too short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btc_corr: Option<f64>,
}

/// Compute the feature set for the newest bar of `candles` (oldest first).
///
/// `btc_closes` is the reference close series for the correlation feature;
/// it is best-effort and may be absent or shorter than the window.
///
/// Returns `None` until enough closed bars exist for every indicator.
pub fn compute_features(candles: &[Candle], btc_closes: Option<&[f64]>) -> Option<FeatureSet> {
    if candles.len() < MIN_BARS {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let close = *closes.last()?;

    let dmi = calculate_dmi(candles, ADX_PERIOD)?;
    let ema21 = latest_ema(&closes, EMA_FAST)?;
    let ema55 = latest_ema(&closes, EMA_SLOW)?;
    let squeeze = squeeze_on(candles, SQUEEZE_PERIOD)?;
    let momentum = momentum_vs_mean(&closes, MOMENTUM_PERIOD)?;
    let vol_ratio = volume_ratio(&volumes, VOL_PERIOD)?;
    let (rsi, rsi_slope) = rsi_with_slope(&closes, RSI_PERIOD)?;

    let btc_corr = btc_closes.and_then(|btc| rolling_correlation(&closes, btc, CORRELATION_BARS));

    Some(FeatureSet {
        close,
        adx: dmi.adx,
        plus_di: dmi.plus_di,
        minus_di: dmi.minus_di,
        ema21,
        ema55,
        squeeze_on: squeeze,
        momentum,
        vol_ratio,
        rsi,
        rsi_slope,
        btc_corr,
    })
}

/// Momentum: distance of the last close from its `period`-bar mean. The
/// entry template looks for this crossing from ≤ 0 to > 0.
fn momentum_vs_mean(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let m = closes.last()? - mean;
    m.is_finite().then_some(m)
}

/// Last bar's volume relative to its `period`-bar average.
fn volume_ratio(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period {
        return None;
    }
    let window = &volumes[volumes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    let r = volumes.last()? / mean;
    r.is_finite().then_some(r)
}

/// Pearson correlation of bar-over-bar returns between two close series over
/// the trailing `bars` window. Series are aligned from the end; `None` when
/// either side has fewer than a quarter of the window.
fn rolling_correlation(a: &[f64], b: &[f64], bars: usize) -> Option<f64> {
    let n = bars.min(a.len().saturating_sub(1)).min(b.len().saturating_sub(1));
    if n < bars / 4 {
        return None;
    }

    let returns = |xs: &[f64]| -> Vec<f64> {
        xs[xs.len() - n - 1..]
            .windows(2)
            .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
            .collect()
    };

    let ra = returns(a);
    let rb = returns(b);

    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    let (ma, mb) = (mean(&ra), mean(&rb));

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in ra.iter().zip(rb.iter()) {
        cov += (x - ma) * (y - mb);
        var_a += (x - ma).powi(2);
        var_b += (y - mb).powi(2);
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let corr = cov / (var_a.sqrt() * var_b.sqrt());
    corr.is_finite().then_some(corr)
}
