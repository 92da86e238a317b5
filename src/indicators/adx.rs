// =============================================================================
// Directional Movement Index (ADX, +DI, -DI)
// =============================================================================
//
// ADX quantifies trend strength regardless of direction; the signed
// components +DI / -DI carry the direction itself. The entry template needs
// all three, so the calculation returns them together.
//
// Pipeline:
//   1. Per bar: +DM, -DM (directional movement) and True Range.
//   2. Wilder's smoothing of +DM, -DM, TR over `period`.
//   3. +DI = smoothed(+DM)/smoothed(TR)*100, -DI likewise.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder's smoothed average of DX over `period`.
// =============================================================================

use crate::types::Candle;

/// ADX together with its directional components, for the most recent bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalIndex {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Compute ADX/+DI/-DI for the last bar of `candles`.
///
/// Returns `None` when `period` is zero, when fewer than `2*period + 1`
/// candles are available (`period` bars seed the smoothing and another
/// `period` DX values seed the ADX average), or when any intermediate value
/// goes non-finite.
pub fn calculate_dmi(candles: &[Candle], period: usize) -> Option<DirectionalIndex> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = candles.len() - 1;

    // Raw +DM / -DM / TR per bar-to-bar transition.
    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for pair in candles.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);

        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());

        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    // Wilder's smoothing, seeded with the plain sum of the first window.
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(directional_values(smooth_plus, smooth_minus, smooth_tr)?.0);

    let mut last_di = directional_values(smooth_plus, smooth_minus, smooth_tr)?;

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];

        last_di = directional_values(smooth_plus, smooth_minus, smooth_tr)?;
        dx_values.push(last_di.0);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: SMA seed over the first `period` DX values, then Wilder smoothing.
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    if !adx.is_finite() {
        return None;
    }

    let (_, plus_di, minus_di) = last_di;
    Some(DirectionalIndex {
        adx,
        plus_di,
        minus_di,
    })
}

/// DX, +DI, -DI from the smoothed components. `None` when the TR window is
/// zero or a result goes non-finite.
fn directional_values(
    smooth_plus: f64,
    smooth_minus: f64,
    smooth_tr: f64,
) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;

    let di_sum = plus_di + minus_di;
    let dx = if di_sum == 0.0 {
        // No directional movement at all.
        0.0
    } else {
        (plus_di - minus_di).abs() / di_sum * 100.0
    };

    if dx.is_finite() && plus_di.is_finite() && minus_di.is_finite() {
        Some((dx, plus_di, minus_di))
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(0, open, high, low, close, 1.0, 0)
    }

    #[test]
    fn dmi_period_zero() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 50];
        assert!(calculate_dmi(&candles, 0).is_none());
    }

    #[test]
    fn dmi_insufficient_data() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 10];
        assert!(calculate_dmi(&candles, 14).is_none());
    }

    #[test]
    fn strong_uptrend_has_high_adx_and_positive_di_dominance() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();

        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.adx > 25.0, "expected trending ADX, got {}", dmi.adx);
        assert!(
            dmi.plus_di > dmi.minus_di,
            "+DI {} should dominate -DI {} in an uptrend",
            dmi.plus_di,
            dmi.minus_di
        );
    }

    #[test]
    fn strong_downtrend_has_negative_di_dominance() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                candle(base, base + 0.5, base - 1.5, base - 1.0)
            })
            .collect();

        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.minus_di > dmi.plus_di);
        assert!(dmi.adx > 25.0);
    }

    #[test]
    fn flat_market_adx_near_zero() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 60];
        let dmi = calculate_dmi(&candles, 14).unwrap();
        assert!(dmi.adx < 1.0, "flat market ADX should be ~0, got {}", dmi.adx);
    }

    #[test]
    fn values_stay_in_range() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(dmi) = calculate_dmi(&candles, 14) {
            assert!((0.0..=100.0).contains(&dmi.adx));
            assert!(dmi.plus_di >= 0.0 && dmi.minus_di >= 0.0);
        }
    }

    #[test]
    fn minimum_candle_count_exact() {
        let period = 5;
        let min = 2 * period + 1;
        let candles: Vec<Candle> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(calculate_dmi(&candles, period).is_some());
        assert!(calculate_dmi(&candles[..min - 1], period).is_none());
    }
}
