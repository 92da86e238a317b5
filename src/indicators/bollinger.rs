// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle ± k·σ. The squeeze
// detector compares these bands against the Keltner channel.

/// Result of a Bollinger Band calculation over the trailing window.
#[derive(Debug, Clone, Copy)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// Calculate Bollinger Bands over the last `period` closes.
///
/// `None` when fewer than `period` closes exist, the middle band is zero, or
/// the result is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let offset = num_std * variance.sqrt();

    let bands = BollingerBands {
        upper: middle + offset,
        middle,
        lower: middle - offset,
    };

    (bands.upper.is_finite() && bands.lower.is_finite()).then_some(bands)
}
