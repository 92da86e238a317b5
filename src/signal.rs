// =============================================================================
// Setup B — squeeze-release long-entry template
// =============================================================================
//
// All conditions are evaluated on the just-closed bar against the previous
// cached bar:
//
//   1. ADX >= ADX_MIN and +DI > -DI         (trend strength and direction)
//   2. Squeeze released this bar            (prev on -> now off)
//   3. Momentum crossed from <= 0 to > 0
//   4. VolRatio >= VOL_RATIO_MIN
//
// The AI score gate sits with the caller: it needs the scorer's cold-start
// state, which is not a property of the bar.
// =============================================================================

use crate::features::FeatureSet;
use crate::types::reason;

/// A passing Setup B evaluation.
#[derive(Debug, Clone)]
pub struct SetupBSignal {
    pub reason_code: &'static str,
    /// Human-readable reason propagated into every downstream artifact.
    pub reason: String,
}

/// Evaluate Setup B for the (prev, now) cached bar pair.
///
/// `Err` carries the first failing check, for decision logging.
pub fn evaluate_setup_b(
    prev: &FeatureSet,
    now: &FeatureSet,
    adx_min: f64,
    vol_ratio_min: f64,
) -> Result<SetupBSignal, String> {
    if now.adx < adx_min {
        return Err(format!("ADX {:.1} below minimum {:.1}", now.adx, adx_min));
    }
    if now.plus_di <= now.minus_di {
        return Err(format!(
            "+DI {:.1} does not dominate -DI {:.1}",
            now.plus_di, now.minus_di
        ));
    }
    if !(prev.squeeze_on && !now.squeeze_on) {
        return Err(format!(
            "no squeeze release (prev {}, now {})",
            prev.squeeze_on, now.squeeze_on
        ));
    }
    if !(prev.momentum <= 0.0 && now.momentum > 0.0) {
        return Err(format!(
            "momentum did not cross zero ({:.4} -> {:.4})",
            prev.momentum, now.momentum
        ));
    }
    if now.vol_ratio < vol_ratio_min {
        return Err(format!(
            "volume ratio {:.2} below minimum {:.2}",
            now.vol_ratio, vol_ratio_min
        ));
    }

    Ok(SetupBSignal {
        reason_code: reason::SETUP_B_SQUEEZE_RELEASE,
        reason: format!(
            "squeeze released with momentum cross: ADX {:.1}, +DI {:.1} > -DI {:.1}, \
             momentum {:.4} -> {:.4}, vol ratio {:.2}",
            now.adx, now.plus_di, now.minus_di, prev.momentum, now.momentum, now.vol_ratio
        ),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// A (prev, now) pair that satisfies every Setup B condition, mirroring
    /// the cold-start scenario bar: ADX 28, +DI 24 > -DI 12, squeeze
    /// released, momentum -0.5 -> +0.3, vol ratio 2.1.
    pub fn passing_pair() -> (FeatureSet, FeatureSet) {
        let prev = FeatureSet {
            close: 100.0,
            adx: 26.0,
            plus_di: 20.0,
            minus_di: 14.0,
            ema21: 99.5,
            ema55: 98.0,
            squeeze_on: true,
            momentum: -0.5,
            vol_ratio: 1.0,
            rsi: 48.0,
            rsi_slope: -0.5,
            btc_corr: None,
        };
        let now = FeatureSet {
            close: 101.0,
            adx: 28.0,
            plus_di: 24.0,
            minus_di: 12.0,
            ema21: 100.0,
            ema55: 98.2,
            squeeze_on: false,
            momentum: 0.3,
            vol_ratio: 2.1,
            rsi: 56.0,
            rsi_slope: 2.0,
            btc_corr: Some(0.4),
        };
        (prev, now)
    }

    #[test]
    fn full_pattern_passes_with_reason() {
        let (prev, now) = passing_pair();
        let signal = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap();
        assert_eq!(signal.reason_code, reason::SETUP_B_SQUEEZE_RELEASE);
        assert!(signal.reason.contains("squeeze released"));
        assert!(signal.reason.contains("28.0"));
    }

    #[test]
    fn weak_adx_fails() {
        let (prev, mut now) = passing_pair();
        now.adx = 15.0;
        let err = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap_err();
        assert!(err.contains("ADX"));
    }

    #[test]
    fn di_dominance_required() {
        let (prev, mut now) = passing_pair();
        now.minus_di = 30.0;
        let err = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap_err();
        assert!(err.contains("-DI"));
    }

    #[test]
    fn squeeze_must_release_this_bar() {
        // Still in squeeze.
        let (mut prev, mut now) = passing_pair();
        now.squeeze_on = true;
        assert!(evaluate_setup_b(&prev, &now, 20.0, 1.5).is_err());

        // Released two bars ago (prev already off).
        prev.squeeze_on = false;
        now.squeeze_on = false;
        let err = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap_err();
        assert!(err.contains("squeeze"));
    }

    #[test]
    fn momentum_must_cross_not_merely_be_positive() {
        let (mut prev, now) = passing_pair();
        prev.momentum = 0.2; // already positive on the prior bar
        let err = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap_err();
        assert!(err.contains("momentum"));
    }

    #[test]
    fn thin_volume_fails() {
        let (prev, mut now) = passing_pair();
        now.vol_ratio = 1.1;
        let err = evaluate_setup_b(&prev, &now, 20.0, 1.5).unwrap_err();
        assert!(err.contains("volume ratio"));
    }

    #[test]
    fn thresholds_are_tunable() {
        let (prev, now) = passing_pair();
        // Tighter config rejects the same bar.
        assert!(evaluate_setup_b(&prev, &now, 30.0, 1.5).is_err());
        assert!(evaluate_setup_b(&prev, &now, 20.0, 2.5).is_err());
    }
}
