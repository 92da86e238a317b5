// =============================================================================
// Risk sizing — dynamic margin and the hard 3 % risk budget
// =============================================================================
//
// Margin: base_margin = max(50, equity * 0.10), amplified by 1.2 when the AI
// score exceeds 85 (never on a cold-start scorer).
//
// Budget: risk_amount = base_margin * leverage * stop_dist_pct must not
// exceed 3 % of equity. Leverage steps down one notch at a time until the
// budget holds; if leverage 1 is still over, the order is rejected with
// RISK_BUDGET_EXCEEDED.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::FeatureSet;
use crate::types::{reason, Side};

/// Hard ceiling on risk per position, as a fraction of equity.
pub const RISK_BUDGET_FRACTION: f64 = 0.03;

/// Margin floor in quote currency.
pub const MARGIN_FLOOR: f64 = 50.0;

/// Fraction of equity allocated as base margin.
pub const MARGIN_EQUITY_FRACTION: f64 = 0.10;

/// AI score above which margin is amplified.
pub const AMPLIFY_SCORE: f64 = 85.0;

/// Margin amplification factor for high-conviction scores.
pub const AMPLIFY_FACTOR: f64 = 1.2;

/// Stop distance bounds as a fraction of entry price.
const STOP_DIST_MIN: f64 = 0.004;
const STOP_DIST_MAX: f64 = 0.04;

/// An approved position size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSize {
    pub margin: f64,
    pub leverage: u32,
    pub qty: f64,
    pub risk_amount: f64,
    pub stop_price: f64,
    pub stop_dist_pct: f64,
}

/// Outcome of the risk gate.
#[derive(Debug, Clone)]
pub enum RiskOutcome {
    Approved(PositionSize),
    Rejected {
        reason_code: &'static str,
        reason: String,
    },
}

/// Dynamic base margin for the account.
pub fn base_margin(equity: f64, ai_score: f64, cold_start: bool) -> f64 {
    let mut margin = MARGIN_FLOOR.max(equity * MARGIN_EQUITY_FRACTION);
    if ai_score > AMPLIFY_SCORE && !cold_start {
        margin *= AMPLIFY_FACTOR;
    }
    margin
}

/// Protective stop distance for one bar, as a fraction of the close:
/// twice the bar's momentum displacement, clamped to [0.4 %, 4 %].
pub fn stop_distance_pct(features: &FeatureSet) -> f64 {
    if features.close <= 0.0 {
        return STOP_DIST_MIN;
    }
    let raw = (features.momentum.abs() / features.close) * 2.0;
    raw.clamp(STOP_DIST_MIN, STOP_DIST_MAX)
}

/// Apply the margin rule and the 3 % budget ladder.
pub fn size_position(
    equity: f64,
    entry_price: f64,
    stop_dist_pct: f64,
    ai_score: f64,
    cold_start: bool,
    max_leverage: u32,
    side: Side,
) -> RiskOutcome {
    if equity <= 0.0 || entry_price <= 0.0 || stop_dist_pct <= 0.0 {
        return RiskOutcome::Rejected {
            reason_code: reason::RISK_BUDGET_EXCEEDED,
            reason: format!(
                "degenerate sizing inputs: equity {equity}, entry {entry_price}, stop {stop_dist_pct}"
            ),
        };
    }

    let margin = base_margin(equity, ai_score, cold_start);
    let budget = RISK_BUDGET_FRACTION * equity;
    let mut leverage = max_leverage.max(1);

    loop {
        let risk_amount = margin * leverage as f64 * stop_dist_pct;
        if risk_amount <= budget {
            let qty = margin * leverage as f64 / entry_price;
            let stop_price = match side {
                Side::Long => entry_price * (1.0 - stop_dist_pct),
                Side::Short => entry_price * (1.0 + stop_dist_pct),
            };
            debug!(
                margin,
                leverage,
                risk_amount,
                budget,
                qty,
                stop_price,
                "position sized within risk budget"
            );
            return RiskOutcome::Approved(PositionSize {
                margin,
                leverage,
                qty,
                risk_amount,
                stop_price,
                stop_dist_pct,
            });
        }

        if leverage == 1 {
            return RiskOutcome::Rejected {
                reason_code: reason::RISK_BUDGET_EXCEEDED,
                reason: format!(
                    "risk {risk_amount:.2} exceeds budget {budget:.2} even at leverage 1 \
                     (margin {margin:.2}, stop {:.2}%)",
                    stop_dist_pct * 100.0
                ),
            };
        }
        leverage -= 1;
    }
}
