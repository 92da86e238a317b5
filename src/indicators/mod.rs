// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the feature
// pipeline computes per closed bar. Every public function returns `Option<T>`
// (or an empty series) so callers are forced to handle insufficient-data and
// numerical-edge-case scenarios.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod keltner;
pub mod rsi;
