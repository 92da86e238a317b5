// =============================================================================
// AI scorer — online-learned entry classifier behind a narrow trait
// =============================================================================
//
// The strategy core depends only on {score, partial_fit, serialize}; concrete
// implementations are selected by the impl tag stored with the current model
// row, falling back to the AI_MODEL_IMPL config. Two implementations ship:
//
//   online_lr   — online logistic regression, fixed learning rate.
//   sgd_compat  — linear model with a decaying SGD schedule.
//
// Scores are probabilities scaled to [0, 100]. A scorer that has seen no
// samples is "cold": callers use the default threshold score and must not
// amplify margin on its account.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::features::FeatureSet;

pub const IMPL_ONLINE_LR: &str = "online_lr";
pub const IMPL_SGD_COMPAT: &str = "sgd_compat";

/// Model name under which the entry classifier is persisted.
pub const ENTRY_MODEL_NAME: &str = "entry-scorer";

/// Dimensionality of [`feature_vector`].
pub const FEATURE_DIM: usize = 8;

/// Score used while the model is cold (no samples seen).
pub const COLD_START_SCORE: f64 = 50.0;

/// Map a cached feature set onto the model input vector. The layout is part
/// of the model blob contract; changing it requires retraining from zero.
pub fn feature_vector(f: &FeatureSet) -> Vec<f64> {
    let rel_momentum = if f.close != 0.0 { f.momentum / f.close } else { 0.0 };
    vec![
        f.adx / 100.0,
        (f.plus_di - f.minus_di) / 100.0,
        rel_momentum * 100.0,
        f.vol_ratio,
        f.rsi / 100.0,
        f.rsi_slope / 100.0,
        if f.squeeze_on { 1.0 } else { 0.0 },
        f.btc_corr.unwrap_or(0.0),
    ]
}

/// Narrow capability set the strategy core depends on.
pub trait Scorer: Send + Sync {
    fn impl_tag(&self) -> &'static str;

    /// Probability in [0, 100] that the entry is favorable.
    fn score(&self, features: &[f64]) -> f64;

    /// Online update with the realized outcome label (1.0 win, 0.0 loss).
    fn partial_fit(&mut self, features: &[f64], label: f64);

    /// Samples absorbed so far; zero means cold start.
    fn samples(&self) -> u64;

    /// Serialize to the model-store blob.
    fn serialize(&self) -> String;
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn dot(w: &[f64], x: &[f64]) -> f64 {
    w.iter().zip(x.iter()).map(|(a, b)| a * b).sum()
}

// =============================================================================
// online_lr
// =============================================================================

/// Online logistic regression with a fixed learning rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineLogistic {
    weights: Vec<f64>,
    bias: f64,
    learning_rate: f64,
    samples: u64,
}

impl OnlineLogistic {
    pub fn new(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            bias: 0.0,
            learning_rate: 0.05,
            samples: 0,
        }
    }

    pub fn from_blob(blob: &str) -> Option<Self> {
        serde_json::from_str(blob).ok()
    }
}

impl Scorer for OnlineLogistic {
    fn impl_tag(&self) -> &'static str {
        IMPL_ONLINE_LR
    }

    fn score(&self, features: &[f64]) -> f64 {
        sigmoid(dot(&self.weights, features) + self.bias) * 100.0
    }

    fn partial_fit(&mut self, features: &[f64], label: f64) {
        let p = sigmoid(dot(&self.weights, features) + self.bias);
        let gradient = label.clamp(0.0, 1.0) - p;
        for (w, x) in self.weights.iter_mut().zip(features.iter()) {
            *w += self.learning_rate * gradient * x;
        }
        self.bias += self.learning_rate * gradient;
        self.samples += 1;
    }

    fn samples(&self) -> u64 {
        self.samples
    }

    fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// =============================================================================
// sgd_compat
// =============================================================================

/// Linear model with an inverse-scaling SGD schedule. Kept update-compatible
/// with models trained elsewhere under the same tag; it is an independent
/// implementation, not a twin of `online_lr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdCompat {
    weights: Vec<f64>,
    intercept: f64,
    eta0: f64,
    power_t: f64,
    samples: u64,
}

impl SgdCompat {
    pub fn new(dim: usize) -> Self {
        Self {
            weights: vec![0.0; dim],
            intercept: 0.0,
            eta0: 0.1,
            power_t: 0.5,
            samples: 0,
        }
    }

    pub fn from_blob(blob: &str) -> Option<Self> {
        serde_json::from_str(blob).ok()
    }

    fn eta(&self) -> f64 {
        self.eta0 / (self.samples as f64 + 1.0).powf(self.power_t)
    }
}

impl Scorer for SgdCompat {
    fn impl_tag(&self) -> &'static str {
        IMPL_SGD_COMPAT
    }

    fn score(&self, features: &[f64]) -> f64 {
        sigmoid(dot(&self.weights, features) + self.intercept) * 100.0
    }

    fn partial_fit(&mut self, features: &[f64], label: f64) {
        let eta = self.eta();
        let p = sigmoid(dot(&self.weights, features) + self.intercept);
        let gradient = label.clamp(0.0, 1.0) - p;
        for (w, x) in self.weights.iter_mut().zip(features.iter()) {
            *w += eta * gradient * x;
        }
        self.intercept += eta * gradient;
        self.samples += 1;
    }

    fn samples(&self) -> u64 {
        self.samples
    }

    fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Instantiate a scorer by impl tag, restoring `blob` when given. Unknown
/// tags and unreadable blobs fall back to a fresh `online_lr`.
pub fn load_scorer(tag: &str, blob: Option<&str>) -> Box<dyn Scorer> {
    match tag {
        IMPL_ONLINE_LR => match blob.and_then(OnlineLogistic::from_blob) {
            Some(model) => Box::new(model),
            None => Box::new(OnlineLogistic::new(FEATURE_DIM)),
        },
        IMPL_SGD_COMPAT => match blob.and_then(SgdCompat::from_blob) {
            Some(model) => Box::new(model),
            None => Box::new(SgdCompat::new(FEATURE_DIM)),
        },
        other => {
            warn!(impl_tag = other, "unknown scorer implementation — falling back to online_lr");
            Box::new(OnlineLogistic::new(FEATURE_DIM))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn winning_features() -> Vec<f64> {
        vec![0.3, 0.15, 0.5, 2.0, 0.6, 0.05, 0.0, 0.4]
    }

    fn losing_features() -> Vec<f64> {
        vec![0.1, -0.1, -0.5, 0.8, 0.4, -0.05, 1.0, -0.2]
    }

    #[test]
    fn fresh_models_score_neutral() {
        for tag in [IMPL_ONLINE_LR, IMPL_SGD_COMPAT] {
            let model = load_scorer(tag, None);
            assert_eq!(model.samples(), 0);
            let score = model.score(&winning_features());
            assert!((score - 50.0).abs() < 1e-9, "{tag} fresh score {score}");
        }
    }

    #[test]
    fn online_lr_learns_label_separation() {
        let mut model = OnlineLogistic::new(FEATURE_DIM);
        for _ in 0..200 {
            model.partial_fit(&winning_features(), 1.0);
            model.partial_fit(&losing_features(), 0.0);
        }
        let win = model.score(&winning_features());
        let lose = model.score(&losing_features());
        assert!(win > 60.0, "winning pattern should score high, got {win}");
        assert!(lose < 40.0, "losing pattern should score low, got {lose}");
        assert_eq!(model.samples(), 400);
    }

    #[test]
    fn sgd_compat_learns_with_decaying_rate() {
        let mut model = SgdCompat::new(FEATURE_DIM);
        let eta_first = model.eta();
        for _ in 0..100 {
            model.partial_fit(&winning_features(), 1.0);
            model.partial_fit(&losing_features(), 0.0);
        }
        assert!(model.eta() < eta_first, "learning rate must decay");
        assert!(model.score(&winning_features()) > model.score(&losing_features()));
    }

    #[test]
    fn serialize_roundtrip_preserves_scores() {
        let mut model = OnlineLogistic::new(FEATURE_DIM);
        for _ in 0..50 {
            model.partial_fit(&winning_features(), 1.0);
        }
        let blob = Scorer::serialize(&model);
        let restored = load_scorer(IMPL_ONLINE_LR, Some(&blob));
        assert_eq!(restored.samples(), model.samples());
        let x = winning_features();
        assert!((restored.score(&x) - model.score(&x)).abs() < 1e-9);
    }

    #[test]
    fn registry_selects_by_tag_with_fallback() {
        assert_eq!(load_scorer(IMPL_ONLINE_LR, None).impl_tag(), IMPL_ONLINE_LR);
        assert_eq!(load_scorer(IMPL_SGD_COMPAT, None).impl_tag(), IMPL_SGD_COMPAT);
        assert_eq!(load_scorer("mystery", None).impl_tag(), IMPL_ONLINE_LR);
        // A blob from the other implementation fails to parse and yields a
        // fresh model under the requested tag.
        let lr_blob = Scorer::serialize(&OnlineLogistic::new(FEATURE_DIM));
        let restored = load_scorer(IMPL_SGD_COMPAT, Some(&lr_blob));
        assert_eq!(restored.impl_tag(), IMPL_SGD_COMPAT);
        assert_eq!(restored.samples(), 0);
    }

    #[test]
    fn feature_vector_has_fixed_dim() {
        let f = FeatureSet {
            close: 100.0,
            adx: 28.0,
            plus_di: 24.0,
            minus_di: 12.0,
            ema21: 99.0,
            ema55: 97.0,
            squeeze_on: false,
            momentum: 0.3,
            vol_ratio: 2.1,
            rsi: 55.0,
            rsi_slope: 1.5,
            btc_corr: None,
        };
        let x = feature_vector(&f);
        assert_eq!(x.len(), FEATURE_DIM);
        assert!((x[6] - 0.0).abs() < f64::EPSILON);
    }
}
