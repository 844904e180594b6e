use crate::domain::classification::Weights;
use crate::domain::model::ModelKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where the weights behind a valuation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    #[default]
    Deterministic,
    Feedback,
    LlmEnhanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedValuation {
    pub fair_value: f64,
    pub method: String,
    /// Sums to one over contributing models, unless `fallback` is set.
    pub weights: Weights,
    pub per_model_fair_value: BTreeMap<ModelKey, Option<f64>>,
    /// No model was usable and the raw DCF value was returned as-is.
    #[serde(default)]
    pub fallback: bool,
}

impl WeightedValuation {
    /// Fair values of the models that produced one, for persistence and backtesting.
    pub fn present_fair_values(&self) -> BTreeMap<ModelKey, f64> {
        self.per_model_fair_value
            .iter()
            .filter_map(|(k, v)| v.map(|v| (*k, v)))
            .collect()
    }
}

pub fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

pub fn round4(n: f64) -> f64 {
    (n * 10_000.0).round() / 10_000.0
}

/// `"DCF 64% + PER 36%"`, listing non-zero weights in model order.
pub fn method_string(weights: &Weights) -> String {
    let parts: Vec<String> = ModelKey::ALL
        .into_iter()
        .filter(|k| weights.get(*k) > 0.0)
        .map(|k| format!("{} {}%", k.display_name(), (weights.get(k) * 100.0).round()))
        .collect();
    parts.join(" + ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_string_lists_non_zero_weights_in_model_order() {
        let w = Weights::from_pairs([
            (ModelKey::Per, 0.357),
            (ModelKey::Dcf, 0.643),
            (ModelKey::Psr, 0.0),
        ]);
        assert_eq!(method_string(&w), "DCF 64% + PER 36%");
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round2(112.857_142), 112.86);
        assert_eq!(round4(0.642_857_1), 0.6429);
    }
}
