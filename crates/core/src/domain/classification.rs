use crate::domain::model::ModelKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance used when asserting that a weight vector sums to one.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Archetype {
    #[serde(rename = "金融業")]
    Financial,
    #[serde(rename = "週期性")]
    Cyclical,
    #[serde(rename = "虧損成長股")]
    LossMakingGrowth,
    #[serde(rename = "成長股")]
    Growth,
    #[serde(rename = "存股")]
    IncomeStock,
    #[serde(rename = "價值成長股")]
    ValueGrowth,
    #[serde(rename = "混合型")]
    Mixed,
}

impl Archetype {
    pub const ALL: [Archetype; 7] = [
        Archetype::Financial,
        Archetype::Cyclical,
        Archetype::LossMakingGrowth,
        Archetype::Growth,
        Archetype::IncomeStock,
        Archetype::ValueGrowth,
        Archetype::Mixed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Archetype::Financial => "金融業",
            Archetype::Cyclical => "週期性",
            Archetype::LossMakingGrowth => "虧損成長股",
            Archetype::Growth => "成長股",
            Archetype::IncomeStock => "存股",
            Archetype::ValueGrowth => "價值成長股",
            Archetype::Mixed => "混合型",
        }
    }

    pub fn from_label(s: &str) -> Option<Archetype> {
        Archetype::ALL.into_iter().find(|a| a.label() == s.trim())
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A weight per model. Keys absent from the map carry weight zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Weights(BTreeMap<ModelKey, f64>);

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (ModelKey, f64)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    pub fn get(&self, key: ModelKey) -> f64 {
        self.0.get(&key).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, key: ModelKey, weight: f64) {
        self.0.insert(key, weight);
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    /// All seven keys, zero-filled.
    pub fn dense(&self) -> BTreeMap<ModelKey, f64> {
        ModelKey::ALL.into_iter().map(|k| (k, self.get(k))).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelKey, f64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Scale so the weights sum to one. Returns `None` when nothing is left to scale.
    pub fn normalized(&self) -> Option<Weights> {
        let sum = self.sum();
        if sum <= 0.0 || !sum.is_finite() {
            return None;
        }
        Some(Weights(
            ModelKey::ALL
                .into_iter()
                .map(|k| (k, self.get(k) / sum))
                .collect(),
        ))
    }

    /// Cap every entry at `cap` and renormalize, repeating until the cap holds.
    ///
    /// The excess removed from capped entries is redistributed over the uncapped ones
    /// in proportion to their weight. When the cap cannot be met (fewer than `1/cap`
    /// non-zero entries) the vector is only normalized.
    pub fn capped_normalized(&self, cap: f64) -> Option<Weights> {
        let mut w = self.normalized()?;
        let positive = w.0.values().filter(|v| **v > 0.0).count();
        if (positive as f64) * cap < 1.0 - WEIGHT_SUM_TOLERANCE {
            tracing::debug!(positive, cap, "weight cap infeasible; normalizing only");
            return Some(w);
        }

        for _ in 0..=ModelKey::ALL.len() {
            let mut over = false;
            for v in w.0.values_mut() {
                if *v > cap {
                    *v = cap;
                    over = true;
                }
            }
            if !over {
                break;
            }
            let capped_total: f64 = w.0.values().filter(|v| **v >= cap).sum();
            let free_total: f64 = w.0.values().filter(|v| **v < cap).sum();
            if free_total <= 0.0 {
                break;
            }
            let scale = (1.0 - capped_total) / free_total;
            for v in w.0.values_mut() {
                if *v < cap {
                    *v *= scale;
                }
            }
        }
        Some(w)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub archetype: Archetype,
    pub description: String,
    pub base_weights: Weights,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archetype_labels_round_trip() {
        for a in Archetype::ALL {
            assert_eq!(Archetype::from_label(a.label()), Some(a));
            let json = serde_json::to_string(&a).unwrap();
            assert_eq!(json, format!("\"{}\"", a.label()));
        }
        assert_eq!(Archetype::from_label("高配息風險股"), None);
    }

    #[test]
    fn normalized_returns_none_for_empty_vector() {
        assert!(Weights::new().normalized().is_none());
        let zero = Weights::from_pairs([(ModelKey::Dcf, 0.0)]);
        assert!(zero.normalized().is_none());
    }

    #[test]
    fn capped_normalized_respects_cap_and_sum() {
        let w = Weights::from_pairs([
            (ModelKey::Dcf, 0.8),
            (ModelKey::Per, 0.1),
            (ModelKey::Pbr, 0.05),
            (ModelKey::Psr, 0.05),
        ]);
        let out = w.capped_normalized(0.5).unwrap();
        assert!((out.sum() - 1.0).abs() < WEIGHT_SUM_TOLERANCE);
        for (_, v) in out.iter() {
            assert!(v <= 0.5 + 1e-12, "weight {v} exceeds cap");
        }
        assert!((out.get(ModelKey::Dcf) - 0.5).abs() < 1e-12);
        // Remaining 0.5 shared 2:1:1.
        assert!((out.get(ModelKey::Per) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn capped_normalized_falls_back_to_plain_normalization_when_infeasible() {
        let w = Weights::from_pairs([(ModelKey::Dcf, 3.0)]);
        let out = w.capped_normalized(0.5).unwrap();
        assert!((out.get(ModelKey::Dcf) - 1.0).abs() < 1e-12);
    }
}
