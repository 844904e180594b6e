//! Inverse-error weighting from realized accuracy, blended with classifier priors.

use crate::domain::accuracy::{AccuracyCheck, Horizon};
use crate::domain::classification::{Archetype, Weights};
use crate::domain::model::ModelKey;
use crate::feedback::FeedbackConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observed errors of one model, per horizon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSamples {
    pub by_horizon: BTreeMap<Horizon, Vec<f64>>,
}

impl ErrorSamples {
    pub fn push(&mut self, horizon: Horizon, mae: f64) {
        self.by_horizon.entry(horizon).or_default().push(mae);
    }

    pub fn count(&self, horizon: Horizon) -> usize {
        self.by_horizon.get(&horizon).map(Vec::len).unwrap_or(0)
    }

    fn mean(&self, horizon: Horizon) -> Option<f64> {
        let v = self.by_horizon.get(&horizon)?;
        if v.is_empty() {
            return None;
        }
        Some(v.iter().sum::<f64>() / v.len() as f64)
    }
}

/// Feedback computed for one archetype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeFeedback {
    pub weights: Weights,
    /// 30d samples per model.
    pub sample_counts: BTreeMap<ModelKey, usize>,
    pub blended_maes: BTreeMap<ModelKey, Option<f64>>,
    pub total_checks: usize,
}

/// Horizon-weighted mean error, renormalized over the horizons that have data.
///
/// `None` when 30d data is missing or has fewer than `min_samples` entries; such a model
/// is left out of feedback rather than treated as perfect.
pub fn blended_mae(samples: &ErrorSamples, config: &FeedbackConfig) -> Option<f64> {
    let mean_30d = samples.mean(Horizon::D30)?;
    if samples.count(Horizon::D30) < config.min_samples {
        return None;
    }

    let hw = config.horizon_weights;
    let mut total = hw.d30 * mean_30d;
    let mut weight = hw.d30;
    for horizon in [Horizon::D90, Horizon::D180] {
        if let Some(mean) = samples.mean(horizon) {
            total += hw.get(horizon) * mean;
            weight += hw.get(horizon);
        }
    }
    if weight <= 0.0 {
        return None;
    }
    Some(total / weight)
}

/// `weight ∝ 1 / (mae + ε)` over models with a blended error, capped then renormalized.
pub fn mae_to_weights(
    maes: &BTreeMap<ModelKey, Option<f64>>,
    config: &FeedbackConfig,
) -> Option<Weights> {
    let inverse = Weights::from_pairs(ModelKey::ALL.into_iter().map(|k| {
        let inv = maes
            .get(&k)
            .copied()
            .flatten()
            .filter(|m| m.is_finite() && *m >= 0.0)
            .map(|m| 1.0 / (m + config.epsilon))
            .unwrap_or(0.0);
        (k, inv)
    }));
    inverse.capped_normalized(config.max_weight)
}

/// `(1 - r)·base + r·feedback` for every model, before capping.
pub fn blend_uncapped(base: &Weights, feedback: &Weights, ratio: f64) -> Weights {
    Weights::from_pairs(
        ModelKey::ALL
            .into_iter()
            .map(|k| (k, (1.0 - ratio) * base.get(k) + ratio * feedback.get(k))),
    )
}

/// Blend classifier priors with feedback weights, then cap and renormalize.
pub fn blend(base: &Weights, feedback: &Weights, config: &FeedbackConfig) -> Option<Weights> {
    blend_uncapped(base, feedback, config.blend_ratio).capped_normalized(config.max_weight)
}

/// Group checks by archetype and derive feedback weights for each group that has at
/// least one eligible model. Checks without a recorded archetype are skipped.
pub fn compute_by_archetype(
    checks: &[AccuracyCheck],
    config: &FeedbackConfig,
) -> BTreeMap<Archetype, ArchetypeFeedback> {
    let mut groups: BTreeMap<Archetype, Vec<&AccuracyCheck>> = BTreeMap::new();
    let mut unclassified = 0usize;
    for check in checks {
        match check.classification_type {
            Some(a) => groups.entry(a).or_default().push(check),
            None => unclassified += 1,
        }
    }
    if unclassified > 0 {
        tracing::debug!(unclassified, "accuracy checks without archetype skipped");
    }

    let mut out = BTreeMap::new();
    for (archetype, group) in groups {
        let mut samples: BTreeMap<ModelKey, ErrorSamples> = BTreeMap::new();
        for check in &group {
            for (model, errors) in &check.model_errors {
                let entry = samples.entry(*model).or_default();
                for horizon in Horizon::ALL {
                    if let Some(mae) = errors.get(horizon).filter(|m| m.is_finite()) {
                        entry.push(horizon, mae);
                    }
                }
            }
        }

        let empty = ErrorSamples::default();
        let blended_maes: BTreeMap<ModelKey, Option<f64>> = ModelKey::ALL
            .into_iter()
            .map(|k| (k, blended_mae(samples.get(&k).unwrap_or(&empty), config)))
            .collect();
        let sample_counts = ModelKey::ALL
            .into_iter()
            .map(|k| (k, samples.get(&k).map(|s| s.count(Horizon::D30)).unwrap_or(0)))
            .collect();

        if let Some(weights) = mae_to_weights(&blended_maes, config) {
            out.insert(
                archetype,
                ArchetypeFeedback {
                    weights,
                    sample_counts,
                    blended_maes,
                    total_checks: group.len(),
                },
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::accuracy::{HorizonErrors, HorizonOutcome};
    use crate::domain::recommendation::Action;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn samples(d30: &[f64], d90: &[f64], d180: &[f64]) -> ErrorSamples {
        let mut s = ErrorSamples::default();
        for (h, v) in [(Horizon::D30, d30), (Horizon::D90, d90), (Horizon::D180, d180)] {
            for m in v {
                s.push(h, *m);
            }
        }
        s
    }

    fn check(archetype: Option<Archetype>, errors: &[(ModelKey, f64, Option<f64>)]) -> AccuracyCheck {
        AccuracyCheck {
            id: Uuid::new_v4(),
            analysis_id: Uuid::new_v4(),
            ticker: "2330".to_string(),
            analysis_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            predicted_fair_value: 100.0,
            predicted_action: Action::Buy,
            price_at_analysis: 90.0,
            classification_type: archetype,
            d30: HorizonOutcome::default(),
            d90: HorizonOutcome::default(),
            d180: HorizonOutcome::default(),
            model_fair_values: BTreeMap::new(),
            model_errors: errors
                .iter()
                .map(|(k, m30, m90)| {
                    (
                        *k,
                        HorizonErrors {
                            mae_30d: Some(*m30),
                            mae_90d: *m90,
                            mae_180d: None,
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn blended_mae_requires_enough_30d_samples() {
        let config = FeedbackConfig::default();
        assert_eq!(blended_mae(&samples(&[10.0; 4], &[], &[]), &config), None);
        assert_eq!(blended_mae(&samples(&[], &[5.0; 10], &[]), &config), None);
        assert_eq!(blended_mae(&samples(&[10.0; 5], &[], &[]), &config), Some(10.0));
    }

    #[test]
    fn blended_mae_renormalizes_over_present_horizons() {
        let config = FeedbackConfig::default();
        let got = blended_mae(&samples(&[10.0; 5], &[20.0], &[]), &config).unwrap();
        assert!((got - (0.5 * 10.0 + 0.3 * 20.0) / 0.8).abs() < 1e-12);

        let got = blended_mae(&samples(&[10.0; 5], &[20.0], &[40.0]), &config).unwrap();
        assert!((got - (5.0 + 6.0 + 8.0)).abs() < 1e-12);
    }

    #[test]
    fn inverse_error_weights_favor_accurate_models_and_respect_cap() {
        let config = FeedbackConfig::default();
        let maes: BTreeMap<_, _> = [
            (ModelKey::Dcf, Some(0.0)),
            (ModelKey::Per, Some(10.0)),
            (ModelKey::Pbr, Some(20.0)),
            (ModelKey::Dividend, None),
        ]
        .into_iter()
        .collect();
        let w = mae_to_weights(&maes, &config).unwrap();

        assert!((w.sum() - 1.0).abs() < 1e-9);
        assert!((w.get(ModelKey::Dcf) - 0.5).abs() < 1e-9);
        assert!(w.get(ModelKey::Per) > w.get(ModelKey::Pbr));
        assert_eq!(w.get(ModelKey::Dividend), 0.0);
        assert!((w.get(ModelKey::Per) / w.get(ModelKey::Pbr) - 20.01 / 10.01).abs() < 1e-9);
    }

    #[test]
    fn no_eligible_model_means_no_weights() {
        let maes: BTreeMap<_, _> = ModelKey::ALL.into_iter().map(|k| (k, None)).collect();
        assert!(mae_to_weights(&maes, &FeedbackConfig::default()).is_none());
    }

    #[test]
    fn uncapped_blend_is_linear() {
        let base = Weights::from_pairs([(ModelKey::Dcf, 0.5)]);
        let feedback = Weights::from_pairs([(ModelKey::Dcf, 0.1)]);
        let out = blend_uncapped(&base, &feedback, 0.3);
        assert!((out.get(ModelKey::Dcf) - 0.38).abs() < 1e-12);
    }

    #[test]
    fn blend_caps_and_sums_to_one() {
        let config = FeedbackConfig::default();
        let base = Weights::from_pairs([
            (ModelKey::Dcf, 0.45),
            (ModelKey::Per, 0.25),
            (ModelKey::Pbr, 0.10),
            (ModelKey::Dividend, 0.20),
        ]);
        let feedback = Weights::from_pairs([(ModelKey::Dcf, 0.5), (ModelKey::Per, 0.5)]);
        let out = blend(&base, &feedback, &config).unwrap();
        assert!((out.sum() - 1.0).abs() < 1e-9);
        for (_, w) in out.iter() {
            assert!(w <= config.max_weight + 1e-9);
        }
    }

    #[test]
    fn groups_by_archetype_and_skips_thin_groups() {
        let config = FeedbackConfig::default();
        let mut checks: Vec<_> = (0..5)
            .map(|_| {
                check(
                    Some(Archetype::Growth),
                    &[
                        (ModelKey::Dcf, 10.0, Some(12.0)),
                        (ModelKey::Per, 5.0, None),
                        (ModelKey::Pbr, 20.0, None),
                    ],
                )
            })
            .collect();
        checks.extend((0..3).map(|_| check(Some(Archetype::IncomeStock), &[(ModelKey::Dcf, 8.0, None)])));
        checks.push(check(None, &[(ModelKey::Dcf, 1.0, None)]));

        let out = compute_by_archetype(&checks, &config);
        assert_eq!(out.len(), 1);
        let growth = &out[&Archetype::Growth];
        assert_eq!(growth.total_checks, 5);
        assert_eq!(growth.sample_counts[&ModelKey::Dcf], 5);
        assert_eq!(growth.sample_counts[&ModelKey::Psr], 0);
        assert_eq!(growth.blended_maes[&ModelKey::Psr], None);
        assert!((growth.weights.get(ModelKey::Per) - 0.5).abs() < 1e-9);
        assert!(growth.weights.get(ModelKey::Dcf) > growth.weights.get(ModelKey::Pbr));
        assert!((growth.weights.sum() - 1.0).abs() < 1e-9);
    }
}
