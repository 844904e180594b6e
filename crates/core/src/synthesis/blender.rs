use crate::domain::classification::Weights;
use crate::domain::model::{ModelBundle, ModelKey, SectorConfidence};
use crate::domain::valuation::{method_string, round2, WeightedValuation};
use std::collections::BTreeMap;

pub const FALLBACK_METHOD: &str = "僅 DCF（無可用模型，退回 DCF 原始值）";

/// Confidence discounts on the DCF and CapEx weights, driven by model diagnostics.
fn apply_confidence_discounts(bundle: &ModelBundle, weights: &mut Weights) {
    if let Some(dcf) = bundle.dcf() {
        let mut factor = 1.0;
        if dcf.terminal_ratio_pct > 85.0 {
            factor *= 0.6;
        } else if dcf.terminal_ratio_pct > 75.0 {
            factor *= 0.8;
        }
        if dcf.fcf_base < 0.0 {
            factor *= 0.3;
        }
        weights.set(ModelKey::Dcf, weights.get(ModelKey::Dcf) * factor);
    }

    if let Some(capex) = bundle.capex() {
        let factor = match capex.sector_confidence {
            SectorConfidence::Low => 0.5,
            SectorConfidence::Medium => 1.0,
            SectorConfidence::High => 1.2,
        };
        weights.set(ModelKey::Capex, weights.get(ModelKey::Capex) * factor);
    }
}

fn per_model_fair_values(bundle: &ModelBundle) -> BTreeMap<ModelKey, Option<f64>> {
    ModelKey::ALL
        .into_iter()
        .map(|k| (k, bundle.usable_fair_value(k)))
        .collect()
}

/// Weighted sum over `weights` (already normalized) of the usable fair values.
fn weighted_sum(fair_values: &BTreeMap<ModelKey, Option<f64>>, weights: &Weights) -> f64 {
    ModelKey::ALL
        .into_iter()
        .filter_map(|k| fair_values.get(&k).copied().flatten().map(|v| v * weights.get(k)))
        .sum()
}

/// Keep only weights whose model has a usable fair value.
fn prune_unusable(fair_values: &BTreeMap<ModelKey, Option<f64>>, weights: &Weights) -> Weights {
    Weights::from_pairs(ModelKey::ALL.into_iter().map(|k| {
        let usable = fair_values.get(&k).copied().flatten().is_some();
        (k, if usable { weights.get(k).max(0.0) } else { 0.0 })
    }))
}

fn fallback(bundle: &ModelBundle, fair_values: BTreeMap<ModelKey, Option<f64>>) -> WeightedValuation {
    let raw_dcf = bundle
        .get(ModelKey::Dcf)
        .and_then(|r| r.fair_value)
        .unwrap_or(0.0);
    tracing::warn!(raw_dcf, "no usable valuation model; falling back to raw DCF value");
    WeightedValuation {
        fair_value: round2(raw_dcf),
        method: FALLBACK_METHOD.to_string(),
        weights: Weights::from_pairs(
            ModelKey::ALL
                .into_iter()
                .map(|k| (k, if k == ModelKey::Dcf { 1.0 } else { 0.0 })),
        ),
        per_model_fair_value: fair_values,
        fallback: true,
    }
}

/// Blend model fair values with `base` weights: prune unusable models, discount by
/// diagnostic confidence, renormalize, and take the weighted sum.
pub fn blend(bundle: &ModelBundle, base: &Weights) -> WeightedValuation {
    let fair_values = per_model_fair_values(bundle);
    let mut weights = prune_unusable(&fair_values, base);
    apply_confidence_discounts(bundle, &mut weights);

    match weights.normalized() {
        Some(normalized) => WeightedValuation {
            fair_value: round2(weighted_sum(&fair_values, &normalized)),
            method: method_string(&normalized),
            weights: normalized,
            per_model_fair_value: fair_values,
            fallback: false,
        },
        None => fallback(bundle, fair_values),
    }
}

/// Recompute a valuation from recorded per-model fair values and replacement weights,
/// without confidence discounts. `None` when no weighted model has a fair value.
pub fn reweight(
    fair_values: &BTreeMap<ModelKey, Option<f64>>,
    weights: &Weights,
    method_suffix: &str,
) -> Option<WeightedValuation> {
    let normalized = prune_unusable(fair_values, weights).normalized()?;
    Some(WeightedValuation {
        fair_value: round2(weighted_sum(fair_values, &normalized)),
        method: format!("{} {method_suffix}", method_string(&normalized)),
        weights: normalized,
        per_model_fair_value: fair_values.clone(),
        fallback: false,
    })
}
