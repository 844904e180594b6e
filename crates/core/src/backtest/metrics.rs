use crate::domain::accuracy::{AccuracyCheck, Horizon};
use crate::domain::model::ModelKey;
use crate::domain::recommendation::Action;
use crate::domain::valuation::round2;
use serde::Serialize;
use std::collections::BTreeMap;

/// Band around the base price inside which a HOLD counts as correct.
pub const HOLD_BAND: f64 = 0.05;

pub const UNCLASSIFIED: &str = "未分類";

/// Whether `action` called the move from `price_at_analysis` to `actual` correctly.
/// `None` when either price is missing or not positive.
pub fn is_direction_correct(action: Action, price_at_analysis: f64, actual: Option<f64>) -> Option<bool> {
    let actual = actual.filter(|a| *a > 0.0)?;
    if price_at_analysis <= 0.0 {
        return None;
    }
    let change = (actual - price_at_analysis) / price_at_analysis;
    Some(match action {
        Action::Buy => change > 0.0,
        Action::Sell => change < 0.0,
        Action::Hold => change.abs() < HOLD_BAND,
    })
}

/// Absolute percentage error of `predicted` against a realized price.
pub fn calc_mae(predicted: f64, actual: f64) -> Option<f64> {
    if actual == 0.0 || !actual.is_finite() {
        return None;
    }
    Some((predicted - actual).abs() / actual * 100.0)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round2(values.iter().sum::<f64>() / values.len() as f64))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitRates {
    pub hit_rate_30d: Option<f64>,
    pub hit_rate_90d: Option<f64>,
    pub hit_rate_180d: Option<f64>,
    pub avg_mae_30d: Option<f64>,
    pub avg_mae_90d: Option<f64>,
    pub avg_mae_180d: Option<f64>,
    pub total_checks: usize,
    pub pending_checks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub avg_mae_30d: Option<f64>,
    pub avg_mae_90d: Option<f64>,
    pub avg_mae_180d: Option<f64>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub model: ModelKey,
    pub avg_mae: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracySummary {
    pub overall: Option<HitRates>,
    pub by_type: BTreeMap<String, HitRates>,
    pub by_model: BTreeMap<ModelKey, ModelStats>,
    pub leaderboard: Vec<LeaderboardEntry>,
}

fn hit_rates(checks: &[&AccuracyCheck]) -> HitRates {
    let rate = |h: Horizon| {
        let decided: Vec<bool> = checks
            .iter()
            .filter_map(|c| c.outcome(h).direction_correct)
            .collect();
        if decided.is_empty() {
            return None;
        }
        let hits = decided.iter().filter(|d| **d).count();
        Some(round2(hits as f64 / decided.len() as f64 * 100.0))
    };
    let mae = |h: Horizon| {
        let errors: Vec<f64> = checks
            .iter()
            .filter_map(|c| {
                c.outcome(h)
                    .actual_price
                    .and_then(|a| calc_mae(c.predicted_fair_value, a))
            })
            .collect();
        mean(&errors)
    };

    HitRates {
        hit_rate_30d: rate(Horizon::D30),
        hit_rate_90d: rate(Horizon::D90),
        hit_rate_180d: rate(Horizon::D180),
        avg_mae_30d: mae(Horizon::D30),
        avg_mae_90d: mae(Horizon::D90),
        avg_mae_180d: mae(Horizon::D180),
        total_checks: checks.len(),
        pending_checks: checks
            .iter()
            .filter(|c| c.d30.direction_correct.is_none() && !c.d30.no_close)
            .count(),
    }
}

/// Hit rates overall and by archetype, per-model error stats, and a leaderboard by
/// ascending 30d error.
pub fn summarize(checks: &[AccuracyCheck]) -> AccuracySummary {
    if checks.is_empty() {
        return AccuracySummary {
            overall: None,
            by_type: BTreeMap::new(),
            by_model: BTreeMap::new(),
            leaderboard: Vec::new(),
        };
    }

    let all: Vec<&AccuracyCheck> = checks.iter().collect();

    let mut groups: BTreeMap<String, Vec<&AccuracyCheck>> = BTreeMap::new();
    for c in checks {
        let label = c
            .classification_type
            .map(|a| a.label().to_string())
            .unwrap_or_else(|| UNCLASSIFIED.to_string());
        groups.entry(label).or_default().push(c);
    }
    let by_type = groups
        .into_iter()
        .map(|(label, group)| (label, hit_rates(&group)))
        .collect();

    let mut samples: BTreeMap<ModelKey, BTreeMap<Horizon, Vec<f64>>> = BTreeMap::new();
    for c in checks {
        for (model, errors) in &c.model_errors {
            let entry = samples.entry(*model).or_default();
            for h in Horizon::ALL {
                if let Some(e) = errors.get(h) {
                    entry.entry(h).or_default().push(e);
                }
            }
        }
    }
    let by_model: BTreeMap<ModelKey, ModelStats> = samples
        .into_iter()
        .map(|(model, by_h)| {
            let m = |h: Horizon| by_h.get(&h).and_then(|v| mean(v));
            let stats = ModelStats {
                avg_mae_30d: m(Horizon::D30),
                avg_mae_90d: m(Horizon::D90),
                avg_mae_180d: m(Horizon::D180),
                sample_count: by_h.get(&Horizon::D30).map(Vec::len).unwrap_or(0),
            };
            (model, stats)
        })
        .collect();

    let mut ranked: Vec<(ModelKey, f64)> = by_model
        .iter()
        .filter_map(|(k, s)| s.avg_mae_30d.map(|m| (*k, m)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    let leaderboard = ranked
        .into_iter()
        .enumerate()
        .map(|(i, (model, avg_mae))| LeaderboardEntry {
            rank: i + 1,
            model,
            avg_mae,
        })
        .collect();

    AccuracySummary {
        overall: Some(hit_rates(&all)),
        by_type,
        by_model,
        leaderboard,
    }
}
