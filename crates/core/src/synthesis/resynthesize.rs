//! Reweighting of an already-persisted analysis, either from an accepted external
//! proposal or from adaptive feedback weights. The input record is never mutated; the
//! result keeps the deterministic half alongside the reweighted one.

use crate::domain::analysis::{AnalysisRecord, ExternalClassification, FeedbackMeta};
use crate::domain::classification::{Classification, Weights};
use crate::domain::contract::SanitizedProposal;
use crate::domain::recommendation::Recommendation;
use crate::domain::valuation::{round2, Provenance, WeightedValuation};
use crate::synthesis::blender::reweight;
use crate::synthesis::recommend::{grade, upside_pct};

pub const LLM_SUFFIX: &str = "(LLM)";
pub const FEEDBACK_SUFFIX: &str = "(Feedback)";

fn direction_headline(prefix: &str, fair_value: f64, upside: f64) -> String {
    let direction = if upside > 0.0 { "上漲" } else { "下跌" };
    format!(
        "{prefix}加權合理價 {fair_value} 元，潛在{direction}空間 {}%",
        round2(upside.abs())
    )
}

fn recommendation(
    valuation: &WeightedValuation,
    current_price: f64,
    reasons: impl FnOnce(f64) -> Vec<String>,
) -> Recommendation {
    let upside = upside_pct(valuation.fair_value, current_price);
    let (action, confidence, _) = grade(upside, valuation.fair_value);
    Recommendation {
        action,
        confidence,
        upside_pct: round2(upside),
        fair_value: valuation.fair_value,
        reasons: reasons(upside),
    }
}

/// Apply a validated proposal to a stored record.
///
/// Returns `None` when none of the proposal's weighted models has a recorded fair
/// value; the caller keeps the deterministic record in that case.
pub fn with_proposal(record: &AnalysisRecord, proposal: &SanitizedProposal) -> Option<AnalysisRecord> {
    let deterministic = record.deterministic_view();
    let valuation = reweight(
        &deterministic.weighted_valuation.per_model_fair_value,
        &proposal.weights,
        LLM_SUFFIX,
    )?;

    let recommendation = recommendation(&valuation, record.current_price, |upside| {
        let mut reasons = vec![
            direction_headline("LLM ", valuation.fair_value, upside),
            format!("AI 分類：{} — {}", proposal.archetype, proposal.description),
        ];
        if !proposal.narrative.is_empty() {
            reasons.push(format!("AI 分析：{}", proposal.narrative));
        }
        reasons
    });

    Some(AnalysisRecord {
        classification: Classification {
            archetype: proposal.archetype,
            description: proposal.description.clone(),
            base_weights: deterministic.classification.base_weights.clone(),
        },
        weighted_valuation: valuation,
        recommendation,
        provenance: Provenance::LlmEnhanced,
        external_classification: Some(ExternalClassification {
            archetype: proposal.archetype,
            description: proposal.description.clone(),
            confidence: proposal.confidence.clone(),
            narrative: proposal.narrative.clone(),
        }),
        deterministic: Some(deterministic),
        ..record.clone()
    })
}

/// Apply blended feedback weights to a stored record.
///
/// Returns `None` when no weighted model has a recorded fair value.
pub fn with_feedback(
    record: &AnalysisRecord,
    weights: &Weights,
    meta: FeedbackMeta,
) -> Option<AnalysisRecord> {
    let deterministic = record.deterministic_view();
    let valuation = reweight(
        &deterministic.weighted_valuation.per_model_fair_value,
        weights,
        FEEDBACK_SUFFIX,
    )?;

    let blend_pct = round2(meta.blend_ratio * 100.0);
    let recommendation = recommendation(&valuation, record.current_price, |upside| {
        vec![
            direction_headline("回饋", valuation.fair_value, upside),
            format!(
                "權重來源：{blend_pct}% 歷史回饋 + {}% 預設",
                round2(100.0 - blend_pct)
            ),
        ]
    });

    Some(AnalysisRecord {
        weighted_valuation: valuation,
        recommendation,
        provenance: Provenance::Feedback,
        deterministic: Some(deterministic),
        feedback: Some(meta),
        ..record.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classification::Archetype;
    use crate::domain::model::ModelKey;
    use crate::domain::recommendation::{Action, Confidence};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn stored() -> AnalysisRecord {
        let per_model_fair_value: BTreeMap<_, _> = ModelKey::ALL
            .into_iter()
            .map(|k| {
                let v = match k {
                    ModelKey::Dcf => Some(150.0),
                    ModelKey::Per => Some(100.0),
                    _ => None,
                };
                (k, v)
            })
            .collect();
        let weights = Weights::from_pairs([(ModelKey::Dcf, 0.6), (ModelKey::Per, 0.4)]);
        AnalysisRecord {
            ticker: "2330".to_string(),
            current_price: 100.0,
            classification: Classification {
                archetype: Archetype::Growth,
                description: "高成長".to_string(),
                base_weights: weights.clone(),
            },
            weighted_valuation: WeightedValuation {
                fair_value: 130.0,
                method: "DCF 60% + PER 40%".to_string(),
                weights,
                per_model_fair_value,
                fallback: false,
            },
            recommendation: Recommendation {
                action: Action::Buy,
                confidence: Confidence::Normal,
                upside_pct: 30.0,
                fair_value: 130.0,
                reasons: vec!["det".to_string()],
            },
            risks: vec![],
            model_summaries: vec![],
            provenance: Provenance::Deterministic,
            deterministic: None,
            external_classification: None,
            feedback: None,
        }
    }

    fn proposal(weights: Weights) -> SanitizedProposal {
        SanitizedProposal {
            archetype: Archetype::ValueGrowth,
            description: "成長兼配息".to_string(),
            weights,
            confidence: "HIGH".to_string(),
            narrative: String::new(),
        }
    }

    #[test]
    fn proposal_reweights_and_keeps_deterministic_copy() {
        let record = stored();
        let p = proposal(Weights::from_pairs([
            (ModelKey::Dcf, 0.4),
            (ModelKey::Per, 0.4),
            (ModelKey::Pbr, 0.2),
        ]));
        let out = with_proposal(&record, &p).unwrap();

        assert_eq!(out.provenance, Provenance::LlmEnhanced);
        assert_eq!(out.weighted_valuation.fair_value, 125.0);
        assert!(out.weighted_valuation.method.ends_with(" (LLM)"));
        assert_eq!(out.classification.archetype, Archetype::ValueGrowth);
        assert_eq!(out.recommendation.action, Action::Buy);
        assert_eq!(out.recommendation.reasons.len(), 2);

        let det = out.deterministic.unwrap();
        assert_eq!(det.weighted_valuation, record.weighted_valuation);
        assert_eq!(det.recommendation, record.recommendation);
        assert_eq!(out.external_classification.unwrap().confidence, "HIGH");
    }

    #[test]
    fn reweighting_twice_keeps_the_original_deterministic_view() {
        let record = stored();
        let first = with_proposal(
            &record,
            &proposal(Weights::from_pairs([(ModelKey::Dcf, 0.5), (ModelKey::Per, 0.5)])),
        )
        .unwrap();
        let meta = FeedbackMeta {
            blend_ratio: 0.3,
            computed_at: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            total_checks: 40,
            sample_counts: BTreeMap::new(),
        };
        let second = with_feedback(
            &first,
            &Weights::from_pairs([(ModelKey::Dcf, 0.2), (ModelKey::Per, 0.8)]),
            meta,
        )
        .unwrap();

        assert_eq!(second.provenance, Provenance::Feedback);
        assert_eq!(second.weighted_valuation.fair_value, 110.0);
        assert_eq!(second.recommendation.action, Action::Hold);
        assert_eq!(
            second.recommendation.reasons[1],
            "權重來源：30% 歷史回饋 + 70% 預設"
        );
        assert_eq!(
            second.deterministic.unwrap().weighted_valuation,
            record.weighted_valuation
        );
    }

    #[test]
    fn nothing_to_weigh_returns_none() {
        let out = with_proposal(&stored(), &proposal(Weights::from_pairs([(ModelKey::Psr, 1.0)])));
        assert!(out.is_none());
    }
}
