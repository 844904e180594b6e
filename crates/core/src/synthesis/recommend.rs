use crate::domain::classification::Classification;
use crate::domain::model::{BandPosition, ModelBundle, ModelKey};
use crate::domain::recommendation::{Action, Confidence, Recommendation};
use crate::domain::valuation::{round2, WeightedValuation};

pub fn upside_pct(fair_value: f64, price: f64) -> f64 {
    if price > 0.0 {
        (fair_value - price) * 100.0 / price
    } else {
        0.0
    }
}

/// Action, confidence and headline sentence for an upside percentage.
pub(crate) fn grade(upside: f64, fair_value: f64) -> (Action, Confidence, String) {
    let u = round2(upside);
    if upside > 30.0 {
        (
            Action::Buy,
            Confidence::Strong,
            format!("加權合理價 {fair_value} 元，潛在上漲空間 {u}%"),
        )
    } else if upside > 10.0 {
        (
            Action::Buy,
            Confidence::Normal,
            format!("加權合理價 {fair_value} 元，尚有 {u}% 空間"),
        )
    } else if upside > -10.0 {
        (
            Action::Hold,
            Confidence::Neutral,
            format!("目前股價接近合理價位（偏差 {u}%）"),
        )
    } else {
        let confidence = if upside < -25.0 {
            Confidence::Strong
        } else {
            Confidence::Normal
        };
        (
            Action::Sell,
            confidence,
            format!("目前股價高於合理價 {}%", round2(upside.abs())),
        )
    }
}

fn band_sentence(key: ModelKey, position: BandPosition) -> Option<String> {
    let label = key.display_name();
    match position {
        BandPosition::Cheap => Some(format!("{label} 位於歷史區間低檔，評價偏便宜")),
        BandPosition::Expensive => Some(format!("{label} 位於歷史區間高檔，評價偏昂貴")),
        BandPosition::Fair | BandPosition::Unknown => None,
    }
}

/// Optional sentences one model contributes, in the order they are appended.
fn model_sentences(bundle: &ModelBundle, key: ModelKey) -> Vec<String> {
    match key {
        ModelKey::Dcf => Vec::new(),
        ModelKey::Dividend => {
            let Some(d) = bundle.dividend() else {
                return Vec::new();
            };
            let mut out = Vec::new();
            match d.yield_position {
                BandPosition::Cheap => out.push("殖利率位於歷史高位區，價格偏低".to_string()),
                BandPosition::Expensive => out.push("殖利率位於歷史低位區，價格偏高".to_string()),
                BandPosition::Fair | BandPosition::Unknown => {}
            }
            if d.is_aristocrat {
                out.push("符合台股股利貴族標準（連續配息且穩定成長）".to_string());
            }
            out
        }
        ModelKey::Capex => match bundle.capex() {
            Some(c) if c.recent_growth_pct > 10.0 => vec![format!(
                "資本支出近期成長 {}%，處於擴張期",
                round2(c.recent_growth_pct)
            )],
            Some(c) if c.recent_growth_pct < -10.0 => vec![format!(
                "資本支出近期減少 {}%，擴張放緩",
                round2(c.recent_growth_pct.abs())
            )],
            _ => Vec::new(),
        },
        ModelKey::Per | ModelKey::Pbr | ModelKey::EvEbitda | ModelKey::Psr => bundle
            .band(key)
            .and_then(|b| band_sentence(key, b.position))
            .into_iter()
            .collect(),
    }
}

/// Map blended fair value against the current price to an action with ordered reasons:
/// headline, classification, then per-model sentences in model order.
pub fn recommend(
    valuation: &WeightedValuation,
    classification: &Classification,
    bundle: &ModelBundle,
    current_price: f64,
) -> Recommendation {
    let upside = upside_pct(valuation.fair_value, current_price);
    let (action, confidence, headline) = grade(upside, valuation.fair_value);

    let mut reasons = vec![
        headline,
        format!(
            "股票類型：{} — {}",
            classification.archetype, classification.description
        ),
    ];
    for key in ModelKey::ALL {
        reasons.extend(model_sentences(bundle, key));
    }

    Recommendation {
        action,
        confidence,
        upside_pct: round2(upside),
        fair_value: valuation.fair_value,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classification::{Archetype, Weights};
    use crate::domain::model::{
        BandDiagnostics, DividendDiagnostics, Diagnostics, ModelResult, PayoutGrade, Signal,
    };
    use std::collections::BTreeMap;

    fn valuation(fair_value: f64) -> WeightedValuation {
        WeightedValuation {
            fair_value,
            method: "DCF 100%".to_string(),
            weights: Weights::from_pairs([(ModelKey::Dcf, 1.0)]),
            per_model_fair_value: BTreeMap::new(),
            fallback: false,
        }
    }

    fn classification() -> Classification {
        Classification {
            archetype: Archetype::Growth,
            description: "高成長".to_string(),
            base_weights: Weights::from_pairs([(ModelKey::Dcf, 1.0)]),
        }
    }

    fn call(fair_value: f64, price: f64) -> Recommendation {
        recommend(&valuation(fair_value), &classification(), &ModelBundle::new(), price)
    }

    #[test]
    fn strong_buy_above_thirty_percent() {
        let r = call(135.0, 100.0);
        assert_eq!(r.action, Action::Buy);
        assert_eq!(r.confidence, Confidence::Strong);
        assert_eq!(r.upside_pct, 35.0);
    }

    #[test]
    fn thresholds_are_exclusive() {
        let r = call(130.0, 100.0);
        assert_eq!((r.action, r.confidence), (Action::Buy, Confidence::Normal));

        let r = call(110.0, 100.0);
        assert_eq!((r.action, r.confidence), (Action::Hold, Confidence::Neutral));

        let r = call(90.0, 100.0);
        assert_eq!((r.action, r.confidence), (Action::Sell, Confidence::Normal));

        let r = call(75.0, 100.0);
        assert_eq!((r.action, r.confidence), (Action::Sell, Confidence::Normal));

        let r = call(74.0, 100.0);
        assert_eq!((r.action, r.confidence), (Action::Sell, Confidence::Strong));
    }

    #[test]
    fn zero_price_means_zero_upside() {
        let r = call(50.0, 0.0);
        assert_eq!(r.upside_pct, 0.0);
        assert_eq!(r.action, Action::Hold);
    }

    #[test]
    fn reasons_are_assembled_in_fixed_order() {
        let band = |key, position| ModelResult {
            key,
            available: true,
            fair_value: Some(100.0),
            signal: Signal::Fair,
            reason: None,
            diagnostics: Diagnostics::Band(BandDiagnostics {
                position,
                current_multiple: Some(12.0),
                ttm_eps: Some(8.0),
            }),
        };
        let dividend = ModelResult {
            key: ModelKey::Dividend,
            available: true,
            fair_value: Some(100.0),
            signal: Signal::Undervalued,
            reason: None,
            diagnostics: Diagnostics::Dividend(DividendDiagnostics {
                current_yield_pct: 5.0,
                yield_position: BandPosition::Cheap,
                payout_grade: PayoutGrade::Safe,
                payout_ratio_pct: Some(60.0),
                consecutive_years: 12,
                is_aristocrat: true,
            }),
        };
        let bundle = ModelBundle::from_results([
            band(ModelKey::Psr, BandPosition::Expensive),
            dividend,
            band(ModelKey::Per, BandPosition::Cheap),
            band(ModelKey::Pbr, BandPosition::Fair),
        ]);

        let r = recommend(&valuation(120.0), &classification(), &bundle, 100.0);
        assert_eq!(r.reasons.len(), 6);
        assert!(r.reasons[0].starts_with("加權合理價 120"));
        assert_eq!(r.reasons[1], "股票類型：成長股 — 高成長");
        assert!(r.reasons[2].starts_with("PER"));
        assert_eq!(r.reasons[3], "殖利率位於歷史高位區，價格偏低");
        assert!(r.reasons[4].contains("股利貴族"));
        assert!(r.reasons[5].starts_with("PSR"));
    }

    #[test]
    fn unavailable_models_add_no_reasons() {
        let mut per = ModelResult::unavailable(ModelKey::Per, "eps < 0");
        per.diagnostics = Diagnostics::Band(BandDiagnostics {
            position: BandPosition::Cheap,
            current_multiple: None,
            ttm_eps: Some(-1.0),
        });
        let bundle = ModelBundle::from_results([per]);
        let r = recommend(&valuation(100.0), &classification(), &bundle, 100.0);
        assert_eq!(r.reasons.len(), 2);
    }
}
