use crate::domain::classification::{Archetype, Classification, Weights};
use crate::domain::model::{ModelBundle, ModelKey, PayoutGrade};
use serde::{Deserialize, Serialize};

/// Coarse sector grouping the classifier cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SectorTag {
    Financial,
    Cyclical,
    #[default]
    Other,
}

const CYCLICAL_INDUSTRIES: &[&str] = &[
    "航運", "鋼鐵", "塑膠", "水泥", "橡膠", "造紙", "玻璃陶瓷", "化學", "油電燃氣",
];

impl SectorTag {
    pub fn from_industry(industry: &str) -> Self {
        let s = industry.trim();
        if s.contains("金融") || s.contains("保險") {
            SectorTag::Financial
        } else if CYCLICAL_INDUSTRIES.iter().any(|k| s.contains(k)) {
            SectorTag::Cyclical
        } else {
            SectorTag::Other
        }
    }
}

/// Scalar inputs to the decision list. Rates are in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSignals {
    pub growth_rate_pct: f64,
    pub dividend_yield_pct: f64,
    pub payout_grade: PayoutGrade,
    pub consecutive_dividend_years: u32,
    pub sector: SectorTag,
    pub capex_intensity_pct: f64,
    pub eps_negative: bool,
}

impl ClassifierSignals {
    pub fn from_bundle(bundle: &ModelBundle, sector: SectorTag) -> Self {
        let growth_rate_pct = bundle.dcf().map(|d| d.growth_rate_pct).unwrap_or(0.0);
        let dividend = bundle.dividend();
        let capex = bundle.capex();

        let ttm_eps = bundle
            .band(ModelKey::Per)
            .and_then(|d| d.ttm_eps)
            .or_else(|| capex.and_then(|d| d.ttm_eps));

        Self {
            growth_rate_pct,
            dividend_yield_pct: dividend.map(|d| d.current_yield_pct).unwrap_or(0.0),
            payout_grade: dividend.map(|d| d.payout_grade).unwrap_or_default(),
            consecutive_dividend_years: dividend.map(|d| d.consecutive_years).unwrap_or(0),
            sector,
            capex_intensity_pct: capex.map(|d| d.intensity_pct).unwrap_or(0.0),
            eps_negative: ttm_eps.map(|e| e < 0.0).unwrap_or(false),
        }
    }
}

type Rule = (fn(&ClassifierSignals) -> bool, fn(&ClassifierSignals) -> Classification);

/// Evaluated top to bottom; the first matching rule wins.
const RULES: &[Rule] = &[
    (|s| s.sector == SectorTag::Financial, |_| financial()),
    (|s| s.sector == SectorTag::Cyclical, |_| cyclical()),
    (
        |s| s.eps_negative && s.growth_rate_pct > 5.0,
        |_| loss_making_growth(),
    ),
    (
        |s| s.growth_rate_pct > 10.0 && s.dividend_yield_pct < 2.0,
        |s| growth(s.capex_intensity_pct > 15.0),
    ),
    (
        |s| {
            s.dividend_yield_pct >= 4.0
                && s.consecutive_dividend_years >= 5
                && s.payout_grade != PayoutGrade::Warning
        },
        |_| income_stock(),
    ),
    (
        |s| s.dividend_yield_pct >= 3.0 && s.growth_rate_pct >= 5.0,
        |_| value_growth(),
    ),
];

pub fn classify(signals: &ClassifierSignals) -> Classification {
    RULES
        .iter()
        .find(|(matches, _)| matches(signals))
        .map(|(_, build)| build(signals))
        .unwrap_or_else(mixed)
}

fn weights(dcf: f64, per: f64, pbr: f64, div: f64, capex: f64, ev: f64, psr: f64) -> Weights {
    Weights::from_pairs([
        (ModelKey::Dcf, dcf),
        (ModelKey::Per, per),
        (ModelKey::Pbr, pbr),
        (ModelKey::Dividend, div),
        (ModelKey::Capex, capex),
        (ModelKey::EvEbitda, ev),
        (ModelKey::Psr, psr),
    ])
}

fn financial() -> Classification {
    Classification {
        archetype: Archetype::Financial,
        description: "金融業現金流含存放款，不適用 FCF 折現，以 PBR 與股利為主".to_string(),
        base_weights: weights(0.0, 0.25, 0.45, 0.30, 0.0, 0.0, 0.0),
    }
}

fn cyclical() -> Classification {
    Classification {
        archetype: Archetype::Cyclical,
        description: "景氣循環產業，獲利波動大，以淨值與 EV/EBITDA 為主".to_string(),
        base_weights: weights(0.10, 0.15, 0.35, 0.15, 0.0, 0.25, 0.0),
    }
}

fn loss_making_growth() -> Classification {
    Classification {
        archetype: Archetype::LossMakingGrowth,
        description: "營收成長但尚未獲利，本益比失真，以營收倍數為主".to_string(),
        base_weights: weights(0.25, 0.0, 0.15, 0.0, 0.15, 0.05, 0.40),
    }
}

fn growth(capex_heavy: bool) -> Classification {
    if capex_heavy {
        Classification {
            archetype: Archetype::Growth,
            description: "高成長、高資本支出，前瞻 CapEx 模型與 DCF 並重".to_string(),
            base_weights: weights(0.30, 0.20, 0.05, 0.05, 0.25, 0.10, 0.05),
        }
    } else {
        Classification {
            archetype: Archetype::Growth,
            description: "高成長、低配息，DCF 模型更具參考價值".to_string(),
            base_weights: weights(0.40, 0.25, 0.05, 0.05, 0.10, 0.10, 0.05),
        }
    }
}

fn income_stock() -> Classification {
    Classification {
        archetype: Archetype::IncomeStock,
        description: "穩定配息、殖利率佳，股利模型更具參考價值".to_string(),
        base_weights: weights(0.15, 0.15, 0.10, 0.45, 0.0, 0.10, 0.05),
    }
}

fn value_growth() -> Classification {
    Classification {
        archetype: Archetype::ValueGrowth,
        description: "兼具成長與配息，多模型並重".to_string(),
        base_weights: weights(0.30, 0.20, 0.10, 0.25, 0.05, 0.10, 0.0),
    }
}

fn mixed() -> Classification {
    Classification {
        archetype: Archetype::Mixed,
        description: "特徵不明顯，建議多模型並行參考".to_string(),
        base_weights: weights(0.30, 0.20, 0.15, 0.15, 0.05, 0.10, 0.05),
    }
}

/// Base weights for an archetype, using the default variant where one has several.
pub fn base_classification(archetype: Archetype) -> Classification {
    match archetype {
        Archetype::Financial => financial(),
        Archetype::Cyclical => cyclical(),
        Archetype::LossMakingGrowth => loss_making_growth(),
        Archetype::Growth => growth(false),
        Archetype::IncomeStock => income_stock(),
        Archetype::ValueGrowth => value_growth(),
        Archetype::Mixed => mixed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> ClassifierSignals {
        ClassifierSignals {
            growth_rate_pct: 0.0,
            dividend_yield_pct: 0.0,
            payout_grade: PayoutGrade::Safe,
            consecutive_dividend_years: 0,
            sector: SectorTag::Other,
            capex_intensity_pct: 0.0,
            eps_negative: false,
        }
    }

    fn all_classifications() -> Vec<Classification> {
        let mut out: Vec<_> = Archetype::ALL.into_iter().map(base_classification).collect();
        out.push(growth(true));
        out
    }

    #[test]
    fn every_base_weight_vector_sums_to_one() {
        for c in all_classifications() {
            assert!(
                (c.base_weights.sum() - 1.0).abs() < 1e-9,
                "{} sums to {}",
                c.archetype,
                c.base_weights.sum()
            );
            for (_, w) in c.base_weights.iter() {
                assert!((0.0..=1.0).contains(&w));
            }
        }
    }

    #[test]
    fn sector_rules_take_precedence_over_everything() {
        let mut s = signals();
        s.sector = SectorTag::Financial;
        s.growth_rate_pct = 30.0;
        s.eps_negative = true;
        s.dividend_yield_pct = 6.0;
        s.consecutive_dividend_years = 10;
        assert_eq!(classify(&s).archetype, Archetype::Financial);

        s.sector = SectorTag::Cyclical;
        assert_eq!(classify(&s).archetype, Archetype::Cyclical);
    }

    #[test]
    fn loss_making_growth_beats_growth() {
        let mut s = signals();
        s.eps_negative = true;
        s.growth_rate_pct = 20.0;
        assert_eq!(classify(&s).archetype, Archetype::LossMakingGrowth);

        s.growth_rate_pct = 5.0;
        assert_eq!(classify(&s).archetype, Archetype::Mixed);
    }

    #[test]
    fn growth_selects_capex_heavy_variant() {
        let mut s = signals();
        s.growth_rate_pct = 12.0;
        s.dividend_yield_pct = 1.5;
        let light = classify(&s);
        assert_eq!(light.archetype, Archetype::Growth);
        assert_eq!(light.base_weights.get(ModelKey::Capex), 0.10);

        s.capex_intensity_pct = 20.0;
        let heavy = classify(&s);
        assert_eq!(heavy.archetype, Archetype::Growth);
        assert_eq!(heavy.base_weights.get(ModelKey::Capex), 0.25);
    }

    #[test]
    fn income_stock_requires_streak_and_safe_payout() {
        let mut s = signals();
        s.dividend_yield_pct = 4.0;
        s.consecutive_dividend_years = 5;
        assert_eq!(classify(&s).archetype, Archetype::IncomeStock);

        s.payout_grade = PayoutGrade::Warning;
        assert_eq!(classify(&s).archetype, Archetype::Mixed);

        s.payout_grade = PayoutGrade::Moderate;
        s.consecutive_dividend_years = 4;
        assert_eq!(classify(&s).archetype, Archetype::Mixed);
    }

    #[test]
    fn income_stock_checked_before_value_growth() {
        let mut s = signals();
        s.dividend_yield_pct = 5.0;
        s.consecutive_dividend_years = 8;
        s.growth_rate_pct = 6.0;
        assert_eq!(classify(&s).archetype, Archetype::IncomeStock);

        s.consecutive_dividend_years = 2;
        assert_eq!(classify(&s).archetype, Archetype::ValueGrowth);
    }

    #[test]
    fn growth_with_high_yield_falls_through() {
        let mut s = signals();
        s.growth_rate_pct = 15.0;
        s.dividend_yield_pct = 3.5;
        assert_eq!(classify(&s).archetype, Archetype::ValueGrowth);
    }

    #[test]
    fn classification_is_deterministic() {
        let mut s = signals();
        s.growth_rate_pct = 11.0;
        assert_eq!(classify(&s), classify(&s));
    }

    #[test]
    fn sector_tag_from_industry() {
        assert_eq!(SectorTag::from_industry("金融保險業"), SectorTag::Financial);
        assert_eq!(SectorTag::from_industry("航運業"), SectorTag::Cyclical);
        assert_eq!(SectorTag::from_industry("鋼鐵工業"), SectorTag::Cyclical);
        assert_eq!(SectorTag::from_industry("半導體業"), SectorTag::Other);
    }
}
