use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of valuation models the synthesis engine knows how to weigh.
///
/// Ordering matters: it is the fixed order used for reason assembly, method strings and
/// per-model maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelKey {
    #[serde(rename = "dcf")]
    Dcf,
    #[serde(rename = "per")]
    Per,
    #[serde(rename = "pbr")]
    Pbr,
    #[serde(rename = "div")]
    Dividend,
    #[serde(rename = "capex")]
    Capex,
    #[serde(rename = "evEbitda")]
    EvEbitda,
    #[serde(rename = "psr")]
    Psr,
}

impl ModelKey {
    pub const ALL: [ModelKey; 7] = [
        ModelKey::Dcf,
        ModelKey::Per,
        ModelKey::Pbr,
        ModelKey::Dividend,
        ModelKey::Capex,
        ModelKey::EvEbitda,
        ModelKey::Psr,
    ];

    /// Wire key, as used in persisted JSON and external proposals.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKey::Dcf => "dcf",
            ModelKey::Per => "per",
            ModelKey::Pbr => "pbr",
            ModelKey::Dividend => "div",
            ModelKey::Capex => "capex",
            ModelKey::EvEbitda => "evEbitda",
            ModelKey::Psr => "psr",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ModelKey::Dcf => "DCF",
            ModelKey::Per => "PER",
            ModelKey::Pbr => "PBR",
            ModelKey::Dividend => "股利",
            ModelKey::Capex => "CapEx",
            ModelKey::EvEbitda => "EV/EBITDA",
            ModelKey::Psr => "PSR",
        }
    }

    pub fn from_wire(s: &str) -> Option<ModelKey> {
        ModelKey::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    #[serde(rename = "UNDERVALUED")]
    Undervalued,
    #[serde(rename = "FAIR")]
    Fair,
    #[serde(rename = "OVERVALUED")]
    Overvalued,
    #[serde(rename = "N/A")]
    NotApplicable,
}

/// Where the current multiple sits inside the model's own historical band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BandPosition {
    Cheap,
    Fair,
    Expensive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutGrade {
    Safe,
    Moderate,
    Warning,
    #[default]
    #[serde(rename = "N/A")]
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SectorConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcfDiagnostics {
    /// Trailing growth rate used for the projection, in percent.
    pub growth_rate_pct: f64,
    pub wacc_pct: f64,
    /// Base free cash flow the projection starts from.
    pub fcf_base: f64,
    /// Terminal value share of total present value, in percent.
    pub terminal_ratio_pct: f64,
    /// Shares outstanding had to be estimated from a default.
    #[serde(default)]
    pub shares_estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendDiagnostics {
    pub current_yield_pct: f64,
    #[serde(default)]
    pub yield_position: BandPosition,
    #[serde(default)]
    pub payout_grade: PayoutGrade,
    pub payout_ratio_pct: Option<f64>,
    pub consecutive_years: u32,
    #[serde(default)]
    pub is_aristocrat: bool,
}

/// Shared by the multiple-band models (PER, PBR, EV/EBITDA, PSR).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandDiagnostics {
    #[serde(default)]
    pub position: BandPosition,
    pub current_multiple: Option<f64>,
    pub ttm_eps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapexDiagnostics {
    pub sector_confidence: SectorConfidence,
    /// Average CapEx over revenue, in percent.
    pub intensity_pct: f64,
    pub recent_growth_pct: f64,
    pub ttm_eps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostics {
    #[default]
    None,
    Dcf(DcfDiagnostics),
    Dividend(DividendDiagnostics),
    Band(BandDiagnostics),
    Capex(CapexDiagnostics),
}

/// Output of one valuation model for one security as of one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub key: ModelKey,
    pub available: bool,
    pub fair_value: Option<f64>,
    pub signal: Signal,
    /// Why the model is unavailable, when it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

impl ModelResult {
    pub fn unavailable(key: ModelKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            available: false,
            fair_value: None,
            signal: Signal::NotApplicable,
            reason: Some(reason.into()),
            diagnostics: Diagnostics::None,
        }
    }

    /// Fair value when the model may contribute to a blend: available and strictly positive.
    pub fn usable_fair_value(&self) -> Option<f64> {
        if !self.available {
            return None;
        }
        self.fair_value.filter(|v| v.is_finite() && *v > 0.0)
    }
}

/// Every model's result for one analysis, keyed by model.
///
/// Missing keys are treated exactly like `available=false`. Serialized as a list of
/// results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ModelResult>", into = "Vec<ModelResult>")]
pub struct ModelBundle {
    results: BTreeMap<ModelKey, ModelResult>,
}

impl ModelBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_results(results: impl IntoIterator<Item = ModelResult>) -> Self {
        let mut bundle = Self::new();
        for r in results {
            bundle.insert(r);
        }
        bundle
    }

    pub fn insert(&mut self, result: ModelResult) {
        self.results.insert(result.key, result);
    }

    pub fn get(&self, key: ModelKey) -> Option<&ModelResult> {
        self.results.get(&key)
    }

    pub fn is_available(&self, key: ModelKey) -> bool {
        self.get(key).map(|r| r.available).unwrap_or(false)
    }

    pub fn usable_fair_value(&self, key: ModelKey) -> Option<f64> {
        self.get(key).and_then(ModelResult::usable_fair_value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelResult> {
        self.results.values()
    }

    pub fn dcf(&self) -> Option<&DcfDiagnostics> {
        match self.get(ModelKey::Dcf).map(|r| &r.diagnostics) {
            Some(Diagnostics::Dcf(d)) => Some(d),
            _ => None,
        }
    }

    pub fn dividend(&self) -> Option<&DividendDiagnostics> {
        match self.get(ModelKey::Dividend) {
            Some(ModelResult {
                available: true,
                diagnostics: Diagnostics::Dividend(d),
                ..
            }) => Some(d),
            _ => None,
        }
    }

    pub fn band(&self, key: ModelKey) -> Option<&BandDiagnostics> {
        match self.get(key) {
            Some(ModelResult {
                available: true,
                diagnostics: Diagnostics::Band(d),
                ..
            }) => Some(d),
            _ => None,
        }
    }

    pub fn capex(&self) -> Option<&CapexDiagnostics> {
        match self.get(ModelKey::Capex) {
            Some(ModelResult {
                available: true,
                diagnostics: Diagnostics::Capex(d),
                ..
            }) => Some(d),
            _ => None,
        }
    }

    /// Availability per model, with every key present.
    pub fn availability(&self) -> BTreeMap<ModelKey, bool> {
        ModelKey::ALL
            .into_iter()
            .map(|k| (k, self.usable_fair_value(k).is_some()))
            .collect()
    }
}

impl From<Vec<ModelResult>> for ModelBundle {
    fn from(results: Vec<ModelResult>) -> Self {
        Self::from_results(results)
    }
}

impl From<ModelBundle> for Vec<ModelResult> {
    fn from(bundle: ModelBundle) -> Self {
        bundle.results.into_values().collect()
    }
}
