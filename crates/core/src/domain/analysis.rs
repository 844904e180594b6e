use crate::domain::classification::{Archetype, Classification};
use crate::domain::model::{ModelKey, ModelResult, Signal};
use crate::domain::recommendation::Recommendation;
use crate::domain::valuation::{Provenance, WeightedValuation};
use crate::time::tw_market;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub key: ModelKey,
    pub available: bool,
    pub fair_value: Option<f64>,
    pub signal: Signal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&ModelResult> for ModelSummary {
    fn from(r: &ModelResult) -> Self {
        Self {
            key: r.key,
            available: r.available,
            fair_value: r.fair_value,
            signal: r.signal,
            reason: r.reason.clone(),
        }
    }
}

/// The deterministic result kept alongside a reweighted one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterministicView {
    pub classification: Classification,
    pub weighted_valuation: WeightedValuation,
    pub recommendation: Recommendation,
}

/// Classification details supplied by an accepted external proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalClassification {
    #[serde(rename = "type")]
    pub archetype: Archetype,
    pub description: String,
    pub confidence: String,
    pub narrative: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMeta {
    pub blend_ratio: f64,
    pub computed_at: DateTime<Utc>,
    pub total_checks: usize,
    pub sample_counts: BTreeMap<ModelKey, usize>,
}

/// Everything one analysis invocation produced. Persisted as-is and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub ticker: String,
    pub current_price: f64,
    pub classification: Classification,
    pub weighted_valuation: WeightedValuation,
    pub recommendation: Recommendation,
    pub risks: Vec<String>,
    pub model_summaries: Vec<ModelSummary>,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deterministic: Option<DeterministicView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_classification: Option<ExternalClassification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackMeta>,
}

impl AnalysisRecord {
    /// The deterministic half of this record: itself when it was never reweighted.
    pub fn deterministic_view(&self) -> DeterministicView {
        match &self.deterministic {
            Some(d) => d.clone(),
            None => DeterministicView {
                classification: self.classification.clone(),
                weighted_valuation: self.weighted_valuation.clone(),
                recommendation: self.recommendation.clone(),
            },
        }
    }

    /// This record with every reweighting stripped: deterministic classification,
    /// valuation and recommendation under `Provenance::Deterministic`.
    pub fn deterministic_record(&self) -> AnalysisRecord {
        let view = self.deterministic_view();
        AnalysisRecord {
            classification: view.classification,
            weighted_valuation: view.weighted_valuation,
            recommendation: view.recommendation,
            provenance: Provenance::Deterministic,
            deterministic: None,
            external_classification: None,
            feedback: None,
            ..self.clone()
        }
    }

    /// Model availability as recorded: a model counts as available iff a fair value was kept.
    pub fn model_availability(&self) -> BTreeMap<ModelKey, bool> {
        let fair_values = &self.weighted_valuation.per_model_fair_value;
        ModelKey::ALL
            .into_iter()
            .map(|k| (k, fair_values.get(&k).copied().flatten().is_some()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub id: Uuid,
    pub ticker: String,
    pub created_at: DateTime<Utc>,
    pub record: AnalysisRecord,
}

impl StoredAnalysis {
    /// Taiwan calendar date of the analysis; horizons are counted from it.
    pub fn analysis_date(&self) -> NaiveDate {
        tw_market::local_date(self.created_at)
    }

    /// Has the positive fair value and price a backtest needs.
    pub fn is_scorable(&self) -> bool {
        self.record.weighted_valuation.fair_value > 0.0 && self.record.current_price > 0.0
    }
}
