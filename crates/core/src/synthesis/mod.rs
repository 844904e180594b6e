pub mod blender;
pub mod classifier;
pub mod recommend;
pub mod resynthesize;
pub mod risk;

use crate::domain::analysis::{AnalysisRecord, DeterministicView, FeedbackMeta, ModelSummary};
use crate::domain::model::{ModelBundle, ModelKey, ModelResult};
use crate::domain::valuation::Provenance;
use crate::error::{FetchError, ModelError};
use crate::feedback::adaptive;
use crate::feedback::cache::FeedbackCache;
use classifier::{ClassifierSignals, SectorTag};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One valuation model. Its formula lives outside the synthesis engine.
#[async_trait::async_trait]
pub trait ValuationModel: Send + Sync {
    fn key(&self) -> ModelKey;

    async fn evaluate(&self, ticker: &str) -> Result<ModelResult, ModelError>;
}

/// Fold per-model outcomes into a bundle; every failure becomes `available=false`.
pub fn collect_bundle(
    outcomes: impl IntoIterator<Item = (ModelKey, Result<ModelResult, ModelError>)>,
) -> ModelBundle {
    let mut bundle = ModelBundle::new();
    for (key, outcome) in outcomes {
        let result = match outcome {
            Ok(mut r) => {
                r.key = key;
                r
            }
            Err(err) => {
                tracing::warn!(model = %key, error = %err, "model unavailable");
                ModelResult::unavailable(key, err.to_string())
            }
        };
        bundle.insert(result);
    }
    bundle
}

/// Run every model concurrently, each under its own timeout.
pub async fn evaluate_all(
    models: &[Arc<dyn ValuationModel>],
    ticker: &str,
    timeout: Duration,
) -> ModelBundle {
    let futures = models.iter().map(|m| async move {
        let key = m.key();
        let outcome = match tokio::time::timeout(timeout, m.evaluate(ticker)).await {
            Ok(r) => r,
            Err(_) => Err(ModelError::Unavailable(FetchError::Timeout {
                dataset: key.to_string(),
                after: timeout,
            })),
        };
        (key, outcome)
    });
    collect_bundle(join_all(futures).await)
}

/// Everything the synthesis step needs for one security as of one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisInput {
    pub ticker: String,
    pub current_price: f64,
    #[serde(default)]
    pub industry: Option<String>,
    pub models: ModelBundle,
}

/// Classify, blend, recommend and annotate. When `feedback` holds a fresh entry for the
/// chosen archetype the blend uses feedback-adjusted weights and the deterministic
/// result is kept alongside.
pub fn synthesize(input: &SynthesisInput, feedback: Option<&FeedbackCache>) -> AnalysisRecord {
    let bundle = &input.models;
    let sector = input
        .industry
        .as_deref()
        .map(SectorTag::from_industry)
        .unwrap_or_default();
    let classification = classifier::classify(&ClassifierSignals::from_bundle(bundle, sector));

    let valuation = blender::blend(bundle, &classification.base_weights);
    let recommendation =
        recommend::recommend(&valuation, &classification, bundle, input.current_price);

    let mut record = AnalysisRecord {
        ticker: input.ticker.clone(),
        current_price: input.current_price,
        classification,
        weighted_valuation: valuation,
        recommendation,
        risks: risk::annotate(bundle),
        model_summaries: ModelKey::ALL
            .into_iter()
            .map(|k| match bundle.get(k) {
                Some(r) => ModelSummary::from(r),
                None => ModelSummary::from(&ModelResult::unavailable(k, "not evaluated")),
            })
            .collect(),
        provenance: Provenance::Deterministic,
        deterministic: None,
        external_classification: None,
        feedback: None,
    };

    if let Some(cache) = feedback {
        if let Some(adjusted) = apply_feedback(&record, bundle, cache) {
            record = adjusted;
        }
    }

    tracing::debug!(
        ticker = %record.ticker,
        archetype = %record.classification.archetype,
        fair_value = record.weighted_valuation.fair_value,
        action = record.recommendation.action.as_str(),
        "synthesis complete"
    );
    record
}

fn apply_feedback(
    record: &AnalysisRecord,
    bundle: &ModelBundle,
    cache: &FeedbackCache,
) -> Option<AnalysisRecord> {
    let archetype = record.classification.archetype;
    let entry = cache.get(archetype)?;
    let config = cache.config();
    let weights = adaptive::blend(
        &record.classification.base_weights,
        &entry.feedback.weights,
        config,
    )?;

    let mut valuation = blender::blend(bundle, &weights);
    if valuation.fallback {
        return None;
    }
    valuation.method = format!("{} {}", valuation.method, resynthesize::FEEDBACK_SUFFIX);
    let recommendation = recommend::recommend(
        &valuation,
        &record.classification,
        bundle,
        record.current_price,
    );

    Some(AnalysisRecord {
        weighted_valuation: valuation,
        recommendation,
        provenance: Provenance::Feedback,
        deterministic: Some(DeterministicView {
            classification: record.classification.clone(),
            weighted_valuation: record.weighted_valuation.clone(),
            recommendation: record.recommendation.clone(),
        }),
        feedback: Some(FeedbackMeta {
            blend_ratio: config.blend_ratio,
            computed_at: entry.computed_at,
            total_checks: entry.total_checks,
            sample_counts: entry.feedback.sample_counts,
        }),
        ..record.clone()
    })
}
