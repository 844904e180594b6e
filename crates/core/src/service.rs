//! Operations shared by the HTTP API and the worker: each one loads from the store,
//! runs the pure engine and optionally persists the result.

use crate::backtest::{run_backtest, BacktestOptions, BacktestReport};
use crate::domain::analysis::{AnalysisRecord, FeedbackMeta, StoredAnalysis};
use crate::domain::contract::{validate_batch, ExternalProposal};
use crate::error::GuardrailViolation;
use crate::feedback::adaptive;
use crate::feedback::cache::{CacheStatus, FeedbackCache};
use crate::ingest::MarketDataProvider;
use crate::storage::lock::{self, LockScope};
use crate::storage::AnalysisStore;
use crate::synthesis::{resynthesize, synthesize, SynthesisInput};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Taiwan listings: four to six digits.
pub fn is_valid_ticker(ticker: &str) -> bool {
    (4..=6).contains(&ticker.len()) && ticker.bytes().all(|b| b.is_ascii_digit())
}

/// Synthesize and persist one analysis.
pub async fn analyze_and_save(
    store: &dyn AnalysisStore,
    input: &SynthesisInput,
    feedback: Option<&FeedbackCache>,
) -> anyhow::Result<StoredAnalysis> {
    anyhow::ensure!(is_valid_ticker(&input.ticker), "invalid ticker {:?}", input.ticker);
    let record = synthesize(input, feedback);
    let stored = store
        .save_analysis(&record)
        .await
        .with_context(|| format!("save analysis for {} failed", input.ticker))?;
    tracing::info!(
        ticker = %stored.ticker,
        analysis_id = %stored.id,
        provenance = ?stored.record.provenance,
        "analysis saved"
    );
    Ok(stored)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResynthesisSource {
    LlmEnhanced,
    Feedback,
    DeterministicFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resynthesis {
    pub ticker: String,
    pub source: ResynthesisSource,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guardrail_errors: Vec<String>,
    pub result: AnalysisRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_id: Option<Uuid>,
}

impl Resynthesis {
    /// The deterministic result behind `latest`, even when `latest` itself was reweighted.
    fn fallback(latest: StoredAnalysis, errors: Vec<String>) -> Self {
        Self {
            result: latest.record.deterministic_record(),
            ticker: latest.ticker,
            source: ResynthesisSource::DeterministicFallback,
            guardrail_errors: errors,
            saved_id: None,
        }
    }
}

async fn finish(
    store: &dyn AnalysisStore,
    ticker: &str,
    source: ResynthesisSource,
    record: AnalysisRecord,
    save: bool,
) -> anyhow::Result<Resynthesis> {
    let saved_id = if save {
        let stored = store
            .save_analysis(&record)
            .await
            .with_context(|| format!("save resynthesized analysis for {ticker} failed"))?;
        Some(stored.id)
    } else {
        None
    };
    Ok(Resynthesis {
        ticker: ticker.to_string(),
        source,
        guardrail_errors: Vec::new(),
        result: record,
        saved_id,
    })
}

fn apply_proposal(
    latest: &StoredAnalysis,
    checked: Result<crate::domain::contract::SanitizedProposal, GuardrailViolation>,
) -> Result<AnalysisRecord, Vec<String>> {
    let sanitized = checked.map_err(|v| v.errors)?;
    resynthesize::with_proposal(&latest.record, &sanitized)
        .ok_or_else(|| vec!["no weighted model has a recorded fair value".to_string()])
}

/// Reweight the latest analysis of `ticker` with an external proposal.
/// `Ok(None)` when the ticker has no analysis.
pub async fn resynthesize_with_proposal(
    store: &dyn AnalysisStore,
    ticker: &str,
    proposal: ExternalProposal,
    save: bool,
) -> anyhow::Result<Option<Resynthesis>> {
    let Some(latest) = store
        .get_latest(ticker)
        .await
        .with_context(|| format!("load latest analysis for {ticker} failed"))?
    else {
        return Ok(None);
    };

    let checked = proposal.validate_and_into_sanitized(&latest.record.model_availability());
    match apply_proposal(&latest, checked) {
        Ok(record) => Ok(Some(
            finish(store, ticker, ResynthesisSource::LlmEnhanced, record, save).await?,
        )),
        Err(errors) => {
            tracing::info!(%ticker, violations = errors.len(), "proposal rejected; keeping deterministic result");
            Ok(Some(Resynthesis::fallback(latest, errors)))
        }
    }
}

/// Reweight the latest analysis of `ticker` with fresh feedback weights for its archetype.
pub async fn resynthesize_with_feedback(
    store: &dyn AnalysisStore,
    cache: &FeedbackCache,
    ticker: &str,
    save: bool,
) -> anyhow::Result<Option<Resynthesis>> {
    let Some(latest) = store
        .get_latest(ticker)
        .await
        .with_context(|| format!("load latest analysis for {ticker} failed"))?
    else {
        return Ok(None);
    };

    let classification = latest.record.deterministic_view().classification;
    let Some(entry) = cache.get(classification.archetype) else {
        let reason = format!("no fresh feedback for {}", classification.archetype);
        return Ok(Some(Resynthesis::fallback(latest, vec![reason])));
    };
    let config = cache.config();
    let reweighted = adaptive::blend(&classification.base_weights, &entry.feedback.weights, config)
        .and_then(|weights| {
            let meta = FeedbackMeta {
                blend_ratio: config.blend_ratio,
                computed_at: entry.computed_at,
                total_checks: entry.total_checks,
                sample_counts: entry.feedback.sample_counts.clone(),
            };
            resynthesize::with_feedback(&latest.record, &weights, meta)
        });

    match reweighted {
        Some(record) => Ok(Some(
            finish(store, ticker, ResynthesisSource::Feedback, record, save).await?,
        )),
        None => {
            let reason = "feedback weights cover no model with a recorded fair value".to_string();
            Ok(Some(Resynthesis::fallback(latest, vec![reason])))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub enhanced: usize,
    pub fallback: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResynthesis {
    pub results: Vec<Resynthesis>,
    pub errors: Vec<BatchError>,
    pub summary: BatchSummary,
}

/// Validate and apply proposals for many tickers. Unknown or invalid tickers are
/// reported per ticker and do not stop the batch.
pub async fn resynthesize_batch(
    store: &dyn AnalysisStore,
    batch: BTreeMap<String, ExternalProposal>,
    save: bool,
) -> BatchResynthesis {
    let mut out = BatchResynthesis {
        summary: BatchSummary {
            total: batch.len(),
            ..Default::default()
        },
        ..Default::default()
    };

    let mut latest_by_ticker = BTreeMap::new();
    let mut accepted = BTreeMap::new();
    for (ticker, proposal) in batch {
        if !is_valid_ticker(&ticker) {
            out.errors.push(BatchError {
                error: format!("invalid ticker format: {ticker}"),
                ticker,
            });
            continue;
        }
        match store.get_latest(&ticker).await {
            Ok(Some(latest)) => {
                latest_by_ticker.insert(ticker.clone(), latest);
                accepted.insert(ticker, proposal);
            }
            Ok(None) => out.errors.push(BatchError {
                error: format!("no analysis found for {ticker}"),
                ticker,
            }),
            Err(err) => out.errors.push(BatchError {
                error: format!("{err:#}"),
                ticker,
            }),
        }
    }

    let availability = latest_by_ticker
        .iter()
        .map(|(t, s)| (t.clone(), s.record.model_availability()))
        .collect();

    for (ticker, checked) in validate_batch(accepted, &availability) {
        let Some(latest) = latest_by_ticker.remove(&ticker) else {
            continue;
        };
        match apply_proposal(&latest, checked) {
            Ok(record) => {
                match finish(store, &ticker, ResynthesisSource::LlmEnhanced, record, save).await {
                    Ok(r) => {
                        out.summary.enhanced += 1;
                        out.results.push(r);
                    }
                    Err(err) => out.errors.push(BatchError {
                        ticker,
                        error: format!("{err:#}"),
                    }),
                }
            }
            Err(errors) => {
                out.summary.fallback += 1;
                out.results.push(Resynthesis::fallback(latest, errors));
            }
        }
    }

    out.summary.failed = out.errors.len();
    tracing::info!(
        total = out.summary.total,
        enhanced = out.summary.enhanced,
        fallback = out.summary.fallback,
        failed = out.summary.failed,
        "batch resynthesis complete"
    );
    out
}

/// Run a backtest pass while holding the backtest advisory lock.
/// `Ok(None)` when another scan holds the lock.
pub async fn run_backtest_locked(
    pool: &sqlx::PgPool,
    store: &dyn AnalysisStore,
    provider: &dyn MarketDataProvider,
    options: &BacktestOptions,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<BacktestReport>> {
    let mut conn = pool.acquire().await.context("acquire lock connection failed")?;
    if !lock::try_acquire(&mut conn, LockScope::Backtest).await? {
        tracing::warn!("backtest lock not acquired; another scan in progress");
        return Ok(None);
    }
    let result = run_backtest(store, provider, options, now).await;
    if let Err(err) = lock::release(&mut conn, LockScope::Backtest).await {
        tracing::warn!(error = %format!("{err:#}"), "backtest lock release failed");
    }
    result.map(Some)
}

/// Recompute the feedback cache from every stored accuracy check.
pub async fn refresh_feedback(
    store: &dyn AnalysisStore,
    cache: &FeedbackCache,
) -> anyhow::Result<CacheStatus> {
    let checks = store
        .get_all_accuracy_checks()
        .await
        .context("load accuracy checks for feedback failed")?;
    cache.refresh(&checks);
    Ok(cache.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::accuracy::AccuracyCheck;
    use crate::domain::classification::Archetype;
    use crate::domain::valuation::Provenance;
    use crate::feedback::cache::tests::growth_checks;
    use crate::feedback::FeedbackConfig;
    use crate::storage::MemoryStore;
    use crate::synthesis::tests::growth_input;
    use serde_json::json;

    fn proposal(weights: serde_json::Value) -> ExternalProposal {
        serde_json::from_value(json!({
            "type": "價值成長股",
            "description": "穩健成長",
            "weights": weights,
            "confidence": "HIGH",
        }))
        .unwrap()
    }

    fn valid() -> ExternalProposal {
        proposal(json!({
            "dcf": 0.5, "per": 0.3, "pbr": 0.2, "div": 0, "capex": 0, "evEbitda": 0, "psr": 0
        }))
    }

    fn uses_unavailable_model() -> ExternalProposal {
        proposal(json!({
            "dcf": 0.4, "per": 0.2, "pbr": 0.2, "div": 0.2, "capex": 0, "evEbitda": 0, "psr": 0
        }))
    }

    #[test]
    fn ticker_format() {
        assert!(is_valid_ticker("2330"));
        assert!(is_valid_ticker("006208"));
        assert!(!is_valid_ticker("233"));
        assert!(!is_valid_ticker("2330.TW"));
    }

    #[tokio::test]
    async fn accepted_proposal_is_saved_as_a_new_row() {
        let store = MemoryStore::new();
        let original = analyze_and_save(&store, &growth_input(), None).await.unwrap();

        let out = resynthesize_with_proposal(&store, "2330", valid(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.source, ResynthesisSource::LlmEnhanced);
        assert!(out.guardrail_errors.is_empty());
        assert_eq!(out.result.classification.archetype, Archetype::ValueGrowth);
        assert_eq!(
            out.result.deterministic.as_ref().unwrap().weighted_valuation,
            original.record.weighted_valuation
        );

        let latest = store.get_latest("2330").await.unwrap().unwrap();
        assert_eq!(Some(latest.id), out.saved_id);
        assert_eq!(latest.record.provenance, Provenance::LlmEnhanced);
        assert_eq!(store.get_latest_two("2330").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_proposal_returns_stored_result_untouched() {
        let store = MemoryStore::new();
        let original = analyze_and_save(&store, &growth_input(), None).await.unwrap();

        let out = resynthesize_with_proposal(&store, "2330", uses_unavailable_model(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.source, ResynthesisSource::DeterministicFallback);
        assert!(out.guardrail_errors.iter().any(|e| e.contains("div")));
        assert_eq!(out.result, original.record);
        assert_eq!(out.saved_id, None);
        assert_eq!(store.get_latest_two("2330").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejection_after_saved_proposal_falls_back_to_deterministic_result() {
        let store = MemoryStore::new();
        let original = analyze_and_save(&store, &growth_input(), None).await.unwrap();
        resynthesize_with_proposal(&store, "2330", valid(), true)
            .await
            .unwrap()
            .unwrap();
        let overweight = proposal(json!({
            "dcf": 0.6, "per": 0.2, "pbr": 0.2, "div": 0, "capex": 0, "evEbitda": 0, "psr": 0
        }));

        let out = resynthesize_with_proposal(&store, "2330", overweight, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.source, ResynthesisSource::DeterministicFallback);
        assert!(out.guardrail_errors.iter().any(|e| e.contains("dcf")));
        assert_eq!(out.result.provenance, Provenance::Deterministic);
        assert!(!out.result.weighted_valuation.method.ends_with("(LLM)"));
        assert!(out.result.external_classification.is_none());
        assert_eq!(out.result, original.record);
    }

    #[tokio::test]
    async fn unknown_ticker_has_nothing_to_resynthesize() {
        let store = MemoryStore::new();
        let out = resynthesize_with_proposal(&store, "2330", valid(), false).await.unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn batch_reports_per_ticker_outcomes() {
        let store = MemoryStore::new();
        analyze_and_save(&store, &growth_input(), None).await.unwrap();
        let mut other = growth_input();
        other.ticker = "2454".to_string();
        analyze_and_save(&store, &other, None).await.unwrap();

        let batch = BTreeMap::from([
            ("2330".to_string(), valid()),
            ("2454".to_string(), uses_unavailable_model()),
            ("9999".to_string(), valid()),
            ("abc".to_string(), valid()),
        ]);
        let out = resynthesize_batch(&store, batch, false).await;

        assert_eq!(
            out.summary,
            BatchSummary {
                total: 4,
                enhanced: 1,
                fallback: 1,
                failed: 2
            }
        );
        let failed: Vec<&str> = out.errors.iter().map(|e| e.ticker.as_str()).collect();
        assert!(failed.contains(&"9999") && failed.contains(&"abc"));
        let fallback = out.results.iter().find(|r| r.ticker == "2454").unwrap();
        assert_eq!(fallback.source, ResynthesisSource::DeterministicFallback);
    }

    #[tokio::test]
    async fn feedback_resynthesis_needs_a_fresh_entry() {
        let store = MemoryStore::new();
        analyze_and_save(&store, &growth_input(), None).await.unwrap();
        let cache = FeedbackCache::new(FeedbackConfig::default());

        let out = resynthesize_with_feedback(&store, &cache, "2330", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.source, ResynthesisSource::DeterministicFallback);

        let checks: Vec<AccuracyCheck> = growth_checks(5);
        cache.refresh(&checks);
        let out = resynthesize_with_feedback(&store, &cache, "2330", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.source, ResynthesisSource::Feedback);
        assert!(out.result.weighted_valuation.method.ends_with("(Feedback)"));
        assert_eq!(out.result.feedback.as_ref().unwrap().total_checks, 5);
    }

    #[tokio::test]
    async fn refresh_reads_every_check_from_the_store() {
        let store = MemoryStore::new();
        let cache = FeedbackCache::new(FeedbackConfig::default());
        let status = refresh_feedback(&store, &cache).await.unwrap();
        assert!(status.initialized);
        assert_eq!(status.total_checks, 0);
        assert!(status.covered_types.is_empty());
    }
}
