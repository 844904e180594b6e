use crate::backtest::metrics::{calc_mae, is_direction_correct};
use crate::backtest::BacktestOptions;
use crate::domain::accuracy::{
    AccuracyCheck, AccuracyUpdate, Horizon, HorizonErrors, HorizonOutcome, ModelErrors,
    NewAccuracyCheck,
};
use crate::domain::analysis::StoredAnalysis;
use crate::domain::model::ModelKey;
use crate::error::FetchError;
use crate::ingest::provider::MarketDataProvider;
use crate::ingest::types::{Dataset, PricePoint};
use crate::storage::AnalysisStore;
use crate::time::tw_market;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub use crate::domain::accuracy::PRICE_TOLERANCE_DAYS;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickerError {
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_id: Option<Uuid>,
    pub error: String,
}

impl TickerError {
    fn ticker(ticker: &str, error: impl ToString) -> Self {
        Self {
            ticker: ticker.to_string(),
            analysis_id: None,
            check_id: None,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BacktestReport {
    /// New accuracy checks written.
    pub processed: usize,
    /// Analyses left unchecked this pass; they are picked up again next run.
    pub skipped: usize,
    /// Existing checks that received a later horizon.
    pub backfilled: usize,
    pub errors: Vec<TickerError>,
}

/// Close of the trading day nearest to `base + offset_days`, within the tolerance.
/// On equal distance the earlier row in `prices` wins.
pub fn find_price_at_offset(prices: &[PricePoint], base: NaiveDate, offset_days: i64) -> Option<f64> {
    let target = base + chrono::Duration::days(offset_days);
    let mut best: Option<(i64, f64)> = None;
    for p in prices {
        let diff = (p.date - target).num_days().abs();
        if diff > PRICE_TOLERANCE_DAYS {
            continue;
        }
        if best.map_or(true, |(d, _)| diff < d) {
            best = Some((diff, p.close));
        }
    }
    best.map(|(_, close)| close)
}

fn record_errors(
    errors: &mut ModelErrors,
    fair_values: &BTreeMap<ModelKey, f64>,
    horizon: Horizon,
    actual: f64,
) {
    for (model, fv) in fair_values {
        errors
            .entry(*model)
            .or_insert_with(HorizonErrors::default)
            .set(horizon, calc_mae(*fv, actual));
    }
}

/// Outcome of one due horizon: priced when a close lies within tolerance, settled without
/// a close once the window is over, `None` while a close may still appear.
fn horizon_outcome(
    horizon: Horizon,
    analysis_date: NaiveDate,
    prices: &[PricePoint],
    today: NaiveDate,
    direction: impl FnOnce(f64) -> Option<bool>,
) -> Option<HorizonOutcome> {
    match find_price_at_offset(prices, analysis_date, horizon.days()) {
        Some(actual) => Some(HorizonOutcome::priced(actual, direction(actual))),
        None if horizon.window_closed(analysis_date, today) => Some(HorizonOutcome::without_close()),
        None => None,
    }
}

/// The accuracy check for an analysis given its realized prices. `Ok(None)` while the 30d
/// close may still appear; once the 30d window has closed without a trading day the check
/// is written with an empty 30d result so the analysis leaves the unchecked queue.
pub fn build_check(
    analysis: &StoredAnalysis,
    prices: &[PricePoint],
    today: NaiveDate,
) -> anyhow::Result<Option<NewAccuracyCheck>> {
    let record = &analysis.record;
    let fair_value = record.weighted_valuation.fair_value;
    anyhow::ensure!(
        analysis.is_scorable(),
        "analysis {} has no usable fair value or price (fair_value={fair_value}, price={})",
        analysis.id,
        record.current_price
    );

    let analysis_date = analysis.analysis_date();
    let action = record.recommendation.action;
    let model_fair_values = record.weighted_valuation.present_fair_values();

    let mut outcomes = BTreeMap::new();
    let mut model_errors = ModelErrors::new();
    for horizon in Horizon::ALL {
        if !horizon.is_due(analysis_date, today) {
            continue;
        }
        let direction = |actual: f64| is_direction_correct(action, record.current_price, Some(actual));
        let Some(outcome) = horizon_outcome(horizon, analysis_date, prices, today, direction) else {
            continue;
        };
        if let Some(actual) = outcome.actual_price {
            record_errors(&mut model_errors, &model_fair_values, horizon, actual);
        }
        outcomes.insert(horizon, outcome);
    }

    if !outcomes.contains_key(&Horizon::D30) {
        return Ok(None);
    }
    let outcome = |h: Horizon| outcomes.get(&h).copied().unwrap_or_default();

    Ok(Some(NewAccuracyCheck {
        analysis_id: analysis.id,
        ticker: analysis.ticker.clone(),
        analysis_date,
        predicted_fair_value: fair_value,
        predicted_action: action,
        price_at_analysis: record.current_price,
        classification_type: Some(record.classification.archetype),
        d30: outcome(Horizon::D30),
        d90: outcome(Horizon::D90),
        d180: outcome(Horizon::D180),
        model_fair_values,
        model_errors,
    }))
}

/// Later horizons that are due and still open: priced when a close is found, settled
/// without a close once their window is over. Settled horizons are never touched, so an
/// already backfilled check yields an empty update.
pub fn backfill_update(check: &AccuracyCheck, prices: &[PricePoint], today: NaiveDate) -> AccuracyUpdate {
    let mut update = AccuracyUpdate::default();
    let mut errors = check.model_errors.clone();
    let mut priced = false;

    for horizon in check.open_due_horizons(today) {
        if horizon == Horizon::D30 {
            continue;
        }
        let direction = |actual: f64| {
            is_direction_correct(check.predicted_action, check.price_at_analysis, Some(actual))
        };
        let Some(outcome) = horizon_outcome(horizon, check.analysis_date, prices, today, direction)
        else {
            continue;
        };
        if let Some(actual) = outcome.actual_price {
            record_errors(&mut errors, &check.model_fair_values, horizon, actual);
            priced = true;
        }
        update.outcomes.insert(horizon, outcome);
    }

    if priced && !check.model_fair_values.is_empty() {
        update.model_errors = Some(errors);
    }
    update
}

async fn fetch_prices(
    provider: &dyn MarketDataProvider,
    ticker: &str,
    start: NaiveDate,
    options: &BacktestOptions,
) -> Result<Vec<PricePoint>, FetchError> {
    if !options.request_spacing.is_zero() {
        tokio::time::sleep(options.request_spacing).await;
    }
    let series = tokio::time::timeout(options.fetch_timeout, provider.fetch_price_series(ticker, start))
        .await
        .map_err(|_| FetchError::Timeout {
            dataset: Dataset::StockPrice.as_str().to_string(),
            after: options.fetch_timeout,
        })??;
    if series.is_empty() {
        return Err(FetchError::Empty {
            dataset: Dataset::StockPrice.as_str().to_string(),
        });
    }
    Ok(series)
}

/// One price fetch per ticker from its earliest date, `concurrency` tickers at a time.
async fn fetch_grouped<T: Send>(
    provider: &dyn MarketDataProvider,
    groups: BTreeMap<String, (NaiveDate, Vec<T>)>,
    options: &BacktestOptions,
) -> Vec<(String, Vec<T>, Result<Vec<PricePoint>, FetchError>)> {
    stream::iter(groups)
        .map(|(ticker, (start, items))| async move {
            let prices = fetch_prices(provider, &ticker, start, options).await;
            (ticker, items, prices)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await
}

/// Check analyses old enough to have a 30d outcome, then backfill due 90d/180d horizons.
///
/// A failed fetch only skips that ticker. Store reads that fail abort the run.
pub async fn run_backtest(
    store: &dyn AnalysisStore,
    provider: &dyn MarketDataProvider,
    options: &BacktestOptions,
    now: DateTime<Utc>,
) -> anyhow::Result<BacktestReport> {
    let today = tw_market::local_date(now);
    let mut report = BacktestReport::default();

    let unchecked = store
        .get_unchecked(options.min_days_ago, now, options.max_results)
        .await
        .context("load unchecked analyses failed")?;

    let mut groups: BTreeMap<String, (NaiveDate, Vec<StoredAnalysis>)> = BTreeMap::new();
    for analysis in unchecked {
        let date = analysis.analysis_date();
        let entry = groups
            .entry(analysis.ticker.clone())
            .or_insert_with(|| (date, Vec::new()));
        entry.0 = entry.0.min(date);
        entry.1.push(analysis);
    }
    tracing::info!(tickers = groups.len(), "backtest: checking unchecked analyses");

    for (ticker, analyses, prices) in fetch_grouped(provider, groups, options).await {
        let prices = match prices {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%ticker, error = %err, "backtest: price fetch failed; skipping ticker");
                report.skipped += analyses.len();
                report.errors.push(TickerError::ticker(&ticker, &err));
                continue;
            }
        };

        for analysis in analyses {
            let saved = match build_check(&analysis, &prices, today) {
                Ok(Some(check)) => store.save_accuracy_check(&check).await.map(Some),
                Ok(None) => Ok(None),
                Err(err) => Err(err),
            };
            match saved {
                Ok(Some(check_id)) => {
                    tracing::debug!(%ticker, analysis_id = %analysis.id, %check_id, "accuracy check created");
                    report.processed += 1;
                }
                Ok(None) => {
                    tracing::info!(%ticker, analysis_id = %analysis.id, "30d window still open without a close; left unchecked");
                    report.skipped += 1;
                }
                Err(err) => {
                    tracing::warn!(%ticker, analysis_id = %analysis.id, error = %format!("{err:#}"), "accuracy check failed");
                    report.skipped += 1;
                    report.errors.push(TickerError {
                        analysis_id: Some(analysis.id),
                        ..TickerError::ticker(&ticker, format!("{err:#}"))
                    });
                }
            }
        }
    }

    let partial = store
        .get_partial(now)
        .await
        .context("load partial accuracy checks failed")?;

    let mut groups: BTreeMap<String, (NaiveDate, Vec<AccuracyCheck>)> = BTreeMap::new();
    for check in partial {
        let entry = groups
            .entry(check.ticker.clone())
            .or_insert_with(|| (check.analysis_date, Vec::new()));
        entry.0 = entry.0.min(check.analysis_date);
        entry.1.push(check);
    }
    tracing::info!(tickers = groups.len(), "backtest: backfilling partial checks");

    for (ticker, checks, prices) in fetch_grouped(provider, groups, options).await {
        let prices = match prices {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%ticker, error = %err, "backfill: price fetch failed; skipping ticker");
                report.errors.push(TickerError::ticker(&ticker, &err));
                continue;
            }
        };

        for check in checks {
            let update = backfill_update(&check, &prices, today);
            if update.is_empty() {
                continue;
            }
            match store.update_accuracy_check(check.id, &update).await {
                Ok(()) => report.backfilled += 1,
                Err(err) => {
                    tracing::warn!(%ticker, check_id = %check.id, error = %format!("{err:#}"), "backfill update failed");
                    report.errors.push(TickerError {
                        check_id: Some(check.id),
                        ..TickerError::ticker(&ticker, format!("{err:#}"))
                    });
                }
            }
        }
    }

    tracing::info!(
        processed = report.processed,
        skipped = report.skipped,
        backfilled = report.backfilled,
        errors = report.errors.len(),
        "backtest complete"
    );
    Ok(report)
}
