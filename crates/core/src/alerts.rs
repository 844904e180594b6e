//! Watch rules evaluated against the newest analyses of a ticker and its latest close.

use crate::domain::analysis::StoredAnalysis;
use crate::domain::classification::Archetype;
use crate::error::FetchError;
use crate::ingest::MarketDataProvider;
use crate::storage::AnalysisStore;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How far back to look for the latest close; covers the longest market closure.
const LATEST_CLOSE_LOOKBACK_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationChange {
    pub ticker: String,
    pub previous: Archetype,
    pub current: Archetype,
    pub previous_at: DateTime<Utc>,
    pub current_at: DateTime<Utc>,
    pub message: String,
}

/// Archetype a record ended up with, preferring an accepted external classification.
fn effective_archetype(analysis: &StoredAnalysis) -> Archetype {
    analysis
        .record
        .external_classification
        .as_ref()
        .map(|c| c.archetype)
        .unwrap_or(analysis.record.classification.archetype)
}

/// Compare the newest two analyses (newest first).
pub fn detect_change(latest_two: &[StoredAnalysis]) -> Option<ClassificationChange> {
    let [current, previous] = latest_two else {
        return None;
    };
    let (prev_type, cur_type) = (effective_archetype(previous), effective_archetype(current));
    if prev_type == cur_type {
        return None;
    }
    Some(ClassificationChange {
        ticker: current.ticker.clone(),
        previous: prev_type,
        current: cur_type,
        previous_at: previous.created_at,
        current_at: current.created_at,
        message: format!("{} 分類從「{prev_type}」變為「{cur_type}」", current.ticker),
    })
}

pub async fn classification_change(
    store: &dyn AnalysisStore,
    ticker: &str,
) -> anyhow::Result<Option<ClassificationChange>> {
    let rows = store
        .get_latest_two(ticker)
        .await
        .with_context(|| format!("load latest analyses for {ticker} failed"))?;
    Ok(detect_change(&rows))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    /// Current price at or above the threshold.
    PriceAbove { threshold: f64 },
    /// Current price at or below the threshold.
    PriceBelow { threshold: f64 },
    /// Upside of the latest analysis, in percent, at or above the threshold.
    UpsideAbove { threshold: f64 },
    ClassificationChange,
}

impl AlertCondition {
    fn needs_price(self) -> bool {
        matches!(self, AlertCondition::PriceAbove { .. } | AlertCondition::PriceBelow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub ticker: String,
    #[serde(flatten)]
    pub condition: AlertCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredAlert {
    pub rule: AlertRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upside_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ClassificationChange>,
    pub message: String,
}

/// Evaluate one rule against the newest two analyses of its ticker (newest first) and
/// the current price. Rules whose input is missing do not trigger.
pub fn evaluate(
    rule: &AlertRule,
    latest_two: &[StoredAnalysis],
    price: Option<f64>,
) -> Option<TriggeredAlert> {
    let ticker = &rule.ticker;
    let triggered = |price: Option<f64>,
                     upside_pct: Option<f64>,
                     change: Option<ClassificationChange>,
                     message: String| TriggeredAlert {
        rule: rule.clone(),
        price,
        upside_pct,
        change,
        message,
    };

    match rule.condition {
        AlertCondition::PriceAbove { threshold } => {
            let price = price.filter(|p| *p >= threshold)?;
            Some(triggered(Some(price), None, None, format!("{ticker} 股價 {price} 已突破 {threshold}")))
        }
        AlertCondition::PriceBelow { threshold } => {
            let price = price.filter(|p| *p <= threshold)?;
            Some(triggered(Some(price), None, None, format!("{ticker} 股價 {price} 已跌破 {threshold}")))
        }
        AlertCondition::UpsideAbove { threshold } => {
            let upside = latest_two
                .first()
                .map(|a| a.record.recommendation.upside_pct)
                .filter(|u| *u >= threshold)?;
            Some(triggered(
                None,
                Some(upside),
                None,
                format!("{ticker} 潛在上漲空間 {upside:.1}% 超過閾值 {threshold}%"),
            ))
        }
        AlertCondition::ClassificationChange => {
            let change = detect_change(latest_two)?;
            let message = change.message.clone();
            Some(triggered(None, None, Some(change), message))
        }
    }
}

/// Latest close on or after `today - LATEST_CLOSE_LOOKBACK_DAYS`.
pub async fn latest_close(
    provider: &dyn MarketDataProvider,
    ticker: &str,
    today: NaiveDate,
) -> Result<Option<f64>, FetchError> {
    let start = today - chrono::Duration::days(LATEST_CLOSE_LOOKBACK_DAYS);
    let series = provider.fetch_price_series(ticker, start).await?;
    Ok(series.last().map(|p| p.close))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertError {
    pub ticker: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertReport {
    pub checked: usize,
    pub triggered: Vec<TriggeredAlert>,
    pub errors: Vec<AlertError>,
}

/// Evaluate every rule. Prices come from `known_prices` first, then from `provider`;
/// a ticker whose inputs cannot be loaded is reported and the rest are still checked.
pub async fn check_alerts(
    store: &dyn AnalysisStore,
    provider: Option<&dyn MarketDataProvider>,
    rules: &[AlertRule],
    known_prices: &BTreeMap<String, f64>,
    today: NaiveDate,
) -> AlertReport {
    let mut by_ticker: BTreeMap<&str, Vec<&AlertRule>> = BTreeMap::new();
    for rule in rules {
        by_ticker.entry(rule.ticker.as_str()).or_default().push(rule);
    }

    let mut report = AlertReport {
        checked: rules.len(),
        ..Default::default()
    };
    for (ticker, rules) in by_ticker {
        let latest_two = match store.get_latest_two(ticker).await {
            Ok(rows) => rows,
            Err(err) => {
                report.errors.push(AlertError {
                    ticker: ticker.to_string(),
                    error: format!("{err:#}"),
                });
                continue;
            }
        };

        let mut price = known_prices.get(ticker).copied();
        if price.is_none() && rules.iter().any(|r| r.condition.needs_price()) {
            match provider {
                Some(provider) => match latest_close(provider, ticker, today).await {
                    Ok(close) => price = close,
                    Err(err) => {
                        tracing::warn!(%ticker, error = %err, "alerts: latest close unavailable");
                        report.errors.push(AlertError {
                            ticker: ticker.to_string(),
                            error: err.to_string(),
                        });
                    }
                },
                None => report.errors.push(AlertError {
                    ticker: ticker.to_string(),
                    error: "no price given and no market data provider configured".to_string(),
                }),
            }
        }

        report
            .triggered
            .extend(rules.into_iter().filter_map(|r| evaluate(r, &latest_two, price)));
    }

    tracing::info!(
        checked = report.checked,
        triggered = report.triggered.len(),
        errors = report.errors.len(),
        "alerts checked"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Diagnostics, ModelBundle, ModelKey, ModelResult, Signal};
    use crate::storage::MemoryStore;
    use crate::synthesis::{synthesize, SynthesisInput};
    use chrono::TimeZone;

    fn record(industry: Option<&str>) -> crate::domain::analysis::AnalysisRecord {
        let per = ModelResult {
            key: ModelKey::Per,
            available: true,
            fair_value: Some(110.0),
            signal: Signal::Fair,
            reason: None,
            diagnostics: Diagnostics::None,
        };
        synthesize(
            &SynthesisInput {
                ticker: "2882".to_string(),
                current_price: 100.0,
                industry: industry.map(str::to_string),
                models: ModelBundle::from_results([per]),
            },
            None,
        )
    }

    #[tokio::test]
    async fn reports_archetype_change_between_latest_two() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let first = record(None);
        let second = record(Some("金融保險業"));
        assert_ne!(first.classification.archetype, Archetype::Financial);
        assert_eq!(second.classification.archetype, Archetype::Financial);

        store.insert_at(first.clone(), t0).unwrap();
        assert_eq!(classification_change(&store, "2882").await.unwrap(), None);

        store.insert_at(second, t0 + chrono::Duration::days(7)).unwrap();
        let change = classification_change(&store, "2882").await.unwrap().unwrap();
        assert_eq!(change.previous, first.classification.archetype);
        assert_eq!(change.current, Archetype::Financial);
        assert!(change.message.contains("金融業"));
    }

    fn rule(ticker: &str, condition: AlertCondition) -> AlertRule {
        AlertRule {
            ticker: ticker.to_string(),
            condition,
        }
    }

    struct Closes;

    #[async_trait::async_trait]
    impl MarketDataProvider for Closes {
        fn provider_name(&self) -> &'static str {
            "closes"
        }

        async fn fetch_records(
            &self,
            dataset: crate::ingest::Dataset,
            ticker: &str,
            _start: NaiveDate,
        ) -> Result<Vec<serde_json::Value>, FetchError> {
            match ticker {
                "2882" => Ok(vec![
                    serde_json::json!({"date": "2026-03-04", "close": 58.0}),
                    serde_json::json!({"date": "2026-03-05", "close": 61.5}),
                ]),
                _ => Err(FetchError::Network {
                    dataset: dataset.as_str().to_string(),
                    detail: "connection reset".to_string(),
                }),
            }
        }
    }

    #[test]
    fn price_and_upside_thresholds_are_inclusive() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let latest = [StoredAnalysis {
            id: uuid::Uuid::new_v4(),
            ticker: "2882".to_string(),
            created_at: t0,
            record: record(None),
        }];

        let above = rule("2882", AlertCondition::PriceAbove { threshold: 60.0 });
        let hit = evaluate(&above, &latest, Some(60.0)).unwrap();
        assert_eq!(hit.price, Some(60.0));
        assert_eq!(hit.message, "2882 股價 60 已突破 60");
        assert!(evaluate(&above, &latest, Some(59.9)).is_none());
        assert!(evaluate(&above, &latest, None).is_none());

        let below = rule("2882", AlertCondition::PriceBelow { threshold: 50.0 });
        assert!(evaluate(&below, &latest, Some(49.5)).unwrap().message.contains("已跌破 50"));
        assert!(evaluate(&below, &latest, Some(50.5)).is_none());

        // PER 110 against a price of 100.
        let upside = rule("2882", AlertCondition::UpsideAbove { threshold: 10.0 });
        let hit = evaluate(&upside, &latest, None).unwrap();
        assert_eq!(hit.upside_pct, Some(10.0));
        assert_eq!(hit.message, "2882 潛在上漲空間 10.0% 超過閾值 10%");
        let too_high = rule("2882", AlertCondition::UpsideAbove { threshold: 15.0 });
        assert!(evaluate(&too_high, &latest, None).is_none());
        assert!(evaluate(&upside, &[], None).is_none());
    }

    #[test]
    fn rules_use_flat_tagged_json() {
        let parsed: Vec<AlertRule> = serde_json::from_value(serde_json::json!([
            {"ticker": "2330", "type": "price_above", "threshold": 1000},
            {"ticker": "2330", "type": "classification_change"},
        ]))
        .unwrap();
        assert_eq!(parsed[0].condition, AlertCondition::PriceAbove { threshold: 1000.0 });
        assert_eq!(parsed[1].condition, AlertCondition::ClassificationChange);
    }

    #[tokio::test]
    async fn batch_check_fetches_missing_prices_and_keeps_going_on_failure() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.insert_at(record(None), t0).unwrap();
        let mut other = record(None);
        other.ticker = "2603".to_string();
        store.insert_at(other, t0).unwrap();

        let rules = [
            rule("2882", AlertCondition::PriceAbove { threshold: 60.0 }),
            rule("2882", AlertCondition::PriceBelow { threshold: 60.0 }),
            rule("2603", AlertCondition::PriceBelow { threshold: 30.0 }),
            rule("2603", AlertCondition::UpsideAbove { threshold: 5.0 }),
            rule("1101", AlertCondition::PriceBelow { threshold: 40.0 }),
        ];
        let known = BTreeMap::from([("1101".to_string(), 35.0)]);
        let today = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();

        let report = check_alerts(&store, Some(&Closes), &rules, &known, today).await;
        assert_eq!(report.checked, 5);
        let messages: Vec<&str> = report.triggered.iter().map(|t| t.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "1101 股價 35 已跌破 40",
                "2603 潛在上漲空間 10.0% 超過閾值 5%",
                "2882 股價 61.5 已突破 60",
            ]
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].ticker, "2603");
    }

    #[tokio::test]
    async fn same_archetype_is_not_a_change() {
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        store.insert_at(record(None), t0).unwrap();
        store.insert_at(record(None), t0 + chrono::Duration::days(1)).unwrap();
        assert!(classification_change(&store, "2882").await.unwrap().is_none());
    }
}
