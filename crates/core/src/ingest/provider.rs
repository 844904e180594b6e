use crate::config::Settings;
use crate::error::FetchError;
use crate::ingest::types::{Dataset, DatasetResponse, PricePoint, PriceRow};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.finmindtrade.com/api/v4/data";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;

#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Raw rows of one dataset for `ticker` from `start` onwards.
    async fn fetch_records(
        &self,
        dataset: Dataset,
        ticker: &str,
        start: NaiveDate,
    ) -> Result<Vec<Value>, FetchError>;

    /// Daily closes in ascending date order.
    async fn fetch_price_series(
        &self,
        ticker: &str,
        start: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        let rows = self.fetch_records(Dataset::StockPrice, ticker, start).await?;
        let mut points = rows
            .into_iter()
            .map(|v| {
                serde_json::from_value::<PriceRow>(v)
                    .map(PricePoint::from)
                    .map_err(|e| FetchError::Decode {
                        dataset: Dataset::StockPrice.as_str().to_string(),
                        detail: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        points.sort_by_key(|p| p.date);
        Ok(points)
    }
}

/// FinMind-style HTTP JSON provider: `GET ?dataset=..&data_id=..&start_date=..&token=..`.
#[derive(Debug, Clone)]
pub struct HttpMarketDataProvider {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl HttpMarketDataProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings
            .market_data_base_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_token = settings.market_data_api_token.clone();

        let timeout_secs = std::env::var("MARKET_DATA_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("MARKET_DATA_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let timeout = Duration::from_secs(timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build market data http client")?;

        Ok(Self {
            http,
            base_url,
            api_token,
            timeout,
            retries,
        })
    }

    async fn fetch_once(
        &self,
        dataset: Dataset,
        ticker: &str,
        start: NaiveDate,
    ) -> Result<Vec<Value>, FetchError> {
        let name = dataset.as_str();
        let mut query = vec![
            ("dataset", name.to_string()),
            ("data_id", ticker.to_string()),
            ("start_date", start.to_string()),
        ];
        if let Some(token) = &self.api_token {
            query.push(("token", token.clone()));
        }

        let res = self
            .http
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_error(name, e))?;

        let status = res.status();
        let text = res.text().await.map_err(|e| self.transport_error(name, e))?;
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                dataset: name.to_string(),
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        let parsed: DatasetResponse =
            serde_json::from_str(&text).map_err(|e| FetchError::Decode {
                dataset: name.to_string(),
                detail: e.to_string(),
            })?;
        if !parsed.is_success() {
            return Err(FetchError::Api {
                dataset: name.to_string(),
                message: parsed.msg,
            });
        }
        Ok(parsed.data)
    }

    fn transport_error(&self, dataset: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                dataset: dataset.to_string(),
                after: self.timeout,
            }
        } else {
            FetchError::Network {
                dataset: dataset.to_string(),
                detail: err.to_string(),
            }
        }
    }
}

/// Transient failures worth another attempt.
fn is_retryable(err: &FetchError) -> bool {
    match err {
        FetchError::Timeout { .. } | FetchError::Network { .. } => true,
        FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
        FetchError::Api { .. } | FetchError::Decode { .. } | FetchError::Empty { .. } => false,
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    fn provider_name(&self) -> &'static str {
        "finmind_http_json"
    }

    async fn fetch_records(
        &self,
        dataset: Dataset,
        ticker: &str,
        start: NaiveDate,
    ) -> Result<Vec<Value>, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(dataset, ticker, start).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    if attempt >= self.retries || !is_retryable(&err) {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(attempt, ?backoff, %ticker, error = %err, "market data fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Canned(Vec<Value>);

    #[async_trait::async_trait]
    impl MarketDataProvider for Canned {
        fn provider_name(&self) -> &'static str {
            "canned"
        }

        async fn fetch_records(
            &self,
            _dataset: Dataset,
            _ticker: &str,
            _start: NaiveDate,
        ) -> Result<Vec<Value>, FetchError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn price_series_is_sorted_by_date() {
        let p = Canned(vec![
            json!({"date": "2026-01-06", "stock_id": "2330", "close": 101.5}),
            json!({"date": "2026-01-05", "stock_id": "2330", "close": 100.0}),
        ]);
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let series = p.fetch_price_series("2330", start).await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].close, 100.0);
        assert_eq!(series[1].date, NaiveDate::from_ymd_opt(2026, 1, 6).unwrap());
    }

    #[tokio::test]
    async fn malformed_rows_are_decode_errors() {
        let p = Canned(vec![json!({"date": "2026-01-06", "close": "n/a"})]);
        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let err = p.fetch_price_series("2330", start).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn parses_envelope() {
        let ok: DatasetResponse =
            serde_json::from_value(json!({"msg": "success", "status": 200, "data": [{}]})).unwrap();
        assert!(ok.is_success());
        let bad: DatasetResponse =
            serde_json::from_value(json!({"msg": "Your level is register", "status": 402})).unwrap();
        assert!(!bad.is_success());
        assert!(bad.data.is_empty());
    }

    #[test]
    fn only_transient_failures_are_retried() {
        let ds = "TaiwanStockPrice".to_string();
        assert!(is_retryable(&FetchError::Timeout {
            dataset: ds.clone(),
            after: Duration::from_secs(30)
        }));
        assert!(is_retryable(&FetchError::HttpStatus {
            dataset: ds.clone(),
            status: 503,
            body: String::new()
        }));
        assert!(!is_retryable(&FetchError::HttpStatus {
            dataset: ds.clone(),
            status: 404,
            body: String::new()
        }));
        assert!(!is_retryable(&FetchError::Api {
            dataset: ds,
            message: "limit".to_string()
        }));
    }
}
