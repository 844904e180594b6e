pub mod engine;
pub mod metrics;

use crate::config::env_or;
use std::time::Duration;

pub use engine::{run_backtest, BacktestReport, TickerError};

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestOptions {
    /// Analyses younger than this are not checked yet.
    pub min_days_ago: i64,
    /// Upper bound on unchecked analyses taken per pass.
    pub max_results: usize,
    /// Tickers fetched in parallel.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    /// Pause before each price fetch.
    pub request_spacing: Duration,
}

impl Default for BacktestOptions {
    fn default() -> Self {
        Self {
            min_days_ago: 30,
            max_results: 100,
            concurrency: 4,
            fetch_timeout: Duration::from_secs(30),
            request_spacing: Duration::ZERO,
        }
    }
}

impl BacktestOptions {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_days_ago: env_or("BACKTEST_MIN_DAYS", d.min_days_ago).max(0),
            max_results: env_or("BACKTEST_MAX_RESULTS", d.max_results),
            concurrency: env_or("BACKTEST_CONCURRENCY", d.concurrency).max(1),
            fetch_timeout: Duration::from_secs(env_or("BACKTEST_FETCH_TIMEOUT_SECS", 30)),
            request_spacing: Duration::from_millis(env_or("BACKTEST_REQUEST_SPACING_MS", 0)),
        }
    }
}
