pub mod alerts;
pub mod backtest;
pub mod domain;
pub mod error;
pub mod feedback;
pub mod ingest;
pub mod llm;
pub mod service;
pub mod storage;
pub mod synthesis;
pub mod time;

pub mod config {
    use anyhow::Context;
    use std::str::FromStr;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub market_data_base_url: Option<String>,
        pub market_data_api_token: Option<String>,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                market_data_base_url: std::env::var("MARKET_DATA_BASE_URL").ok(),
                market_data_api_token: std::env::var("MARKET_DATA_API_TOKEN").ok(),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_market_data_api_token(&self) -> anyhow::Result<&str> {
            self.market_data_api_token
                .as_deref()
                .context("MARKET_DATA_API_TOKEN is required")
        }
    }

    /// Parsed env var, or `default` when unset or unparsable.
    pub(crate) fn env_or<T: FromStr>(name: &str, default: T) -> T {
        std::env::var(name)
            .ok()
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }
}
