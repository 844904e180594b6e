pub mod accuracy;
pub mod analyses;
pub mod lock;
pub mod memory;

use crate::domain::accuracy::{AccuracyCheck, AccuracyUpdate, NewAccuracyCheck};
use crate::domain::analysis::{AnalysisRecord, StoredAnalysis};
use crate::time::tw_market;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Read/write contract for analyses and their accuracy checks.
///
/// Analyses are append-only. Accuracy checks are inserted once and then only have
/// empty horizons filled in.
#[async_trait::async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn save_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<StoredAnalysis>;

    async fn get_latest(&self, ticker: &str) -> anyhow::Result<Option<StoredAnalysis>>;

    /// Newest first.
    async fn get_latest_two(&self, ticker: &str) -> anyhow::Result<Vec<StoredAnalysis>>;

    /// Scorable analyses at least `min_days_ago` old with no accuracy check yet, oldest
    /// first. Analyses without a positive fair value or price are never returned.
    async fn get_unchecked(
        &self,
        min_days_ago: i64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredAnalysis>>;

    /// Checks with a 90d or 180d horizon that is due and still open.
    async fn get_partial(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<AccuracyCheck>>;

    async fn save_accuracy_check(&self, check: &NewAccuracyCheck) -> anyhow::Result<Uuid>;

    /// Fill open horizons and replace model errors. Settled horizons are kept.
    async fn update_accuracy_check(&self, id: Uuid, update: &AccuracyUpdate) -> anyhow::Result<()>;

    async fn get_all_accuracy_checks(&self) -> anyhow::Result<Vec<AccuracyCheck>>;
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl AnalysisStore for PgStore {
    async fn save_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<StoredAnalysis> {
        analyses::insert(&self.pool, record).await
    }

    async fn get_latest(&self, ticker: &str) -> anyhow::Result<Option<StoredAnalysis>> {
        Ok(analyses::latest(&self.pool, ticker, 1).await?.into_iter().next())
    }

    async fn get_latest_two(&self, ticker: &str) -> anyhow::Result<Vec<StoredAnalysis>> {
        analyses::latest(&self.pool, ticker, 2).await
    }

    async fn get_unchecked(
        &self,
        min_days_ago: i64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredAnalysis>> {
        let cutoff = now - chrono::Duration::days(min_days_ago);
        analyses::unchecked(&self.pool, cutoff, limit).await
    }

    async fn get_partial(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<AccuracyCheck>> {
        accuracy::partial(&self.pool, tw_market::local_date(now)).await
    }

    async fn save_accuracy_check(&self, check: &NewAccuracyCheck) -> anyhow::Result<Uuid> {
        accuracy::insert(&self.pool, check).await
    }

    async fn update_accuracy_check(&self, id: Uuid, update: &AccuracyUpdate) -> anyhow::Result<()> {
        accuracy::update(&self.pool, id, update).await
    }

    async fn get_all_accuracy_checks(&self) -> anyhow::Result<Vec<AccuracyCheck>> {
        accuracy::all(&self.pool).await
    }
}
