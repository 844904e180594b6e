use crate::domain::accuracy::{AccuracyCheck, AccuracyUpdate, Horizon, NewAccuracyCheck};
use crate::domain::analysis::{AnalysisRecord, StoredAnalysis};
use crate::storage::AnalysisStore;
use crate::time::tw_market;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    analyses: Vec<StoredAnalysis>,
    checks: Vec<AccuracyCheck>,
}

/// In-process store for dry runs and tests. Same contract as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    /// Insert an analysis with an explicit creation time.
    pub fn insert_at(
        &self,
        record: AnalysisRecord,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<StoredAnalysis> {
        let stored = StoredAnalysis {
            id: Uuid::new_v4(),
            ticker: record.ticker.clone(),
            created_at,
            record,
        };
        self.lock()?.analyses.push(stored.clone());
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl AnalysisStore for MemoryStore {
    async fn save_analysis(&self, record: &AnalysisRecord) -> anyhow::Result<StoredAnalysis> {
        self.insert_at(record.clone(), Utc::now())
    }

    async fn get_latest(&self, ticker: &str) -> anyhow::Result<Option<StoredAnalysis>> {
        Ok(self.get_latest_two(ticker).await?.into_iter().next())
    }

    async fn get_latest_two(&self, ticker: &str) -> anyhow::Result<Vec<StoredAnalysis>> {
        let tables = self.lock()?;
        let mut rows: Vec<StoredAnalysis> = tables
            .analyses
            .iter()
            .rev()
            .filter(|a| a.ticker == ticker)
            .cloned()
            .collect();
        // Stable sort over reversed insertion order: later inserts win timestamp ties.
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(2);
        Ok(rows)
    }

    async fn get_unchecked(
        &self,
        min_days_ago: i64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredAnalysis>> {
        let cutoff = now - chrono::Duration::days(min_days_ago);
        let tables = self.lock()?;
        let mut rows: Vec<StoredAnalysis> = tables
            .analyses
            .iter()
            .filter(|a| a.created_at <= cutoff && a.is_scorable())
            .filter(|a| !tables.checks.iter().any(|c| c.analysis_id == a.id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn get_partial(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<AccuracyCheck>> {
        let today = tw_market::local_date(now);
        let tables = self.lock()?;
        let mut rows: Vec<AccuracyCheck> = tables
            .checks
            .iter()
            .filter(|c| {
                c.open_due_horizons(today)
                    .iter()
                    .any(|h| matches!(h, Horizon::D90 | Horizon::D180))
            })
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.analysis_date);
        Ok(rows)
    }

    async fn save_accuracy_check(&self, check: &NewAccuracyCheck) -> anyhow::Result<Uuid> {
        let mut tables = self.lock()?;
        anyhow::ensure!(
            !tables.checks.iter().any(|c| c.analysis_id == check.analysis_id),
            "accuracy check already exists for analysis {}",
            check.analysis_id
        );
        let id = Uuid::new_v4();
        tables.checks.push(AccuracyCheck::from_new(id, check.clone()));
        Ok(id)
    }

    async fn update_accuracy_check(&self, id: Uuid, update: &AccuracyUpdate) -> anyhow::Result<()> {
        let mut tables = self.lock()?;
        let check = tables
            .checks
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("accuracy check {id} not found"))?;
        check.apply(update);
        Ok(())
    }

    async fn get_all_accuracy_checks(&self) -> anyhow::Result<Vec<AccuracyCheck>> {
        let mut rows = self.lock()?.checks.clone();
        rows.sort_by(|a, b| b.analysis_date.cmp(&a.analysis_date));
        Ok(rows)
    }
}
