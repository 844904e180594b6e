use crate::domain::analysis::{AnalysisRecord, StoredAnalysis};
use crate::domain::valuation::Provenance;
use anyhow::Context;
use chrono::{DateTime, Utc};
use uuid::Uuid;

type AnalysisRow = (Uuid, String, DateTime<Utc>, serde_json::Value);

fn provenance_label(p: Provenance) -> &'static str {
    match p {
        Provenance::Deterministic => "deterministic",
        Provenance::Feedback => "feedback",
        Provenance::LlmEnhanced => "llm-enhanced",
    }
}

fn from_row((id, ticker, created_at, result): AnalysisRow) -> anyhow::Result<StoredAnalysis> {
    let record: AnalysisRecord = serde_json::from_value(result)
        .with_context(|| format!("analyses.result for {id} is not a valid AnalysisRecord"))?;
    Ok(StoredAnalysis {
        id,
        ticker,
        created_at,
        record,
    })
}

pub async fn insert(pool: &sqlx::PgPool, record: &AnalysisRecord) -> anyhow::Result<StoredAnalysis> {
    let id = Uuid::new_v4();
    let result = serde_json::to_value(record).context("serialize AnalysisRecord failed")?;

    let created_at: DateTime<Utc> = sqlx::query_scalar(
        "INSERT INTO analyses (id, ticker, classification_type, provenance, result) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING created_at",
    )
    .bind(id)
    .bind(&record.ticker)
    .bind(record.classification.archetype.label())
    .bind(provenance_label(record.provenance))
    .bind(result)
    .fetch_one(pool)
    .await
    .context("insert analyses failed")?;

    Ok(StoredAnalysis {
        id,
        ticker: record.ticker.clone(),
        created_at,
        record: record.clone(),
    })
}

pub async fn latest(pool: &sqlx::PgPool, ticker: &str, limit: i64) -> anyhow::Result<Vec<StoredAnalysis>> {
    let rows: Vec<AnalysisRow> = sqlx::query_as(
        "SELECT id, ticker, created_at, result FROM analyses \
         WHERE ticker = $1 \
         ORDER BY created_at DESC \
         LIMIT $2",
    )
    .bind(ticker)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("select latest analyses failed")?;

    rows.into_iter().map(from_row).collect()
}

pub async fn unchecked(
    pool: &sqlx::PgPool,
    created_before: DateTime<Utc>,
    limit: usize,
) -> anyhow::Result<Vec<StoredAnalysis>> {
    let rows: Vec<AnalysisRow> = sqlx::query_as(
        "SELECT a.id, a.ticker, a.created_at, a.result FROM analyses a \
         LEFT JOIN accuracy_checks ac ON ac.analysis_id = a.id \
         WHERE ac.id IS NULL AND a.created_at <= $1 \
           AND (a.result -> 'weighted_valuation' ->> 'fair_value')::float8 > 0 \
           AND (a.result ->> 'current_price')::float8 > 0 \
         ORDER BY a.created_at ASC \
         LIMIT $2",
    )
    .bind(created_before)
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await
    .context("select unchecked analyses failed")?;

    rows.into_iter().map(from_row).collect()
}
