use crate::domain::accuracy::{
    AccuracyCheck, AccuracyUpdate, Horizon, HorizonOutcome, ModelErrors, NewAccuracyCheck,
};
use crate::domain::classification::Archetype;
use crate::domain::model::ModelKey;
use crate::domain::recommendation::Action;
use anyhow::Context;
use chrono::NaiveDate;
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, analysis_id, ticker, analysis_date, predicted_fair_value, \
     predicted_action, price_at_analysis, classification_type, \
     actual_price_30d, actual_price_90d, actual_price_180d, \
     direction_correct_30d, direction_correct_90d, direction_correct_180d, \
     no_close_30d, no_close_90d, no_close_180d, \
     model_fair_values, model_errors";

#[derive(Debug, sqlx::FromRow)]
struct AccuracyRow {
    id: Uuid,
    analysis_id: Uuid,
    ticker: String,
    analysis_date: NaiveDate,
    predicted_fair_value: f64,
    predicted_action: String,
    price_at_analysis: f64,
    classification_type: Option<String>,
    actual_price_30d: Option<f64>,
    actual_price_90d: Option<f64>,
    actual_price_180d: Option<f64>,
    direction_correct_30d: Option<bool>,
    direction_correct_90d: Option<bool>,
    direction_correct_180d: Option<bool>,
    no_close_30d: bool,
    no_close_90d: bool,
    no_close_180d: bool,
    model_fair_values: Json<BTreeMap<ModelKey, f64>>,
    model_errors: Json<ModelErrors>,
}

impl TryFrom<AccuracyRow> for AccuracyCheck {
    type Error = anyhow::Error;

    fn try_from(r: AccuracyRow) -> anyhow::Result<Self> {
        let predicted_action = Action::parse(&r.predicted_action).with_context(|| {
            format!("accuracy_checks {} has invalid predicted_action {:?}", r.id, r.predicted_action)
        })?;
        Ok(Self {
            id: r.id,
            analysis_id: r.analysis_id,
            ticker: r.ticker,
            analysis_date: r.analysis_date,
            predicted_fair_value: r.predicted_fair_value,
            predicted_action,
            price_at_analysis: r.price_at_analysis,
            classification_type: r.classification_type.as_deref().and_then(Archetype::from_label),
            d30: HorizonOutcome {
                actual_price: r.actual_price_30d,
                direction_correct: r.direction_correct_30d,
                no_close: r.no_close_30d,
            },
            d90: HorizonOutcome {
                actual_price: r.actual_price_90d,
                direction_correct: r.direction_correct_90d,
                no_close: r.no_close_90d,
            },
            d180: HorizonOutcome {
                actual_price: r.actual_price_180d,
                direction_correct: r.direction_correct_180d,
                no_close: r.no_close_180d,
            },
            model_fair_values: r.model_fair_values.0,
            model_errors: r.model_errors.0,
        })
    }
}

pub async fn insert(pool: &sqlx::PgPool, check: &NewAccuracyCheck) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO accuracy_checks (id, analysis_id, ticker, analysis_date, predicted_fair_value, \
         predicted_action, price_at_analysis, classification_type, \
         actual_price_30d, actual_price_90d, actual_price_180d, \
         direction_correct_30d, direction_correct_90d, direction_correct_180d, \
         no_close_30d, no_close_90d, no_close_180d, \
         model_fair_values, model_errors) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .bind(id)
    .bind(check.analysis_id)
    .bind(&check.ticker)
    .bind(check.analysis_date)
    .bind(check.predicted_fair_value)
    .bind(check.predicted_action.as_str())
    .bind(check.price_at_analysis)
    .bind(check.classification_type.map(Archetype::label))
    .bind(check.d30.actual_price)
    .bind(check.d90.actual_price)
    .bind(check.d180.actual_price)
    .bind(check.d30.direction_correct)
    .bind(check.d90.direction_correct)
    .bind(check.d180.direction_correct)
    .bind(check.d30.no_close)
    .bind(check.d90.no_close)
    .bind(check.d180.no_close)
    .bind(Json(&check.model_fair_values))
    .bind(Json(&check.model_errors))
    .execute(pool)
    .await
    .with_context(|| format!("insert accuracy_checks failed (analysis_id={})", check.analysis_id))?;
    Ok(id)
}

/// Single-row backfill. Each horizon is only written while it is still open (no price and
/// not settled without a close), so replaying an update leaves settled horizons untouched.
pub async fn update(pool: &sqlx::PgPool, id: Uuid, update: &AccuracyUpdate) -> anyhow::Result<()> {
    let outcome = |h: Horizon| update.outcomes.get(&h).copied().unwrap_or_default();
    let (d30, d90, d180) = (outcome(Horizon::D30), outcome(Horizon::D90), outcome(Horizon::D180));

    sqlx::query(
        "UPDATE accuracy_checks SET \
         direction_correct_30d = CASE WHEN actual_price_30d IS NULL AND NOT no_close_30d THEN $2 ELSE direction_correct_30d END, \
         actual_price_30d = CASE WHEN actual_price_30d IS NULL AND NOT no_close_30d THEN $3 ELSE actual_price_30d END, \
         no_close_30d = CASE WHEN actual_price_30d IS NULL AND NOT no_close_30d THEN $4 ELSE no_close_30d END, \
         direction_correct_90d = CASE WHEN actual_price_90d IS NULL AND NOT no_close_90d THEN $5 ELSE direction_correct_90d END, \
         actual_price_90d = CASE WHEN actual_price_90d IS NULL AND NOT no_close_90d THEN $6 ELSE actual_price_90d END, \
         no_close_90d = CASE WHEN actual_price_90d IS NULL AND NOT no_close_90d THEN $7 ELSE no_close_90d END, \
         direction_correct_180d = CASE WHEN actual_price_180d IS NULL AND NOT no_close_180d THEN $8 ELSE direction_correct_180d END, \
         actual_price_180d = CASE WHEN actual_price_180d IS NULL AND NOT no_close_180d THEN $9 ELSE actual_price_180d END, \
         no_close_180d = CASE WHEN actual_price_180d IS NULL AND NOT no_close_180d THEN $10 ELSE no_close_180d END, \
         model_errors = COALESCE($11, model_errors), \
         checked_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(d30.direction_correct)
    .bind(d30.actual_price)
    .bind(d30.no_close)
    .bind(d90.direction_correct)
    .bind(d90.actual_price)
    .bind(d90.no_close)
    .bind(d180.direction_correct)
    .bind(d180.actual_price)
    .bind(d180.no_close)
    .bind(update.model_errors.as_ref().map(Json))
    .execute(pool)
    .await
    .with_context(|| format!("update accuracy_checks failed (id={id})"))?;
    Ok(())
}

pub async fn partial(pool: &sqlx::PgPool, today: NaiveDate) -> anyhow::Result<Vec<AccuracyCheck>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM accuracy_checks \
         WHERE (actual_price_90d IS NULL AND NOT no_close_90d AND analysis_date <= $1 - 90) \
            OR (actual_price_180d IS NULL AND NOT no_close_180d AND analysis_date <= $1 - 180) \
         ORDER BY analysis_date ASC"
    );
    let rows: Vec<AccuracyRow> = sqlx::query_as(&sql)
        .bind(today)
        .fetch_all(pool)
        .await
        .context("select partial accuracy_checks failed")?;
    rows.into_iter().map(AccuracyCheck::try_from).collect()
}

pub async fn all(pool: &sqlx::PgPool) -> anyhow::Result<Vec<AccuracyCheck>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM accuracy_checks ORDER BY analysis_date DESC");
    let rows: Vec<AccuracyRow> = sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("select accuracy_checks failed")?;
    rows.into_iter().map(AccuracyCheck::try_from).collect()
}
