use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use fairval_core::alerts::{self, AlertReport, AlertRule, ClassificationChange};
use fairval_core::backtest::metrics::{summarize, AccuracySummary};
use fairval_core::backtest::{BacktestOptions, BacktestReport};
use fairval_core::domain::analysis::{AnalysisRecord, StoredAnalysis};
use fairval_core::domain::contract::ExternalProposal;
use fairval_core::feedback::cache::{CacheStatus, FeedbackCache};
use fairval_core::feedback::FeedbackConfig;
use fairval_core::ingest::{HttpMarketDataProvider, MarketDataProvider};
use fairval_core::service::{self, BatchResynthesis, Resynthesis};
use fairval_core::storage::{AnalysisStore, PgStore};
use fairval_core::synthesis::{synthesize, SynthesisInput};
use fairval_core::time::tw_market;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = fairval_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match fairval_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let provider: Option<Arc<dyn MarketDataProvider>> =
        match HttpMarketDataProvider::from_settings(&settings) {
            Ok(p) => Some(Arc::new(p)),
            Err(e) => {
                sentry_anyhow::capture_anyhow(&e);
                tracing::error!(error = %e, "market data client unavailable; backtests disabled");
                None
            }
        };

    let state = AppState {
        store: pool
            .clone()
            .map(|p| Arc::new(PgStore::new(p)) as Arc<dyn AnalysisStore>),
        pool,
        provider,
        feedback: Arc::new(FeedbackCache::new(FeedbackConfig::from_env())),
        backtest: BacktestOptions::from_env(),
    };

    if let Some(store) = &state.store {
        if let Err(e) = service::refresh_feedback(store.as_ref(), &state.feedback).await {
            sentry_anyhow::capture_anyhow(&e);
            tracing::warn!(error = %e, "initial feedback refresh failed; serving deterministic weights");
        }
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/analyses", post(create_analysis))
        .route("/analyses/:ticker/latest", get(get_latest_analysis))
        .route(
            "/analyses/:ticker/classification-change",
            get(get_classification_change),
        )
        .route("/analyses/:ticker/resynthesize", post(resynthesize_ticker))
        .route("/batch/resynthesize", post(resynthesize_batch))
        .route("/alerts/check", post(check_alerts))
        .route("/backtest/run", post(run_backtest))
        .route("/backtest/summary", get(get_backtest_summary))
        .route("/feedback/status", get(get_feedback_status))
        .route("/feedback/refresh", post(refresh_feedback))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    pool: Option<PgPool>,
    store: Option<Arc<dyn AnalysisStore>>,
    provider: Option<Arc<dyn MarketDataProvider>>,
    feedback: Arc<FeedbackCache>,
    backtest: BacktestOptions,
}

impl AppState {
    fn store(&self) -> Result<&dyn AnalysisStore, StatusCode> {
        self.store.as_deref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %format!("{e:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn check_ticker(ticker: &str) -> Result<(), StatusCode> {
    if service::is_valid_ticker(ticker) {
        Ok(())
    } else {
        Err(StatusCode::BAD_REQUEST)
    }
}

#[derive(Debug, Serialize)]
struct AnalysisResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    saved: bool,
    record: AnalysisRecord,
}

/// Synthesizes from supplied model results. Without a database the record is returned unsaved.
async fn create_analysis(
    State(state): State<AppState>,
    Json(input): Json<SynthesisInput>,
) -> Result<Json<AnalysisResponse>, StatusCode> {
    check_ticker(&input.ticker)?;

    let Some(store) = state.store.as_deref() else {
        return Ok(Json(AnalysisResponse {
            id: None,
            saved: false,
            record: synthesize(&input, Some(state.feedback.as_ref())),
        }));
    };

    let stored = service::analyze_and_save(store, &input, Some(state.feedback.as_ref()))
        .await
        .map_err(internal)?;
    Ok(Json(AnalysisResponse {
        id: Some(stored.id),
        saved: true,
        record: stored.record,
    }))
}

async fn get_latest_analysis(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<StoredAnalysis>, StatusCode> {
    check_ticker(&ticker)?;
    let latest = state
        .store()?
        .get_latest(&ticker)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(latest))
}

async fn get_classification_change(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<Option<ClassificationChange>>, StatusCode> {
    check_ticker(&ticker)?;
    let change = alerts::classification_change(state.store()?, &ticker)
        .await
        .map_err(internal)?;
    Ok(Json(change))
}

#[derive(Debug, Deserialize)]
struct ResynthesizeRequest {
    /// Structured proposal.
    #[serde(default)]
    proposal: Option<ExternalProposal>,
    /// Raw model reply containing a proposal.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    save: bool,
}

/// With a proposal (structured or raw text) the proposal is validated and applied;
/// with neither, the cached feedback weights are.
async fn resynthesize_ticker(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Json(req): Json<ResynthesizeRequest>,
) -> Result<Json<Resynthesis>, StatusCode> {
    check_ticker(&ticker)?;
    let store = state.store()?;

    let proposal = match (req.proposal, req.text) {
        (Some(p), _) => Some(p),
        (None, Some(text)) => Some(fairval_core::llm::parse_proposal(&text).map_err(|e| {
            tracing::info!(%ticker, error = %format!("{e:#}"), "unparsable proposal text");
            StatusCode::UNPROCESSABLE_ENTITY
        })?),
        (None, None) => None,
    };

    let out = match proposal {
        Some(p) => service::resynthesize_with_proposal(store, &ticker, p, req.save).await,
        None => service::resynthesize_with_feedback(store, &state.feedback, &ticker, req.save).await,
    }
    .map_err(internal)?
    .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    stocks: BTreeMap<String, ExternalProposal>,
    #[serde(default)]
    save: bool,
}

async fn resynthesize_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResynthesis>, StatusCode> {
    if req.stocks.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let store = state.store()?;
    Ok(Json(service::resynthesize_batch(store, req.stocks, req.save).await))
}

#[derive(Debug, Deserialize)]
struct AlertsRequest {
    rules: Vec<AlertRule>,
    /// Current prices by ticker; missing ones are fetched.
    #[serde(default)]
    prices: BTreeMap<String, f64>,
}

async fn check_alerts(
    State(state): State<AppState>,
    Json(req): Json<AlertsRequest>,
) -> Result<Json<AlertReport>, StatusCode> {
    for rule in &req.rules {
        check_ticker(&rule.ticker)?;
    }
    let store = state.store()?;
    let today = tw_market::local_date(Utc::now());
    Ok(Json(
        alerts::check_alerts(store, state.provider.as_deref(), &req.rules, &req.prices, today).await,
    ))
}

#[derive(Debug, Deserialize)]
struct BacktestParams {
    min_days_ago: Option<i64>,
    max_results: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BacktestResponse {
    #[serde(flatten)]
    report: BacktestReport,
    summary: AccuracySummary,
    feedback: CacheStatus,
}

async fn run_backtest(
    State(state): State<AppState>,
    Query(params): Query<BacktestParams>,
) -> Result<Json<BacktestResponse>, StatusCode> {
    let (Some(pool), Some(store), Some(provider)) =
        (&state.pool, state.store.as_deref(), state.provider.as_deref())
    else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let options = BacktestOptions {
        min_days_ago: params.min_days_ago.unwrap_or(state.backtest.min_days_ago).max(0),
        max_results: params.max_results.unwrap_or(state.backtest.max_results),
        ..state.backtest.clone()
    };

    let report = service::run_backtest_locked(pool, store, provider, &options, Utc::now())
        .await
        .map_err(internal)?
        .ok_or(StatusCode::CONFLICT)?;

    let feedback = service::refresh_feedback(store, &state.feedback)
        .await
        .map_err(internal)?;
    let checks = store.get_all_accuracy_checks().await.map_err(internal)?;

    Ok(Json(BacktestResponse {
        report,
        summary: summarize(&checks),
        feedback,
    }))
}

async fn get_backtest_summary(
    State(state): State<AppState>,
) -> Result<Json<AccuracySummary>, StatusCode> {
    let checks = state
        .store()?
        .get_all_accuracy_checks()
        .await
        .map_err(internal)?;
    Ok(Json(summarize(&checks)))
}

async fn get_feedback_status(State(state): State<AppState>) -> Json<CacheStatus> {
    Json(state.feedback.status())
}

async fn refresh_feedback(
    State(state): State<AppState>,
) -> Result<Json<CacheStatus>, StatusCode> {
    let status = service::refresh_feedback(state.store()?, &state.feedback)
        .await
        .map_err(internal)?;
    Ok(Json(status))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &fairval_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
