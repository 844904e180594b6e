use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fairval_core::alerts::{self, AlertRule};
use fairval_core::backtest::metrics::summarize;
use fairval_core::backtest::BacktestOptions;
use fairval_core::config::Settings;
use fairval_core::feedback::cache::FeedbackCache;
use fairval_core::feedback::FeedbackConfig;
use fairval_core::ingest::HttpMarketDataProvider;
use fairval_core::service;
use fairval_core::storage::{AnalysisStore, PgStore};
use fairval_core::synthesis::{synthesize, SynthesisInput};
use fairval_core::time::tw_market;

#[derive(Debug, Parser)]
#[command(name = "fairval_worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Synthesize analyses from model results in a JSON file (one input or a list).
    Analyze {
        #[arg(long)]
        input: PathBuf,

        /// Print results without writing to the database.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check stored analyses against realized prices, then refresh feedback weights.
    Backtest {
        /// Evaluate as of this market date (YYYY-MM-DD). Defaults to the latest Taiwan
        /// trading date with a published close.
        #[arg(long)]
        as_of_date: Option<String>,

        #[arg(long)]
        min_days: Option<i64>,

        #[arg(long)]
        max_results: Option<usize>,
    },

    /// Evaluate watch rules from a JSON file against the latest analyses and closes.
    Alerts {
        #[arg(long)]
        rules: PathBuf,
    },

    /// Reweight the latest analysis of a ticker with an external proposal, or with
    /// feedback weights when no proposal is given.
    Resynthesize {
        /// Required unless the proposal file holds a batch keyed by ticker.
        #[arg(long)]
        ticker: Option<String>,

        /// JSON or raw model reply containing the proposal.
        #[arg(long)]
        proposal: Option<PathBuf>,

        #[arg(long)]
        save: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputFile {
    One(SynthesisInput),
    Many(Vec<SynthesisInput>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Analyze { input, dry_run } => analyze(&settings, &input, dry_run).await,
        Command::Backtest {
            as_of_date,
            min_days,
            max_results,
        } => backtest(&settings, as_of_date.as_deref(), min_days, max_results).await,
        Command::Resynthesize {
            ticker,
            proposal,
            save,
        } => resynthesize(&settings, ticker.as_deref(), proposal.as_deref(), save).await,
        Command::Alerts { rules } => check_alerts(&settings, &rules).await,
    };

    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %format!("{err:#}"), "worker run failed");
    }
    result
}

async fn connect(settings: &Settings) -> anyhow::Result<sqlx::PgPool> {
    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;
    fairval_core::storage::migrate(&pool).await?;
    Ok(pool)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output failed")?);
    Ok(())
}

async fn loaded_feedback(store: &dyn AnalysisStore) -> anyhow::Result<FeedbackCache> {
    let cache = FeedbackCache::new(FeedbackConfig::from_env());
    let status = service::refresh_feedback(store, &cache).await?;
    tracing::info!(
        total_checks = status.total_checks,
        covered = status.covered_types.len(),
        "feedback loaded"
    );
    Ok(cache)
}

async fn analyze(settings: &Settings, path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {} failed", path.display()))?;
    let inputs = match serde_json::from_str::<InputFile>(&text)
        .with_context(|| format!("{} is not a synthesis input", path.display()))?
    {
        InputFile::One(i) => vec![i],
        InputFile::Many(v) => v,
    };

    if dry_run {
        let records: Vec<_> = inputs.iter().map(|i| synthesize(i, None)).collect();
        tracing::info!(dry_run = true, analyses = records.len(), "analyze complete");
        return print_json(&records);
    }

    let store = PgStore::new(connect(settings).await?);
    let cache = loaded_feedback(&store).await?;

    let mut saved = Vec::with_capacity(inputs.len());
    for input in &inputs {
        saved.push(service::analyze_and_save(&store, input, Some(&cache)).await?);
    }
    print_json(&saved)
}

async fn backtest(
    settings: &Settings,
    as_of_date: Option<&str>,
    min_days: Option<i64>,
    max_results: Option<usize>,
) -> anyhow::Result<()> {
    let date = tw_market::resolve_market_date(as_of_date, chrono::Utc::now())?;
    let now = tw_market::end_of_day(date);

    let defaults = BacktestOptions::from_env();
    let options = BacktestOptions {
        min_days_ago: min_days.unwrap_or(defaults.min_days_ago).max(0),
        max_results: max_results.unwrap_or(defaults.max_results),
        ..defaults
    };

    let pool = connect(settings).await?;
    let store = PgStore::new(pool.clone());
    let provider = HttpMarketDataProvider::from_settings(settings)?;

    let Some(report) =
        service::run_backtest_locked(&pool, &store, &provider, &options, now).await?
    else {
        tracing::warn!(%date, "backtest already running elsewhere; nothing done");
        return Ok(());
    };
    tracing::info!(%date, processed = report.processed, backfilled = report.backfilled, "backtest pass done");

    let cache = loaded_feedback(&store).await?;
    let checks = store.get_all_accuracy_checks().await?;
    print_json(&serde_json::json!({
        "report": report,
        "summary": summarize(&checks),
        "feedback": cache.status(),
    }))
}

async fn resynthesize(
    settings: &Settings,
    ticker: Option<&str>,
    proposal: Option<&Path>,
    save: bool,
) -> anyhow::Result<()> {
    let text = proposal
        .map(|p| std::fs::read_to_string(p).with_context(|| format!("read {} failed", p.display())))
        .transpose()?;

    let store = PgStore::new(connect(settings).await?);

    match (ticker, text) {
        (Some(ticker), Some(text)) => {
            let proposal = fairval_core::llm::parse_proposal(&text)?;
            let out = service::resynthesize_with_proposal(&store, ticker, proposal, save)
                .await?
                .with_context(|| format!("no analysis found for {ticker}"))?;
            print_json(&out)
        }
        (Some(ticker), None) => {
            let cache = loaded_feedback(&store).await?;
            let out = service::resynthesize_with_feedback(&store, &cache, ticker, save)
                .await?
                .with_context(|| format!("no analysis found for {ticker}"))?;
            print_json(&out)
        }
        (None, Some(text)) => {
            let batch = fairval_core::llm::parse_batch(&text)?;
            print_json(&service::resynthesize_batch(&store, batch, save).await)
        }
        (None, None) => anyhow::bail!("pass --ticker, --proposal, or both"),
    }
}

async fn check_alerts(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {} failed", path.display()))?;
    let rules: Vec<AlertRule> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a list of alert rules", path.display()))?;
    if let Some(bad) = rules.iter().find(|r| !service::is_valid_ticker(&r.ticker)) {
        anyhow::bail!("invalid ticker {:?} in alert rules", bad.ticker);
    }

    let store = PgStore::new(connect(settings).await?);
    let provider = HttpMarketDataProvider::from_settings(settings)?;
    let today = tw_market::local_date(chrono::Utc::now());
    let report =
        alerts::check_alerts(&store, Some(&provider), &rules, &BTreeMap::new(), today).await;
    print_json(&report)
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
