use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use news_etl::config::Config;
use news_etl::feed::FeedFetcher;
use news_etl::pipeline::{
    self, PipelineError, PipelineRunner, RunFailure, RunReport, RunSettings, Stage,
};
use news_etl::storage::{Database, StoreError};

/// A run failed (including failures to reach the store at startup).
const EXIT_RUN_FAILED: u8 = 1;
/// Configuration was missing or invalid; no run was attempted.
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "news-etl",
    version,
    about = "Load new items from a news RSS feed into a relational store"
)]
struct Args {
    /// TOML config file (environment variables override its values)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Repeat the run every N minutes until interrupted (0 = run once)
    #[arg(long, value_name = "N")]
    interval_minutes: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional; real environment variables take precedence over it
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }

    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let error = PipelineError::from(e);
            tracing::error!(kind = %error.kind(), error = %error, "Invalid configuration");
            eprintln!(
                "{}",
                serde_json::json!({ "kind": error.kind(), "message": error.to_string() })
            );
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(minutes) = args.interval_minutes {
        config.interval_minutes = minutes;
    }
    tracing::debug!(config = ?config, "Resolved configuration");

    match execute(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Fatal error");
            ExitCode::from(EXIT_RUN_FAILED)
        }
    }
}

/// Builds the fetcher, then runs once or on a fixed interval.
async fn execute(config: Config) -> Result<ExitCode> {
    let fetcher = match FeedFetcher::new(
        config.fetch_timeout,
        &config.user_agent,
        config.max_feed_bytes,
    ) {
        Ok(fetcher) => fetcher,
        Err(e) => return Ok(startup_failure(&config, e.into())),
    };

    if config.interval_minutes > 0 {
        run_on_interval(fetcher, &config).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut runner = match connect(fetcher, &config).await {
        Ok(runner) => runner,
        Err(e) => return Ok(startup_failure(&config, e.into())),
    };

    let code = match runner.run().await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("{}", failure.to_json());
            ExitCode::from(EXIT_RUN_FAILED)
        }
    };

    runner.store().close().await;
    Ok(code)
}

/// Opens the store (one retry) and wires a runner around it.
async fn connect(
    fetcher: FeedFetcher,
    config: &Config,
) -> Result<PipelineRunner<Database>, StoreError> {
    let db = Database::open_with_retry(config.database_url(), config.retry_backoff).await?;

    let stored = db.count_records().await?;
    let last_ingested = db.last_ingested_at().await?;
    tracing::info!(
        backend = db.backend_name(),
        feed = %config.feed_url,
        stored,
        last_ingested = ?last_ingested.map(|t| t.to_rfc3339()),
        "Store ready"
    );

    Ok(PipelineRunner::new(
        fetcher,
        db,
        config.feed_url.clone(),
        RunSettings::from(config),
    ))
}

/// Runs immediately, then every `interval_minutes`, until Ctrl-C.
///
/// A failed run is reported and the loop continues. A store that cannot be
/// reached counts as a failed run and is reopened on the next tick. Ctrl-C
/// pressed during a run stops the loop once that run completes.
async fn run_on_interval(fetcher: FeedFetcher, config: &Config) -> Result<()> {
    let minutes = config.interval_minutes;
    let period = Duration::from_secs(minutes.saturating_mul(60));
    tracing::info!(interval_minutes = minutes, "Running on a fixed interval, Ctrl-C to stop");

    let mut listener_error = None;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            listener_error = Some(e);
        }
    };

    let open = || {
        let fetcher = fetcher.clone();
        async move {
            connect(fetcher, config).await.map_err(|e| {
                RunFailure::new(Stage::Idle, &PipelineError::from(e), &config.feed_url)
            })
        }
    };

    let runner = pipeline::run_on_interval(period, open, shutdown, |result| match result {
        Ok(report) => print_report(&report),
        Err(failure) => eprintln!("{}", failure.to_json()),
    })
    .await;

    if let Some(runner) = runner {
        runner.store().close().await;
    }
    match listener_error {
        Some(e) => Err(e).context("Failed to listen for Ctrl-C"),
        None => Ok(()),
    }
}

fn startup_failure(config: &Config, error: PipelineError) -> ExitCode {
    let failure = RunFailure::new(Stage::Idle, &error, &config.feed_url);
    tracing::error!(
        kind = %failure.kind,
        feed = %failure.feed_url,
        error = %failure.message,
        "Startup failed"
    );
    eprintln!("{}", failure.to_json());
    ExitCode::from(EXIT_RUN_FAILED)
}

fn print_report(report: &RunReport) {
    println!(
        "Loaded {} new record(s): {} seen, {} skipped, {} already present ({:.2}s)",
        report.loaded,
        report.entries_seen,
        report.skipped,
        report.already_present,
        report.elapsed.as_secs_f64()
    );
}
