use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use playtrack_core::Settings;
use playtrack_engine::scheduler::{RetentionScheduler, SchedulerConfig};
use playtrack_engine::tracker::{Tracker, TrackerConfig};
use playtrack_engine::HealthState;
use playtrack_feed::{FeedClient, FeedStatus, HistoryImporter};
use playtrack_store::aggregates::AggregateRepo;
use playtrack_store::sessions::SessionRepo;
use playtrack_store::{Database, QueryFacade};

#[derive(Parser)]
#[command(name = "playtrack", about = "Playback session tracker for a media server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Track the live event feed and serve the stats API (default).
    Run,
    /// Backfill historical sessions from the playback-reporting source.
    Import {
        /// Number of days to import.
        #[arg(long, default_value_t = 365)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    if !settings.has_api_token() {
        anyhow::bail!("PLAYTRACK_API_TOKEN is not set");
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Import { days } => run_import(settings, days).await,
        Command::Run => run(settings).await,
    }
}

async fn run_import(settings: Settings, days: u32) -> anyhow::Result<()> {
    let db = Database::open(&settings.database_path)?;
    let importer = HistoryImporter::new(settings, SessionRepo::new(db));
    let outcome = importer.run(days).await?;
    tracing::info!(
        imported = outcome.imported,
        skipped = outcome.skipped,
        "import finished"
    );
    Ok(())
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    tracing::info!("starting playtrack");

    let db = Database::open(&settings.database_path)?;
    let sessions = SessionRepo::new(db.clone());

    // Rows left open by a previous process: anything already past the
    // inactivity window is closed at its last observation. Fresh rows stay
    // open and are re-adopted once the feed lists them again.
    let stale = sessions.close_stale(chrono::Utc::now() - settings.session_timeout())?;
    if stale > 0 {
        tracing::info!(count = stale, "closed stale sessions from previous run");
    }

    let health = Arc::new(HealthState::new());
    let feed_status = Arc::new(FeedStatus::new());
    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(1024);

    let tracker = Tracker::new(
        SessionRepo::new(db.clone()),
        TrackerConfig::from_settings(&settings),
        Arc::clone(&health),
    );
    let tracker_handle = tokio::spawn(tracker.run(event_rx, cancel.child_token()));

    let scheduler = Arc::new(RetentionScheduler::new(
        SessionRepo::new(db.clone()),
        AggregateRepo::new(db.clone()),
        SchedulerConfig::from_settings(&settings),
        Arc::clone(&health),
    ));
    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.child_token()));

    let feed = FeedClient::new(settings.clone(), event_tx, Arc::clone(&feed_status));
    let feed_handle = tokio::spawn(feed.run(cancel.child_token()));

    let metrics_handle = playtrack_server::metrics::install_recorder();
    let state = playtrack_server::AppState {
        facade: Arc::new(QueryFacade::new(db)),
        health,
        feed_status,
        metrics: metrics_handle,
    };
    let server = playtrack_server::start(
        playtrack_server::ServerConfig { port: settings.http_port },
        state,
    )
    .await?;
    tracing::info!(port = server.port, "playtrack ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();

    // Let the feed, tracker, and any in-flight scheduler unit finish.
    let _ = feed_handle.await;
    let _ = tracker_handle.await;
    let _ = scheduler_handle.await;

    tracing::info!("playtrack stopped");
    Ok(())
}
