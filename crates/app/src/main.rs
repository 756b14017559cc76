use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use engine::{
    Clock, Deadline, Engine, EngineConfig, PendingConfig, SweeperConfig, SystemClock,
    eligibility::EligibilityPolicy,
};
use migration::{Migrator, MigratorTrait};
use settings::{Database, Settings};

mod settings;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "stored_value")]
#[command(about = "Stored-value ledger: migrations and pending expiry sweeper")]
struct Cli {
    /// Settings file (also read from `LEDGER_SETTINGS`).
    #[arg(long, env = "LEDGER_SETTINGS", default_value = "settings.toml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate the database and sweep expired pending transactions on an
    /// interval until interrupted.
    Run,
    /// Run a single sweep and exit.
    SweepOnce,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let settings = Settings::new(&cli.settings)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "stored_value={level},engine={level},migration={level}",
            level = settings.app.level
        ))
        .init();

    let db = parse_database(&settings.database).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = build_engine(&settings, db, clock.clone()).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&engine, &settings.sweeper, clock.as_ref()).await,
        Command::SweepOnce => {
            sweep(&engine, &settings.sweeper, clock.as_ref()).await?;
            Ok(())
        }
    }
}

async fn run(
    engine: &Engine,
    sweeper: &settings::Sweeper,
    clock: &dyn Clock,
) -> Result<(), BoxError> {
    if !sweeper.enabled {
        tracing::info!("sweeper disabled, waiting for ctrl-c");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(sweeper.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = sweep(engine, sweeper, clock).await {
                    tracing::error!("pending expiry sweep failed: {err}");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn sweep(
    engine: &Engine,
    sweeper: &settings::Sweeper,
    clock: &dyn Clock,
) -> Result<(), BoxError> {
    let deadline = Deadline::after(clock, chrono::Duration::seconds(sweeper.budget_secs));
    let report = engine.sweep_expired_pending(deadline).await?;
    tracing::info!(
        fetched = report.fetched,
        processed = report.processed,
        failed = report.failed,
        budget_exceeded = report.remaining_budget_exceeded,
        "pending expiry sweep finished"
    );
    Ok(())
}

async fn build_engine(
    settings: &Settings,
    db: sea_orm::DatabaseConnection,
    clock: Arc<dyn Clock>,
) -> Result<Engine, BoxError> {
    let defaults = PendingConfig::default();
    let config = EngineConfig {
        eligibility: EligibilityPolicy {
            enforce_active: settings.engine.enforce_active,
            enforce_start_date: settings.engine.enforce_start_date,
        },
        pending: PendingConfig {
            default_window: settings
                .engine
                .pending_default_days
                .map_or(defaults.default_window, chrono::Duration::days),
            max_window: settings
                .engine
                .pending_max_days
                .map_or(defaults.max_window, chrono::Duration::days),
        },
        sweeper: SweeperConfig {
            batch_size: settings.sweeper.batch_size,
            safety_margin: chrono::Duration::seconds(settings.sweeper.safety_margin_secs),
        },
    };

    let mut builder = Engine::builder().database(db).clock(clock).config(config);
    match &settings.engine.code_secret {
        Some(secret) => builder = builder.code_secret(secret),
        None => tracing::warn!(
            "engine.code_secret is unset, code hashes use the built-in development secret"
        ),
    }
    Ok(builder.build().await?)
}

async fn parse_database(config: &Database) -> Result<sea_orm::DatabaseConnection, BoxError> {
    let url = match config {
        Database::Memory => String::from("sqlite::memory:"),
        Database::Sqlite(path) => format!("sqlite:{}?mode=rwc", path),
    };

    let database = sea_orm::Database::connect(url).await?;
    Migrator::up(&database, None).await?;
    tracing::info!("database ready");
    Ok(database)
}
