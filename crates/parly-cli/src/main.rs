use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use parly_storage::{FileCheckpointStore, HttpFetcher, PgStore, Store};
use parly_sync::{
    backfill_bill_details, seed_members, BillProgressJob, BillsJob, CancelFlag, EntityJob,
    PayloadFetcher, RolesJob, SyncConfig, SyncEngine, VotesJob,
};

#[derive(Parser)]
#[command(name = "parly", about = "Incremental sync of Canadian parliamentary records")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Seed the members table from the public member directory
    SeedMembers,
    /// Run one entity sync job, resuming from its checkpoint if present
    Sync {
        #[arg(value_enum)]
        entity: EntityArg,
    },
    /// Fill missing bill detail columns from the bill JSON endpoint
    Backfill {
        /// Concurrent workers; defaults to PARLY_BACKFILL_WORKERS
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EntityArg {
    Roles,
    Votes,
    Bills,
    BillProgress,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SyncConfig::from_env()?;
    let cancel = CancelFlag::default();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::SeedMembers => {
            let store = PgStore::connect(&config.database_url).await?;
            let fetcher = HttpFetcher::new(config.http_config())?;
            let (inserted, total) = seed_members(&store, &fetcher).await?;
            println!("seeded members: {inserted} new of {total} listed");
        }
        Commands::Sync { entity } => match entity {
            EntityArg::Roles => run_sync(&config, &RolesJob, cancel).await?,
            EntityArg::Votes => run_sync(&config, &VotesJob, cancel).await?,
            EntityArg::Bills => run_sync(&config, &BillsJob::default(), cancel).await?,
            EntityArg::BillProgress => run_sync(&config, &BillProgressJob, cancel).await?,
        },
        Commands::Backfill { workers } => {
            let store = PgStore::connect(&config.database_url).await?;
            let fetcher = HttpFetcher::new(config.http_config())?;
            let workers = workers.unwrap_or(config.backfill_workers);
            let summary = backfill_bill_details(
                Arc::new(store) as Arc<dyn Store>,
                Arc::new(fetcher) as Arc<dyn PayloadFetcher>,
                workers,
                cancel,
            )
            .await?;
            println!("{summary}");
        }
    }

    Ok(())
}

async fn run_sync<J: EntityJob>(
    config: &SyncConfig,
    job: &J,
    cancel: CancelFlag,
) -> anyhow::Result<()> {
    let store = PgStore::connect(&config.database_url).await?;
    let fetcher =
        HttpFetcher::new(config.http_config()).context("building http client")?;
    let checkpoints =
        FileCheckpointStore::for_job(&config.checkpoint_dir, job.entity().job_name());

    let engine = SyncEngine {
        store: &store,
        fetcher: &fetcher,
        checkpoints: &checkpoints,
        cancel,
    };
    let summary = engine.run(job).await?;
    println!("{summary}");
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current owner before stopping");
            cancel.cancel();
        }
    });
}
