use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ghscan_core::StatType;
use ghscan_sync::{scheduler, Stage, StageReport, SyncPipeline};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ghscan")]
#[command(about = "Regional GitHub account crawler and analytics pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search accounts in the configured location for the next date window.
    FetchUsers,
    /// Enumerate repositories for the least recently fetched accounts.
    FetchRepos,
    /// Recompute one stat, or every stat with `all`.
    Recompute {
        #[arg(default_value = "all")]
        stat: String,
    },
    /// Build per-account profiles from stored repositories.
    Profiles,
    /// Rank similar accounts for every profile.
    Matches,
    /// Run every stage on its crontab until interrupted.
    Schedule,
    /// Serve the read-only JSON endpoints.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Delete every stored account, repository and stat.
    Drop {
        #[arg(long)]
        yes: bool,
    },
}

fn init_logger() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding report")?);
    Ok(())
}

/// Token cancelled on Ctrl-C so a manual run stops at its next suspension
/// point and keeps what it already committed.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });
    cancel
}

async fn run_once(pipeline: &SyncPipeline, stage: Stage) -> Result<()> {
    let report: StageReport = pipeline.run_stage_with(stage, &interrupt_token()).await?;
    print_json(&report)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let cli = Cli::parse();
    let pipeline = SyncPipeline::from_env().await?;

    match cli.command {
        Commands::FetchUsers => run_once(&pipeline, Stage::FetchAccounts).await?,
        Commands::FetchRepos => run_once(&pipeline, Stage::FetchRepositories).await?,
        Commands::Recompute { stat } => {
            if stat == "all" {
                let report = pipeline.recompute_all(&interrupt_token()).await?;
                print_json(&StageReport::RecomputeAll(report))?;
            } else {
                let stat: StatType = stat.parse()?;
                run_once(&pipeline, Stage::Recompute(stat)).await?;
            }
        }
        Commands::Profiles => run_once(&pipeline, Stage::BuildProfiles).await?,
        Commands::Matches => run_once(&pipeline, Stage::RankMatches).await?,
        Commands::Schedule => scheduler::run_until_shutdown(pipeline).await?,
        Commands::Serve { port } => {
            let port = port.unwrap_or(pipeline.config().web_port);
            ghscan_web::serve(pipeline.store().clone(), port).await?;
        }
        Commands::Drop { yes } => {
            if !yes {
                bail!("refusing to drop every collection without --yes");
            }
            let store = pipeline.store();
            store.accounts().drop_all().await.context("dropping users")?;
            store.repositories().drop_all().await.context("dropping repos")?;
            store.stat_records().drop_all().await.context("dropping stats")?;
            info!("all collections dropped");
        }
    }

    Ok(())
}
