use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use forgelog_sync::{AppConfig, JobOutcome, Orchestrator};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "forgelog")]
#[command(about = "Sync forge activity events into ClickHouse and Neo4j")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync of the tracked Gitee orgs and repos.
    SyncGitee,
    /// Import archive files into the graph; without files, imports every unmarked archive.
    ImportLogs { files: Vec<PathBuf> },
    /// Download hourly archives in `[from, to)`.
    Download {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
    /// Wipe the graph and recreate its constraints.
    InitGraph,
    /// Run the cron jobs until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FORGELOG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FORGELOG_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        fmt().with_env_filter(filter).json().with_target(false).init();
    } else {
        fmt().with_env_filter(filter).with_target(false).compact().init();
    }
}

async fn confirm(question: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(question.as_bytes()).await?;
    stdout.flush().await?;
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("reading confirmation")?;
    Ok(answer.trim_end_matches(['\r', '\n']) == "Yes")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if matches!(cli.command, Commands::Schedule) {
        config.scheduler_enabled = true;
    }
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);

    match cli.command {
        Commands::SyncGitee => match orchestrator.run_gitee_sync().await? {
            JobOutcome::Completed(report) => println!(
                "sync complete: run_id={} entities={} pages={} inserted={} dropped={} failed={}",
                report.run_id, report.entities, report.pages, report.inserted, report.dropped, report.failed
            ),
            JobOutcome::Skipped => println!("sync skipped: another run is in progress"),
        },
        Commands::ImportLogs { files } => {
            let report = if files.is_empty() {
                match orchestrator.run_log_import().await? {
                    JobOutcome::Completed(report) => report,
                    JobOutcome::Skipped => {
                        println!("import skipped: another run is in progress");
                        return Ok(());
                    }
                }
            } else {
                orchestrator.import_files(files).await?
            };
            println!(
                "import complete: files={} committed={} failed={} unmarked={} nodes={} edges={}",
                report.files, report.committed, report.failed, report.unmarked, report.nodes, report.edges
            );
        }
        Commands::Download { from, to } => {
            let report = orchestrator.download(from, to).await?;
            println!(
                "download complete: downloaded={} already_present={} not_found={} timed_out={} failed={}",
                report.downloaded, report.already_present, report.not_found, report.timed_out, report.failed
            );
        }
        Commands::InitGraph => {
            if confirm("!!!Do you want to init the neo4j database?(Yes) ").await? {
                orchestrator.init_graph().await?;
                println!("graph initialized");
            } else {
                println!("graph left untouched");
            }
        }
        Commands::Schedule => {
            let Some(sched) = orchestrator.maybe_build_scheduler().await? else {
                return Ok(());
            };
            let immediate = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                if let Err(err) = immediate.run_gitee_sync().await {
                    error!(error = %format!("{err:#}"), "initial gitee sync failed");
                }
            });
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
