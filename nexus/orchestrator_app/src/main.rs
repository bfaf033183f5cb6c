//! `nexus` — entrypoint for the NEXUS self-learning control plane.
//!
//! Builds every component once, then either drives the learning and
//! autonomous loops until a shutdown signal arrives, or runs a one-shot
//! maintenance command.

mod core;

use std::{
    env,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::core::CoreContext;

#[derive(Parser, Debug)]
#[command(name = "nexus", version, about = "NEXUS self-learning control plane")]
struct Cli {
    /// Project root holding `data/` and `workspace/`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the learning and autonomous loops until shutdown.
    Run {
        /// Stop after this many iterations (default: run forever).
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Runs exactly one learning iteration and prints the report.
    Iterate,
    /// Prints a status summary.
    Status,
    /// Runs one knowledge scan across all sources.
    Scan,
    /// Creates a backup of the brain data directory.
    Backup {
        /// Optional tag appended to the archive name.
        #[arg(long)]
        tag: Option<String>,
    },
    /// Lists available backups.
    Backups,
    /// Restores a named backup archive.
    Restore {
        /// Archive name (`nexus_backup_*.tar.gz`).
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let core = CoreContext::build(&cli.root).context("building NEXUS core")?;

    match cli.command {
        Commands::Run { max_iterations } => run_loops(core, max_iterations).await,
        Commands::Iterate => {
            let report = core.learning.run_iteration().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            core.debugger.end_session();
            Ok(())
        }
        Commands::Status => {
            let status = json!({
                "learning": core.learning.status_report(),
                "health": core.debugger.health_report(),
                "actions": core.actions.stats(),
                "memory": core.store.stats(),
                "sources": core.scout.source_stats(),
                "autonomous": core.autonomous.status(),
                "skills": core.skills.skill_report(),
                "self_reminder": core.reminder.status(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Scan => {
            let results = core.scout.scan_all().await;
            let total: usize = results.values().map(Vec::len).sum();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "sources_scanned": results.len(),
                    "total_findings": total,
                }))?
            );
            Ok(())
        }
        Commands::Backup { tag } => {
            let info = core.backups.create_backup(tag.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::Backups => {
            let backups = core.backups.list_backups()?;
            println!("{}", serde_json::to_string_pretty(&backups)?);
            Ok(())
        }
        Commands::Restore { name } => {
            let info = core.backups.restore_backup(&name)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

async fn run_loops(core: CoreContext, max_iterations: Option<u64>) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let learning = Arc::clone(&core.learning);
    let autonomous = Arc::clone(&core.autonomous);

    let learning_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match max_iterations {
                Some(budget) => {
                    for _ in 0..budget {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        learning.run_iteration().await;
                    }
                    shutdown.store(true, Ordering::SeqCst);
                }
                None => learning.run(shutdown).await,
            }
        })
    };
    let autonomous_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { autonomous.run(shutdown).await })
    };

    let grace = Duration::from_secs(
        env::var("GRACEFUL_SHUTDOWN_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
    );
    let joined = async {
        let _ = learning_task.await;
        let _ = autonomous_task.await;
    };
    tokio::select! {
        () = joined => {}
        () = async {
            // Give the loops the grace period once shutdown is requested.
            while !shutdown.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(grace).await;
        } => {}
    }

    core.debugger.end_session();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
