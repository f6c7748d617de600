mod backend;
mod cli;
mod config;
mod dispatch;
mod error;
mod purge;
mod sas;
mod schedule;
mod snapshot;
mod upload;

use std::path::PathBuf;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use dispatch::Dispatcher;
use schedule::CycleStatus;

const DEFAULT_CONFIG_PATH: &str = "agent.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("sas") => return cli::run_sas(&args[2..]),
        Some("list") => return cli::run_list(&args[2..]).await,
        Some("purge") => return cli::run_purge(&args[2..]).await,
        _ => {}
    }

    info!("kvbackup-agent starting");

    // Load config
    let config_path = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AgentConfig::load(&PathBuf::from(&config_path))?;
    info!(path = %config_path, backups = config.backups.len(), "Config loaded");

    let mut dispatcher = Dispatcher::new(&config)?;
    let mut failed = 0usize;
    for spec in &config.backups {
        match dispatcher.handle(spec).await {
            Ok(CycleStatus::Succeeded { backup, .. }) => {
                info!(backup = %spec.name, key = %backup.backup_key, size = backup.size, "First backup complete");
            }
            Ok(CycleStatus::Failed { kind, message, .. }) => {
                failed += 1;
                warn!(backup = %spec.name, kind = %kind, error = %message, "First backup failed");
            }
            Err(e) => {
                failed += 1;
                error!(backup = %spec.name, error = %e, "Backup rejected");
            }
        }
    }

    if dispatcher.schedules().is_empty() {
        if failed > 0 {
            anyhow::bail!("{} of {} backup(s) failed", failed, config.backups.len());
        }
        info!("No recurring schedules, exiting");
        return Ok(());
    }

    info!(schedules = ?dispatcher.schedules(), "Agent running. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Received shutdown signal");

    for name in dispatcher.schedules() {
        if let Some(status) = dispatcher.status(&name) {
            info!(schedule = %name, cycles = status.cycles, failures = status.failures, "Schedule summary");
        }
    }

    dispatcher.shutdown().await;
    info!("Agent stopped");
    Ok(())
}
