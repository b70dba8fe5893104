mod archive;
mod cli;
mod config;
mod constants;
mod dedup;
mod locator;
mod permissions;
mod restore;
mod rotate;
mod service;
mod snapshot;
mod utils;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::cli::{Cli, Commands, RestoreArgs, RotateArgs};
use crate::config::{load_config, resolve_config_path, RestoreConfig};
use crate::restore::{render_summary, restore_all, RestoreOptions};
use crate::service::Systemctl;

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,restorarr=info".into());
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn load(path: Option<PathBuf>) -> Result<RestoreConfig> {
    let path = resolve_config_path(path);
    tracing::info!(config = %path.display(), "loading restore configuration");
    load_config(&path)
}

fn restore(config: RestoreConfig, args: RestoreArgs) -> Result<()> {
    let unknown: Vec<&String> = args
        .apps
        .iter()
        .filter(|name| !config.apps.iter().any(|entry| &entry.name == *name))
        .collect();
    if !unknown.is_empty() {
        bail!("unknown application(s): {unknown:?}");
    }
    if !utils::is_root() {
        tracing::warn!("not running as root; service control and ownership changes may fail");
    }

    let services = Systemctl::detect();
    let options = RestoreOptions {
        stop_timeout: Duration::from_secs(args.stop_timeout_secs),
    };
    let outcomes = restore_all(&config.apps, &args.apps, &services, &options);
    println!("{}", render_summary(&outcomes));

    let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
    if failed > 0 {
        bail!("{failed} application(s) did not restore cleanly");
    }
    Ok(())
}

fn rotate(config: RestoreConfig, args: RotateArgs) -> Result<()> {
    let keep = args.keep.unwrap_or(config.rotation.keep);
    let roots = config.backup_roots();
    if roots.is_empty() {
        tracing::warn!("no backup roots configured; nothing to rotate");
        return Ok(());
    }
    let reports = rotate::rotate_all(&roots, keep);
    let mut failures = 0;
    for report in &reports {
        println!(
            "{}: kept {}, removed {}, failed {}",
            report.root.display(),
            report.kept.len(),
            report.removed.len(),
            report.failed.len()
        );
        failures += report.failed.len();
    }
    if failures > 0 {
        bail!("rotation finished with {failures} failure(s)");
    }
    Ok(())
}

fn dedup(config: RestoreConfig) -> Result<()> {
    let dedup = config
        .dedup
        .context("configuration has no dedup block")?;
    let report = dedup::run_dedup(&dedup)?;
    println!(
        "examined {}, deleted {}, failed {}, removed {} empty dir(s)",
        report.examined,
        report.deleted.len(),
        report.failed.len(),
        report.removed_dirs.len()
    );
    if !report.failed.is_empty() {
        bail!("dedup finished with {} failure(s)", report.failed.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = load(cli.config)?;
    match cli.command {
        Commands::Restore(args) => restore(config, args),
        Commands::Rotate(args) => rotate(config, args),
        Commands::Dedup => dedup(config),
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
