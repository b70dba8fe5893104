use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::DEFAULT_STOP_TIMEOUT_SECS;

#[derive(Parser)]
#[command(
    name = "restorarr",
    version,
    about = "Restore application state from the latest backups"
)]
pub struct Cli {
    /// Restore configuration (falls back to $RESTORARR_CONFIG, then /etc/restorarr/restore_apps.json).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Also append logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Restore(RestoreArgs),
    Rotate(RotateArgs),
    Dedup,
    ShowConfig,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Only restore these applications; may be repeated.
    #[arg(long = "app")]
    pub apps: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_STOP_TIMEOUT_SECS)]
    pub stop_timeout_secs: u64,
}

#[derive(Args)]
pub struct RotateArgs {
    /// Overrides `rotation.keep` from the configuration.
    #[arg(long)]
    pub keep: Option<usize>,
}
