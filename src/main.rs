//! Command-line entry point for `tor-ctl-filter`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tor_ctl_filter::{cfg, logging, process, supervisor};

/// A protective, policy-filtering proxy in front of a Tor control port.
#[derive(Debug, Parser)]
#[command(name = "tor-ctl-filter", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: PathBuf,

    /// Override the configured logging level (e.g. "debug", "info,tor_ctl_filter::session=trace").
    #[arg(short = 'l', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Override the configured logfile path.
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Don't check permissions on the cookie files we read.
    #[arg(long, global = true)]
    disable_fs_permission_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy and run until interrupted.
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = cfg::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(log_file) = cli.log_file {
        settings.logging.file = Some(log_file);
    }
    let settings = Arc::new(settings);

    let _log_guard = logging::setup(&settings.logging, cli.log_level.as_deref())
        .context("setting up logging")?;

    let mistrust = if cli.disable_fs_permission_checks {
        fs_mistrust::Mistrust::new_dangerously_trust_everyone()
    } else {
        fs_mistrust::Mistrust::new()
    };
    let mistrust = Arc::new(mistrust);

    process::use_max_file_limit();

    let Command::Run = cli.command;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;

    runtime.block_on(async move {
        tokio::select! {
            res = supervisor::run(settings, mistrust) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt, shutting down");
                Ok(())
            }
        }
    })
}
