//! meshfw - mesh radio firmware artifact tool
//!
//! Fetches, unpacks and probes firmware artifacts using the same retrieval
//! rules as the update core, without a device attached.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;
mod error;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{ExtractArgs, FetchArgs};

#[derive(Parser)]
#[command(name = "meshfw")]
#[command(about = "Fetch and unpack mesh radio firmware artifacts")]
#[command(version)]
#[command(long_about = "
meshfw resolves firmware artifacts with the same rules the update core uses:
the conventional direct-asset URL first, then the release bundle. Artifacts
are staged in the scratch directory and copied to the requested output.

Use --json for machine-readable output suitable for scripting.
")]
struct Cli {
    /// Output in JSON format for machine parsing
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "MESHFW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the direct-asset base URL
    #[arg(long, global = true, env = "MESHFW_BASE_URL")]
    base_url: Option<String>,

    /// Override the scratch directory
    #[arg(long, global = true, env = "MESHFW_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve the artifact a transport would flash and save it
    Fetch(FetchArgs),

    /// Extract one target's image from a release bundle
    Extract(ExtractArgs),

    /// Check whether a firmware URL exists
    Probe {
        /// URL to probe with HEAD
        url: String,
    },

    /// Clear the scratch directory
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("meshfw={log_level},meshfw_update={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match execute_command(&cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            std::process::exit(error::exit_code(&e));
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let config = commands::load_config(
        cli.config.as_deref(),
        cli.base_url.as_deref(),
        cli.scratch_dir.as_deref(),
    )?;

    match &cli.command {
        Commands::Fetch(args) => commands::fetch::execute(args, &config, cli.json).await,
        Commands::Extract(args) => commands::extract::execute(args, &config, cli.json).await,
        Commands::Probe { url } => commands::probe::execute(url, &config, cli.json).await,
        Commands::Purge => commands::purge::execute(&config, cli.json).await,
    }
}
