//! Bulk outbound message dispatcher
//!
//! - `volley run` dispatches the campaigns described by the configuration
//! - `volley check-config` validates the configuration and exits

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use volley::{
    Volley,
    config::{CONFIG_ENV, DEFAULT_CONFIG_PATHS, find_config_file},
};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[derive(Parser, Debug)]
#[command(name = "volley")]
#[command(about = "Rate-limited bulk message dispatcher", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file (RON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Dispatch every configured campaign (the default)
    #[default]
    Run,
    /// Parse and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(
        cli.config.as_deref(),
        std::env::var(CONFIG_ENV).ok(),
        DEFAULT_CONFIG_PATHS,
    )?;
    let volley = Volley::load(&config_path)?;

    match cli.command.unwrap_or_default() {
        Commands::Run => volley.run().await,
        Commands::CheckConfig => {
            volley.validate()?;
            println!(
                "{}: OK ({} campaign(s), {} workers, {} msg/s)",
                config_path.display(),
                volley.simulation.campaigns.len(),
                volley.dispatch.worker_count,
                volley.dispatch.rate_limit.messages_per_second
            );
            Ok(())
        }
    }
}
