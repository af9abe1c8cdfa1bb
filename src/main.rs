use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use validator_ha::config::Config;
use validator_ha::manager::Manager;

#[derive(Parser, Debug)]
#[command(
    name = "validator-ha",
    about = "High availability manager for Solana validators",
    long_about = "Monitors cluster gossip and manages failover decisions so that exactly one \
                  peer in the HA set holds the shared active identity at a time."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HA supervisor
    Run {
        /// Path to the configuration file
        #[arg(long, short, default_value = "~/validator-ha/config.yaml")]
        config: PathBuf,

        /// Override log.level from the config (debug, info, warn, error, fatal)
        #[arg(long, short = 'l')]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, log_level } => run(config, log_level).await,
    }
}

async fn run(config_path: PathBuf, log_level: Option<String>) -> ExitCode {
    // Config comes first: it decides how logging is set up. Failures here
    // go straight to stderr.
    let cfg = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = log_level.unwrap_or_else(|| cfg.log.level.clone());
    if let Err(e) = init_logging(&level, &cfg.log.format) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    if cfg.failover.dry_run {
        tracing::warn!("failover.dry_run is true - failovers will dry-run commands only and be no-op");
    }

    let manager = match Manager::new(cfg).await {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "failed to initialize");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = manager.run().await {
        error!(error = %e, "HA manager failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    // "fatal" is accepted in config for operator familiarity; tracing has
    // no fatal level, so it maps to error.
    let level = match level {
        "fatal" => "error",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    match format {
        "json" => builder.json().init(),
        "logfmt" => builder.with_ansi(false).compact().init(),
        _ => builder.init(),
    }
    Ok(())
}
