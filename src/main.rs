//! Pump.fun Volume Engine - multi-wallet volume sessions with live risk monitoring
//!
//! # WARNING
//! - This tool trades with real money from every configured wallet.
//! - Each cycle pays venue fees, priority fees and slippage; volume is not free.
//! - Keep keypair files at mode 600; custody refuses anything looser.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use pump_volume::cli::commands;
use pump_volume::config::Config;

/// Pump.fun Volume Engine
#[derive(Parser)]
#[command(name = "volume")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a volume session until completion or Ctrl-C
    Start {
        /// Owner of the session and its wallets
        #[arg(long)]
        user: String,

        /// Token mint address
        #[arg(long)]
        asset: String,

        /// Target volume in SOL (default from config)
        #[arg(long)]
        target_volume: Option<f64>,
    },

    /// Preview an execution plan offline
    Plan {
        /// bullish, defensive or arbitrage
        #[arg(long)]
        strategy: String,

        /// Number of wallets to plan for
        #[arg(long)]
        wallets: usize,

        /// Cycle volume in SOL (default: strategy-scaled base volume)
        #[arg(long)]
        volume: Option<f64>,

        /// Seed for reproducible randomization
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Classify a metrics snapshot from a JSON file
    Classify {
        /// Path to the metrics JSON
        #[arg(long)]
        metrics: PathBuf,
    },

    /// Show a stored session and its recent executions
    Status {
        /// Session ID
        #[arg(long)]
        session: String,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let directive = "pump_volume=info".parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded from {}", cli.config);

    let result = match cli.command {
        Commands::Start {
            user,
            asset,
            target_volume,
        } => commands::start(&config, &user, &asset, target_volume).await,
        Commands::Plan {
            strategy,
            wallets,
            volume,
            seed,
        } => commands::plan(&config, &strategy, wallets, volume, seed),
        Commands::Classify { metrics } => commands::classify(&config, &metrics).await,
        Commands::Status { session } => commands::status(&config, &session).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
