use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::{ConfigLoader, FloodgateConfig, LoggingConfig};
use floodgate::ratelimit::{BackendKind, Decision};

#[derive(Parser)]
#[command(name = "floodgate", version, about = "Token-bucket admission control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate configuration, then print the effective settings
    Validate {
        /// Configuration file (YAML or TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run admission decisions for one key and print a summary
    Check {
        /// Configuration file (YAML or TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Partition key to spend tokens from
        #[arg(short, long)]
        key: String,

        /// Number of decisions to make
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

#[derive(Serialize)]
struct CheckSummary {
    key: String,
    backend: BackendKind,
    allowed: u32,
    denied: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => {
            let config = load_config(config)?;
            init_tracing(&config.logging);

            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Check { config, key, count } => {
            let config = load_config(config)?;
            init_tracing(&config.logging);

            let summary = check(&config, key, count).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<FloodgateConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_config_path(path);
    }

    loader.load().context("Failed to load configuration")
}

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn check(config: &FloodgateConfig, key: String, count: u32) -> anyhow::Result<CheckSummary> {
    let limiter = config
        .build_limiter()
        .context("Failed to build rate limiter")?;

    info!(
        key = %key,
        count = count,
        backend = %limiter.backend_kind(),
        "Running admission check"
    );

    let mut allowed = 0;
    let mut denied = 0;
    for _ in 0..count {
        match limiter.decide_key(&key, limiter.now_ms()).await {
            Decision::Allow => allowed += 1,
            Decision::Deny => denied += 1,
        }
    }

    Ok(CheckSummary {
        key,
        backend: limiter.backend_kind(),
        allowed,
        denied,
    })
}
