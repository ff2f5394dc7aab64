use clap::{Parser, Subcommand};

mod commands;

use commands::{PositionsArgs, RunArgs};

#[derive(Parser)]
#[command(name = "algo-trade")]
#[command(about = "Exit risk engine for intraday options positions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exit engine until Ctrl+C
    Run(RunArgs),
    /// Load and validate a config file, then print the effective config
    CheckConfig {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        /// Profile overlay (e.g. "paper" loads Config.paper.toml on top)
        #[arg(short, long)]
        profile: Option<String>,
    },
    /// List active positions from the authoritative store
    Positions(PositionsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run(args) => {
            commands::run_engine(args).await?;
        }
        Commands::CheckConfig { config, profile } => {
            commands::run_check_config(&config, profile.as_deref())?;
        }
        Commands::Positions(args) => {
            commands::run_positions(args).await?;
        }
    }

    Ok(())
}
