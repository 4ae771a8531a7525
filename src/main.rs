use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hopscope::bootstrap::setup_environment;
use hopscope::config::{Config, Mode};

#[derive(Parser)]
#[command(name = "hopscope", version, about = "Traceroute enrichment service")]
struct Cli {
    /// Configuration file (overrides HOPSCOPE_CONFIG and the well-known
    /// paths).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the enrichment worker: consumers, dispatchers, IXP updater,
    /// housekeeper.
    Worker,
    /// Run the web-side task set: the job dispatcher only.
    Web,
}

fn init_logging(config: &Config) {
    let filter = match &config.logging {
        Some(directives) => EnvFilter::try_new(directives)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config);

    let mode = match cli.command {
        Command::Worker => Mode::Worker,
        Command::Web => Mode::Web,
    };

    let mut env = setup_environment(&config, mode).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = env.wait() => {}
    }

    env.shutdown().await;

    Ok(())
}
