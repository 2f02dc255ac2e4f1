use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hookline_core::config::Config;
use hookline_core::env::HOOKLINE_LOG;

mod cli;
mod demo;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    // RUST_LOG wins, then HOOKLINE_LOG, then --verbose / the configured level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_from_env(HOOKLINE_LOG))
                .unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Plugins(args) => crate::cli::plugins::run(args, config).await,
        Commands::Inject(args) => crate::cli::inject::run(args, config).await,
        Commands::Config(args) => crate::cli::config::run(args, config, cli.config.as_deref()),
    }
}
