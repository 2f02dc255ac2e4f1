use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hookline_core::env::HOOKLINE_CONFIG;

pub mod config;
pub mod inject;
pub mod plugins;

#[derive(Parser)]
#[command(name = "hookline")]
#[command(author, version, about = "Inspect and exercise a scoped hook pipeline in-process")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (TOML)
    #[arg(short, long, global = true, env = HOOKLINE_CONFIG)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the demo application's scope tree and routes
    Plugins(plugins::PluginsArgs),

    /// Dispatch one request through the demo application
    Inject(inject::InjectArgs),

    /// Show or edit configuration
    Config(config::ConfigArgs),
}
