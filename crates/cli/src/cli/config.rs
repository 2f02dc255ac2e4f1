use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use hookline_core::Config;
use hookline_core::env::HOOKLINE_CONFIG;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Get a config value by dotted key (e.g. server.body_limit)
    Get { key: String },

    /// Set a config value and save the file
    Set { key: String, value: String },

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config: Config, path: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommands::Get { key } => {
            println!("{}", config.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            let path = require_path(path)?;
            let mut config = config;
            config.set_value(&key, &value)?;
            config.save(&path)?;
            println!("{} = {}", key, config.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Init { force } => {
            let path = require_path(path)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

fn require_path(path: Option<&Path>) -> Result<PathBuf> {
    path.map(Path::to_path_buf)
        .or_else(Config::config_path)
        .with_context(|| format!("No config file given; pass --config or set {}", HOOKLINE_CONFIG))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_then_get_roundtrips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hookline.toml");

        let args = ConfigArgs {
            command: ConfigCommands::Set {
                key: "server.body_limit".into(),
                value: "2048".into(),
            },
        };
        run(args, Config::default(), Some(&path)).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.server.body_limit, 2048);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hookline.toml");
        let init = |force| ConfigArgs {
            command: ConfigCommands::Init { force },
        };

        run(init(false), Config::default(), Some(&path)).unwrap();
        assert!(run(init(false), Config::default(), Some(&path)).is_err());
        run(init(true), Config::default(), Some(&path)).unwrap();
    }
}
