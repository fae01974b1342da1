//! CLI subcommand: `winecage config`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::io::Write;
use std::path::Path;

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration (file values merged over defaults)
    Show {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Print one value, e.g. `x11.width`
    Get { key: String },

    /// Change one value and write the config file
    Set { key: String, value: String },

    /// Print where the config file and runtime directory live
    Path,

    /// Write a commented config file with the defaults
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, mut config: Config) -> Result<()> {
    match args.command {
        ConfigCommands::Show { json } => {
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                toml::to_string_pretty(&config)?
            };
            println!("{}", rendered.trim_end());
        }
        ConfigCommands::Get { key } => println!("{}", config.get_value(&key)?),
        ConfigCommands::Set { key, value } => {
            config.set_value(&key, &value)?;
            config.save()?;
            eprintln!("{} = {} (saved to {})", key, value, config.file_path().display());
        }
        ConfigCommands::Path => {
            let exists = if config.file_path().exists() {
                ""
            } else {
                " (not created yet)"
            };
            println!("config:  {}{}", config.file_path().display(), exists);
            println!("runtime: {}", config.paths.runtime_dir.display());
        }
        ConfigCommands::Init { force } => {
            let path = config.file_path();
            write_template(&path, force)?;
            eprintln!("Wrote {}", path.display());
        }
    }
    Ok(())
}

/// Write the default template to `path` atomically.
fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(DEFAULT_CONFIG_TEMPLATE.as_bytes())?;
    staged
        .persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
