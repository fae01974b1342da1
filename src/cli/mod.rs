pub mod config;
pub mod run;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "winecage")]
#[command(
    author,
    version,
    about = "Run untrusted Windows programs in a deny-by-default bubblewrap sandbox"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "WINECAGE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program inside the sandbox
    Run(run::RunArgs),

    /// Show sandbox capabilities of this host and the effective configuration
    Status,

    /// Configuration management
    Config(config::ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["winecage", "run", "-v", "--network", "app.exe"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.network);
                assert_eq!(args.program, ["app.exe"]);
            }
            _ => panic!("expected run"),
        }
    }
}
