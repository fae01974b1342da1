use anyhow::Result;
use clap::Parser;

use winecage::Config;
use winecage::cli::{self, Cli, Commands};
use winecage::sandbox::SandboxError;
use winecage::sandbox::status::{GENERAL_FAILURE, SUCCESS, USAGE_ERROR};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version land here too.
            let code = if e.use_stderr() { USAGE_ERROR } else { SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging.level);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli.command, config))
}

fn init_logging(verbose: bool, configured: &str) {
    let log_level = if verbose { "debug" } else { configured };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

async fn async_main(command: Commands, config: Config) -> Result<i32> {
    match command {
        Commands::Run(args) => cli::run::run(args, &config).await,
        Commands::Status => cli::status::run(&config).map(|_| 0),
        Commands::Config(args) => cli::config::run(args, config).map(|_| 0),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SandboxError>())
        .map_or(GENERAL_FAILURE, SandboxError::exit_code)
}
