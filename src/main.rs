use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use warden::cli::{self, Cli, Commands};
use warden::config::{Config, LogFormat};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli, config))
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // Logs go to stderr so relayed command output on stdout stays clean.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn async_main(cli: Cli, config: Config) -> Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => cli::run::run(args, config).await,
        Commands::Status => cli::status::run(&config).map(|()| ExitCode::SUCCESS),
        Commands::Check(args) => cli::check::run(args, &config),
        Commands::Audit(args) => cli::audit::run(args, &config),
        Commands::Paths => cli::paths::run(&config).map(|()| ExitCode::SUCCESS),
    }
}
