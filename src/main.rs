use clap::Parser;

use windows_sandbox_manager::cli::args::{Cli, Commands};
use windows_sandbox_manager::cli::commands;
use windows_sandbox_manager::cli::init_logging;
use windows_sandbox_manager::config::load_config;
use windows_sandbox_manager::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    let config = load_config(cli.global_opts.config.as_deref())?;
    let format = cli.global_opts.format;

    match cli.command {
        Commands::Create(args) => {
            commands::create(args, config, format).await?;
        }
        Commands::Shutdown(args) => {
            commands::shutdown(args, config, format).await?;
        }
        Commands::List(args) => {
            commands::list(args, config, format).await?;
        }
        Commands::Exec(args) => {
            commands::exec(args, config, format).await?;
        }
        Commands::Monitor(args) => {
            commands::monitor(args, config, format).await?;
        }
        Commands::Status => {
            commands::status(config, format).await?;
        }
        Commands::Init(args) => {
            commands::init(args).await?;
        }
        Commands::Config(args) => {
            commands::config(args, config).await?;
        }
    }

    Ok(())
}
