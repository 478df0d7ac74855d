//! nasdiff - Main Entry Point
//!
//! Trains and evaluates score-based architecture generators from the command line.

use clap::Parser;
use nasdiff::cli::{cmd_config, cmd_evaluate, cmd_train, show_help, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nasdiff=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Train { config, workdir, seed, resume }) => {
            cmd_train(&config, workdir.as_deref(), seed, resume)?;
        }
        Some(Commands::Evaluate { config, ckpt, num_samples }) => {
            cmd_evaluate(&config, ckpt.as_deref(), num_samples)?;
        }
        Some(Commands::Config { task, output }) => {
            cmd_config(&task, output.as_deref())?;
        }
        None => {
            show_help();
        }
    }

    Ok(())
}
