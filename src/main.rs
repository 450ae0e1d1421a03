use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;

use banbench::error::BenchError;
use cli::{run_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Run the command; fatal error classes map to documented exit codes
    if let Err(e) = run_command(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<BenchError>()
            .map(BenchError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }

    Ok(())
}
