//! Weirding CLI
//!
//! Entry point for the weirding command-line application.

use clap::Parser;

use weirding::cli::output::{display_error, exit_code};
use weirding::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG overrides the level chosen by -v/-q
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level().into())
                .from_env_lossy(),
        )
        .init();

    if let Err(e) = cli.run().await {
        display_error(&e);
        std::process::exit(exit_code(&e));
    }
}
