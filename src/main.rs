mod alerts;
mod cli;
mod config;
mod core;
mod db;
mod error;
mod fetchers;
mod signals;
pub mod tags;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries JSON only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whalecli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let code = match cli::run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("command failed: {e:?}");
            cli::print_error(&e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
