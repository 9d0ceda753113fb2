//! `quarry`: seed a SQLite store and measure how pooling, tracking,
//! projection, split fetching, caching and client-side filtering change
//! query cost.

mod bench;
mod cli;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.verbose);
    cli.run().await.map_err(|err| miette::miette!("{err:?}"))
}

/// Log to stderr; `RUST_LOG` wins over `-v` flags when set.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Only fails if a subscriber is already installed.
    _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).compact().try_init();
}
