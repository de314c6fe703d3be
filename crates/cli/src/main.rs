use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tablesink_cli::{run, SinkConfig};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Load tap messages from stdin into Postgres or SQLite tables"
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, short)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SinkConfig::load(&cli.config)?;
    init_tracing(&config.logging_level);

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let summary = run(config, stdin.lock(), &mut stdout).context("tablesink run failed")?;
    eprintln!(
        "Processed {} lines: {} records, {} rows written, {} checkpoints emitted",
        summary.lines, summary.records, summary.rows_written, summary.checkpoints_emitted
    );
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
