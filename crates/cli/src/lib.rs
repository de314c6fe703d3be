//! tablesink-cli
//!
//! Config loading and the line-driven pipeline behind the `tablesink` binary.

#![warn(missing_docs)]

pub mod config;
mod error;
pub mod pipeline;

use std::io::{BufRead, Write};

use tablesink_sql::{PostgresConnection, SqliteConnection, TargetEngine, TargetUri};
use tracing::info;

pub use config::SinkConfig;
pub use error::SinkError;
pub use pipeline::{Pipeline, RunSummary};

/// Connects to the configured target and runs the sink over `input`.
pub fn run<R: BufRead, W: Write>(
    config: SinkConfig,
    input: R,
    output: &mut W,
) -> Result<RunSummary, SinkError> {
    let target = TargetUri::parse(&config.target_url)?;
    match target.engine {
        TargetEngine::Postgres => {
            info!(schema = %config.target_schema, "connecting to postgres target");
            let connection = PostgresConnection::with_options(
                &target.dsn,
                config.target_schema.clone(),
                config.postgres_options(),
            )?;
            Pipeline::new(config, connection).run(input, output)
        }
        TargetEngine::Sqlite => {
            info!(path = ?target.path, "opening sqlite target");
            let connection = SqliteConnection::connect(&target.dsn)?;
            Pipeline::new(config, connection).run(input, output)
        }
    }
}
