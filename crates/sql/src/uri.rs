use std::path::PathBuf;

use thiserror::Error;
use url::Url;

/// Supported target engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEngine {
    /// Postgres server.
    Postgres,
    /// SQLite database file.
    Sqlite,
}

/// Parsed target DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    /// Target engine.
    pub engine: TargetEngine,
    /// DSN handed to the driver unchanged.
    pub dsn: String,
    /// Database file for SQLite targets (`None` for in-memory databases).
    pub path: Option<PathBuf>,
}

/// Errors produced when parsing target URIs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetUriError {
    /// URI failed basic parsing.
    #[error("invalid target URI: {0}")]
    Invalid(String),
    /// Required component missing.
    #[error("missing required component: {0}")]
    MissingComponent(&'static str),
    /// Scheme not recognized.
    #[error("unsupported target engine '{0}'")]
    UnsupportedEngine(String),
}

impl TargetUri {
    /// Parses the provided DSN.
    pub fn parse(input: &str) -> Result<Self, TargetUriError> {
        let input = input.trim();
        let url = Url::parse(input).map_err(|err| TargetUriError::Invalid(err.to_string()))?;
        match url.scheme() {
            "postgres" | "postgresql" => {
                if url.host_str().map_or(true, str::is_empty) {
                    return Err(TargetUriError::MissingComponent("host"));
                }
                Ok(Self {
                    engine: TargetEngine::Postgres,
                    dsn: input.to_string(),
                    path: None,
                })
            }
            "sqlite" => Ok(Self {
                engine: TargetEngine::Sqlite,
                dsn: input.to_string(),
                path: sqlite_path(input)?,
            }),
            other => Err(TargetUriError::UnsupportedEngine(other.to_string())),
        }
    }
}

fn sqlite_path(input: &str) -> Result<Option<PathBuf>, TargetUriError> {
    let rest = input
        .strip_prefix("sqlite://")
        .or_else(|| input.strip_prefix("sqlite:"))
        .unwrap_or_default();
    let rest = rest.split('?').next().unwrap_or_default();
    if rest == ":memory:" {
        return Ok(None);
    }
    if rest.is_empty() {
        return Err(TargetUriError::MissingComponent("database path"));
    }
    Ok(Some(PathBuf::from(rest)))
}
