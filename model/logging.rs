//! `env_logger` setup for the binary.

use log::LevelFilter;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Environment variable consulted when no level is given explicitly.
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
const DEFAULT_LEVEL: &str = "warn";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to open log file '{path}': {source}")]
    File { path: String, source: std::io::Error },
    #[error("unknown log level '{0}'")]
    Level(String),
    #[error(transparent)]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Resolves the effective level: explicit argument, then `LOG_LEVEL`, then `warn`.
pub fn resolve_level(explicit: Option<&str>, from_env: Option<&str>) -> Result<LevelFilter, LoggingError> {
    let text = explicit.or(from_env).unwrap_or(DEFAULT_LEVEL);
    text.trim()
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::Level(text.to_string()))
}

/// Installs the global logger. At debug level and below each line carries the
/// source location. Output goes to stderr, or to `log_file` when given.
pub fn init_logging(level: Option<&str>, log_file: Option<&Path>) -> Result<LevelFilter, LoggingError> {
    let from_env = std::env::var(LOG_LEVEL_ENV).ok();
    let filter = resolve_level(level, from_env.as_deref())?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(filter);
    if filter >= LevelFilter::Debug {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
    } else {
        builder.format_timestamp_secs().format_module_path(false);
    }
    if let Some(path) = log_file {
        let file = File::create(path).map_err(|source| LoggingError::File {
            path: path.display().to_string(),
            source,
        })?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_level_beats_the_environment() {
        assert_eq!(resolve_level(Some("debug"), Some("error")).unwrap(), LevelFilter::Debug);
        assert_eq!(resolve_level(None, Some("error")).unwrap(), LevelFilter::Error);
        assert_eq!(resolve_level(None, None).unwrap(), LevelFilter::Warn);
    }

    #[test]
    fn unknown_level_is_rejected() {
        assert!(matches!(resolve_level(Some("chatty"), None), Err(LoggingError::Level(_))));
    }
}
