/*!
 * Tracing setup for the library and the CLI
 *
 * Human-readable lines go to stderr so stdout stays free for reports. With
 * `logging.file` set, JSON lines go to that file instead. `RUST_LOG` wins
 * over the configured level when present.
 */

use std::fs::File;
use std::path::Path;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingSection;
use crate::error::{GovernorError, Result};

/// Level a logging section asks for; `verbose` means debug
pub fn effective_level(config: &LoggingSection) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Filter directive covering both crates at one level
pub fn default_directive(level: Level) -> String {
    format!("pacekeeper={},pacekeeper_core_resilience={}", level, level)
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LoggingSection) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter_for(config)?);

    match &config.file {
        Some(path) => registry.with(json_file_layer(path)?).init(),
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init(),
    }
    Ok(())
}

fn filter_for(config: &LoggingSection) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directive(effective_level(config)))
        .map_err(|e| GovernorError::Config(format!("invalid log directive: {}", e)))
}

/// JSON lines with span close events, written to `path`
fn json_file_layer<S>(path: &Path) -> Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let file = File::create(path).map_err(|e| {
        GovernorError::Config(format!("cannot create log file {}: {}", path.display(), e))
    })?;

    Ok(fmt::layer()
        .json()
        .with_writer(file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE))
}

/// Route logs to the test harness; safe to call from every test
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(default_directive(Level::DEBUG)))
        .with(fmt::layer().with_test_writer().without_time())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use tracing_subscriber::Registry;

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = LoggingSection {
            level: LogLevel::Error,
            file: None,
            verbose: true,
        };
        assert_eq!(effective_level(&config), Level::DEBUG);

        let quiet = LoggingSection {
            verbose: false,
            ..config
        };
        assert_eq!(effective_level(&quiet), Level::ERROR);
    }

    #[test]
    fn test_default_directive_covers_both_crates() {
        let directive = default_directive(Level::INFO);
        assert_eq!(directive, "pacekeeper=INFO,pacekeeper_core_resilience=INFO");
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn test_json_layer_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.jsonl");
        assert!(json_file_layer::<Registry>(&path).is_ok());
        assert!(path.exists());

        let missing = dir.path().join("no-such-dir").join("governor.jsonl");
        let err = json_file_layer::<Registry>(&missing).err().unwrap();
        assert_eq!(err.exit_code(), crate::error::EXIT_FATAL);
    }

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("test logging initialized");
    }
}
