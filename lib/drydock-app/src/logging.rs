//! Logging.

use std::path::{Path, PathBuf};

use drydock_error::{generic_error, ErrorContext as _, GenericError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer, Registry,
};

const LOG_LEVEL_ENV_VAR: &str = "DRYDOCK_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "DRYDOCK_LOG_FORMAT_JSON";
const LOG_FILE_ENV_VAR: &str = "DRYDOCK_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Keeps background log writers alive.
///
/// Must be held until the process is about to exit so that any buffered log lines are flushed.
#[derive(Default)]
pub struct LoggingGuard {
    worker_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    fn add_worker_guard(&mut self, guard: WorkerGuard) {
        self.worker_guards.push(guard);
    }
}

/// Logging settings sourced from the environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct LoggingSettings {
    directives: Option<String>,
    json: bool,
    log_file: Option<PathBuf>,
}

impl LoggingSettings {
    /// Reads the settings from the process environment.
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let directives = lookup(LOG_LEVEL_ENV_VAR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let json = lookup(LOG_FORMAT_JSON_ENV_VAR)
            .map(|s| s.trim().to_lowercase())
            .map(|s| s == "true" || s == "1")
            .unwrap_or(false);
        let log_file = lookup(LOG_FILE_ENV_VAR)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            directives,
            json,
            log_file,
        }
    }

    /// Whether log lines are formatted as JSON.
    #[cfg(test)]
    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Path of the additional log file, if one is configured.
    #[cfg(test)]
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    fn env_filter(&self, default_level: LevelFilter) -> EnvFilter {
        let builder = EnvFilter::builder().with_default_directive(default_level.into());
        match self.directives.as_deref() {
            Some(directives) => builder.parse_lossy(directives),
            None => builder.parse_lossy(""),
        }
    }
}

/// Initializes the logging subsystem for `tracing`.
///
/// The filtering directives come from `DRYDOCK_LOG_LEVEL`, falling back to `default_level` (or `INFO`) when unset.
/// Setting `DRYDOCK_LOG_FORMAT_JSON` to `true` or `1` switches console output to flattened JSON. Console output always
/// goes to standard error, leaving standard output to commands such as `monitor` and `logs`. When `DRYDOCK_LOG_FILE`
/// is set, log lines are additionally appended to that file through a non-blocking writer.
///
/// # Errors
///
/// If the log file cannot be opened, or the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<LoggingGuard, GenericError> {
    initialize_logging_with(&LoggingSettings::from_env(), default_level)
}

/// Initializes the logging subsystem for `tracing` from explicit settings.
///
/// # Errors
///
/// If the log file cannot be opened, or the logging subsystem was already initialized, an error will be returned.
fn initialize_logging_with(
    settings: &LoggingSettings, default_level: Option<LevelFilter>,
) -> Result<LoggingGuard, GenericError> {
    let level_filter = settings.env_filter(default_level.unwrap_or(LevelFilter::INFO));

    let mut logging_guard = LoggingGuard::default();
    let mut configured_layers: Vec<BoxedLayer> = Vec::new();

    configured_layers.push(if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    });

    if let Some(log_file) = settings.log_file.as_deref() {
        let file_name = log_file
            .file_name()
            .with_error_context(|| format!("Log file path '{}' has no file name.", log_file.display()))?;
        let directory = log_file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)
            .with_error_context(|| format!("Failed to create log directory '{}'.", directory.display()))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (nb_appender, guard) = tracing_appender::non_blocking(appender);
        logging_guard.add_worker_guard(guard);

        configured_layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(nb_appender)
                .boxed(),
        );
    }

    // The filter wraps the fanout so that events are filtered once rather than per output.
    tracing_subscriber::registry()
        .with(configured_layers.with_filter(level_filter))
        .try_init()
        .map_err(|e| generic_error!("Failed to initialize logging: {}", e))?;

    Ok(logging_guard)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings_from(pairs: &[(&str, &str)]) -> LoggingSettings {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        LoggingSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let settings = settings_from(&[]);
        assert_eq!(settings, LoggingSettings::default());
        assert!(!settings.is_json());
        assert!(settings.log_file().is_none());
    }

    #[test]
    fn json_format_is_permissive() {
        assert!(settings_from(&[(LOG_FORMAT_JSON_ENV_VAR, " TRUE ")]).is_json());
        assert!(settings_from(&[(LOG_FORMAT_JSON_ENV_VAR, "1")]).is_json());
        assert!(!settings_from(&[(LOG_FORMAT_JSON_ENV_VAR, "yes")]).is_json());
    }

    #[test]
    fn blank_values_are_ignored() {
        let settings = settings_from(&[(LOG_LEVEL_ENV_VAR, "  "), (LOG_FILE_ENV_VAR, "")]);
        assert_eq!(settings, LoggingSettings::default());
    }

    #[test]
    fn directives_override_default_level() {
        let settings = settings_from(&[(LOG_LEVEL_ENV_VAR, "drydock_core=trace")]);
        let filter = settings.env_filter(LevelFilter::WARN);
        assert!(filter.to_string().contains("drydock_core=trace"));
    }
}
