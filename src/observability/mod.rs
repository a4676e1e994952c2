//! Observability: logging, metrics, and the run event bus.

mod event_bus;
mod logging;
mod metrics;

pub use event_bus::{DEFAULT_EVENT_BUS_CAPACITY, EventBus, FilteredReceiver};
pub use logging::{LogFormat, LoggingConfig};
pub use metrics::{MetricsHandle, install_prometheus};

use crate::config::LoggingSettings;
use crate::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, Registry};

/// Full observability configuration.
#[derive(Debug, Clone, Default)]
pub struct ObservabilityConfig {
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Whether to install the Prometheus recorder.
    pub metrics_enabled: bool,
}

/// Options for settings-based initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Whether verbose output was requested via CLI.
    pub verbose: bool,
    /// Whether to install the Prometheus recorder.
    pub metrics: bool,
    /// Log format forced by the CLI, overriding config and environment.
    pub format: Option<LogFormat>,
}

/// Handle for observability runtime components.
#[derive(Debug, Default)]
pub struct ObservabilityHandle {
    metrics: Option<MetricsHandle>,
}

impl ObservabilityHandle {
    /// Renders collected metrics, if a recorder was installed.
    #[must_use]
    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(MetricsHandle::render)
    }
}

static OBSERVABILITY_INIT: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn observability_error(cause: impl ToString) -> Error {
    Error::OperationFailed {
        operation: "observability_init".to_string(),
        cause: cause.to_string(),
    }
}

/// Initializes observability from config settings with env overrides.
///
/// # Errors
///
/// Returns an error if observability has already been initialized or if any
/// component fails to initialize.
pub fn init_from_settings(
    settings: &LoggingSettings,
    options: InitOptions,
) -> Result<ObservabilityHandle> {
    let mut logging = LoggingConfig::from_settings(settings, options.verbose);
    if let Some(format) = options.format {
        logging = logging.with_format(format);
    }
    init(ObservabilityConfig {
        logging,
        metrics_enabled: options.metrics,
    })
}

/// Initializes logging and metrics for the process.
///
/// Log output goes to stderr unless a file is configured, so stdout stays
/// free for command output.
///
/// # Errors
///
/// Returns an error if observability has already been initialized or if any
/// component fails to initialize.
pub fn init(config: ObservabilityConfig) -> Result<ObservabilityHandle> {
    if OBSERVABILITY_INIT.get().is_some() {
        return Err(observability_error("observability already initialized"));
    }

    let metrics = if config.metrics_enabled {
        Some(install_prometheus()?)
    } else {
        None
    };

    let filter = config.logging.env_filter()?;
    let layer = fmt_layer(&config.logging)?.with_filter(filter);
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(observability_error)?;

    OBSERVABILITY_INIT
        .set(())
        .map_err(|()| observability_error("failed to mark observability initialized"))?;

    Ok(ObservabilityHandle { metrics })
}

/// Builds the formatting layer for the configured format and destination.
fn fmt_layer(logging: &LoggingConfig) -> Result<BoxedLayer> {
    let to_file = logging.file.is_some();
    let writer = match &logging.file {
        Some(path) => BoxMakeWriter::new(open_log_file(path)?),
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true);
    Ok(match logging.format {
        LogFormat::Json => base.json().with_current_span(true).boxed(),
        LogFormat::Pretty => base.with_ansi(!to_file).boxed(),
    })
}

/// Opens a log file for appending, creating parent directories.
fn open_log_file(path: &Path) -> Result<Mutex<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: "create_log_dir".to_string(),
            cause: e.to_string(),
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
        .map_err(|e| Error::OperationFailed {
            operation: "open_log_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memdedup.log");
        assert!(open_log_file(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_handle_without_recorder_renders_nothing() {
        assert!(ObservabilityHandle::default().render_metrics().is_none());
    }
}
