//! Logging setup for the data stream engine
//!
//! Every crate in the workspace logs through `tracing`. This crate builds
//! the process-wide subscriber: a console layer (pretty or JSONL) and an
//! optional JSONL file layer written through a non-blocking rolling
//! appender. `RUST_LOG` overrides the configured level.
//!
//! # Quick Start
//!
//! ```ignore
//! use datastream_logging::{LogConfig, SubscriberBuilder};
//!
//! // Keep the guard alive until exit so buffered file output is flushed
//! let _guard = SubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```

pub mod config;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use thiserror::Error;
use tracing::Subscriber;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Level or directive could not be parsed
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    /// Log file could not be opened
    #[error("Failed to open log file: {0}")]
    Appender(#[from] InitError),

    /// A global subscriber is already installed
    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// Builder for the process-wide tracing subscriber
pub struct SubscriberBuilder {
    config: LogConfig,
}

impl SubscriberBuilder {
    /// Create a builder with default configuration (pretty console, info)
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Switch the console between pretty and JSONL output
    pub fn with_pretty_console(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Current configuration
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Build the subscriber without installing it
    ///
    /// The guard, present when file output is configured, must outlive
    /// every event that should reach the file.
    pub fn build(
        self,
    ) -> Result<(Box<dyn Subscriber + Send + Sync>, Option<WorkerGuard>), LoggingError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.config.default_level).map_err(|e| {
                LoggingError::InvalidFilter {
                    directive: self.config.default_level.clone(),
                    reason: e.to_string(),
                }
            })?,
        };

        let console = &self.config.console;
        let jsonl = &self.config.jsonl;

        let pretty_console = (console.enabled && console.pretty).then(|| {
            fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });

        let json_console = (console.enabled && !console.pretty).then(|| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
        });

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = tracing_appender::non_blocking(file_appender(file_config)?);
                let layer = fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(jsonl.include_spans)
                    .flatten_event(jsonl.flatten_events)
                    .with_file(jsonl.include_location)
                    .with_line_number(jsonl.include_location)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let subscriber = Registry::default()
            .with(filter)
            .with(pretty_console)
            .with(json_console)
            .with(file_layer);

        Ok((Box::new(subscriber), guard))
    }

    /// Install the subscriber globally
    ///
    /// Fails if a global subscriber has already been set.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (subscriber, guard) = self.build()?;
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
        Ok(guard)
    }
}

impl Default for SubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling appender for a file configuration
fn file_appender(config: &FileConfig) -> Result<RollingFileAppender, InitError> {
    let rotation = match config.rotation {
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
        RotationStrategy::Never => Rotation::NEVER,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    builder.build(&config.directory)
}

/// Initialize logging for tests; safe to call from every test
pub fn init_testing() {
    let _ = SubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}
