//! Structured logging for QBB fabric simulations
//!
//! Console output for people, JSONL files for tooling, both filtered by
//! `RUST_LOG`-style directives and stamped with the node and simulated time
//! of the event being processed.
//!
//! # Features
//!
//! - **Console Output**: Pretty, compact or JSONL, optionally colored
//! - **JSONL Files**: One file per run or rotated via tracing-appender
//! - **Node Context**: [`NodeContextGuard`] puts node id, role and simulated time on every line
//! - **Target Filters**: Per-crate level overrides from configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use qbb_logging::{LogConfig, QbbSubscriberBuilder};
//!
//! // Keep the guard alive until the run is over so file output is flushed
//! let _guard = QbbSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod layers;

pub use config::{
    ConsoleConfig, ConsoleFormat, FileConfig, JsonlConfig, LogConfig, Rotation, DEVICE_TRACE_TARGET,
};
pub use context::{role_name, NodeContextData, NodeContextGuard};
pub use error::{LoggingError, LoggingResult};
pub use layers::{jsonl_layer, NodeContextExtension, NodeContextLayer};

use std::fs::{self, File};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation as RollingRotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Builder for configuring and installing the global subscriber
pub struct QbbSubscriberBuilder {
    config: LogConfig,
}

impl QbbSubscriberBuilder {
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Base level for targets without an override
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn with_console(mut self, format: ConsoleFormat) -> Self {
        self.config.console.format = format;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Filter from `RUST_LOG` if set, else from the configured directives
    pub fn env_filter(&self) -> LoggingResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directives = self.config.directives().join(",");
        EnvFilter::try_new(&directives).map_err(|err| LoggingError::InvalidFilter {
            directive: directives.clone(),
            reason: err.to_string(),
        })
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes file output when dropped; keep it alive for
    /// the whole run.
    pub fn init(self) -> LoggingResult<Option<WorkerGuard>> {
        let env_filter = self.env_filter()?;

        let (file_writer, guard) = match &self.config.file {
            Some(file) => {
                let (writer, guard) = file_writer(file)?;
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let console = &self.config.console;
        let pretty_console = (console.format == ConsoleFormat::Pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(console.color)
        });
        let compact_console = (console.format == ConsoleFormat::Compact).then(|| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(console.color)
                .with_target(false)
        });
        let json_console = (console.format == ConsoleFormat::Jsonl)
            .then(|| jsonl_layer(std::io::stdout, &self.config.jsonl));
        let file_layer = file_writer.map(|writer| jsonl_layer(writer, &self.config.jsonl));

        Registry::default()
            .with(env_filter)
            .with(NodeContextLayer::new())
            .with(pretty_console)
            .with(compact_console)
            .with(json_console)
            .with(file_layer)
            .try_init()
            .map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))?;

        Ok(guard)
    }
}

impl Default for QbbSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Open the non-blocking writer for `config`
fn file_writer(config: &FileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.directory)?;
    let writer = match config.rotation {
        Rotation::PerRun => {
            let file = File::create(config.run_file_path())?;
            tracing_appender::non_blocking(file)
        }
        Rotation::Daily => tracing_appender::non_blocking(RollingFileAppender::new(
            RollingRotation::DAILY,
            &config.directory,
            &config.prefix,
        )),
        Rotation::Hourly => tracing_appender::non_blocking(RollingFileAppender::new(
            RollingRotation::HOURLY,
            &config.directory,
            &config.prefix,
        )),
    };
    Ok(writer)
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> LoggingResult<Option<WorkerGuard>> {
    QbbSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for tests; a second call is a no-op
pub fn init_testing() {
    let _ = QbbSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = QbbSubscriberBuilder::new();
        assert_eq!(builder.config().level, "info");
        assert!(builder.config().file.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let builder = QbbSubscriberBuilder::new()
            .with_level("trace")
            .with_console(ConsoleFormat::Off)
            .with_file_output(FileConfig::new("out").with_prefix("incast"));
        assert_eq!(builder.config().level, "trace");
        assert_eq!(builder.config().console.format, ConsoleFormat::Off);
        assert_eq!(builder.config().file.as_ref().unwrap().prefix, "incast");
    }

    #[test]
    fn test_per_run_file_is_created() {
        let dir = std::env::temp_dir().join(format!("qbb-logging-{}", uuid::Uuid::new_v4()));
        let config = FileConfig::new(&dir).with_prefix("incast");
        let (_writer, guard) = file_writer(&config).unwrap();
        drop(guard);
        assert!(dir.join("incast.jsonl").is_file());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rolling_file_writer_opens() {
        let dir = std::env::temp_dir().join(format!("qbb-logging-{}", uuid::Uuid::new_v4()));
        let config = FileConfig::new(&dir).with_rotation(Rotation::Hourly);
        assert!(file_writer(&config).is_ok());
        assert!(dir.is_dir());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bad_directive_is_reported() {
        let builder = QbbSubscriberBuilder::new().with_level("qbb_device=notalevel");
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(matches!(
            builder.env_filter(),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }
}
