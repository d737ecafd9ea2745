use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use composer_logging::{JsonLogger, LogLevel, LogRecord};
use serde_json::Value;

/// Builder for [`ComposerTelemetry`].
#[derive(Debug)]
pub struct ComposerTelemetryBuilder {
    component: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl ComposerTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            log_path: None,
            min_level: LogLevel::Debug,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ComposerTelemetry> {
        let logger = self
            .log_path
            .map(|path| JsonLogger::with_min_level(path, self.min_level))
            .transpose()?;
        Ok(ComposerTelemetry {
            inner: Arc::new(TelemetryInner {
                component: self.component,
                logger,
            }),
        })
    }
}

struct TelemetryInner {
    component: String,
    logger: Option<JsonLogger>,
}

/// Telemetry handle shared across composer components.
#[derive(Clone)]
pub struct ComposerTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ComposerTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposerTelemetry")
            .field("component", &self.inner.component)
            .field("log", &self.inner.logger.as_ref().map(JsonLogger::path))
            .finish()
    }
}

impl ComposerTelemetry {
    /// Starts a builder.
    #[must_use]
    pub fn builder(component: impl Into<String>) -> ComposerTelemetryBuilder {
        ComposerTelemetryBuilder::new(component)
    }

    /// Handle that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                component: "composer".into(),
                logger: None,
            }),
        }
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(LogRecord::new(&self.inner.component, level, message).with_metadata(metadata))
    }

    /// Logs structured metadata tagged with a tick number.
    pub fn log_tick(&self, tick: u64, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(
            LogRecord::new(&self.inner.component, level, message)
                .with_tick(tick)
                .with_metadata(metadata),
        )
    }

    fn write(&self, record: LogRecord) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            logger.log(&record)?;
        }
        Ok(())
    }
}
