use super::config::{LogFormat, LogLevel};
use parking_lot::RwLock;
use std::sync::{Arc, Once};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Invalid log directive '{input}'")]
    InvalidDirective { input: String },

    #[error("Logging system initialization failed: {details}")]
    LoggingInitFailed {
        details: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// One `target=level` filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    pub target: String,
    pub level: LogLevel,
}

impl LogDirective {
    pub fn new(target: impl Into<String>, level: LogLevel) -> Self {
        Self {
            target: target.into(),
            level,
        }
    }

    pub fn parse(input: &str) -> Result<Self, InitializationError> {
        let invalid = || InitializationError::InvalidDirective {
            input: input.to_string(),
        };
        let (target, level) = input.split_once('=').ok_or_else(invalid)?;
        let target = target.trim();
        if target.is_empty() {
            return Err(invalid());
        }
        let level = level.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(target, level))
    }

    pub fn to_filter_string(&self) -> String {
        format!("{}={}", self.target, self.level.as_str())
    }
}

pub struct LoggingSystem {
    directives: Arc<RwLock<Vec<LogDirective>>>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Malformed directives are skipped with a warning on stderr.
    pub fn add_directive(&self, directive: &str) {
        match LogDirective::parse(directive) {
            Ok(directive) => self.directives.write().push(directive),
            Err(e) => eprintln!("Warning: {e}, skipping directive"),
        }
    }

    /// HTTP stack internals are noisy at info.
    pub fn add_default_directives(&self) {
        let mut directives = self.directives.write();
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls"] {
            directives.push(LogDirective::new(target, LogLevel::Warn));
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        let mut parts = Vec::with_capacity(directives.len() + 1);
        parts.push(default_level.as_str().to_string());
        parts.extend(directives.iter().map(LogDirective::to_filter_string));
        parts.join(",")
    }

    pub fn initialize_tracing(
        &self,
        default_level: LogLevel,
        format: LogFormat,
    ) -> Result<(), InitializationError> {
        // RUST_LOG, when set, replaces the computed filter
        let filter_string = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| self.build_filter_string(default_level));

        let env_filter =
            EnvFilter::try_new(&filter_string).map_err(|e| InitializationError::LoggingInitFailed {
                details: format!("Failed to create EnvFilter with '{filter_string}'"),
                source: Box::new(e),
            })?;

        let result = match format {
            LogFormat::Text => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .with_level(true)
                        .compact(),
                )
                .try_init(),
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .json(),
                )
                .try_init(),
        };

        result.map_err(|e| InitializationError::LoggingInitFailed {
            details: "Failed to set global tracing subscriber".to_string(),
            source: Box::new(e),
        })
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global subscriber once; later calls report whether the
/// first one succeeded.
pub fn setup_logging_safe(level: LogLevel, format: LogFormat) -> Result<(), InitializationError> {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INIT: Once = Once::new();
    static INIT_SUCCESS: AtomicBool = AtomicBool::new(false);

    INIT.call_once(|| {
        let logging_system = LoggingSystem::new();
        logging_system.add_default_directives();
        match logging_system.initialize_tracing(level, format) {
            Ok(()) => INIT_SUCCESS.store(true, Ordering::Release),
            Err(e) => eprintln!("Warning: {e}"),
        }
    });

    if INIT_SUCCESS.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(InitializationError::LoggingInitFailed {
            details: "Logging system initialization failed".to_string(),
            source: Box::new(std::io::Error::other("Logging initialization error")),
        })
    }
}
