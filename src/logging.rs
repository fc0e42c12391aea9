// Logging setup and structured recovery events
use serde::{Deserialize, Serialize};
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ConfigError, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format (pretty for terminals, json for programmatic use)
    pub format: LogFormat,
    /// Color output configuration
    pub color: ColorConfig,
    /// Whether to show targets (module names)
    pub show_targets: bool,
}

/// Log output format options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-field output for terminals
    Pretty,
    /// JSON lines, for shipping recovery events to a collector
    Json,
    /// Single-line output
    Compact,
}

/// Color output configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ColorConfig {
    /// Automatically detect if colors should be used
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            color: ColorConfig::Auto,
            show_targets: false,
        }
    }
}

impl LogConfig {
    /// Create logging configuration from CLI arguments
    pub fn from_cli(verbose: bool, quiet: bool, color: Option<String>) -> Self {
        let level = if quiet {
            Level::ERROR
        } else if verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };

        let color_config = match color.as_deref() {
            Some("always") => ColorConfig::Always,
            Some("never") => ColorConfig::Never,
            _ => ColorConfig::Auto,
        };

        Self {
            level,
            format: LogFormat::Pretty,
            color: color_config,
            show_targets: false,
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Check if colors should be used based on configuration and terminal
    pub fn should_use_colors(&self) -> bool {
        match self.color {
            ColorConfig::Always => true,
            ColorConfig::Never => false,
            ColorConfig::Auto => {
                io::stderr().is_terminal()
                    && std::env::var("TERM").map_or(true, |term| term != "dumb")
                    && std::env::var("NO_COLOR").is_err()
            }
        }
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directive = format!("recovery_engine={}", self.level);
        EnvFilter::try_new(&directive).map_err(|e| {
            ConfigError::InvalidValue {
                message: e.to_string(),
                field: "logging.level".to_string(),
                value: directive,
                expected: "valid tracing directive".to_string(),
            }
            .into()
        })
    }
}

/// Initialize the logging system with the given configuration.
///
/// Calling this more than once is harmless; later calls keep the first subscriber.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = config.env_filter()?;
    let ansi = config.should_use_colors();

    let installed = match config.format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter)
            .with_target(config.show_targets)
            .with_ansi(ansi)
            .with_writer(io::stderr)
            .try_init(),
        LogFormat::Json => fmt()
            .with_env_filter(env_filter)
            .json()
            .with_writer(io::stderr)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(env_filter)
            .compact()
            .with_target(config.show_targets)
            .with_ansi(ansi)
            .with_writer(io::stderr)
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}

/// Spans and events emitted while classifying and recovering
pub mod utils {
    use std::path::Path;
    use tracing::{debug, error, info, span, warn, Level, Span};

    use crate::circuit_breaker::CircuitState;
    use crate::policy::RecoveryStrategy;
    use crate::recovery::RecoveryAttempt;
    use crate::taxonomy::{ErrorDetails, ErrorKind};

    /// Span wrapping one recovery run
    pub fn recovery_span(operation_key: &str, kind: ErrorKind) -> Span {
        span!(
            Level::INFO,
            "recovery",
            operation_key = %operation_key,
            kind = %kind
        )
    }

    /// Create a span for configuration loading
    pub fn config_loading_span(config_path: &Path) -> Span {
        span!(Level::DEBUG, "config_loading", path = %config_path.display())
    }

    /// Log configuration validation
    pub fn log_config_validation(config_path: &Path, valid: bool) {
        if valid {
            debug!(path = %config_path.display(), "Configuration validation passed");
        } else {
            error!(path = %config_path.display(), "Configuration validation failed");
        }
    }

    /// One event per recorded attempt
    pub fn log_attempt(operation_key: &str, attempt: &RecoveryAttempt) {
        let attempt_number = attempt.metadata.get("attempt").and_then(|v| v.as_u64());
        let delay_ms = attempt.metadata.get("delay_ms").and_then(|v| v.as_u64());

        match &attempt.error {
            None => info!(
                operation_key = %operation_key,
                strategy = %attempt.strategy,
                attempt = attempt_number,
                delay_ms = delay_ms,
                success = true,
                "Recovery attempt succeeded"
            ),
            Some(error) => warn!(
                operation_key = %operation_key,
                strategy = %attempt.strategy,
                attempt = attempt_number,
                delay_ms = delay_ms,
                success = false,
                error = %error,
                "Recovery attempt failed"
            ),
        }
    }

    /// Final outcome of a recovery run
    pub fn log_recovery_result(
        operation_key: &str,
        success: bool,
        strategy_used: Option<RecoveryStrategy>,
        attempts: usize,
    ) {
        let strategy = strategy_used.map(|s| s.as_str());
        if success {
            info!(
                operation_key = %operation_key,
                strategy = strategy,
                attempts = attempts,
                success = true,
                "Recovery successful"
            );
        } else {
            error!(
                operation_key = %operation_key,
                attempts = attempts,
                success = false,
                "Recovery failed"
            );
        }
    }

    pub fn log_escalation(operation_key: &str, details: &ErrorDetails) {
        error!(
            operation_key = %operation_key,
            error_id = %details.id(),
            kind = %details.kind(),
            severity = %details.severity(),
            "Escalating failure for manual intervention: {}",
            details.message()
        );
    }

    pub fn log_classification(details: &ErrorDetails, operation: &str) {
        debug!(
            operation = %operation,
            error_id = %details.id(),
            kind = %details.kind(),
            category = %details.category(),
            severity = %details.severity(),
            source = ?details.classification_source(),
            "Classified error"
        );
    }

    pub fn log_circuit_transition(
        key: &str,
        from: CircuitState,
        to: CircuitState,
        failure_count: u32,
    ) {
        match (from, to) {
            (CircuitState::HalfOpen, CircuitState::Open) => warn!(
                operation_key = %key,
                failure_count = failure_count,
                "Circuit breaker reopened for operation {} (half-open test failed)",
                key
            ),
            (_, CircuitState::Open) => warn!(
                operation_key = %key,
                failure_count = failure_count,
                "Circuit breaker opened for operation {}",
                key
            ),
            (_, CircuitState::HalfOpen) => info!(
                operation_key = %key,
                "Circuit breaker half-open for operation {}",
                key
            ),
            (_, CircuitState::Closed) => info!(
                operation_key = %key,
                "Circuit breaker closed for operation {}",
                key
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.color, ColorConfig::Auto);
        assert!(!config.show_targets);
    }

    #[test]
    fn test_log_config_from_cli_verbose() {
        let config = LogConfig::from_cli(true, false, None);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.color, ColorConfig::Auto);
    }

    #[test]
    fn test_quiet_wins_over_verbose() {
        let config = LogConfig::from_cli(true, true, None);
        assert_eq!(config.level, Level::ERROR);
    }

    #[test]
    fn test_log_config_color_never() {
        let config = LogConfig::from_cli(false, false, Some("never".to_string()));
        assert_eq!(config.color, ColorConfig::Never);
        assert!(!config.should_use_colors());
    }

    #[test]
    fn test_env_filter_targets_crate() {
        let filter = LogConfig::default().env_filter().unwrap();
        assert!(filter
            .to_string()
            .to_lowercase()
            .contains("recovery_engine=info"));
    }

    #[test]
    fn test_log_format_names() {
        let format: LogFormat = serde_yaml::from_str("json").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
