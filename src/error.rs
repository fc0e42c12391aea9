// Error types for the recovery engine
// Construction-time errors, per-attempt errors, and user-facing formatting
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::policy::RecoveryStrategy;
use crate::taxonomy::{ErrorDetails, ErrorKind};

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Errors the engine surfaces synchronously. These only occur while loading
/// configuration or constructing components, never while recovering.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<ConfigError>),

    #[error("Invalid recovery policy: {0}")]
    Policy(#[from] Box<PolicyError>),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid YAML syntax: {message}")]
    InvalidYaml {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
        file_path: Option<PathBuf>,
    },

    #[error("Invalid TOML syntax: {message}")]
    InvalidToml {
        message: String,
        file_path: Option<PathBuf>,
    },

    #[error("Configuration file not found: {path}")]
    NotFound {
        path: PathBuf,
        suggestion: Option<String>,
    },

    #[error("Unsupported configuration format: {path}")]
    UnsupportedFormat { path: PathBuf, expected: String },

    #[error("Invalid configuration value: {message}")]
    InvalidValue {
        message: String,
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed {
        message: String,
        file_path: Option<PathBuf>,
        errors: Vec<String>,
    },

    #[error("IO operation failed: {message}")]
    IOError {
        message: String,
        path: Option<PathBuf>,
    },
}

/// Malformed policy tables
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no strategies configured for {kind}")]
    EmptyStrategyList { kind: ErrorKind },

    #[error("abort must be the last strategy for {kind} (found at position {position})")]
    AbortNotLast { kind: ErrorKind, position: usize },

    #[error("strategy {strategy} listed more than once for {kind}")]
    DuplicateStrategy {
        kind: ErrorKind,
        strategy: RecoveryStrategy,
    },
}

/// Why a single recovery attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptError {
    #[error("{message}")]
    Operation { message: String },

    #[error("circuit breaker open for {key}; retry after {retry_after_ms}ms")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("no fallback registered for {key}")]
    NoFallbackRegistered { key: String },

    #[error("fallback for {key} was registered for a different argument or result type")]
    FallbackTypeMismatch { key: String },

    #[error("no degraded argument set supplied")]
    NoDegradedArguments,

    #[error("operation aborted")]
    Aborted,
}

impl AttemptError {
    pub fn operation(error: &anyhow::Error) -> Self {
        AttemptError::Operation {
            message: format!("{error:#}"),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AttemptError::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, AttemptError::CircuitOpen { .. })
    }
}

/// Raised by a circuit breaker that rejects a call without running it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker open for {key}")]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_after: Duration,
}

/// Result of routing a call through a circuit breaker
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("{0}")]
    Open(#[source] CircuitOpenError),

    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            CircuitBreakerError::Operation(error) => Some(error),
            CircuitBreakerError::Open(_) => None,
        }
    }
}

/// Raised when the caller's cancellation token fires mid-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Format errors with colors and context
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Format classified error details for an end user
    pub fn format_details(&self, details: &ErrorDetails) -> String {
        let mut output = self.prefix();
        output.push_str(details.user_message().unwrap_or(details.message()));
        output.push_str(&format!(
            "\n  Kind: {} ({}, severity {})",
            details.kind(),
            details.category(),
            details.severity()
        ));
        if details.user_message().is_some() {
            output.push_str(&format!("\n  Cause: {}", details.message()));
        }
        if !details.affected_resources().is_empty() {
            output.push_str(&format!(
                "\n  Affected: {}",
                details.affected_resources().join(", ")
            ));
        }
        if let Some(suggestion) = details.recovery_suggestion() {
            output.push_str(&format!("\n  Help: {suggestion}"));
        }
        output
    }

    /// Format an engine error with context
    pub fn format_error(&self, error: &RecoveryError) -> String {
        use tracing::error;

        match error {
            RecoveryError::Config(_) => {
                error!(error_type = "config", error = %error, "Configuration error occurred");
            }
            RecoveryError::Policy(_) => {
                error!(error_type = "policy", error = %error, "Invalid recovery policy");
            }
            RecoveryError::Io(_) => {
                error!(error_type = "io", error = %error, "IO operation failed");
            }
        }

        let mut output = self.prefix();
        output.push_str(&error.to_string());

        match error {
            RecoveryError::Config(config_err) => {
                self.add_config_context(&mut output, config_err.as_ref());
            }
            RecoveryError::Policy(policy_err) => {
                self.add_policy_context(&mut output, policy_err.as_ref());
            }
            RecoveryError::Io(_) => {}
        }

        output
    }

    fn prefix(&self) -> String {
        let mut output = String::new();
        if self.use_colors {
            output.push_str("\x1b[31m"); // Red color
        }
        output.push_str("Error: ");
        if self.use_colors {
            output.push_str("\x1b[0m"); // Reset color
        }
        output
    }

    fn add_config_context(&self, output: &mut String, error: &ConfigError) {
        match error {
            ConfigError::InvalidYaml {
                file_path: Some(path),
                line: Some(line),
                ..
            } => {
                output.push_str(&format!("\n  --> {}:{}", path.display(), line));
            }
            ConfigError::NotFound {
                suggestion: Some(suggestion),
                ..
            } => {
                output.push_str(&format!("\n  Help: {suggestion}"));
            }
            ConfigError::InvalidValue {
                field, expected, ..
            } => {
                output.push_str(&format!("\n  Field: {field}"));
                output.push_str(&format!("\n  Expected: {expected}"));
            }
            ConfigError::ValidationFailed { errors, .. } => {
                for (i, error) in errors.iter().enumerate() {
                    output.push_str(&format!("\n    {}: {}", i + 1, error));
                }
            }
            ConfigError::UnsupportedFormat { expected, .. } => {
                output.push_str(&format!("\n  Help: use one of {expected}"));
            }
            _ => {}
        }
    }

    fn add_policy_context(&self, output: &mut String, error: &PolicyError) {
        match error {
            PolicyError::AbortNotLast { .. } => {
                output.push_str("\n  Help: abort is terminal; move it to the end of the list");
            }
            PolicyError::EmptyStrategyList { .. } => {
                output.push_str("\n  Help: list at least one strategy, e.g. [abort]");
            }
            PolicyError::DuplicateStrategy { .. } => {}
        }
    }
}

/// Exit codes for the diagnostic CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const POLICY_ERROR: i32 = 3;
    pub const CLI_ERROR: i32 = 7;
}

impl RecoveryError {
    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            RecoveryError::Config(_) => exit_codes::CONFIG_ERROR,
            RecoveryError::Policy(_) => exit_codes::POLICY_ERROR,
            RecoveryError::Io(_) => exit_codes::GENERAL_ERROR,
        }
    }

    /// Create a user-friendly error message with context
    pub fn user_message(&self, use_colors: bool) -> String {
        ErrorFormatter::new(use_colors).format_error(self)
    }
}

impl From<ConfigError> for RecoveryError {
    fn from(error: ConfigError) -> Self {
        RecoveryError::Config(Box::new(error))
    }
}

impl From<PolicyError> for RecoveryError {
    fn from(error: PolicyError) -> Self {
        RecoveryError::Policy(Box::new(error))
    }
}

// Conversion from serde_yaml::Error to ConfigError
impl From<serde_yaml::Error> for Box<ConfigError> {
    fn from(error: serde_yaml::Error) -> Self {
        let location = error.location();
        Box::new(ConfigError::InvalidYaml {
            message: error.to_string(),
            line: location.as_ref().map(|l| l.line() as u32),
            column: location.as_ref().map(|l| l.column() as u32),
            file_path: None,
        })
    }
}

// Conversion from toml::de::Error to ConfigError
impl From<toml::de::Error> for Box<ConfigError> {
    fn from(error: toml::de::Error) -> Self {
        Box::new(ConfigError::InvalidToml {
            message: error.message().to_string(),
            file_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = RecoveryError::from(ConfigError::ValidationFailed {
            message: "test error".to_string(),
            file_path: None,
            errors: vec![],
        });
        assert_eq!(
            error.to_string(),
            "Configuration error: Configuration validation failed: test error"
        );
        assert_eq!(error.exit_code(), exit_codes::CONFIG_ERROR);
    }

    #[test]
    fn test_policy_error_exit_code() {
        let error = RecoveryError::from(PolicyError::AbortNotLast {
            kind: ErrorKind::Timeout,
            position: 0,
        });
        assert_eq!(error.exit_code(), exit_codes::POLICY_ERROR);
        assert!(error.user_message(false).contains("Help: abort is terminal"));
    }

    #[test]
    fn test_attempt_error_messages() {
        assert_eq!(AttemptError::Aborted.to_string(), "operation aborted");
        assert!(AttemptError::Cancelled.is_cancelled());
        let open = AttemptError::CircuitOpen {
            key: "db".to_string(),
            retry_after_ms: 1500,
        };
        assert!(open.is_circuit_open());
        assert_eq!(
            serde_json::to_value(&open).unwrap()["type"],
            serde_json::json!("circuit_open")
        );
    }

    #[test]
    fn test_format_details_includes_help() {
        let details = ErrorDetails::builder(ErrorKind::NotFound, "macro 'x' not found")
            .affected_resource("macro:x")
            .build();
        let text = ErrorFormatter::new(false).format_details(&details);
        assert!(text.starts_with("Error: "));
        assert!(text.contains("not_found"));
        assert!(text.contains("Affected: macro:x"));
        assert!(text.contains("Help: "));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = RecoveryError::from(io_error);
        assert!(error.to_string().contains("IO operation failed"));
    }
}
