// recovery-engine - error classification and recovery library
// Classifies failures into a closed taxonomy and drives policy-selected recovery strategies

pub mod backoff;
pub mod cancellation;
pub mod circuit_breaker;
pub mod classifier;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod policy;
pub mod recovery;
pub mod taxonomy;

// Re-export main types for easier access
pub use cancellation::{CancelHandle, CancelToken};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use classifier::{ClassifiedError, ErrorClassifier, OperationContext};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, LoggingSection, RecoveryConfiguration};
pub use error::{
    exit_codes, AttemptError, Cancelled, CircuitBreakerError, CircuitOpenError, ConfigError,
    ErrorFormatter, PolicyError, RecoveryError, Result,
};
pub use logging::{ColorConfig, LogConfig, LogFormat};
pub use policy::{RecoveryPolicy, RecoveryStrategy};
pub use recovery::{
    Invocation, RecoveryAttempt, RecoveryEngine, RecoveryExecutor, RecoveryFailure,
    RecoveryResult,
};
pub use taxonomy::{
    ClassificationSource, ErrorCategory, ErrorDetails, ErrorDetailsBuilder, ErrorKind,
    ErrorSeverity,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Formatted version string
pub fn version_info() -> String {
    format!("{NAME} {VERSION}")
}
