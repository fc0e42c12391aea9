// Error taxonomy for the recovery engine
// Closed set of error kinds, their categories, and the immutable ErrorDetails record

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Maximum length (in characters) of `ErrorDetails::message`
pub const MAX_MESSAGE_LENGTH: usize = 1000;

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)password|token|secret|key").expect("sensitive key pattern is valid")
});

/// Error severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Top-level grouping of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Permission,
    Resource,
    Integration,
    Configuration,
    Performance,
    Security,
    BusinessLogic,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Integration => "integration",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Performance => "performance",
            ErrorCategory::Security => "security",
            ErrorCategory::BusinessLogic => "business_logic",
        };
        f.write_str(name)
    }
}

/// Closed enumeration of classified failure kinds.
///
/// Every kind belongs to exactly one [`ErrorCategory`], see [`ErrorKind::category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Validation
    InvalidInput,
    MissingParameter,
    TypeMismatch,
    OutOfRange,

    // Permission
    AccessDenied,
    InsufficientPrivileges,
    AuthenticationFailed,

    // Resource
    NotFound,
    AlreadyExists,
    ResourceBusy,
    QuotaExceeded,
    DiskFull,

    // Integration
    ScriptError,
    EngineUnavailable,
    SystemApiError,
    NetworkError,
    ExternalServiceError,

    // Configuration
    InvalidConfiguration,
    MissingConfiguration,
    IncompatibleVersion,

    // Performance
    Timeout,
    MemoryExhausted,
    RateLimited,

    // Security
    SecurityViolation,
    InjectionAttempt,
    IntegrityFailure,

    // Business logic
    InvalidState,
    ConflictingOperation,
    PreconditionFailed,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 29] = [
        ErrorKind::InvalidInput,
        ErrorKind::MissingParameter,
        ErrorKind::TypeMismatch,
        ErrorKind::OutOfRange,
        ErrorKind::AccessDenied,
        ErrorKind::InsufficientPrivileges,
        ErrorKind::AuthenticationFailed,
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::ResourceBusy,
        ErrorKind::QuotaExceeded,
        ErrorKind::DiskFull,
        ErrorKind::ScriptError,
        ErrorKind::EngineUnavailable,
        ErrorKind::SystemApiError,
        ErrorKind::NetworkError,
        ErrorKind::ExternalServiceError,
        ErrorKind::InvalidConfiguration,
        ErrorKind::MissingConfiguration,
        ErrorKind::IncompatibleVersion,
        ErrorKind::Timeout,
        ErrorKind::MemoryExhausted,
        ErrorKind::RateLimited,
        ErrorKind::SecurityViolation,
        ErrorKind::InjectionAttempt,
        ErrorKind::IntegrityFailure,
        ErrorKind::InvalidState,
        ErrorKind::ConflictingOperation,
        ErrorKind::PreconditionFailed,
    ];

    /// Category this kind belongs to
    pub const fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::InvalidInput
            | ErrorKind::MissingParameter
            | ErrorKind::TypeMismatch
            | ErrorKind::OutOfRange => ErrorCategory::Validation,
            ErrorKind::AccessDenied
            | ErrorKind::InsufficientPrivileges
            | ErrorKind::AuthenticationFailed => ErrorCategory::Permission,
            ErrorKind::NotFound
            | ErrorKind::AlreadyExists
            | ErrorKind::ResourceBusy
            | ErrorKind::QuotaExceeded
            | ErrorKind::DiskFull => ErrorCategory::Resource,
            ErrorKind::ScriptError
            | ErrorKind::EngineUnavailable
            | ErrorKind::SystemApiError
            | ErrorKind::NetworkError
            | ErrorKind::ExternalServiceError => ErrorCategory::Integration,
            ErrorKind::InvalidConfiguration
            | ErrorKind::MissingConfiguration
            | ErrorKind::IncompatibleVersion => ErrorCategory::Configuration,
            ErrorKind::Timeout | ErrorKind::MemoryExhausted | ErrorKind::RateLimited => {
                ErrorCategory::Performance
            }
            ErrorKind::SecurityViolation
            | ErrorKind::InjectionAttempt
            | ErrorKind::IntegrityFailure => ErrorCategory::Security,
            ErrorKind::InvalidState
            | ErrorKind::ConflictingOperation
            | ErrorKind::PreconditionFailed => ErrorCategory::BusinessLogic,
        }
    }

    /// Severity assigned when the classifier has no better information
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            ErrorKind::InvalidInput
            | ErrorKind::MissingParameter
            | ErrorKind::TypeMismatch
            | ErrorKind::OutOfRange
            | ErrorKind::AlreadyExists => ErrorSeverity::Low,
            ErrorKind::AccessDenied
            | ErrorKind::InsufficientPrivileges
            | ErrorKind::AuthenticationFailed
            | ErrorKind::DiskFull
            | ErrorKind::EngineUnavailable
            | ErrorKind::InvalidConfiguration
            | ErrorKind::MissingConfiguration
            | ErrorKind::MemoryExhausted => ErrorSeverity::High,
            ErrorKind::SecurityViolation
            | ErrorKind::InjectionAttempt
            | ErrorKind::IntegrityFailure => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short message suitable for showing to an end user
    pub const fn default_user_message(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "The provided input is not valid.",
            ErrorKind::MissingParameter => "A required parameter is missing.",
            ErrorKind::TypeMismatch => "A value has the wrong type.",
            ErrorKind::OutOfRange => "A value is outside the allowed range.",
            ErrorKind::AccessDenied => "Access to the requested resource was denied.",
            ErrorKind::InsufficientPrivileges => "The operation requires additional privileges.",
            ErrorKind::AuthenticationFailed => "Authentication failed.",
            ErrorKind::NotFound => "The requested resource could not be found.",
            ErrorKind::AlreadyExists => "The resource already exists.",
            ErrorKind::ResourceBusy => "The resource is currently busy.",
            ErrorKind::QuotaExceeded => "A usage quota has been exceeded.",
            ErrorKind::DiskFull => "There is not enough disk space.",
            ErrorKind::ScriptError => "A script failed to run.",
            ErrorKind::EngineUnavailable => "The automation engine is not available.",
            ErrorKind::SystemApiError => "A system call failed unexpectedly.",
            ErrorKind::NetworkError => "A network error occurred.",
            ErrorKind::ExternalServiceError => "An external service is not responding correctly.",
            ErrorKind::InvalidConfiguration => "The configuration is not valid.",
            ErrorKind::MissingConfiguration => "Required configuration is missing.",
            ErrorKind::IncompatibleVersion => "A component version is not compatible.",
            ErrorKind::Timeout => "The operation timed out.",
            ErrorKind::MemoryExhausted => "The system ran out of memory.",
            ErrorKind::RateLimited => "Too many requests; the operation was rate limited.",
            ErrorKind::SecurityViolation => "The operation was blocked by a security policy.",
            ErrorKind::InjectionAttempt => "The input was rejected as potentially malicious.",
            ErrorKind::IntegrityFailure => "A data integrity check failed.",
            ErrorKind::InvalidState => "The operation is not valid in the current state.",
            ErrorKind::ConflictingOperation => "The operation conflicts with another operation.",
            ErrorKind::PreconditionFailed => "A precondition for the operation was not met.",
        }
    }

    /// Suggested next step for the user or operator
    pub const fn default_recovery_suggestion(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput | ErrorKind::TypeMismatch => {
                "Check the input values and their format, then try again."
            }
            ErrorKind::MissingParameter => "Provide all required parameters.",
            ErrorKind::OutOfRange => "Use a value inside the documented range.",
            ErrorKind::AccessDenied | ErrorKind::InsufficientPrivileges => {
                "Grant the required permissions and try again."
            }
            ErrorKind::AuthenticationFailed => "Verify the credentials and sign in again.",
            ErrorKind::NotFound => "Check that the resource name or identifier is correct.",
            ErrorKind::AlreadyExists => "Use a different name or update the existing resource.",
            ErrorKind::ResourceBusy => "Wait for the resource to become available.",
            ErrorKind::QuotaExceeded => "Reduce usage or raise the quota.",
            ErrorKind::DiskFull => "Free up disk space.",
            ErrorKind::ScriptError => "Review the script for errors.",
            ErrorKind::EngineUnavailable => "Make sure the automation engine is running.",
            ErrorKind::SystemApiError => "Try again; report the problem if it persists.",
            ErrorKind::NetworkError => "Check the network connection.",
            ErrorKind::ExternalServiceError => "Wait for the external service to recover.",
            ErrorKind::InvalidConfiguration => "Correct the configuration file.",
            ErrorKind::MissingConfiguration => "Add the missing configuration values.",
            ErrorKind::IncompatibleVersion => "Upgrade or downgrade to a supported version.",
            ErrorKind::Timeout => "Try again, or increase the timeout.",
            ErrorKind::MemoryExhausted => "Close other applications or reduce the workload.",
            ErrorKind::RateLimited => "Wait before sending more requests.",
            ErrorKind::SecurityViolation
            | ErrorKind::InjectionAttempt
            | ErrorKind::IntegrityFailure => "Contact an administrator.",
            ErrorKind::InvalidState | ErrorKind::PreconditionFailed => {
                "Complete the prerequisite steps before retrying."
            }
            ErrorKind::ConflictingOperation => "Wait for the other operation to finish.",
        }
    }

    /// snake_case name, matching the serialized form
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::MissingParameter => "missing_parameter",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::InsufficientPrivileges => "insufficient_privileges",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::ScriptError => "script_error",
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::SystemApiError => "system_api_error",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ExternalServiceError => "external_service_error",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::MissingConfiguration => "missing_configuration",
            ErrorKind::IncompatibleVersion => "incompatible_version",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MemoryExhausted => "memory_exhausted",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SecurityViolation => "security_violation",
            ErrorKind::InjectionAttempt => "injection_attempt",
            ErrorKind::IntegrityFailure => "integrity_failure",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ConflictingOperation => "conflicting_operation",
            ErrorKind::PreconditionFailed => "precondition_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown error kind '{s}'"))
    }
}

/// Which classification step produced the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    TypeTable,
    MessagePattern,
    ContextHeuristic,
    Default,
    Explicit,
}

/// Immutable record describing one classified failure.
///
/// Only [`ErrorDetailsBuilder::build`] creates values, which is where the
/// message bounds and context sanitization are enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetails {
    id: String,
    kind: ErrorKind,
    severity: ErrorSeverity,
    message: String,
    technical_detail: Option<String>,
    user_message: Option<String>,
    recovery_suggestion: Option<String>,
    context: HashMap<String, serde_json::Value>,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
    affected_resources: Vec<String>,
    stack_trace: Option<String>,
    source: ClassificationSource,
}

impl ErrorDetails {
    pub fn builder(kind: ErrorKind, message: impl Into<String>) -> ErrorDetailsBuilder {
        ErrorDetailsBuilder::new(kind, message)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Derived from the kind; never stored separately
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn technical_detail(&self) -> Option<&str> {
        self.technical_detail.as_deref()
    }

    pub fn user_message(&self) -> Option<&str> {
        self.user_message.as_deref()
    }

    pub fn recovery_suggestion(&self) -> Option<&str> {
        self.recovery_suggestion.as_deref()
    }

    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn affected_resources(&self) -> &[String] {
        &self.affected_resources
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub fn classification_source(&self) -> ClassificationSource {
        self.source
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for ErrorDetails {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Record<'a> {
            id: &'a str,
            kind: ErrorKind,
            category: ErrorCategory,
            severity: ErrorSeverity,
            message: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            technical_detail: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            user_message: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            recovery_suggestion: Option<&'a str>,
            context: &'a HashMap<String, serde_json::Value>,
            timestamp: DateTime<Utc>,
            #[serde(skip_serializing_if = "Option::is_none")]
            correlation_id: Option<&'a str>,
            affected_resources: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            stack_trace: Option<&'a str>,
            classification_source: ClassificationSource,
        }

        Record {
            id: &self.id,
            kind: self.kind,
            category: self.category(),
            severity: self.severity,
            message: &self.message,
            technical_detail: self.technical_detail.as_deref(),
            user_message: self.user_message.as_deref(),
            recovery_suggestion: self.recovery_suggestion.as_deref(),
            context: &self.context,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id.as_deref(),
            affected_resources: &self.affected_resources,
            stack_trace: self.stack_trace.as_deref(),
            classification_source: self.source,
        }
        .serialize(serializer)
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.category(), self.kind, self.message)
    }
}

/// Builder for [`ErrorDetails`]
#[derive(Debug, Clone)]
pub struct ErrorDetailsBuilder {
    kind: ErrorKind,
    severity: Option<ErrorSeverity>,
    message: String,
    technical_detail: Option<String>,
    user_message: Option<String>,
    recovery_suggestion: Option<String>,
    context: HashMap<String, serde_json::Value>,
    correlation_id: Option<String>,
    affected_resources: Vec<String>,
    stack_trace: Option<String>,
    source: ClassificationSource,
}

impl ErrorDetailsBuilder {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: None,
            message: message.into(),
            technical_detail: None,
            user_message: None,
            recovery_suggestion: None,
            context: HashMap::new(),
            correlation_id: None,
            affected_resources: Vec::new(),
            stack_trace: None,
            source: ClassificationSource::Explicit,
        }
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn technical_detail(mut self, detail: impl Into<String>) -> Self {
        self.technical_detail = Some(detail.into());
        self
    }

    pub fn user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }

    pub fn recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestion = Some(suggestion.into());
        self
    }

    pub fn context_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context.extend(context);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn affected_resource(mut self, resource: impl Into<String>) -> Self {
        self.affected_resources.push(resource.into());
        self
    }

    pub fn affected_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affected_resources
            .extend(resources.into_iter().map(Into::into));
        self
    }

    pub fn stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    pub fn source(mut self, source: ClassificationSource) -> Self {
        self.source = source;
        self
    }

    pub fn build(self) -> ErrorDetails {
        let message = normalize_message(&self.message, self.kind);

        ErrorDetails {
            id: Uuid::new_v4().to_string(),
            kind: self.kind,
            severity: self.severity.unwrap_or(self.kind.default_severity()),
            message,
            technical_detail: self.technical_detail,
            user_message: Some(
                self.user_message
                    .unwrap_or_else(|| self.kind.default_user_message().to_string()),
            ),
            recovery_suggestion: Some(
                self.recovery_suggestion
                    .unwrap_or_else(|| self.kind.default_recovery_suggestion().to_string()),
            ),
            context: sanitize_context(self.context),
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            affected_resources: self.affected_resources,
            stack_trace: self.stack_trace,
            source: self.source,
        }
    }
}

fn normalize_message(message: &str, kind: ErrorKind) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return kind.default_user_message().to_string();
    }
    match trimmed.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((cut, _)) => trimmed[..cut].to_string(),
        None => trimmed.to_string(),
    }
}

/// Returns true when a context key must not be stored
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Removes sensitive keys, including keys of nested JSON objects
pub fn sanitize_context(
    context: HashMap<String, serde_json::Value>,
) -> HashMap<String, serde_json::Value> {
    context
        .into_iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .map(|(key, value)| (key, sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(key, _)| !is_sensitive_key(key))
                .map(|(key, value)| (key, sanitize_value(value)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sanitize_value).collect())
        }
        other => other,
    }
}
