// Error classification
// Maps arbitrary failures onto the closed ErrorKind taxonomy: native type checks first,
// then message patterns, then operation-name heuristics, then a default.

use once_cell::sync::Lazy;
use regex::Regex;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

use crate::error::{Cancelled, CircuitOpenError};
use crate::logging::utils::log_classification;
use crate::taxonomy::{ClassificationSource, ErrorDetails, ErrorKind, ErrorSeverity};

/// Describes the operation that failed
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub operation: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub correlation_id: Option<String>,
    pub affected_resources: Vec<String>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_affected_resource(mut self, resource: impl Into<String>) -> Self {
        self.affected_resources.push(resource.into());
        self
    }
}

/// An error the caller has already classified
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<Box<dyn StdError + Send + Sync + 'static>>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

type TypeCheck = fn(&(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)>;

/// Native type checks, tried in order against each error in the chain
const TYPE_TABLE: &[TypeCheck] = &[
    classified_kind,
    io_kind,
    elapsed_kind,
    parse_kind,
    json_kind,
    engine_kind,
];

/// Message patterns in priority order; the first match wins
const MESSAGE_PATTERNS: &[(&str, ErrorKind)] = &[
    (r"permission denied|access denied|not authori[sz]ed|forbidden", ErrorKind::AccessDenied),
    (r"privilege|requires? (admin|root)|\bsudo\b", ErrorKind::InsufficientPrivileges),
    (
        r"authentication failed|invalid credentials|unauthori[sz]ed|login failed",
        ErrorKind::AuthenticationFailed,
    ),
    (r"timeout|timed out|deadline exceeded", ErrorKind::Timeout),
    (r"rate limit|too many requests|throttl", ErrorKind::RateLimited),
    (
        r"out of memory|memory (limit|exhausted)|cannot allocate",
        ErrorKind::MemoryExhausted,
    ),
    (r"no space left|disk full", ErrorKind::DiskFull),
    (r"quota exceeded|limit exceeded", ErrorKind::QuotaExceeded),
    (
        r"not found|no such (file|directory|macro|item)|does not exist",
        ErrorKind::NotFound,
    ),
    (r"already exists|duplicate", ErrorKind::AlreadyExists),
    (r"resource busy|\blocked\b|\bin use\b", ErrorKind::ResourceBusy),
    (
        r"connection (refused|reset|closed)|network (is )?unreachable|\bdns\b|host unreachable",
        ErrorKind::NetworkError,
    ),
    (
        r"service unavailable|bad gateway|upstream",
        ErrorKind::ExternalServiceError,
    ),
    (
        r"applescript|osascript|script error|syntax error",
        ErrorKind::ScriptError,
    ),
    (
        r"engine (is )?(not running|unavailable)|not running",
        ErrorKind::EngineUnavailable,
    ),
    (r"injection|malicious|suspicious", ErrorKind::InjectionAttempt),
    (r"security (violation|policy)|sandbox", ErrorKind::SecurityViolation),
    (
        r"checksum|integrity|signature mismatch|tampered",
        ErrorKind::IntegrityFailure,
    ),
    (
        r"missing (required )?(parameter|argument|field)",
        ErrorKind::MissingParameter,
    ),
    (
        r"expected .+ (got|found)|type mismatch|invalid type",
        ErrorKind::TypeMismatch,
    ),
    (
        r"out of range|must be between|too (large|small)|exceeds (the )?maximum",
        ErrorKind::OutOfRange,
    ),
    (
        r"invalid (config|configuration|setting)",
        ErrorKind::InvalidConfiguration,
    ),
    (r"missing config|not configured", ErrorKind::MissingConfiguration),
    (
        r"unsupported version|incompatible|version mismatch",
        ErrorKind::IncompatibleVersion,
    ),
    (r"(invalid|illegal|unexpected) state", ErrorKind::InvalidState),
    (r"conflict|concurrent modification", ErrorKind::ConflictingOperation),
    (r"precondition|prerequisite", ErrorKind::PreconditionFailed),
    (r"invalid|malformed", ErrorKind::InvalidInput),
];

static COMPILED_PATTERNS: Lazy<Vec<(Regex, ErrorKind)>> = Lazy::new(|| {
    MESSAGE_PATTERNS
        .iter()
        .map(|(pattern, kind)| {
            let regex = Regex::new(&format!("(?i){pattern}"))
                .expect("classification patterns are valid regexes");
            (regex, *kind)
        })
        .collect()
});

/// Operation-name heuristics, tried in order on the lower-cased operation
const CONTEXT_HEURISTICS: &[(&[&str], ErrorKind)] = &[
    (&["script"], ErrorKind::ScriptError),
    (&["macro", "engine"], ErrorKind::EngineUnavailable),
    (
        &["http", "fetch", "request", "network", "download", "upload"],
        ErrorKind::NetworkError,
    ),
    (&["config", "setting"], ErrorKind::InvalidConfiguration),
    (&["auth", "login"], ErrorKind::AuthenticationFailed),
    (&["validate", "parse"], ErrorKind::InvalidInput),
];

/// Stateless classifier; cheap to share
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error and its `source()` chain. Never fails.
    pub fn classify(&self, error: &(dyn StdError + 'static), ctx: &OperationContext) -> ErrorDetails {
        let chain: Vec<&(dyn StdError + 'static)> =
            std::iter::successors(Some(error), |&e| e.source()).collect();
        let messages: Vec<String> = chain.iter().map(|e| e.to_string()).collect();

        let typed = chain
            .iter()
            .find_map(|e| TYPE_TABLE.iter().find_map(|check| check(*e)));

        let details = self.finish(typed, &messages, ctx);
        log_classification(&details, &ctx.operation);
        details
    }

    pub fn classify_anyhow(&self, error: &anyhow::Error, ctx: &OperationContext) -> ErrorDetails {
        let root: &(dyn StdError + Send + Sync + 'static) = error.as_ref();
        self.classify(root, ctx)
    }

    /// Classify a bare message, as when only the text of a failure is known
    pub fn classify_message(&self, message: &str, ctx: &OperationContext) -> ErrorDetails {
        let details = self.finish(None, &[message.to_string()], ctx);
        log_classification(&details, &ctx.operation);
        details
    }

    /// Kind for a message, without building details
    pub fn match_message(&self, text: &str) -> Option<ErrorKind> {
        COMPILED_PATTERNS
            .iter()
            .find(|(regex, _)| regex.is_match(text))
            .map(|(_, kind)| *kind)
    }

    /// Kind suggested by the operation name alone
    pub fn match_operation(&self, operation: &str) -> Option<ErrorKind> {
        let operation = operation.to_lowercase();
        CONTEXT_HEURISTICS
            .iter()
            .find(|(needles, _)| needles.iter().any(|needle| operation.contains(needle)))
            .map(|(_, kind)| *kind)
    }

    fn finish(
        &self,
        typed: Option<(ErrorKind, ClassificationSource)>,
        messages: &[String],
        ctx: &OperationContext,
    ) -> ErrorDetails {
        let chain_text = messages.join(": ");

        let (kind, source) = typed
            .or_else(|| {
                self.match_message(&chain_text)
                    .map(|kind| (kind, ClassificationSource::MessagePattern))
            })
            .or_else(|| {
                self.match_operation(&ctx.operation)
                    .map(|kind| (kind, ClassificationSource::ContextHeuristic))
            })
            .unwrap_or((ErrorKind::SystemApiError, ClassificationSource::Default));

        let mut builder = ErrorDetails::builder(kind, chain_text)
            .source(source)
            .technical_detail(technical_detail(messages))
            .context(ctx.parameters.clone())
            .context_value("operation", serde_json::Value::String(ctx.operation.clone()))
            .affected_resources(ctx.affected_resources.iter().cloned());

        if source == ClassificationSource::Default {
            builder = builder.severity(ErrorSeverity::Medium);
        }
        if let Some(id) = &ctx.correlation_id {
            builder = builder.correlation_id(id.clone());
        }
        if let Some(trace) = captured_backtrace() {
            builder = builder.stack_trace(trace);
        }

        builder.build()
    }
}

fn technical_detail(messages: &[String]) -> String {
    let mut detail = String::new();
    for (depth, message) in messages.iter().enumerate() {
        if depth == 0 {
            detail.push_str(message);
        } else {
            detail.push_str(&format!("\n  caused by: {message}"));
        }
    }
    detail
}

fn captured_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn classified_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    error
        .downcast_ref::<ClassifiedError>()
        .map(|e| (e.kind(), ClassificationSource::Explicit))
}

fn io_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    let io_error = error.downcast_ref::<io::Error>()?;
    let kind = match io_error.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe => ErrorKind::NetworkError,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidInput,
        io::ErrorKind::OutOfMemory => ErrorKind::MemoryExhausted,
        io::ErrorKind::WouldBlock => ErrorKind::ResourceBusy,
        io::ErrorKind::Unsupported => ErrorKind::IncompatibleVersion,
        _ => return None,
    };
    Some((kind, ClassificationSource::TypeTable))
}

fn elapsed_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    error
        .is::<tokio::time::error::Elapsed>()
        .then_some((ErrorKind::Timeout, ClassificationSource::TypeTable))
}

fn parse_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    let is_parse = error.is::<std::num::ParseIntError>()
        || error.is::<std::num::ParseFloatError>()
        || error.is::<std::str::Utf8Error>()
        || error.is::<std::string::FromUtf8Error>();
    is_parse.then_some((ErrorKind::TypeMismatch, ClassificationSource::TypeTable))
}

fn json_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    error
        .is::<serde_json::Error>()
        .then_some((ErrorKind::InvalidInput, ClassificationSource::TypeTable))
}

fn engine_kind(error: &(dyn StdError + 'static)) -> Option<(ErrorKind, ClassificationSource)> {
    if error.is::<CircuitOpenError>() {
        Some((ErrorKind::ExternalServiceError, ClassificationSource::TypeTable))
    } else if error.is::<Cancelled>() {
        Some((ErrorKind::Timeout, ClassificationSource::TypeTable))
    } else {
        None
    }
}
