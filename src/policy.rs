// Recovery policy table: which strategies to try, in order, for each error kind
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::error::{PolicyError, Result};
use crate::taxonomy::ErrorKind;

/// Recovery strategy types for different error scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retry operation with exponential backoff
    Retry,

    /// Fallback to an alternative implementation registered for the operation family
    Fallback,

    /// Run the operation with a reduced-scope argument set
    GracefulDegradation,

    /// Route the call through the operation family's circuit breaker
    CircuitBreaker,

    /// Hand the failure to a human; never produces a result
    Escalation,

    /// Give up; always last
    Abort,
}

impl RecoveryStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
            RecoveryStrategy::Escalation => "escalation",
            RecoveryStrategy::Abort => "abort",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ABORT_ONLY: &[RecoveryStrategy] = &[RecoveryStrategy::Abort];

/// Mapping from error kind to an ordered strategy list.
///
/// Kinds without an entry fall back to `[Abort]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryPolicy {
    entries: HashMap<ErrorKind, Vec<RecoveryStrategy>>,
}

impl RecoveryPolicy {
    /// Policy with no entries; every kind aborts
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Validated policy from explicit entries
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ErrorKind, Vec<RecoveryStrategy>)>,
    {
        let policy = Self {
            entries: entries.into_iter().collect(),
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Builder-style insert; validation happens when the policy is handed to an executor
    pub fn with(mut self, kind: ErrorKind, strategies: Vec<RecoveryStrategy>) -> Self {
        self.entries.insert(kind, strategies);
        self
    }

    /// Overlay `overrides` on top of this policy, replacing whole entries
    pub fn merged(mut self, overrides: &HashMap<ErrorKind, Vec<RecoveryStrategy>>) -> Self {
        for (kind, strategies) in overrides {
            self.entries.insert(*kind, strategies.clone());
        }
        self
    }

    /// Strategies for `kind`, in execution order
    pub fn strategies_for(&self, kind: ErrorKind) -> &[RecoveryStrategy] {
        self.entries
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(ABORT_ONLY)
    }

    pub fn contains(&self, kind: ErrorKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Entries sorted by kind, for display
    pub fn entries(&self) -> BTreeMap<ErrorKind, &[RecoveryStrategy]> {
        self.entries
            .iter()
            .map(|(kind, strategies)| (*kind, strategies.as_slice()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        for (kind, strategies) in &self.entries {
            validate_entry(*kind, strategies)?;
        }
        Ok(())
    }
}

impl Default for RecoveryPolicy {
    /// Built-in policy table
    fn default() -> Self {
        use RecoveryStrategy::*;

        let mut entries = HashMap::new();

        // Transient performance and integration failures
        entries.insert(
            ErrorKind::Timeout,
            vec![Retry, CircuitBreaker, GracefulDegradation, Abort],
        );
        entries.insert(ErrorKind::RateLimited, vec![Retry, GracefulDegradation, Abort]);
        entries.insert(
            ErrorKind::NetworkError,
            vec![Retry, CircuitBreaker, Fallback, Abort],
        );
        entries.insert(
            ErrorKind::ExternalServiceError,
            vec![CircuitBreaker, Retry, Fallback, Abort],
        );
        entries.insert(
            ErrorKind::EngineUnavailable,
            vec![Retry, Fallback, Escalation, Abort],
        );
        entries.insert(ErrorKind::ScriptError, vec![Retry, Fallback, Abort]);
        entries.insert(ErrorKind::SystemApiError, vec![Retry, Fallback, Abort]);
        entries.insert(ErrorKind::ResourceBusy, vec![Retry, Fallback, Abort]);

        // Capacity problems
        entries.insert(
            ErrorKind::MemoryExhausted,
            vec![GracefulDegradation, Escalation, Abort],
        );
        entries.insert(
            ErrorKind::QuotaExceeded,
            vec![GracefulDegradation, Escalation, Abort],
        );
        entries.insert(ErrorKind::DiskFull, vec![Escalation, Abort]);
        entries.insert(ErrorKind::NotFound, vec![Fallback, Abort]);

        // Needs a human
        for kind in [
            ErrorKind::AccessDenied,
            ErrorKind::InsufficientPrivileges,
            ErrorKind::AuthenticationFailed,
            ErrorKind::SecurityViolation,
            ErrorKind::InjectionAttempt,
            ErrorKind::IntegrityFailure,
        ] {
            entries.insert(kind, vec![Escalation, Abort]);
        }
        for kind in [
            ErrorKind::InvalidConfiguration,
            ErrorKind::MissingConfiguration,
            ErrorKind::IncompatibleVersion,
        ] {
            entries.insert(kind, vec![Fallback, Escalation, Abort]);
        }

        // State races may clear up on their own
        entries.insert(ErrorKind::InvalidState, vec![Retry, Abort]);
        entries.insert(ErrorKind::ConflictingOperation, vec![Retry, Abort]);

        // Validation kinds and PreconditionFailed are left unmapped: they abort.
        Self { entries }
    }
}

fn validate_entry(kind: ErrorKind, strategies: &[RecoveryStrategy]) -> Result<()> {
    if strategies.is_empty() {
        return Err(PolicyError::EmptyStrategyList { kind }.into());
    }

    let mut seen = HashSet::new();
    for (position, strategy) in strategies.iter().enumerate() {
        if !seen.insert(*strategy) {
            return Err(PolicyError::DuplicateStrategy {
                kind,
                strategy: *strategy,
            }
            .into());
        }
        if *strategy == RecoveryStrategy::Abort && position + 1 != strategies.len() {
            return Err(PolicyError::AbortNotLast { kind, position }.into());
        }
    }
    Ok(())
}
